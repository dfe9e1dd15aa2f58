use std::{
    borrow::Cow,
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{
    appender::Appender, fs::Filesystem, internal_metrics::InternalMetrics, pool::PoolGuard, Error,
};

const DEFAULT_ARCHIVE_WIDTH: usize = 5;

/**
How archives are numbered when a file is rotated.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Numbering {
    /**
    Each rotation takes the next number in an increasing sequence.

    When there are too many archives, the ones with the lowest numbers are deleted. Numbers are never reused, so the retained archives may not start at zero.
    */
    #[default]
    Sequential,
    /**
    The most recent archive is always numbered zero.

    Each rotation renumbers existing archives up by one. Archives that would be numbered beyond the retention limit are deleted instead.
    */
    Rolling,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ArchiveSpec {
    pub(crate) file_name: Option<String>,
    pub(crate) above_size_bytes: u64,
    pub(crate) max_archive_files: usize,
    pub(crate) numbering: Numbering,
}

/**
A parsed archive file name, like `archive/{####}.txt`.

The file name contains a single run of `#`s, optionally wrapped in `{}`. Each archive replaces that run with its number, zero-padded to the length of the run.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArchivePattern {
    dir: PathBuf,
    prefix: String,
    suffix: String,
    width: usize,
}

impl ArchivePattern {
    pub(crate) fn parse(pattern: &str) -> Result<Self, Error> {
        let path = Path::new(pattern);

        let file_name = path
            .file_name()
            .and_then(|file_name| file_name.to_str())
            .ok_or_else(|| Error::config("archive file names must include a valid UTF8 file name"))?;

        let dir = path.parent().map(PathBuf::from).unwrap_or_default();

        if dir.to_string_lossy().contains('#') {
            return Err(Error::config(
                "the `#` placeholder in archive file names must be in the file name, not the directory",
            ));
        }

        let start = file_name
            .find('#')
            .ok_or_else(|| Error::config("archive file names must include a `#` placeholder"))?;

        let width = file_name[start..]
            .bytes()
            .take_while(|b| *b == b'#')
            .count();
        let end = start + width;

        if file_name[end..].contains('#') {
            return Err(Error::config(
                "archive file names must include exactly one run of `#` placeholders",
            ));
        }

        let (prefix, suffix) =
            if file_name[..start].ends_with('{') && file_name[end..].starts_with('}') {
                (&file_name[..start - 1], &file_name[end + 1..])
            } else {
                (&file_name[..start], &file_name[end..])
            };

        Ok(ArchivePattern {
            dir,
            prefix: prefix.to_owned(),
            suffix: suffix.to_owned(),
            width,
        })
    }

    // `logs/app.txt` is archived as `logs/app.00000.txt`
    pub(crate) fn for_file(path: &str) -> Self {
        let path = Path::new(path);

        let dir = path.parent().map(PathBuf::from).unwrap_or_default();

        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        let suffix = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();

        ArchivePattern {
            dir,
            prefix: format!("{stem}."),
            suffix,
            width: DEFAULT_ARCHIVE_WIDTH,
        }
    }

    pub(crate) fn path(&self, index: u64) -> PathBuf {
        self.dir.join(format!(
            "{}{:0width$}{}",
            self.prefix,
            index,
            self.suffix,
            width = self.width
        ))
    }

    pub(crate) fn index_of(&self, file_name: &str) -> Option<u64> {
        let digits = file_name
            .strip_prefix(&*self.prefix)?
            .strip_suffix(&*self.suffix)?;

        if digits.len() < self.width || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        digits.parse().ok()
    }

    fn key(&self) -> String {
        format!("{}/{}#{}", self.dir.display(), self.prefix, self.suffix)
    }

    fn read_dir(&self) -> &Path {
        if self.dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            &self.dir
        }
    }
}

/**
Moves full files into numbered archives.

A file is due for rotation once its length reaches the configured threshold. The rotation itself happens before the next write to that file is accepted, so the write that crossed the threshold stays in the archived file.
*/
pub struct ArchiveEngine {
    pattern: Option<ArchivePattern>,
    above_size_bytes: u64,
    max_archive_files: usize,
    numbering: Numbering,
    // The next sequential number for each archive file name
    sequences: Mutex<HashMap<String, u64>>,
    metrics: Arc<InternalMetrics>,
}

impl ArchiveEngine {
    pub(crate) fn new(spec: ArchiveSpec, metrics: Arc<InternalMetrics>) -> Result<Self, Error> {
        let pattern = spec
            .file_name
            .as_deref()
            .map(ArchivePattern::parse)
            .transpose()?;

        Ok(ArchiveEngine {
            pattern,
            above_size_bytes: spec.above_size_bytes,
            max_archive_files: spec.max_archive_files,
            numbering: spec.numbering,
            sequences: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    /**
    Whether the appender's file has reached the size threshold.
    */
    pub fn needs_rotation(&self, appender: &Appender) -> bool {
        self.above_size_bytes > 0 && appender.len() >= self.above_size_bytes
    }

    /**
    Archive the file at `path` and replace it with a fresh, empty one.

    If the file can't be moved into its archive then it's left in place and an [`crate::ErrorKind::Rotate`] error is returned. The appender for `path` is closed either way, so the next write will open the file again.
    */
    pub fn rotate(&self, pool: &mut PoolGuard, path: &str) -> Result<(), Error> {
        let fs = pool.pool().fs();

        pool.close(path);

        let pattern = match self.pattern {
            Some(ref pattern) => Cow::Borrowed(pattern),
            None => Cow::Owned(ArchivePattern::for_file(path)),
        };

        self.archive(fs, &pattern, path).map_err(|err| {
            self.metrics.archive_failed.increment();

            emit::warn!(
                rt: emit::runtime::internal(),
                "failed to archive {path}: {err}",
                #[emit::as_debug]
                path,
                err,
            );

            Error::rotate(path, err)
        })?;

        pool.get_or_open(path)?;

        Ok(())
    }

    fn archive(
        &self,
        fs: &(dyn Filesystem + Send + Sync),
        pattern: &ArchivePattern,
        path: &str,
    ) -> Result<(), io::Error> {
        if !pattern.dir.as_os_str().is_empty() && !fs.is_dir(&pattern.dir) {
            fs.create_dir_all(&pattern.dir)?;
        }

        let mut existing = self.existing(fs, pattern)?;

        let archived = match self.numbering {
            Numbering::Sequential => {
                let index = self.next_sequence(pattern, &existing);
                let archived = pattern.path(index);

                fs.rename(Path::new(path), &archived)?;
                self.commit_sequence(pattern, index);
                existing.push(index);

                if self.max_archive_files > 0 {
                    let excess = existing.len().saturating_sub(self.max_archive_files);

                    for index in existing.drain(..excess) {
                        self.delete(fs, pattern.path(index));
                    }
                }

                archived
            }
            Numbering::Rolling => {
                // Work from the highest number down so nothing gets overwritten
                for index in existing.into_iter().rev() {
                    let from = pattern.path(index);

                    if self.max_archive_files > 0 && index + 1 >= self.max_archive_files as u64 {
                        self.delete(fs, from);
                    } else {
                        fs.rename(&from, &pattern.path(index + 1))?;
                    }
                }

                let archived = pattern.path(0);
                fs.rename(Path::new(path), &archived)?;

                archived
            }
        };

        let _ = fs.sync_parent(&archived);

        self.metrics.archive_created.increment();

        emit::debug!(
            rt: emit::runtime::internal(),
            "archived {path} to {archived}",
            #[emit::as_debug]
            path,
            #[emit::as_debug]
            archived,
        );

        Ok(())
    }

    // Archive numbers already on disk, lowest first
    fn existing(
        &self,
        fs: &(dyn Filesystem + Send + Sync),
        pattern: &ArchivePattern,
    ) -> Result<Vec<u64>, io::Error> {
        let dir = pattern.read_dir();

        if !fs.is_dir(dir) {
            return Ok(Vec::new());
        }

        let mut existing = fs
            .read_dir_files(dir)?
            .filter_map(|path| pattern.index_of(path.file_name()?.to_str()?))
            .collect::<Vec<_>>();

        existing.sort_unstable();
        existing.dedup();

        Ok(existing)
    }

    // The number the next archive should take. It's only used up by `commit_sequence`
    fn next_sequence(&self, pattern: &ArchivePattern, existing: &[u64]) -> u64 {
        let sequences = self.sequences.lock().unwrap();

        // Never reuse a number, even if its archive has since been deleted
        let on_disk = existing.last().map(|index| index + 1).unwrap_or(0);

        sequences
            .get(&pattern.key())
            .map(|next| (*next).max(on_disk))
            .unwrap_or(on_disk)
    }

    fn commit_sequence(&self, pattern: &ArchivePattern, index: u64) {
        let mut sequences = self.sequences.lock().unwrap();

        let next = sequences.entry(pattern.key()).or_insert(0);
        *next = (*next).max(index + 1);
    }

    fn delete(&self, fs: &(dyn Filesystem + Send + Sync), path: PathBuf) {
        match fs.remove_file(&path) {
            Ok(()) => {
                self.metrics.archive_deleted.increment();

                emit::debug!(
                    rt: emit::runtime::internal(),
                    "deleted archive {path}",
                    #[emit::as_debug]
                    path,
                );
            }
            Err(err) => {
                self.metrics.archive_delete_failed.increment();

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "failed to delete archive {path}: {err}",
                    #[emit::as_debug]
                    path,
                    err,
                );
            }
        }
    }
}
