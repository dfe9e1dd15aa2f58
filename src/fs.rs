/*!
The storage capability files are written through.

[`StdFilesystem`] is used by default. Implement [`Filesystem`] to write through some other storage.
*/

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

/**
A store of files and directories.
*/
pub trait Filesystem {
    /**
    Create a directory and all of its parents if they don't already exist.
    */
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /**
    Whether `path` is an existing directory.
    */
    fn is_dir(&self, path: &Path) -> bool;

    /**
    Whether `path` is an existing file.
    */
    fn is_file(&self, path: &Path) -> bool;

    /**
    Make sure the creation or removal of entries in the parent of `path` is durable.
    */
    fn sync_parent(&self, path: &Path) -> io::Result<()>;

    /**
    List the files directly in the directory at `path`.
    */
    fn read_dir_files(&self, path: &Path) -> io::Result<Box<dyn Iterator<Item = PathBuf>>>;

    /**
    Delete the file at `path`.
    */
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /**
    Move the file at `from` to `to`, replacing anything already there.
    */
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /**
    Open the file at `path` for appending, creating it if it doesn't exist.
    */
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn File + Send + Sync>>;
}

impl<'a, F: Filesystem + ?Sized> Filesystem for &'a F {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        (**self).create_dir_all(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        (**self).is_dir(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        (**self).is_file(path)
    }

    fn sync_parent(&self, path: &Path) -> io::Result<()> {
        (**self).sync_parent(path)
    }

    fn read_dir_files(&self, path: &Path) -> io::Result<Box<dyn Iterator<Item = PathBuf>>> {
        (**self).read_dir_files(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        (**self).remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        (**self).rename(from, to)
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn File + Send + Sync>> {
        (**self).open_append(path)
    }
}

impl<F: Filesystem + ?Sized> Filesystem for Arc<F> {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        (**self).create_dir_all(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        (**self).is_dir(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        (**self).is_file(path)
    }

    fn sync_parent(&self, path: &Path) -> io::Result<()> {
        (**self).sync_parent(path)
    }

    fn read_dir_files(&self, path: &Path) -> io::Result<Box<dyn Iterator<Item = PathBuf>>> {
        (**self).read_dir_files(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        (**self).remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        (**self).rename(from, to)
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn File + Send + Sync>> {
        (**self).open_append(path)
    }
}

/**
A file opened for appending.
*/
pub trait File: Write {
    /**
    The current length of the file in bytes.
    */
    fn len(&self) -> io::Result<u64>;

    /**
    Flush written data through to durable storage.
    */
    fn sync_all(&mut self) -> io::Result<()>;
}

impl<'a, F: File + ?Sized> File for &'a mut F {
    fn len(&self) -> io::Result<u64> {
        (**self).len()
    }

    fn sync_all(&mut self) -> io::Result<()> {
        (**self).sync_all()
    }
}

impl<F: File + ?Sized> File for Box<F> {
    fn len(&self) -> io::Result<u64> {
        (**self).len()
    }

    fn sync_all(&mut self) -> io::Result<()> {
        (**self).sync_all()
    }
}

/**
A [`Filesystem`] backed by [`std::fs`].
*/
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFilesystem;

impl StdFilesystem {
    /**
    Create a new filesystem.
    */
    pub fn new() -> Self {
        StdFilesystem
    }
}

impl Filesystem for StdFilesystem {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn sync_parent(&self, path: &Path) -> io::Result<()> {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                let _ = std::fs::OpenOptions::new()
                    .read(true)
                    .open(parent)?
                    .sync_all();
            }

            Ok(())
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            let _ = path;

            Ok(())
        }
    }

    fn read_dir_files(&self, path: &Path) -> io::Result<Box<dyn Iterator<Item = PathBuf>>> {
        let iter = std::fs::read_dir(path)?.filter_map(|entry| {
            let entry = entry.ok()?;

            if entry.metadata().ok()?.is_file() {
                Some(entry.path())
            } else {
                None
            }
        });

        Ok(Box::new(iter))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn File + Send + Sync>> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(false)
            .append(true)
            .open(path)?;

        Ok(Box::new(StdFile::new(file)))
    }
}

struct StdFile(std::fs::File);

impl StdFile {
    fn new(file: std::fs::File) -> Self {
        StdFile(file)
    }
}

impl File for StdFile {
    fn len(&self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }

    fn sync_all(&mut self) -> io::Result<()> {
        self.0.sync_all()
    }
}

impl Write for StdFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
