use std::{
    collections::{BTreeMap, BTreeSet},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use rand::Rng as _;

use crate::{
    fs::{File, Filesystem},
    FileBuf, FileTarget, Level, LogEvent, Numbering,
};

pub(crate) fn temp_dir(name: &str) -> PathBuf {
    let id: u32 = rand::thread_rng().gen();

    let dir = PathBuf::from(format!("./target/filesink/{name}-{id:08x}"));
    std::fs::create_dir_all(&dir).unwrap();

    dir
}

pub(crate) fn pathstr(path: &Path) -> String {
    let path = path.to_str().unwrap().replace('\\', "/");
    let path = path.trim_end_matches('/');
    let path = path.strip_prefix("./").unwrap_or(path);

    if path == "." {
        String::new()
    } else {
        path.to_owned()
    }
}

fn parentstr(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(pathstr)
        .unwrap_or_default()
}

#[derive(Clone, Default)]
pub(crate) struct InMemoryFilesystem {
    entries: Arc<Mutex<Entries>>,
    fail_rename: Arc<AtomicBool>,
    fail_write: Arc<AtomicBool>,
}

#[derive(Default)]
struct Entries {
    files: BTreeMap<String, Arc<Mutex<Vec<u8>>>>,
    dirs: BTreeSet<String>,
}

impl InMemoryFilesystem {
    pub(crate) fn new() -> Self {
        InMemoryFilesystem::default()
    }

    pub(crate) fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|file| file.lock().unwrap().clone())
    }

    pub(crate) fn contents_str(&self, path: &str) -> String {
        String::from_utf8(
            self.contents(path)
                .unwrap_or_else(|| panic!("missing file {path}")),
        )
        .unwrap()
    }

    pub(crate) fn files(&self) -> Vec<String> {
        self.entries.lock().unwrap().files.keys().cloned().collect()
    }

    pub(crate) fn add_file(&self, path: &str, contents: &[u8]) {
        let mut entries = self.entries.lock().unwrap();

        add_dirs(&mut entries, &parentstr(path));
        entries
            .files
            .insert(path.to_owned(), Arc::new(Mutex::new(contents.to_vec())));
    }

    pub(crate) fn add_dir(&self, path: &str) {
        add_dirs(&mut self.entries.lock().unwrap(), path);
    }

    pub(crate) fn fail_rename(&self, fail: bool) {
        self.fail_rename.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_write(&self, fail: bool) {
        self.fail_write.store(fail, Ordering::SeqCst);
    }
}

fn add_dirs(entries: &mut Entries, path: &str) {
    let mut path = Some(Path::new(path));

    while let Some(dir) = path.filter(|dir| !dir.as_os_str().is_empty()) {
        entries.dirs.insert(pathstr(dir));
        path = dir.parent();
    }
}

impl Filesystem for InMemoryFilesystem {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let path = pathstr(path);

        if entries.files.contains_key(&path) {
            return Err(io::Error::new(io::ErrorKind::Other, "a file exists at this path"));
        }

        add_dirs(&mut entries, &path);

        Ok(())
    }

    fn is_dir(&self, path: &Path) -> bool {
        let path = pathstr(path);

        // The empty path is the root of the filesystem
        path.is_empty() || self.entries.lock().unwrap().dirs.contains(&path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.entries
            .lock()
            .unwrap()
            .files
            .contains_key(&pathstr(path))
    }

    fn sync_parent(&self, _: &Path) -> io::Result<()> {
        Ok(())
    }

    fn read_dir_files(&self, path: &Path) -> io::Result<Box<dyn Iterator<Item = PathBuf>>> {
        let dir = pathstr(path);

        let files = self
            .entries
            .lock()
            .unwrap()
            .files
            .keys()
            .filter(|file| parentstr(file) == dir)
            .map(PathBuf::from)
            .collect::<Vec<_>>();

        Ok(Box::new(files.into_iter()))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .files
            .remove(&pathstr(path))
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file not found"))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if self.fail_rename.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "rename refused"));
        }

        let mut entries = self.entries.lock().unwrap();

        let to = pathstr(to);
        if !entries.dirs.contains(&parentstr(&to)) && !parentstr(&to).is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "directory not found"));
        }

        let file = entries
            .files
            .remove(&pathstr(from))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file not found"))?;

        entries.files.insert(to, file);

        Ok(())
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn File + Send + Sync>> {
        let mut entries = self.entries.lock().unwrap();
        let path = pathstr(path);

        if entries.dirs.contains(&path) {
            return Err(io::Error::new(io::ErrorKind::Other, "is a directory"));
        }

        let parent = parentstr(&path);
        if !parent.is_empty() && !entries.dirs.contains(&parent) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "directory not found"));
        }

        let data = entries.files.entry(path).or_default().clone();

        Ok(Box::new(InMemoryFile {
            data,
            fail_write: self.fail_write.clone(),
        }))
    }
}

struct InMemoryFile {
    data: Arc<Mutex<Vec<u8>>>,
    fail_write: Arc<AtomicBool>,
}

impl File for InMemoryFile {
    fn len(&self) -> io::Result<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for InMemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_write.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "write refused"));
        }

        self.data.lock().unwrap().extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct TestClock(Arc<Mutex<emit::Timestamp>>);

impl TestClock {
    pub(crate) fn new() -> Self {
        TestClock(Arc::new(Mutex::new(emit::Timestamp::MIN)))
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl emit::Clock for TestClock {
    fn now(&self) -> Option<emit::Timestamp> {
        Some(*self.0.lock().unwrap())
    }
}

// 1250 four-byte lines in five blocks, archived every 1000 bytes, keeping 3 archives
const ARCHIVE_BLOCKS: [&str; 5] = ["aaa", "bbb", "ccc", "ddd", "eee"];

pub(crate) fn archive_blocks_target(fs: &InMemoryFilesystem, numbering: Numbering) -> FileTarget {
    crate::target_with_writer(
        "logs/file.txt",
        |buf: &mut FileBuf, evt: &LogEvent| {
            buf.extend_from_slice(evt.message().as_bytes());
            Ok(())
        },
        b"\n",
    )
    .filesystem(fs.clone())
    .clock(TestClock::new())
    .archive_above_size_bytes(1000)
    .archive_file_name("logs/archive/{####}.txt")
    .max_archive_files(3)
    .archive_numbering(numbering)
    .build()
}

pub(crate) fn archive_blocks() -> Vec<LogEvent> {
    ARCHIVE_BLOCKS
        .into_iter()
        .flat_map(|block| (0..250).map(move |_| LogEvent::new(Level::Info, "app", block)))
        .collect()
}

pub(crate) fn assert_archive_blocks(fs: &InMemoryFilesystem, numbering: Numbering) {
    let block = |line: &str| format!("{line}\n").repeat(250);

    assert_eq!(block("eee"), fs.contents_str("logs/file.txt"));

    let expected = match numbering {
        Numbering::Sequential => [
            ("logs/archive/0001.txt", "bbb"),
            ("logs/archive/0002.txt", "ccc"),
            ("logs/archive/0003.txt", "ddd"),
        ],
        Numbering::Rolling => [
            ("logs/archive/0000.txt", "ddd"),
            ("logs/archive/0001.txt", "ccc"),
            ("logs/archive/0002.txt", "bbb"),
        ],
    };

    for (path, line) in expected {
        assert_eq!(block(line), fs.contents_str(path), "{path}");
    }

    let mut files = expected
        .iter()
        .map(|(path, _)| path.to_string())
        .collect::<Vec<_>>();
    files.push("logs/file.txt".to_owned());

    assert_eq!(files, fs.files());
}
