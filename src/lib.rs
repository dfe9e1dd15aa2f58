/*!
Write log events to dynamically named files with size-based archiving.

Each event is routed to a file path by a [`PathRouter`]. One target can write to a single file, or fan out to many files that are opened lazily and closed again when they go idle. When a file grows beyond a configured size it's moved into a numbered archive and a fresh file takes its place.

This library writes newline delimited JSON by default, like:

```text
{"ts":"2024-05-29T03:35:13.943506000Z","lvl":"Info","logger":"my_app::db","msg":"connected","thread":"1"}
```

# Getting started

Build a [`FileTarget`] and write events through it:

```
use filesink::{LogEvent, Level, Target};

let target = filesink::target("./target/logs/my_app.txt")
    .archive_above_size_bytes(10 * 1024 * 1024)
    .max_archive_files(5)
    .build();

target.write(
    LogEvent::new(Level::Info, "my_app", "started"),
    filesink::callback(|result| {
        if let Err(err) = result {
            eprintln!("{err}");
        }
    }),
);

target.close();
```

Writes are performed synchronously on the calling thread. Wrap a target in [`background`] to write on a dedicated thread instead, or in [`buffering`] to write in fixed-size batches.

# Failure isolation

Events in a batch are grouped by the file they're routed to. If a file can't be opened or written then only the events addressed to that file fail. Every event's callback is invoked exactly once, and callbacks are invoked in the order their events were submitted.

# Archiving

See [`FileTargetBuilder::archive_file_name`] and [`Numbering`] for how archives are named and retained.

# Troubleshooting

Diagnostics produced by `filesink` itself are written to `emit`'s internal runtime. Failures are also counted in metrics, which you can collect through [`FileTarget::metric_source`]:

```
use emit::metric::Source;

let target = filesink::target("./target/logs/my_app.txt").build();

let mut reporter = emit::metric::Reporter::new();
reporter.add_source(target.metric_source());
```
*/

#![deny(missing_docs)]

mod appender;
mod archive;
mod background;
mod buffering;
mod dispatch;
mod error;
mod event;
mod internal_metrics;
mod pool;
mod router;

pub mod fs;

#[cfg(test)]
mod test_util;

use std::{
    io,
    path::Path,
    sync::{Arc, RwLock},
    time::Duration,
};

use emit::{clock::ErasedClock, platform::system_clock::SystemClock};

use crate::{
    archive::{ArchiveEngine, ArchiveSpec},
    dispatch::Dispatcher,
    event::Writer,
    fs::{Filesystem, StdFilesystem},
    internal_metrics::InternalMetrics,
    pool::{AppenderPool, PoolOptions},
};

pub use self::{
    appender::AppenderInfo,
    archive::Numbering,
    background::{background, AsyncTarget, AsyncTargetBuilder},
    buffering::{buffering, BufferingTarget},
    error::{Error, ErrorKind},
    event::{callback, ignore, Callback, FileBuf, Level, LogEvent, ThreadInfo},
    internal_metrics::FileTargetMetrics,
    router::PathRouter,
};

pub use filesink_batcher::OverflowPolicy;

const DEFAULT_OPEN_FILE_CACHE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_OPEN_FILE_CACHE_SIZE: usize = 5;
const DEFAULT_AUTO_FLUSH: bool = true;

/**
Something that writes batches of [`LogEvent`]s.

Implementations invoke each event's [`Callback`] exactly once with the outcome of writing it.
*/
pub trait Target {
    /**
    Write a batch of events, invoking each event's callback with its outcome.

    Callbacks are invoked in the order events appear in the batch. They may be invoked before this method returns, or later on another thread.
    */
    fn write_batch(&self, batch: Vec<(LogEvent, Callback)>);

    /**
    Write a single event.
    */
    fn write(&self, evt: LogEvent, callback: Callback) {
        self.write_batch(vec![(evt, callback)])
    }

    /**
    Block until events written so far are durably stored, or until `timeout` elapses.

    Returns `false` if the flush didn't complete.
    */
    fn blocking_flush(&self, timeout: Duration) -> bool;
}

impl<'a, T: Target + ?Sized> Target for &'a T {
    fn write_batch(&self, batch: Vec<(LogEvent, Callback)>) {
        (**self).write_batch(batch)
    }

    fn write(&self, evt: LogEvent, callback: Callback) {
        (**self).write(evt, callback)
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        (**self).blocking_flush(timeout)
    }
}

impl<T: Target + ?Sized> Target for Box<T> {
    fn write_batch(&self, batch: Vec<(LogEvent, Callback)>) {
        (**self).write_batch(batch)
    }

    fn write(&self, evt: LogEvent, callback: Callback) {
        (**self).write(evt, callback)
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        (**self).blocking_flush(timeout)
    }
}

impl<T: Target + ?Sized> Target for Arc<T> {
    fn write_batch(&self, batch: Vec<(LogEvent, Callback)>) {
        (**self).write_batch(batch)
    }

    fn write(&self, evt: LogEvent, callback: Callback) {
        (**self).write(evt, callback)
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        (**self).blocking_flush(timeout)
    }
}

/**
Create a builder for a [`FileTarget`] using the default newline-delimited JSON format.

The `router` decides which file each event is written to. Pass a path to write every event to the same file, or a [`PathRouter`] to fan out.
*/
#[cfg(feature = "default_writer")]
pub fn target(router: impl Into<PathRouter>) -> FileTargetBuilder {
    FileTargetBuilder::new(router)
}

/**
Create a builder for a [`FileTarget`].

The `writer` is used to render each [`LogEvent`] into its on-disk format. If rendering fails then that event's callback receives an [`ErrorKind::Render`] error and the rest of the batch is still written.

The `writer` may finish each event with the separator. If it doesn't, then it will be added automatically.
*/
pub fn target_with_writer(
    router: impl Into<PathRouter>,
    writer: impl Fn(&mut FileBuf, &LogEvent) -> io::Result<()> + Send + Sync + 'static,
    separator: &'static [u8],
) -> FileTargetBuilder {
    FileTargetBuilder::new_with_writer(router, writer, separator)
}

/**
A builder for a [`FileTarget`].

Use [`target`] or [`target_with_writer`] to begin a [`FileTargetBuilder`].

Once configured, call [`FileTargetBuilder::build`] to get a [`FileTarget`]. No files are opened until events are written to it.
*/
pub struct FileTargetBuilder {
    router: PathRouter,
    writer: Writer,
    separator: &'static [u8],
    archive: ArchiveSpec,
    open_file_cache_timeout: Duration,
    open_file_cache_size: usize,
    delete_old_file_on_startup: bool,
    auto_flush: bool,
    header: Option<Box<[u8]>>,
    fs: Arc<dyn Filesystem + Send + Sync>,
    clock: Box<dyn ErasedClock + Send + Sync>,
}

impl FileTargetBuilder {
    /**
    Create a new [`FileTargetBuilder`] using the default newline-delimited JSON format.

    It will use the following defaults:

    - No archiving.
    - Idle files are closed after 60 seconds.
    - At most 5 files are open at once.
    - Files are flushed after every batch.
    */
    #[cfg(feature = "default_writer")]
    pub fn new(router: impl Into<PathRouter>) -> Self {
        Self::new_with_writer(router, event::default_writer, b"\n")
    }

    /**
    Create a new [`FileTargetBuilder`].

    The `writer` is used to render each [`LogEvent`] into its on-disk format. If rendering fails then that event's callback receives an [`ErrorKind::Render`] error.

    The `writer` may finish each event with the separator. If it doesn't, then it will be added automatically.
    */
    pub fn new_with_writer(
        router: impl Into<PathRouter>,
        writer: impl Fn(&mut FileBuf, &LogEvent) -> io::Result<()> + Send + Sync + 'static,
        separator: &'static [u8],
    ) -> Self {
        FileTargetBuilder {
            router: router.into(),
            writer: Box::new(writer),
            separator,
            archive: ArchiveSpec::default(),
            open_file_cache_timeout: DEFAULT_OPEN_FILE_CACHE_TIMEOUT,
            open_file_cache_size: DEFAULT_OPEN_FILE_CACHE_SIZE,
            delete_old_file_on_startup: false,
            auto_flush: DEFAULT_AUTO_FLUSH,
            header: None,
            fs: Arc::new(StdFilesystem::new()),
            clock: Box::new(SystemClock::new()),
        }
    }

    /**
    Specify a writer for incoming [`LogEvent`]s.

    The `writer` may finish each event with the separator. If it doesn't, then it will be added automatically.
    */
    pub fn writer(
        mut self,
        writer: impl Fn(&mut FileBuf, &LogEvent) -> io::Result<()> + Send + Sync + 'static,
        separator: &'static [u8],
    ) -> Self {
        self.writer = Box::new(writer);
        self.separator = separator;
        self
    }

    /**
    The size a file can reach before it's moved into an archive.

    The write that takes a file to this size is kept in that file. The file is archived before the next write to it. A value of `0` disables archiving.
    */
    pub fn archive_above_size_bytes(mut self, archive_above_size_bytes: u64) -> Self {
        self.archive.above_size_bytes = archive_above_size_bytes;
        self
    }

    /**
    The file name to archive files to.

    The file name must contain a single run of `#`s in its last component, optionally wrapped in `{}`, like `logs/archive/app.{####}.txt`. The `#`s are replaced by the archive number, zero-padded to the number of `#`s.

    If no file name is given then archives sit alongside the file being archived. `logs/app.txt` will be archived to `logs/app.00000.txt`, `logs/app.00001.txt`, and so on.
    */
    pub fn archive_file_name(mut self, archive_file_name: impl Into<String>) -> Self {
        self.archive.file_name = Some(archive_file_name.into());
        self
    }

    /**
    The maximum number of archives to keep for each file.

    A value of `0` keeps every archive.
    */
    pub fn max_archive_files(mut self, max_archive_files: usize) -> Self {
        self.archive.max_archive_files = max_archive_files;
        self
    }

    /**
    How archives are numbered.
    */
    pub fn archive_numbering(mut self, numbering: Numbering) -> Self {
        self.archive.numbering = numbering;
        self
    }

    /**
    How long a file can go without being written to before it's closed.

    A value of [`Duration::ZERO`] closes files after every write.
    */
    pub fn open_file_cache_timeout(mut self, timeout: Duration) -> Self {
        self.open_file_cache_timeout = timeout;
        self
    }

    /**
    The maximum number of files to keep open at once.

    When another file needs to be opened, the one written to least recently is closed first. A value of `0` doesn't limit the number of open files.
    */
    pub fn open_file_cache_size(mut self, open_file_cache_size: usize) -> Self {
        self.open_file_cache_size = open_file_cache_size;
        self
    }

    /**
    Whether to delete a file left over from a previous run before it's first written to.

    Archives of the file aren't affected.
    */
    pub fn delete_old_file_on_startup(mut self, delete_old_file_on_startup: bool) -> Self {
        self.delete_old_file_on_startup = delete_old_file_on_startup;
        self
    }

    /**
    Whether to flush and sync files after every batch.

    When disabled, written events may sit in OS buffers until [`FileTarget::blocking_flush`] or [`FileTarget::close`] is called.
    */
    pub fn auto_flush(mut self, auto_flush: bool) -> Self {
        self.auto_flush = auto_flush;
        self
    }

    /**
    Bytes to write at the start of every new, empty file.

    This includes the fresh file that replaces one that's been archived.
    */
    pub fn header(mut self, header: impl Into<Vec<u8>>) -> Self {
        self.header = Some(header.into().into_boxed_slice());
        self
    }

    /**
    Write files through a custom [`Filesystem`].
    */
    pub fn filesystem(mut self, fs: impl Filesystem + Send + Sync + 'static) -> Self {
        self.fs = Arc::new(fs);
        self
    }

    /**
    Use a custom clock for tracking when files were last written to.
    */
    pub fn clock(mut self, clock: impl emit::Clock + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /**
    Complete the builder, returning a [`FileTarget`].

    If the configuration is invalid this method won't fail or panic. Every event written to the target will fail with an [`ErrorKind::Config`] error instead. In these cases it will log to [`emit::runtime::internal`] and increment the `configuration_failed` metric on [`FileTarget::metric_source`].
    */
    pub fn build(self) -> FileTarget {
        let metrics = Arc::new(InternalMetrics::default());

        let state = match self.build_inner(metrics.clone()) {
            Ok(dispatcher) => State::Active(dispatcher),
            Err(err) => {
                emit::error!(
                    rt: emit::runtime::internal(),
                    "file target configuration is invalid; no events will be written: {err}"
                );

                metrics.configuration_failed.increment();

                State::Invalid(err)
            }
        };

        FileTarget {
            state: RwLock::new(state),
            metrics,
        }
    }

    fn build_inner(self, metrics: Arc<InternalMetrics>) -> Result<Dispatcher, Error> {
        let archive = ArchiveEngine::new(self.archive, metrics.clone())?;

        let pool = AppenderPool::new(
            self.fs,
            self.clock,
            metrics.clone(),
            PoolOptions {
                delete_on_startup: self.delete_old_file_on_startup,
                idle_timeout: self.open_file_cache_timeout,
                max_open: self.open_file_cache_size,
                header: self.header,
            },
        );

        Ok(Dispatcher::new(
            self.router,
            self.writer,
            Box::from(self.separator),
            self.auto_flush,
            pool,
            archive,
            metrics,
        ))
    }
}

/**
A target that writes events to files on the calling thread.

Create a target through the [`target`] function, calling [`FileTargetBuilder::build`] to complete configuration.

Files are opened the first time an event is routed to them. Call [`FileTarget::close`] to flush and close every open file. Events written after that fail with an [`ErrorKind::Closed`] error. Dropping the target also closes it.
*/
pub struct FileTarget {
    state: RwLock<State>,
    metrics: Arc<InternalMetrics>,
}

enum State {
    Active(Dispatcher),
    Invalid(Error),
    Closed,
}

impl Target for FileTarget {
    fn write_batch(&self, batch: Vec<(LogEvent, Callback)>) {
        let (mut events, callbacks): (Vec<_>, Vec<_>) = batch.into_iter().unzip();

        for evt in &mut events {
            evt.capture();
        }

        // Batches may be written concurrently; the pool serializes access to files
        let outcomes = match *self.state.read().unwrap() {
            State::Active(ref dispatcher) => dispatcher.write_all(&events),
            State::Invalid(ref err) => vec![Err(err.clone()); events.len()],
            State::Closed => vec![
                Err(Error::new(
                    ErrorKind::Closed,
                    None,
                    "the target has been closed"
                ));
                events.len()
            ],
        };

        // Callbacks run outside the lock so they're free to use the target
        for _ in 0..event::complete(callbacks, outcomes) {
            self.metrics.callback_panicked.increment();
        }
    }

    fn blocking_flush(&self, _: Duration) -> bool {
        self.flush().is_ok()
    }
}

impl FileTarget {
    /**
    Flush every open file through to durable storage.

    Files that fail to flush are closed. The first failure is returned after every file has been attempted.
    */
    pub fn flush(&self) -> Result<(), Error> {
        match *self.state.read().unwrap() {
            State::Active(ref dispatcher) => dispatcher.pool().flush_all(),
            State::Invalid(_) | State::Closed => Ok(()),
        }
    }

    /**
    Close every file that hasn't been written to within the open file cache timeout.

    Idle files are also closed after every batch, so this only needs to be called when a target might go quiet for a long time.

    Returns the number of files closed.
    */
    pub fn evict_idle(&self) -> usize {
        match *self.state.read().unwrap() {
            State::Active(ref dispatcher) => {
                let pool = dispatcher.pool();

                pool.evict_idle(pool.now(), pool.idle_timeout())
            }
            State::Invalid(_) | State::Closed => 0,
        }
    }

    /**
    Get a snapshot of the open file at `path`, if there is one.
    */
    pub fn info(&self, path: impl AsRef<Path>) -> Option<AppenderInfo> {
        let path = path.as_ref().to_str()?;

        match *self.state.read().unwrap() {
            State::Active(ref dispatcher) => dispatcher.pool().info(path),
            State::Invalid(_) | State::Closed => None,
        }
    }

    /**
    The number of files currently open.
    */
    pub fn open_files(&self) -> usize {
        match *self.state.read().unwrap() {
            State::Active(ref dispatcher) => dispatcher.pool().len(),
            State::Invalid(_) | State::Closed => 0,
        }
    }

    /**
    Flush and close every open file.

    Events written after this call fail with an [`ErrorKind::Closed`] error. Closing an already closed target does nothing.
    */
    pub fn close(&self) {
        let state = std::mem::replace(&mut *self.state.write().unwrap(), State::Closed);

        if let State::Active(dispatcher) = state {
            let pool = dispatcher.pool();

            if let Err(err) = pool.flush_all() {
                emit::warn!(
                    rt: emit::runtime::internal(),
                    "failed to flush files while closing: {err}",
                );
            }

            pool.close_all();
        }
    }

    /**
    Get an [`emit::metric::Source`] for instrumentation produced by the target.

    These metrics can be used to monitor the running health of your file writing.
    */
    pub fn metric_source(&self) -> FileTargetMetrics {
        FileTargetMetrics {
            metrics: self.metrics.clone(),
        }
    }
}

impl Drop for FileTarget {
    fn drop(&mut self) {
        self.close();
    }
}
