use std::{
    collections::{HashMap, HashSet},
    io,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use emit::clock::{Clock as _, ErasedClock};

use crate::{
    appender::{Appender, AppenderInfo},
    fs::Filesystem,
    internal_metrics::InternalMetrics,
    Error,
};

pub(crate) struct PoolOptions {
    pub(crate) delete_on_startup: bool,
    pub(crate) idle_timeout: Duration,
    pub(crate) max_open: usize,
    pub(crate) header: Option<Box<[u8]>>,
}

/**
The set of open [`Appender`]s, keyed by their resolved path.

There's at most one appender per path. All access goes through a single lock, so concurrent writers, flushes, and idle sweeps never race to open the same file twice.
*/
pub struct AppenderPool {
    fs: Arc<dyn Filesystem + Send + Sync>,
    clock: Box<dyn ErasedClock + Send + Sync>,
    metrics: Arc<InternalMetrics>,
    options: PoolOptions,
    state: Mutex<PoolState>,
}

struct PoolState {
    appenders: HashMap<String, Appender>,
    // Paths opened at least once by this pool; startup deletion only applies to the first open
    seen: HashSet<String>,
}

/**
Exclusive access to an [`AppenderPool`].
*/
pub struct PoolGuard<'a> {
    pool: &'a AppenderPool,
    state: MutexGuard<'a, PoolState>,
}

impl AppenderPool {
    pub(crate) fn new(
        fs: Arc<dyn Filesystem + Send + Sync>,
        clock: Box<dyn ErasedClock + Send + Sync>,
        metrics: Arc<InternalMetrics>,
        options: PoolOptions,
    ) -> Self {
        AppenderPool {
            fs,
            clock,
            metrics,
            options,
            state: Mutex::new(PoolState {
                appenders: HashMap::new(),
                seen: HashSet::new(),
            }),
        }
    }

    /**
    Take exclusive access to the pool.
    */
    pub fn lock(&self) -> PoolGuard<'_> {
        PoolGuard {
            pool: self,
            state: self.state.lock().unwrap(),
        }
    }

    /**
    The current time according to the pool's clock.
    */
    pub fn now(&self) -> emit::Timestamp {
        self.clock.now().unwrap_or(emit::Timestamp::MIN)
    }

    pub(crate) fn fs(&self) -> &(dyn Filesystem + Send + Sync) {
        &*self.fs
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.options.idle_timeout
    }

    /**
    Get a snapshot of the appender for `path`, if one is pooled.
    */
    pub fn info(&self, path: &str) -> Option<AppenderInfo> {
        self.lock().state.appenders.get(path).map(|appender| appender.info())
    }

    /**
    The number of appenders currently pooled.
    */
    pub fn len(&self) -> usize {
        self.lock().state.appenders.len()
    }

    /**
    Close and remove every appender that hasn't been written to within `timeout` of `now`.

    Returns the number of appenders evicted.
    */
    pub fn evict_idle(&self, now: emit::Timestamp, timeout: Duration) -> usize {
        let mut pool = self.lock();

        let idle = pool
            .state
            .appenders
            .iter()
            .filter(|(_, appender)| {
                // If the clock went backwards then the appender isn't idle
                now.duration_since(appender.last_write_time())
                    .map(|elapsed| elapsed >= timeout)
                    .unwrap_or(false)
            })
            .map(|(path, _)| path.clone())
            .collect::<Vec<_>>();

        for path in &idle {
            self.metrics.file_evicted.increment();

            emit::debug!(
                rt: emit::runtime::internal(),
                "evicting idle {path}",
                #[emit::as_debug]
                path,
            );

            pool.close(path);
        }

        idle.len()
    }

    /**
    Flush every pooled appender through to durable storage.

    Appenders that fail to flush are closed and removed. The first failure is returned after every appender has been attempted.
    */
    pub fn flush_all(&self) -> Result<(), Error> {
        let now = self.now();
        let mut pool = self.lock();

        let mut failed = Vec::new();
        for (path, appender) in pool.state.appenders.iter_mut() {
            if let Err(err) = appender.flush(now) {
                self.metrics.file_write_failed.increment();

                failed.push(Error::write(path, err));
            }
        }

        for err in &failed {
            if let Some(path) = err.path() {
                pool.close(path);
            }
        }

        match failed.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /**
    Close and remove every pooled appender.
    */
    pub fn close_all(&self) {
        let mut pool = self.lock();

        for (path, mut appender) in pool.state.appenders.drain() {
            if let Err(err) = appender.close() {
                self.metrics.file_write_failed.increment();

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "failed to close {path}: {err}",
                    #[emit::as_debug]
                    path,
                    err,
                );
            }
        }
    }
}

impl<'a> PoolGuard<'a> {
    /**
    Get the appender for `path`, opening and pooling a new one if there isn't one already.
    */
    pub fn get_or_open(&mut self, path: &str) -> Result<&mut Appender, Error> {
        if !self.state.appenders.contains_key(path) {
            let appender = self.open(path)?;

            self.make_room();
            self.state.appenders.insert(path.to_owned(), appender);
        }

        self.state
            .appenders
            .get_mut(path)
            .ok_or_else(|| {
                Error::open(
                    path,
                    io::Error::new(io::ErrorKind::Other, "appender missing from pool"),
                )
            })
    }

    /**
    Close the appender for `path` and remove it from the pool.

    The next call to [`PoolGuard::get_or_open`] for `path` will open the file again.
    */
    pub fn close(&mut self, path: &str) {
        if let Some(mut appender) = self.state.appenders.remove(path) {
            if let Err(err) = appender.close() {
                self.pool.metrics.file_write_failed.increment();

                emit::warn!(
                    rt: emit::runtime::internal(),
                    "failed to close {path}: {err}",
                    #[emit::as_debug]
                    path,
                    err,
                );
            }
        }
    }

    pub(crate) fn pool(&self) -> &'a AppenderPool {
        self.pool
    }

    fn open(&mut self, path: &str) -> Result<Appender, Error> {
        let pool = self.pool;
        let fs = pool.fs();

        if self.state.seen.insert(path.to_owned())
            && pool.options.delete_on_startup
            && fs.is_file(Path::new(path))
        {
            match fs.remove_file(Path::new(path)) {
                Ok(()) => {
                    pool.metrics.file_delete_on_startup.increment();

                    emit::debug!(
                        rt: emit::runtime::internal(),
                        "deleted {path} on startup",
                        #[emit::as_debug]
                        path,
                    );
                }
                Err(err) => {
                    pool.metrics.file_open_failed.increment();

                    // Don't start appending to a file that should have been replaced
                    self.state.seen.remove(path);

                    return Err(Error::open(path, err));
                }
            }
        }

        let now = pool.now();

        let mut appender = Appender::open(fs, path, now).map_err(|err| {
            pool.metrics.file_open_failed.increment();

            emit::warn!(
                rt: emit::runtime::internal(),
                "failed to open {path}: {err}",
                #[emit::as_debug]
                path,
                err,
            );

            Error::open(path, err)
        })?;

        pool.metrics.file_open.increment();

        emit::debug!(
            rt: emit::runtime::internal(),
            "opened {path}",
            #[emit::as_debug]
            path,
        );

        if let Some(ref header) = pool.options.header {
            if appender.len() == 0 {
                appender
                    .write(header, now)
                    .map_err(|err| Error::write(path, err))?;
            }
        }

        Ok(appender)
    }

    // Close the least recently written appenders until there's room for one more
    fn make_room(&mut self) {
        let max_open = self.pool.options.max_open;
        if max_open == 0 {
            return;
        }

        while self.state.appenders.len() >= max_open {
            let Some(oldest) = self
                .state
                .appenders
                .iter()
                .min_by_key(|(_, appender)| appender.last_write_time())
                .map(|(path, _)| path.clone())
            else {
                return;
            };

            self.pool.metrics.file_evicted.increment();
            self.close(&oldest);
        }
    }
}
