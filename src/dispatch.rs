use std::{collections::BTreeMap, io, sync::Arc, time::Duration};

use crate::{
    archive::ArchiveEngine,
    event::{FileBuf, Writer},
    internal_metrics::InternalMetrics,
    pool::{AppenderPool, PoolGuard},
    Error, ErrorKind, LogEvent, PathRouter,
};

/**
Writes batches of events to their files.

Events are grouped by the path they resolve to. Each group is written on its own, so a file that can't be opened or written only fails the events addressed to it. Outcomes are returned in the order events were submitted, regardless of the order groups are written in.
*/
pub(crate) struct Dispatcher {
    router: PathRouter,
    writer: Writer,
    separator: Box<[u8]>,
    auto_flush: bool,
    pool: AppenderPool,
    archive: ArchiveEngine,
    metrics: Arc<InternalMetrics>,
}

// A rendered event along with its position in the submitted batch
struct Member {
    index: usize,
    bytes: Box<[u8]>,
}

impl Dispatcher {
    pub(crate) fn new(
        router: PathRouter,
        writer: Writer,
        separator: Box<[u8]>,
        auto_flush: bool,
        pool: AppenderPool,
        archive: ArchiveEngine,
        metrics: Arc<InternalMetrics>,
    ) -> Self {
        Dispatcher {
            router,
            writer,
            separator,
            auto_flush,
            pool,
            archive,
            metrics,
        }
    }

    pub(crate) fn pool(&self) -> &AppenderPool {
        &self.pool
    }

    /**
    Write `events`, returning the outcome of each one in the same order.
    */
    pub(crate) fn write_all(&self, events: &[LogEvent]) -> Vec<Result<(), Error>> {
        let mut outcomes = vec![Ok(()); events.len()];

        // Groups are written in path order; members keep their arrival order
        let mut groups = BTreeMap::<String, Vec<Member>>::new();

        for (index, evt) in events.iter().enumerate() {
            let path = self.router.resolve(evt);

            match self.render(evt) {
                Ok(bytes) => groups.entry(path).or_default().push(Member { index, bytes }),
                Err(err) => {
                    self.metrics.event_format_failed.increment();

                    emit::warn!(
                        rt: emit::runtime::internal(),
                        "failed to render event for {path}: {err}",
                        #[emit::as_debug]
                        path,
                        err,
                    );

                    outcomes[index] = Err(Error::new(ErrorKind::Render, Some(&path), err));
                }
            }
        }

        for (path, members) in groups {
            if let Err(err) = self.write_group(&path, &members) {
                for member in &members {
                    outcomes[member.index] = Err(err.clone());
                }
            }
        }

        let idle_timeout = self.pool.idle_timeout();
        if idle_timeout > Duration::ZERO {
            self.pool.evict_idle(self.pool.now(), idle_timeout);
        }

        outcomes
    }

    fn render(&self, evt: &LogEvent) -> io::Result<Box<[u8]>> {
        let mut buf = FileBuf::new();

        (self.writer)(&mut buf, evt)?;

        if !buf.ends_with(&self.separator) {
            buf.extend_from_slice(&self.separator);
        }

        Ok(buf.into_boxed_slice())
    }

    fn write_group(&self, path: &str, members: &[Member]) -> Result<(), Error> {
        let now = self.pool.now();
        let mut pool = self.pool.lock();

        let written = self.write_members(&mut pool, path, members, now);

        // A failed appender is discarded so the next write to its path opens it fresh
        if written.is_err() {
            pool.close(path);
        }

        written
    }

    fn write_members(
        &self,
        pool: &mut PoolGuard,
        path: &str,
        members: &[Member],
        now: emit::Timestamp,
    ) -> Result<(), Error> {
        // Without an idle timeout, files are only held open for a single write
        let close_each = self.pool.idle_timeout() == Duration::ZERO;

        for member in members {
            if self.archive.needs_rotation(pool.get_or_open(path)?) {
                self.archive.rotate(pool, path)?;
            }

            pool.get_or_open(path)?
                .write(&member.bytes, now)
                .map_err(|err| self.write_failed(path, err))?;

            if close_each {
                self.flush(pool, path, now)?;
                pool.close(path);
            }
        }

        if !close_each {
            self.flush(pool, path, now)?;
        }

        Ok(())
    }

    fn flush(&self, pool: &mut PoolGuard, path: &str, now: emit::Timestamp) -> Result<(), Error> {
        if self.auto_flush {
            pool.get_or_open(path)?
                .flush(now)
                .map_err(|err| self.write_failed(path, err))?;
        }

        Ok(())
    }

    fn write_failed(&self, path: &str, err: io::Error) -> Error {
        self.metrics.file_write_failed.increment();

        emit::warn!(
            rt: emit::runtime::internal(),
            "failed to write to {path}: {err}",
            #[emit::as_debug]
            path,
            err,
        );

        Error::write(path, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        archive::{ArchiveSpec, Numbering},
        pool::PoolOptions,
        test_util::{InMemoryFilesystem, TestClock},
        Level,
    };

    fn message_writer() -> Writer {
        Box::new(|buf: &mut FileBuf, evt: &LogEvent| {
            buf.extend_from_slice(evt.message().as_bytes());
            Ok(())
        })
    }

    fn dispatcher(fs: &InMemoryFilesystem, router: PathRouter, idle_timeout: Duration) -> Dispatcher {
        let metrics = Arc::new(InternalMetrics::default());

        Dispatcher::new(
            router,
            message_writer(),
            Box::from(&b"\n"[..]),
            true,
            AppenderPool::new(
                Arc::new(fs.clone()),
                Box::new(TestClock::new()),
                metrics.clone(),
                PoolOptions {
                    delete_on_startup: false,
                    idle_timeout,
                    max_open: 0,
                    header: None,
                },
            ),
            ArchiveEngine::new(ArchiveSpec::default(), metrics.clone()).unwrap(),
            metrics,
        )
    }

    fn by_logger() -> PathRouter {
        PathRouter::from_fn(|evt| evt.logger().to_owned())
    }

    fn evt(logger: &str, msg: &str) -> LogEvent {
        LogEvent::new(Level::Info, logger, msg)
    }

    fn collect(dispatcher: &Dispatcher, events: Vec<LogEvent>) -> Vec<Result<(), ErrorKind>> {
        let outcomes = dispatcher.write_all(&events);

        assert_eq!(events.len(), outcomes.len());

        outcomes
            .into_iter()
            .map(|outcome| outcome.map_err(|err| err.kind()))
            .collect()
    }

    #[test]
    fn directory_path_fails_only_its_group() {
        let fs = InMemoryFilesystem::new();
        fs.add_dir("a");

        let dispatcher = dispatcher(&fs, by_logger(), Duration::from_secs(60));

        let outcomes = collect(
            &dispatcher,
            vec![
                evt("file99.txt", "ok"),
                evt("a/", "fail 1"),
                evt("a/", "fail 2"),
                evt("a/", "fail 3"),
            ],
        );

        assert_eq!(
            vec![
                Ok(()),
                Err(ErrorKind::Open),
                Err(ErrorKind::Open),
                Err(ErrorKind::Open),
            ],
            outcomes
        );
        assert_eq!("ok\n", fs.contents_str("file99.txt"));
    }

    #[test]
    fn interleaved_paths_keep_arrival_order() {
        let fs = InMemoryFilesystem::new();
        fs.add_dir("bad");

        let dispatcher = dispatcher(&fs, by_logger(), Duration::from_secs(60));

        let outcomes = collect(
            &dispatcher,
            vec![
                evt("b.txt", "b1"),
                evt("bad", "x"),
                evt("a.txt", "a1"),
                evt("b.txt", "b2"),
                evt("a.txt", "a2"),
                evt("bad", "y"),
                evt("b.txt", "b3"),
            ],
        );

        assert_eq!(
            vec![
                Ok(()),
                Err(ErrorKind::Open),
                Ok(()),
                Ok(()),
                Ok(()),
                Err(ErrorKind::Open),
                Ok(()),
            ],
            outcomes
        );

        assert_eq!("a1\na2\n", fs.contents_str("a.txt"));
        assert_eq!("b1\nb2\nb3\n", fs.contents_str("b.txt"));
    }

    #[test]
    fn failed_write_closes_appender() {
        let fs = InMemoryFilesystem::new();

        let dispatcher = dispatcher(&fs, PathRouter::fixed("app.txt"), Duration::from_secs(60));

        assert_eq!(vec![Ok(())], collect(&dispatcher, vec![evt("app", "1")]));
        assert!(dispatcher.pool().info("app.txt").is_some());

        fs.fail_write(true);

        assert_eq!(
            vec![Err(ErrorKind::Write), Err(ErrorKind::Write)],
            collect(&dispatcher, vec![evt("app", "2"), evt("app", "3")])
        );
        assert!(dispatcher.pool().info("app.txt").is_none());

        // The next batch opens the file again
        fs.fail_write(false);

        assert_eq!(vec![Ok(())], collect(&dispatcher, vec![evt("app", "4")]));
        assert_eq!("1\n4\n", fs.contents_str("app.txt"));
        assert_eq!(2, dispatcher.metrics.file_open.sample());
    }

    #[test]
    fn render_failure_fails_only_that_event() {
        let fs = InMemoryFilesystem::new();

        let mut dispatcher = dispatcher(&fs, PathRouter::fixed("app.txt"), Duration::from_secs(60));
        dispatcher.writer = Box::new(|buf: &mut FileBuf, evt: &LogEvent| {
            if evt.message() == "bad" {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "unrenderable"));
            }

            buf.extend_from_slice(evt.message().as_bytes());
            Ok(())
        });

        let outcomes = collect(
            &dispatcher,
            vec![evt("app", "1"), evt("app", "bad"), evt("app", "2")],
        );

        assert_eq!(vec![Ok(()), Err(ErrorKind::Render), Ok(())], outcomes);
        assert_eq!("1\n2\n", fs.contents_str("app.txt"));
        assert_eq!(1, dispatcher.metrics.event_format_failed.sample());
    }

    #[test]
    fn separator_is_not_doubled() {
        let fs = InMemoryFilesystem::new();

        let dispatcher = dispatcher(&fs, PathRouter::fixed("app.txt"), Duration::from_secs(60));

        collect(&dispatcher, vec![evt("app", "1\n"), evt("app", "2")]);

        assert_eq!("1\n2\n", fs.contents_str("app.txt"));
    }

    #[test]
    fn zero_idle_timeout_closes_after_each_write() {
        let fs = InMemoryFilesystem::new();

        let dispatcher = dispatcher(&fs, by_logger(), Duration::ZERO);

        let outcomes = collect(
            &dispatcher,
            vec![evt("a.txt", "1"), evt("b.txt", "1"), evt("a.txt", "2")],
        );

        assert_eq!(vec![Ok(()), Ok(()), Ok(())], outcomes);
        assert_eq!(0, dispatcher.pool().len());
        assert_eq!("1\n2\n", fs.contents_str("a.txt"));
        assert_eq!("1\n", fs.contents_str("b.txt"));

        // Every write opened its file afresh
        assert_eq!(3, dispatcher.metrics.file_open.sample());
    }

    #[test]
    fn rotation_failure_keeps_live_file() {
        let fs = InMemoryFilesystem::new();
        let metrics = Arc::new(InternalMetrics::default());

        let mut dispatcher = dispatcher(&fs, PathRouter::fixed("app.txt"), Duration::from_secs(60));
        dispatcher.archive = ArchiveEngine::new(
            ArchiveSpec {
                file_name: Some("archive/{##}.txt".into()),
                above_size_bytes: 4,
                max_archive_files: 2,
                numbering: Numbering::Rolling,
            },
            metrics.clone(),
        )
        .unwrap();

        assert_eq!(vec![Ok(())], collect(&dispatcher, vec![evt("app", "abc")]));

        fs.fail_rename(true);

        assert_eq!(
            vec![Err(ErrorKind::Rotate)],
            collect(&dispatcher, vec![evt("app", "def")])
        );
        assert_eq!("abc\n", fs.contents_str("app.txt"));
        assert_eq!(1, metrics.archive_failed.sample());

        fs.fail_rename(false);

        assert_eq!(vec![Ok(())], collect(&dispatcher, vec![evt("app", "ghi")]));
        assert_eq!("abc\n", fs.contents_str("archive/00.txt"));
        assert_eq!("ghi\n", fs.contents_str("app.txt"));
    }
}
