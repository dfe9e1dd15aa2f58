use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use filesink_batcher::{OverflowPolicy, Sender};

use crate::{event, Callback, Error, ErrorKind, LogEvent, Target};

const DEFAULT_QUEUE_LIMIT: usize = 10_000;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_OVERFLOW: OverflowPolicy = OverflowPolicy::Discard;

type Job = (LogEvent, Callback);

/**
Create a builder for an [`AsyncTarget`] that writes to `target` on a background thread.
*/
pub fn background<T: Target + Send + Sync + 'static>(target: T) -> AsyncTargetBuilder<T> {
    AsyncTargetBuilder::new(target)
}

/**
A builder for an [`AsyncTarget`].

It will use the following defaults:

- A queue of up to 10,000 events.
- Batches of up to 100 events.
- Events submitted while the queue is full are discarded.
*/
pub struct AsyncTargetBuilder<T> {
    target: T,
    queue_limit: usize,
    batch_size: usize,
    overflow: OverflowPolicy,
}

impl<T: Target + Send + Sync + 'static> AsyncTargetBuilder<T> {
    /**
    Create a new builder wrapping `target`.
    */
    pub fn new(target: T) -> Self {
        AsyncTargetBuilder {
            target,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            batch_size: DEFAULT_BATCH_SIZE,
            overflow: DEFAULT_OVERFLOW,
        }
    }

    /**
    The number of events the queue holds before the overflow policy applies.

    A value of `0` is treated as `1`.
    */
    pub fn queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }

    /**
    The maximum number of events handed to the wrapped target in a single batch.
    */
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /**
    What to do with events submitted while the queue is full.

    Events discarded by [`OverflowPolicy::Discard`] have their callback invoked with an [`ErrorKind::Discarded`] error.
    */
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /**
    Spawn the background thread, returning an [`AsyncTarget`] to submit events to.

    This method fails if the thread can't be spawned.
    */
    pub fn spawn(self) -> Result<AsyncTarget<T>, Error> {
        let target = Arc::new(self.target);

        let (sender, receiver) = filesink_batcher::bounded(self.queue_limit, self.overflow);
        let receiver = receiver.max_batch_size(self.batch_size);

        let handle = filesink_batcher::spawn("filesink_worker", receiver, {
            let target = target.clone();

            move |batch: Vec<Job>| target.write_batch(batch)
        })
        .map_err(|err| {
            emit::error!(
                rt: emit::runtime::internal(),
                "failed to spawn the background writer: {err}",
            );

            Error::config(err)
        })?;

        Ok(AsyncTarget {
            sender,
            target,
            handle,
        })
    }
}

/**
A [`Target`] that writes events to another target on a dedicated background thread.

Submitting an event captures its thread and timestamp and pushes it onto a queue. A single background thread takes events off the queue in the order they were submitted and writes them in batches. Events routed to the same file are written in submission order across batches.

Create an async target through the [`background`] function, calling [`AsyncTargetBuilder::spawn`] to complete configuration.

Dropping the target stops accepting events. The background thread writes any events still queued and then exits. Call [`AsyncTarget::close`] to wait for that to happen.
*/
pub struct AsyncTarget<T> {
    sender: Sender<Job>,
    target: Arc<T>,
    handle: thread::JoinHandle<()>,
}

impl<T: Target + Send + Sync + 'static> Target for AsyncTarget<T> {
    fn write_batch(&self, batch: Vec<(LogEvent, Callback)>) {
        for (mut evt, callback) in batch {
            evt.capture();

            if let Err(err) = self.sender.send((evt, callback)) {
                let (kind, reason) = if err.is_full() {
                    (ErrorKind::Discarded, "the queue is full")
                } else {
                    (ErrorKind::Closed, "the background writer has stopped")
                };

                if kind == ErrorKind::Discarded {
                    emit::warn!(
                        rt: emit::runtime::internal(),
                        "discarding event: {reason}",
                    );
                }

                let (_, callback) = err.into_inner();
                event::complete(Some(callback), Some(Err(Error::new(kind, None, reason))));
            }
        }
    }

    /**
    Wait for every event submitted so far to be written by the background thread, then flush the wrapped target.
    */
    fn blocking_flush(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        if !filesink_batcher::blocking_flush(&self.sender, timeout) {
            return false;
        }

        self.target
            .blocking_flush(timeout.saturating_sub(start.elapsed()))
    }
}

impl<T: Target + Send + Sync + 'static> AsyncTarget<T> {
    /**
    Get a reference to the wrapped target.
    */
    pub fn inner(&self) -> &T {
        &self.target
    }

    /**
    Get an [`emit::metric::Source`] for instrumentation produced by the queue.
    */
    pub fn metric_source(&self) -> impl emit::metric::Source + Send + Sync + 'static {
        self.sender.metric_source()
    }

    /**
    Stop accepting events and wait for the background thread to write everything already queued.

    Returns `false` if the queue wasn't drained within `timeout`. In that case the background thread is left to finish on its own.
    */
    pub fn close(self, timeout: Duration) -> bool {
        let AsyncTarget {
            sender,
            target,
            handle,
        } = self;

        if !filesink_batcher::blocking_flush(&sender, timeout) {
            return false;
        }

        // Closing the queue lets the background thread exit
        drop(sender);

        if handle.join().is_err() {
            return false;
        }

        target.blocking_flush(Duration::ZERO)
    }
}
