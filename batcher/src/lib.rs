/*!
Infrastructure for writing log events in the background.

This library implements a queue between any number of producer threads and a single consumer running on a dedicated thread. The queue implements:

- **Batching:** Items pushed onto the queue are handed to the consumer in ordered batches of at most [`Receiver::max_batch_size`] items rather than one-at-a-time.
- **Overflow policies:** When the queue is at capacity, new items either grow the queue, are discarded, or block the sender until the consumer makes room. See [`OverflowPolicy`].
- **Flushing:** Callers can ask to be signalled when every item in the queue at the point they called has been processed. Items pushed after that point aren't waited on.
- **Isolation:** A consumer that panics while processing a batch doesn't take down the background thread. Later batches are still processed.
*/

#![deny(missing_docs)]

use crate::internal_metrics::InternalMetrics;
use std::{
    cmp,
    collections::VecDeque,
    error, fmt, mem,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

mod internal_metrics;

pub mod sync;

pub use sync::{blocking_flush, blocking_send, spawn};

const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/**
What to do with a new item when the queue is already at its maximum capacity.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /**
    Push the item anyway, letting the queue grow beyond its capacity.
    */
    Grow,
    /**
    Reject the item, returning it to the sender.
    */
    Discard,
    /**
    Block the sending thread until the consumer takes items off the queue.
    */
    Block,
}

/**
Create a [`Sender`] and [`Receiver`] pair.

When the queue holds `max_capacity` items, further sends are handled according to `overflow`. A capacity of `0` is treated as `1`.

Use [`Sender::send`] to push items onto the queue.

Use [`sync::spawn`] to run the receiver-side of the queue on a background thread.
*/
pub fn bounded<T>(max_capacity: usize, overflow: OverflowPolicy) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        metrics: Default::default(),
        state: Mutex::new(State {
            queue: VecDeque::new(),
            enqueued: 0,
            processed: 0,
            is_open: true,
            watchers: Watchers::new(),
        }),
        wake: Condvar::new(),
    });

    (
        Sender {
            max_capacity: cmp::max(1, max_capacity),
            overflow,
            shared: shared.clone(),
        },
        Receiver {
            idle_delay: Delay::new(Duration::from_millis(1), Duration::from_millis(500)),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            shared,
        },
    )
}

/**
The sending half of a queue.
*/
pub struct Sender<T> {
    max_capacity: usize,
    overflow: OverflowPolicy,
    shared: Arc<Shared<T>>,
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().is_open = false;
        self.shared.wake.notify_all();
    }
}

impl<T> Sender<T> {
    /**
    Send an item on the queue.

    The item will be processed at some future point by the [`Receiver`]. If the queue is full then the item is handled according to the configured [`OverflowPolicy`]. If the item couldn't be queued it's returned in the error.
    */
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        match self.overflow {
            OverflowPolicy::Grow => self.push(msg, true),
            OverflowPolicy::Discard => self.push(msg, false).map_err(|err| {
                if err.is_full() {
                    self.shared.metrics.queue_full_discarded.increment();
                }

                err
            }),
            OverflowPolicy::Block => sync::blocking_send(self, msg, None),
        }
    }

    /**
    Send an item on the queue, returning it if the queue is currently full.

    This method ignores the configured [`OverflowPolicy`].
    */
    pub fn try_send(&self, msg: T) -> Result<(), SendError<T>> {
        self.push(msg, false)
    }

    fn push(&self, msg: T, grow: bool) -> Result<(), SendError<T>> {
        let mut state = self.shared.state.lock().unwrap();

        if !state.is_open {
            return Err(SendError::closed(msg));
        }

        if !grow && state.queue.len() >= self.max_capacity {
            return Err(SendError::full(msg));
        }

        state.queue.push_back(msg);
        state.enqueued += 1;

        // Only the receiver waits on this condition
        drop(state);
        self.shared.wake.notify_one();

        Ok(())
    }

    fn send_or_wait(
        &self,
        msg: T,
        timeout: Option<Duration>,
        mut wait_until_not_full: impl FnMut(&Self, Duration),
    ) -> Result<(), SendError<T>> {
        match self.try_send(msg) {
            // If the message was sent then return
            Ok(()) => Ok(()),
            // If the message wasn't sent then wait until the receiver takes
            // some items and try again
            Err(mut err) => {
                self.shared.metrics.queue_full_blocked.increment();

                let now = Instant::now();

                loop {
                    if err.is_closed() {
                        return Err(err);
                    }

                    let remaining = match timeout {
                        Some(timeout) => match timeout.checked_sub(now.elapsed()) {
                            Some(remaining) if remaining > Duration::ZERO => remaining,
                            _ => return Err(err),
                        },
                        None => BLOCKING_SEND_SLICE,
                    };

                    wait_until_not_full(self, cmp::min(remaining, BLOCKING_SEND_SLICE));

                    // NOTE: Between being triggered and calling, we may have filled up again
                    match self.try_send(err.into_inner()) {
                        Ok(()) => return Ok(()),
                        Err(retry) => err = retry,
                    }
                }
            }
        }
    }

    /**
    Set a callback to fire when the queue has room for another item.

    If the queue already has room then the callback fires immediately on the calling thread.
    */
    pub fn when_not_full(&self, f: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();

        if state.queue.len() < self.max_capacity || !state.is_open {
            drop(state);

            f();
        } else {
            state.watchers.push_on_take(Box::new(f));
        }
    }

    /**
    Set a callback to fire when all items in the queue at the time of this call are processed by the [`Receiver`].

    Items sent after this call aren't waited on.
    */
    pub fn when_flushed(&self, f: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();

        // If:
        // - Everything sent so far has been processed or
        // - The queue is closed
        // Then:
        // - Call the watcher without scheduling it; there's nothing to flush
        if state.processed >= state.enqueued || !state.is_open {
            // Drop the lock before signalling the watcher
            drop(state);

            f();
        } else {
            let target = state.enqueued;
            state.watchers.push_on_flush(target, Box::new(f));
        }
    }

    /**
    Get an [`emit::metric::Source`] for instrumentation produced by the queue.

    These metrics can be used to monitor the running health of the background writer.
    */
    pub fn metric_source(&self) -> ChannelMetrics<T> {
        ChannelMetrics {
            shared: self.shared.clone(),
        }
    }
}

const BLOCKING_SEND_SLICE: Duration = Duration::from_millis(100);

/**
The receiving half of a queue.

Use [`Receiver::exec`] or [`crate::sync::spawn`] to run the receiver as a background worker.
*/
pub struct Receiver<T> {
    idle_delay: Delay,
    max_batch_size: usize,
    shared: Arc<Shared<T>>,
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let watchers = {
            let mut state = self.shared.state.lock().unwrap();
            state.is_open = false;

            mem::take(&mut state.watchers)
        };

        // Nothing will ever process the remaining items, so release anyone waiting
        watchers.notify_all();
    }
}

impl<T> Receiver<T> {
    /**
    Set the maximum number of items handed to the consumer in a single batch.

    A value of `0` is treated as `1`.
    */
    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = cmp::max(1, max_batch_size);
        self
    }

    /**
    Run the receiver on the current thread.

    Batches are taken from the front of the queue in the order their items were sent. This method returns once the [`Sender`] is dropped and all remaining items have been processed.

    If `on_batch` panics, the panic is caught and the receiver moves on to the next batch.
    */
    pub fn exec(mut self, mut on_batch: impl FnMut(Vec<T>)) {
        loop {
            // Run inside the lock
            let (batch, on_take, is_open) = {
                let mut state = self.shared.state.lock().unwrap();

                // If there's nothing to do then wait for a sender to wake us
                // The wait is bounded so a lost notification only costs latency
                if state.queue.is_empty() && state.is_open {
                    state = self
                        .shared
                        .wake
                        .wait_timeout(state, self.idle_delay.next())
                        .unwrap()
                        .0;
                }

                let len = cmp::min(state.queue.len(), self.max_batch_size);
                let batch = state.queue.drain(..len).collect::<Vec<_>>();

                let on_take = if len > 0 {
                    mem::take(&mut state.watchers.on_take)
                } else {
                    Vec::new()
                };

                (batch, on_take, state.is_open)
            };

            // Run outside of the lock
            notify(on_take);

            if !batch.is_empty() {
                self.idle_delay.reset();

                let len = batch.len() as u64;

                // Process the batch, taking care not to panic
                match panic::catch_unwind(AssertUnwindSafe(|| on_batch(batch))) {
                    Ok(()) => {
                        self.shared.metrics.queue_batch_processed.increment();
                    }
                    Err(_) => {
                        self.shared.metrics.queue_batch_panicked.increment();

                        emit::warn!(
                            rt: emit::runtime::internal(),
                            "background batch of {len} items panicked; the items were not processed",
                            len,
                        );
                    }
                }

                // After the batch has been processed, notify any watchers waiting on it
                let flushed = {
                    let mut state = self.shared.state.lock().unwrap();

                    state.processed += len;
                    let processed = state.processed;

                    state.watchers.take_flushed(processed)
                };

                notify(flushed);
            }
            // If the queue is closed and empty then exit the loop and return; this will
            // drop the receiver
            else if !is_open {
                return;
            }
        }
    }

    /**
    Get an [`emit::metric::Source`] for instrumentation produced by the queue.

    These metrics can be used to monitor the running health of the background writer.
    */
    pub fn metric_source(&self) -> ChannelMetrics<T> {
        ChannelMetrics {
            shared: self.shared.clone(),
        }
    }
}

/**
An error attempting to push an item onto the queue.

The item that couldn't be queued can be recovered with [`SendError::into_inner`].
*/
pub struct SendError<T> {
    msg: T,
    reason: &'static str,
    is_closed: bool,
}

impl<T> SendError<T> {
    fn full(msg: T) -> Self {
        SendError {
            msg,
            reason: "the queue is full",
            is_closed: false,
        }
    }

    fn closed(msg: T) -> Self {
        SendError {
            msg,
            reason: "the queue is closed",
            is_closed: true,
        }
    }

    /**
    Whether the item was rejected because the queue is at capacity.
    */
    pub fn is_full(&self) -> bool {
        !self.is_closed
    }

    /**
    Whether the item was rejected because the receiver is gone.
    */
    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /**
    Get the item that couldn't be queued.
    */
    pub fn into_inner(self) -> T {
        self.msg
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self.reason, f)
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.reason, f)
    }
}

impl<T> error::Error for SendError<T> {}

struct Delay {
    current: Duration,
    step: Duration,
    max: Duration,
}

impl Delay {
    fn new(step: Duration, max: Duration) -> Delay {
        Delay {
            current: Duration::ZERO,
            step,
            max,
        }
    }

    fn reset(&mut self) {
        self.current = Duration::ZERO
    }

    fn next(&mut self) -> Duration {
        self.current = cmp::min(self.current * 2 + self.step, self.max);
        self.current
    }
}

struct Shared<T> {
    metrics: InternalMetrics,
    state: Mutex<State<T>>,
    wake: Condvar,
}

/**
Metrics produced by a queue.

You can enumerate the metrics using the [`emit::metric::Source`] implementation. See [`emit::metric`] for details.
*/
pub struct ChannelMetrics<T> {
    shared: Arc<Shared<T>>,
}

impl<T> emit::metric::Source for ChannelMetrics<T> {
    fn sample_metrics<S: emit::metric::sampler::Sampler>(&self, sampler: S) {
        let queue_length = { self.shared.state.lock().unwrap().queue.len() };

        let metrics = self
            .shared
            .metrics
            .sample()
            .chain(Some(emit::metric::Metric::new(
                emit::pkg!(),
                "queue_length",
                emit::well_known::METRIC_AGG_LAST,
                emit::empty::Empty,
                queue_length,
                emit::empty::Empty,
            )));

        for metric in metrics {
            sampler.metric(metric);
        }
    }
}

struct State<T> {
    queue: VecDeque<T>,
    enqueued: u64,
    processed: u64,
    is_open: bool,
    watchers: Watchers,
}

type Watcher = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Watchers {
    on_take: Vec<Watcher>,
    on_flush: Vec<(u64, Watcher)>,
}

impl Watchers {
    fn new() -> Self {
        Watchers {
            on_take: Vec::new(),
            on_flush: Vec::new(),
        }
    }

    fn push_on_take(&mut self, watcher: Watcher) {
        self.on_take.push(watcher);
    }

    fn push_on_flush(&mut self, target: u64, watcher: Watcher) {
        self.on_flush.push((target, watcher));
    }

    fn take_flushed(&mut self, processed: u64) -> Vec<Watcher> {
        let mut flushed = Vec::new();

        for (target, watcher) in mem::take(&mut self.on_flush) {
            if target <= processed {
                flushed.push(watcher);
            } else {
                self.on_flush.push((target, watcher));
            }
        }

        flushed
    }

    fn notify_all(self) {
        notify(self.on_take);
        notify(self.on_flush.into_iter().map(|(_, watcher)| watcher));
    }
}

fn notify(watchers: impl IntoIterator<Item = Watcher>) {
    for watcher in watchers {
        let _ = panic::catch_unwind(AssertUnwindSafe(watcher));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn discard_rejects_new_items_when_full() {
        let (sender, receiver) = bounded::<u32>(2, OverflowPolicy::Discard);

        sender.send(1).unwrap();
        sender.send(2).unwrap();

        let err = sender.send(3).unwrap_err();
        assert!(err.is_full());
        assert_eq!(3, err.into_inner());

        assert_eq!(1, sender.shared.metrics.queue_full_discarded.sample());

        drop(receiver);
    }

    #[test]
    fn grow_accepts_items_beyond_capacity() {
        let (sender, receiver) = bounded::<u32>(2, OverflowPolicy::Grow);

        for i in 0..10 {
            sender.send(i).unwrap();
        }

        assert_eq!(10, sender.shared.state.lock().unwrap().queue.len());

        drop(receiver);
    }

    #[test]
    fn send_after_receiver_dropped_is_closed() {
        let (sender, receiver) = bounded::<u32>(2, OverflowPolicy::Grow);

        drop(receiver);

        let err = sender.send(1).unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn exec_takes_bounded_batches_in_order() {
        let (sender, receiver) = bounded::<u32>(100, OverflowPolicy::Grow);

        for i in 0..25 {
            sender.send(i).unwrap();
        }

        drop(sender);

        let mut batches = Vec::new();
        receiver
            .max_batch_size(10)
            .exec(|batch| batches.push(batch));

        assert_eq!(
            vec![
                (0..10).collect::<Vec<_>>(),
                (10..20).collect::<Vec<_>>(),
                (20..25).collect::<Vec<_>>(),
            ],
            batches
        );
    }

    #[test]
    fn exec_survives_panicking_batch() {
        let (sender, receiver) = bounded::<u32>(100, OverflowPolicy::Grow);

        for i in 0..3 {
            sender.send(i).unwrap();
        }

        drop(sender);

        let shared = receiver.shared.clone();

        let mut seen = Vec::new();
        receiver.max_batch_size(1).exec(|batch| {
            if batch[0] == 1 {
                panic!("explicit panic");
            }

            seen.extend(batch);
        });

        assert_eq!(vec![0, 2], seen);
        assert_eq!(1, shared.metrics.queue_batch_panicked.sample());
        assert_eq!(2, shared.metrics.queue_batch_processed.sample());
    }

    #[test]
    fn when_flushed_fires_immediately_when_nothing_is_queued() {
        let (sender, _receiver) = bounded::<u32>(10, OverflowPolicy::Grow);

        let fired = Arc::new(AtomicBool::new(false));

        sender.when_flushed({
            let fired = fired.clone();
            move || fired.store(true, Ordering::SeqCst)
        });

        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn when_flushed_waits_for_queued_items_only() {
        let (sender, receiver) = bounded::<u32>(10, OverflowPolicy::Grow);

        sender.send(1).unwrap();

        let fired = Arc::new(AtomicBool::new(false));

        sender.when_flushed({
            let fired = fired.clone();
            move || fired.store(true, Ordering::SeqCst)
        });

        assert!(!fired.load(Ordering::SeqCst));

        let mut state = receiver.shared.state.lock().unwrap();
        state.queue.push_back(2);
        state.enqueued += 1;

        // Processing the first item is enough to satisfy the watcher
        state.processed += 1;
        let processed = state.processed;
        let flushed = state.watchers.take_flushed(processed);
        drop(state);

        notify(flushed);

        assert!(fired.load(Ordering::SeqCst));
    }

    #[quickcheck_macros::quickcheck]
    fn exec_preserves_send_order(items: Vec<u8>, max_batch_size: u8) -> bool {
        let (sender, receiver) = bounded::<u8>(usize::MAX, OverflowPolicy::Grow);

        for item in &items {
            sender.send(*item).unwrap();
        }

        drop(sender);

        let mut received = Vec::new();
        receiver
            .max_batch_size(max_batch_size as usize)
            .exec(|batch| received.extend(batch));

        received == items
    }
}
