use std::{mem, sync::Mutex, time::Duration};

use crate::{Callback, LogEvent, Target};

/**
Wrap `target` so events are written in batches of `capacity`.

See [`BufferingTarget`] for details.
*/
pub fn buffering<T: Target>(target: T, capacity: usize) -> BufferingTarget<T> {
    BufferingTarget::new(target, capacity)
}

/**
A [`Target`] that holds events until it has a full batch to write.

Events are written to the wrapped target, in the order they were submitted, once `capacity` of them are buffered, or when [`Target::blocking_flush`] is called. Any events still buffered when the target is dropped are written then.

Buffered events have already captured their thread and timestamp, so they reflect the thread that submitted them rather than the one that fills the buffer.

A full batch is written to the wrapped target while the buffer is locked, so batches reach it in the order they filled up. Callbacks run during that write, which means a callback must not write to or flush the same `BufferingTarget` or it will deadlock.
*/
pub struct BufferingTarget<T: Target> {
    target: T,
    capacity: usize,
    buffer: Mutex<Vec<(LogEvent, Callback)>>,
}

impl<T: Target> BufferingTarget<T> {
    /**
    Wrap `target`, writing events in batches of `capacity`.

    A capacity of `0` is treated as `1`.
    */
    pub fn new(target: T, capacity: usize) -> Self {
        let capacity = capacity.max(1);

        BufferingTarget {
            target,
            capacity,
            buffer: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /**
    Get a reference to the wrapped target.
    */
    pub fn inner(&self) -> &T {
        &self.target
    }

    /**
    The number of events waiting to be written.
    */
    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    fn write_buffered(&self) {
        // Hold the lock while writing so batches reach the target in submission order
        let mut buffer = self.buffer.lock().unwrap();

        if !buffer.is_empty() {
            let batch = mem::replace(&mut *buffer, Vec::with_capacity(self.capacity));

            self.target.write_batch(batch);
        }
    }
}

impl<T: Target> Target for BufferingTarget<T> {
    fn write_batch(&self, batch: Vec<(LogEvent, Callback)>) {
        let mut buffer = self.buffer.lock().unwrap();

        for (mut evt, callback) in batch {
            evt.capture();

            buffer.push((evt, callback));

            if buffer.len() >= self.capacity {
                let batch = mem::replace(&mut *buffer, Vec::with_capacity(self.capacity));

                self.target.write_batch(batch);
            }
        }
    }

    fn blocking_flush(&self, timeout: Duration) -> bool {
        self.write_buffered();

        self.target.blocking_flush(timeout)
    }
}

impl<T: Target> Drop for BufferingTarget<T> {
    fn drop(&mut self) {
        self.write_buffered();
    }
}
