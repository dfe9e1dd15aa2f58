/*!
Run queues on regular OS threads.
*/

use std::{
    io,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use crate::{Receiver, SendError, Sender};

/**
Run the receiver on a dedicated background thread named `name`.

This method spawns a background thread and runs [`Receiver::exec`] on it. The thread exits, and the handle joins, once the [`Sender`] is dropped and the queue is drained.
*/
pub fn spawn<T: Send + 'static>(
    name: impl Into<String>,
    receiver: Receiver<T>,
    on_batch: impl FnMut(Vec<T>) + Send + 'static,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(name.into())
        .spawn(move || receiver.exec(on_batch))
}

/**
Wait for a queue running on a regular OS thread to process all items present at the point this call was made.

Returns `false` if `timeout` elapsed before the items were processed.
*/
pub fn blocking_flush<T>(sender: &Sender<T>, timeout: Duration) -> bool {
    let notifier = Trigger::new();

    sender.when_flushed({
        let notifier = notifier.clone();

        move || {
            notifier.trigger();
        }
    });

    notifier.wait_timeout(timeout)
}

/**
Send an item on the queue, blocking while the queue is at capacity.

If `timeout` is `None` then this method waits until the item is queued or the receiver goes away.
*/
pub fn blocking_send<T>(
    sender: &Sender<T>,
    msg: T,
    timeout: Option<Duration>,
) -> Result<(), SendError<T>> {
    sender.send_or_wait(msg, timeout, |sender, timeout| {
        let notifier = Trigger::new();

        sender.when_not_full({
            let notifier = notifier.clone();

            move || {
                notifier.trigger();
            }
        });

        notifier.wait_timeout(timeout);
    })
}

#[derive(Clone)]
struct Trigger(Arc<(Mutex<bool>, Condvar)>);

impl Trigger {
    fn new() -> Self {
        Trigger(Arc::new((Mutex::new(false), Condvar::new())))
    }

    fn trigger(self) {
        *(self.0).0.lock().unwrap() = true;
        (self.0).1.notify_all();
    }

    fn wait_timeout(&self, mut timeout: Duration) -> bool {
        let mut flushed_slot = (self.0).0.lock().unwrap();
        loop {
            // If we flushed then return
            // This condition may already be set before we start waiting
            if *flushed_slot {
                return true;
            }

            // If the timeout is 0 then return
            // There's no point waiting for the condition
            if timeout == Duration::ZERO {
                return false;
            }

            let now = Instant::now();
            match (self.0).1.wait_timeout(flushed_slot, timeout).unwrap() {
                (flushed, r) if !r.timed_out() => {
                    flushed_slot = flushed;

                    // Reduce the remaining timeout just in case we didn't time out,
                    // but woke up spuriously for some reason
                    timeout = match timeout.checked_sub(now.elapsed()) {
                        Some(timeout) => timeout,
                        // We didn't time out, but got close enough that we should now anyways
                        None => {
                            return *flushed_slot;
                        }
                    };

                    continue;
                }
                // Timed out
                (flushed, _) => {
                    return *flushed;
                }
            }
        }
    }
}
