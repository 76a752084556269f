//! The central callback executor.
//!
//! Every user-visible callback in the fabric (message handlers, disconnect
//! handlers) is posted here rather than run on a transport thread. A
//! scheduler dispatches from one FIFO queue on one named thread, so
//! callbacks submitted by a single submitter run in submission order, which
//! is what keeps same-channel messages from reordering during dispatch.
//! Embedders that want parallel dispatch create one scheduler per remote
//! connection.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};

enum Command {
    Run(Box<dyn FnOnce() + Send>, &'static str),
    Shutdown,
}

/// A shared executor with a single FIFO dispatch thread.
pub struct CallbackScheduler {
    name: String,
    queue: Sender<Command>,
    outstanding: Mutex<usize>,
    drained: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackScheduler {
    /// Creates a named scheduler and starts its dispatch thread.
    pub fn new(name: &str) -> Arc<CallbackScheduler> {
        let (queue, commands) = unbounded::<Command>();

        let scheduler = Arc::new(CallbackScheduler {
            name: name.to_owned(),
            queue,
            outstanding: Mutex::new(0),
            drained: Condvar::new(),
            worker: Mutex::new(None),
        });

        let shared = Arc::downgrade(&scheduler);
        let worker = thread::Builder::new()
            .name(format!("scheduler {}", name))
            .spawn(move || {
                while let Ok(command) = commands.recv() {
                    match command {
                        Command::Run(action, tag) => {
                            tracing::trace!(tag, "dispatching callback");
                            action();
                            if let Some(scheduler) = shared.upgrade() {
                                scheduler.finish_one();
                            }
                        }
                        Command::Shutdown => return,
                    }
                }
            })
            .expect("failed to spawn scheduler thread");

        *scheduler.worker.lock().expect("scheduler state poisoned") = Some(worker);
        scheduler
    }

    /// The scheduler's name, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a callback for dispatch in submission order.
    ///
    /// The tag names the submission site in trace output.
    pub fn schedule_immediately(&self, action: impl FnOnce() + Send + 'static, tag: &'static str) {
        {
            let mut outstanding = self.outstanding.lock().expect("scheduler state poisoned");
            *outstanding += 1;
        }
        if self.queue.send(Command::Run(Box::new(action), tag)).is_err() {
            // Dispatch thread already gone; account for the callback so
            // waiters do not hang.
            self.finish_one();
        }
    }

    /// Blocks until every callback enqueued so far has executed.
    ///
    /// Intended for tests; callbacks enqueued while waiting extend the wait.
    pub fn block_until_idle(&self) {
        let mut outstanding = self.outstanding.lock().expect("scheduler state poisoned");
        while *outstanding > 0 {
            outstanding = self
                .drained
                .wait(outstanding)
                .expect("scheduler state poisoned");
        }
    }

    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock().expect("scheduler state poisoned");
        *outstanding -= 1;
        if *outstanding == 0 {
            self.drained.notify_all();
        }
    }
}

impl Drop for CallbackScheduler {
    fn drop(&mut self) {
        let _ = self.queue.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().ok().and_then(|mut slot| slot.take()) {
            // The dispatch thread itself may drop the last handle; joining
            // ourselves would deadlock.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_run_in_submission_order() {
        let scheduler = CallbackScheduler::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for index in 0..100usize {
            let seen = seen.clone();
            scheduler.schedule_immediately(
                move || seen.lock().unwrap().push(index),
                "test submission",
            );
        }
        scheduler.block_until_idle();
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn block_until_idle_observes_all_work() {
        let scheduler = CallbackScheduler::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let count = count.clone();
            scheduler.schedule_immediately(
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                "test count",
            );
        }
        scheduler.block_until_idle();
        assert_eq!(count.load(Ordering::SeqCst), 32);
    }
}
