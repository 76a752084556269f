//! The queue-like adapter: a push channel made pullable.
//!
//! Wrapping a channel installs handlers that park messages in an internal
//! queue; consumers pull with blocking, non-blocking, or deadline reads.
//! The adapter can later be re-subscribed with explicit handlers, at which
//! point buffered values flush to them in FIFO order and delivery reverts
//! to the push path. Buffered values are always surfaced before the
//! disconnect is.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::channel::{Channel, Disconnected, OnDisconnected, OnMessage};
use crate::scheduler::CallbackScheduler;

struct Subscriber<T> {
    on_message: Arc<Mutex<OnMessage<T>>>,
}

struct QueueState<TIn> {
    pending: VecDeque<TIn>,
    subscriber: Option<Subscriber<TIn>>,
    disconnected: bool,
    disconnect_delivered: bool,
    on_disconnected: Option<OnDisconnected>,
}

struct QueueCore<TOut, TIn> {
    inner: Arc<dyn Channel<TOut, TIn>>,
    scheduler: Arc<CallbackScheduler>,
    state: Mutex<QueueState<TIn>>,
    available: Condvar,
}

/// A channel with blocking pull reads alongside its push interface.
pub struct QueuelikeChannel<TOut, TIn> {
    core: Arc<QueueCore<TOut, TIn>>,
}

/// Wraps `inner` so consumers can pull, installing the queueing handlers.
pub fn make_queuelike<TOut, TIn>(
    scheduler: &Arc<CallbackScheduler>,
    inner: Arc<dyn Channel<TOut, TIn>>,
) -> Arc<QueuelikeChannel<TOut, TIn>>
where
    TOut: Send + 'static,
    TIn: Send + 'static,
{
    let core = Arc::new(QueueCore {
        inner,
        scheduler: scheduler.clone(),
        state: Mutex::new(QueueState {
            pending: VecDeque::new(),
            subscriber: None,
            disconnected: false,
            disconnect_delivered: false,
            on_disconnected: None,
        }),
        available: Condvar::new(),
    });

    let enqueue_core = core.clone();
    let disconnect_core = core.clone();
    core.inner.set_handlers(
        Box::new(move |message| enqueue_core.on_inner_message(message)),
        Box::new(move || disconnect_core.on_inner_disconnect()),
    );

    Arc::new(QueuelikeChannel { core })
}

impl<TOut, TIn> QueueCore<TOut, TIn>
where
    TOut: Send + 'static,
    TIn: Send + 'static,
{
    fn on_inner_message(&self, message: TIn) {
        let mut state = self.state.lock().expect("queuelike state poisoned");
        match &state.subscriber {
            Some(subscriber) => {
                // Deliver through the scheduler so a message arriving
                // during re-subscription cannot overtake the buffered
                // flush scheduled just before it.
                let handler = subscriber.on_message.clone();
                self.scheduler.schedule_immediately(
                    move || (handler.lock().expect("message handler poisoned"))(message),
                    "QueuelikeChannel::push",
                );
            }
            None => {
                state.pending.push_back(message);
                self.available.notify_one();
            }
        }
    }

    fn on_inner_disconnect(&self) {
        let callback = {
            let mut state = self.state.lock().expect("queuelike state poisoned");
            state.disconnected = true;
            self.available.notify_all();
            if state.subscriber.is_some() && !state.disconnect_delivered {
                state.disconnect_delivered = true;
                state.on_disconnected.take()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl<TOut, TIn> QueuelikeChannel<TOut, TIn>
where
    TOut: Send + 'static,
    TIn: Send + 'static,
{
    /// Blocks until a message arrives or the channel disconnects.
    pub fn get(&self) -> Result<TIn, Disconnected> {
        let mut state = self.core.state.lock().expect("queuelike state poisoned");
        loop {
            if let Some(message) = state.pending.pop_front() {
                return Ok(message);
            }
            if state.disconnected {
                return Err(Disconnected);
            }
            state = self
                .core
                .available
                .wait(state)
                .expect("queuelike state poisoned");
        }
    }

    /// Returns a message if one is already buffered.
    pub fn get_nonblocking(&self) -> Result<Option<TIn>, Disconnected> {
        let mut state = self.core.state.lock().expect("queuelike state poisoned");
        if let Some(message) = state.pending.pop_front() {
            return Ok(Some(message));
        }
        if state.disconnected {
            return Err(Disconnected);
        }
        Ok(None)
    }

    /// Blocks up to `timeout` for a message; `None` past the deadline.
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<TIn>, Disconnected> {
        let deadline = Instant::now() + timeout;
        let mut state = self.core.state.lock().expect("queuelike state poisoned");
        loop {
            if let Some(message) = state.pending.pop_front() {
                return Ok(Some(message));
            }
            if state.disconnected {
                return Err(Disconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (reacquired, _) = self
                .core
                .available
                .wait_timeout(state, deadline - now)
                .expect("queuelike state poisoned");
            state = reacquired;
        }
    }

    /// True when a buffered message is waiting.
    pub fn has_pending_values(&self) -> bool {
        !self
            .core
            .state
            .lock()
            .expect("queuelike state poisoned")
            .pending
            .is_empty()
    }
}

impl<TOut, TIn> Channel<TOut, TIn> for QueuelikeChannel<TOut, TIn>
where
    TOut: Send + 'static,
    TIn: Send + 'static,
{
    fn write(&self, message: TOut) -> Result<(), Disconnected> {
        self.core.inner.write(message)
    }

    fn disconnect(&self) {
        self.core.inner.disconnect();
    }

    /// Re-subscribes with explicit handlers: buffered values flush to them
    /// in FIFO order, then delivery takes the push path.
    fn set_handlers(&self, on_message: OnMessage<TIn>, on_disconnected: OnDisconnected) {
        let scheduler = self.core.scheduler.clone();
        let mut state = self.core.state.lock().expect("queuelike state poisoned");

        let subscriber = Subscriber { on_message: Arc::new(Mutex::new(on_message)) };

        while let Some(message) = state.pending.pop_front() {
            let handler = subscriber.on_message.clone();
            scheduler.schedule_immediately(
                move || (handler.lock().expect("message handler poisoned"))(message),
                "QueuelikeChannel::set_handlers flush",
            );
        }

        if state.disconnected && !state.disconnect_delivered {
            state.disconnect_delivered = true;
            scheduler
                .schedule_immediately(on_disconnected, "QueuelikeChannel::set_handlers disconnect");
        } else {
            state.on_disconnected = Some(on_disconnected);
        }

        state.subscriber = Some(subscriber);
    }

    fn scheduler(&self) -> Arc<CallbackScheduler> {
        self.core.scheduler.clone()
    }

    fn channel_type(&self) -> String {
        format!("QueuelikeChannel<{}>", self.core.inner.channel_type())
    }
}
