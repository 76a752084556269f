//! The channel abstraction: a bidirectional typed message pipe.
//!
//! A channel writes messages of one type and delivers messages of another
//! to a pair of installed handlers. Channels buffer inbound messages until
//! handlers are installed, deliver every handler invocation through the
//! callback scheduler (never on a transport thread), and report
//! disconnection exactly once — even when the handler is installed after
//! the disconnect was observed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::scheduler::CallbackScheduler;

/// The channel is gone; the only application-visible failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("channel disconnected")]
pub struct Disconnected;

/// Handler invoked for each inbound message, in arrival order.
pub type OnMessage<T> = Box<dyn FnMut(T) + Send>;

/// Handler invoked exactly once when the channel disconnects.
pub type OnDisconnected = Box<dyn FnOnce() + Send>;

/// A bidirectional pipe writing `TOut` and delivering `TIn`.
pub trait Channel<TOut, TIn>: Send + Sync {
    /// Sends a message to the peer.
    ///
    /// Accepted even before handlers are installed. Fails only once the
    /// channel is known to be disconnected.
    fn write(&self, message: TOut) -> Result<(), Disconnected>;

    /// Tears the channel down. Idempotent; the disconnect handler fires
    /// exactly once whether the disconnect is local or observed from the
    /// peer.
    fn disconnect(&self);

    /// Installs the message and disconnect handlers, releasing anything
    /// buffered so far in arrival order.
    fn set_handlers(&self, on_message: OnMessage<TIn>, on_disconnected: OnDisconnected);

    /// The scheduler this channel dispatches handlers on.
    fn scheduler(&self) -> Arc<CallbackScheduler>;

    /// A short description of the channel stack, for diagnostics.
    fn channel_type(&self) -> String;
}

/// A byte-level transport: frames in, frames out.
pub type ByteChannel = dyn Channel<Vec<u8>, Vec<u8>>;

struct InstalledHandlers<T> {
    on_message: Arc<Mutex<OnMessage<T>>>,
    on_disconnected: Arc<Mutex<Option<OnDisconnected>>>,
}

struct SlotState<T> {
    handlers: Option<InstalledHandlers<T>>,
    pending: VecDeque<T>,
    disconnected: bool,
    disconnect_delivered: bool,
}

/// The receive-side state machine shared by the concrete channels.
///
/// Owns the buffered-until-installed queue, the deferred-disconnect flag,
/// and the exactly-once disconnect delivery; every delivery goes through
/// the scheduler so no handler runs on the caller's thread.
pub struct HandlerSlot<T> {
    scheduler: Mutex<Arc<CallbackScheduler>>,
    state: Mutex<SlotState<T>>,
}

impl<T: Send + 'static> HandlerSlot<T> {
    /// A slot with no handlers and nothing buffered.
    pub fn new(scheduler: Arc<CallbackScheduler>) -> Self {
        HandlerSlot {
            scheduler: Mutex::new(scheduler),
            state: Mutex::new(SlotState {
                handlers: None,
                pending: VecDeque::new(),
                disconnected: false,
                disconnect_delivered: false,
            }),
        }
    }

    /// The scheduler deliveries are posted to.
    pub fn scheduler(&self) -> Arc<CallbackScheduler> {
        self.scheduler.lock().expect("handler slot poisoned").clone()
    }

    /// Redirects future deliveries to a different scheduler.
    pub fn set_scheduler(&self, scheduler: Arc<CallbackScheduler>) {
        *self.scheduler.lock().expect("handler slot poisoned") = scheduler;
    }

    /// Installs handlers, flushing buffered messages in arrival order and
    /// then any deferred disconnect.
    pub fn set_handlers(&self, on_message: OnMessage<T>, on_disconnected: OnDisconnected) {
        let scheduler = self.scheduler();
        let mut state = self.state.lock().expect("handler slot poisoned");

        let installed = InstalledHandlers {
            on_message: Arc::new(Mutex::new(on_message)),
            on_disconnected: Arc::new(Mutex::new(Some(on_disconnected))),
        };

        while let Some(message) = state.pending.pop_front() {
            let handler = installed.on_message.clone();
            scheduler.schedule_immediately(
                move || (handler.lock().expect("message handler poisoned"))(message),
                "HandlerSlot::set_handlers message",
            );
        }

        if state.disconnected && !state.disconnect_delivered {
            state.disconnect_delivered = true;
            let handler = installed.on_disconnected.clone();
            scheduler.schedule_immediately(
                move || {
                    if let Some(callback) =
                        handler.lock().expect("disconnect handler poisoned").take()
                    {
                        callback();
                    }
                },
                "HandlerSlot::set_handlers disconnect",
            );
        }

        state.handlers = Some(installed);
    }

    /// Delivers an inbound message, or buffers it when handlers are not
    /// yet installed. Messages arriving after disconnection are dropped.
    pub fn deliver(&self, message: T) {
        let scheduler = self.scheduler();
        let mut state = self.state.lock().expect("handler slot poisoned");
        if let Some(installed) = &state.handlers {
            let handler = installed.on_message.clone();
            scheduler.schedule_immediately(
                move || (handler.lock().expect("message handler poisoned"))(message),
                "HandlerSlot::deliver",
            );
        } else if !state.disconnected {
            state.pending.push_back(message);
        }
    }

    /// Records disconnection, delivering the handler exactly once.
    ///
    /// Before handlers are installed this only sets the flag; the install
    /// will see it and deliver the deferred notification.
    pub fn disconnect(&self) {
        let scheduler = self.scheduler();
        let mut state = self.state.lock().expect("handler slot poisoned");
        if state.disconnect_delivered {
            return;
        }
        state.disconnected = true;
        let handler = match &state.handlers {
            Some(installed) => installed.on_disconnected.clone(),
            None => return,
        };
        state.disconnect_delivered = true;
        scheduler.schedule_immediately(
            move || {
                if let Some(callback) = handler.lock().expect("disconnect handler poisoned").take()
                {
                    callback();
                }
            },
            "HandlerSlot::disconnect",
        );
    }

    /// True once disconnection has been recorded.
    pub fn is_disconnected(&self) -> bool {
        self.state.lock().expect("handler slot poisoned").disconnected
    }
}
