//! The multi-channel: one logical channel fanned out over several
//! sub-channels.
//!
//! A priority function maps each outbound message to a number, and the
//! message routes to sub-channel `priority % N`. The field is a bucket
//! selector, not a scheduling priority: the point is that a head-of-line
//! stall on one sub-stream cannot starve messages travelling on the
//! others. Inbound messages from all sub-channels merge in arrival order;
//! no ordering holds across sub-streams, and the application protocol must
//! tolerate reordering between buckets.

use std::sync::{Arc, Mutex};

use itertools::Itertools;

use crate::channel::{Channel, Disconnected, OnDisconnected, OnMessage};
use crate::scheduler::CallbackScheduler;

/// Maps an outbound message to its routing priority.
pub type PriorityFn<T> = Arc<dyn Fn(&T) -> u32 + Send + Sync>;

struct MultiState {
    disconnected: bool,
    disconnect_delivered: bool,
    on_disconnected: Option<OnDisconnected>,
}

struct MultiCore<TOut, TIn> {
    subs: Vec<Arc<dyn Channel<TOut, TIn>>>,
    priority: PriorityFn<TOut>,
    state: Mutex<MultiState>,
}

/// N sub-channels presented as one channel, routed by priority.
pub struct MultiChannel<TOut, TIn> {
    core: Arc<MultiCore<TOut, TIn>>,
}

impl<TOut, TIn> MultiChannel<TOut, TIn>
where
    TOut: Send + 'static,
    TIn: Send + 'static,
{
    /// Combines `subs` under `priority` routing.
    ///
    /// Panics when `subs` is empty; a multi-channel with no sub-channels
    /// has nowhere to route.
    pub fn new(
        subs: Vec<Arc<dyn Channel<TOut, TIn>>>,
        priority: PriorityFn<TOut>,
    ) -> Arc<MultiChannel<TOut, TIn>> {
        assert!(!subs.is_empty());
        Arc::new(MultiChannel {
            core: Arc::new(MultiCore {
                subs,
                priority,
                state: Mutex::new(MultiState {
                    disconnected: false,
                    disconnect_delivered: false,
                    on_disconnected: None,
                }),
            }),
        })
    }

    /// Number of sub-channels.
    pub fn fan_out(&self) -> usize {
        self.core.subs.len()
    }
}

impl<TOut, TIn> MultiCore<TOut, TIn> {
    /// A sub-channel reported disconnection; runs on the scheduler.
    ///
    /// Marks the logical channel disconnected, tears down the remaining
    /// sub-channels, and delivers the user notification exactly once.
    fn handle_peer_disconnect(&self) {
        let callback = {
            let mut state = self.state.lock().expect("multi-channel state poisoned");
            state.disconnected = true;
            if state.disconnect_delivered {
                None
            } else {
                match state.on_disconnected.take() {
                    Some(callback) => {
                        state.disconnect_delivered = true;
                        Some(callback)
                    }
                    None => None,
                }
            }
        };
        for sub in &self.subs {
            sub.disconnect();
        }
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl<TOut, TIn> Channel<TOut, TIn> for MultiChannel<TOut, TIn>
where
    TOut: Send + 'static,
    TIn: Send + 'static,
{
    fn write(&self, message: TOut) -> Result<(), Disconnected> {
        {
            let state = self.core.state.lock().expect("multi-channel state poisoned");
            if state.disconnected {
                return Err(Disconnected);
            }
        }
        let index = (self.core.priority)(&message) as usize % self.core.subs.len();
        self.core.subs[index].write(message)
    }

    fn disconnect(&self) {
        {
            let mut state = self.core.state.lock().expect("multi-channel state poisoned");
            if state.disconnected {
                return;
            }
            state.disconnected = true;
        }
        // Delivery of the user notification rides the sub-channels' own
        // disconnect handlers, which run on the scheduler.
        for sub in &self.core.subs {
            sub.disconnect();
        }
    }

    fn set_handlers(&self, on_message: OnMessage<TIn>, on_disconnected: OnDisconnected) {
        {
            let mut state = self.core.state.lock().expect("multi-channel state poisoned");
            if state.disconnected && !state.disconnect_delivered {
                // Disconnected locally before handlers existed; deliver the
                // deferred notice through the scheduler.
                state.disconnect_delivered = true;
                drop(state);
                self.scheduler().schedule_immediately(
                    on_disconnected,
                    "MultiChannel::set_handlers disconnect",
                );
                return;
            }
            state.on_disconnected = Some(on_disconnected);
        }

        let shared = Arc::new(Mutex::new(on_message));
        for sub in &self.core.subs {
            let handler = shared.clone();
            let core = self.core.clone();
            sub.set_handlers(
                Box::new(move |message| {
                    (handler.lock().expect("message handler poisoned"))(message)
                }),
                Box::new(move || core.handle_peer_disconnect()),
            );
        }
    }

    fn scheduler(&self) -> Arc<CallbackScheduler> {
        self.core.subs[0].scheduler()
    }

    fn channel_type(&self) -> String {
        format!(
            "MultiChannel<{}>",
            self.core.subs.iter().map(|sub| sub.channel_type()).join(", ")
        )
    }
}
