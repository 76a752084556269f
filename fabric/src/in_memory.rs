//! Paired in-process channels, used for tests and same-process links.
//!
//! A pair shares one disconnect flag and two handler slots, one per
//! direction; each side's writes land in the slot the other side reads
//! from. Closing either side flips the shared flag and notifies both
//! slots, so the peer observes exactly one disconnect.

use std::sync::{Arc, Mutex};

use crate::channel::{Channel, Disconnected, HandlerSlot, OnDisconnected, OnMessage};
use crate::scheduler::CallbackScheduler;

struct DisconnectFlag {
    disconnected: Mutex<bool>,
}

/// One side of an in-process channel pair.
pub struct InMemoryChannel<TOut, TIn> {
    outgoing: Arc<HandlerSlot<TOut>>,
    incoming: Arc<HandlerSlot<TIn>>,
    flag: Arc<DisconnectFlag>,
}

/// Creates a connected channel pair sharing a disconnect flag.
pub fn in_memory_pair<A, B>(
    scheduler: &Arc<CallbackScheduler>,
) -> (Arc<InMemoryChannel<A, B>>, Arc<InMemoryChannel<B, A>>)
where
    A: Send + 'static,
    B: Send + 'static,
{
    let forward = Arc::new(HandlerSlot::new(scheduler.clone()));
    let backward = Arc::new(HandlerSlot::new(scheduler.clone()));
    let flag = Arc::new(DisconnectFlag { disconnected: Mutex::new(false) });

    let left = Arc::new(InMemoryChannel {
        outgoing: forward.clone(),
        incoming: backward.clone(),
        flag: flag.clone(),
    });
    let right = Arc::new(InMemoryChannel { outgoing: backward, incoming: forward, flag });
    (left, right)
}

impl<TOut, TIn> Channel<TOut, TIn> for InMemoryChannel<TOut, TIn>
where
    TOut: Send + 'static,
    TIn: Send + 'static,
{
    fn write(&self, message: TOut) -> Result<(), Disconnected> {
        {
            let disconnected = self.flag.disconnected.lock().expect("disconnect flag poisoned");
            if *disconnected {
                return Err(Disconnected);
            }
        }
        self.outgoing.deliver(message);
        Ok(())
    }

    fn disconnect(&self) {
        {
            let mut disconnected =
                self.flag.disconnected.lock().expect("disconnect flag poisoned");
            if *disconnected {
                return;
            }
            *disconnected = true;
        }
        self.incoming.disconnect();
        self.outgoing.disconnect();
    }

    fn set_handlers(&self, on_message: OnMessage<TIn>, on_disconnected: OnDisconnected) {
        self.incoming.set_handlers(on_message, on_disconnected);
    }

    fn scheduler(&self) -> Arc<CallbackScheduler> {
        self.incoming.scheduler()
    }

    fn channel_type(&self) -> String {
        "InMemoryChannel".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_cross_the_pair() {
        let scheduler = CallbackScheduler::new("test");
        let (left, right) = in_memory_pair::<String, String>(&scheduler);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        right.set_handlers(
            Box::new(move |message| sink.lock().unwrap().push(message)),
            Box::new(|| {}),
        );

        left.write("one".to_owned()).unwrap();
        left.write("two".to_owned()).unwrap();
        scheduler.block_until_idle();
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn close_notifies_peer_once_and_fails_writes() {
        let scheduler = CallbackScheduler::new("test");
        let (left, right) = in_memory_pair::<u32, u32>(&scheduler);

        let disconnects = Arc::new(Mutex::new(0));
        let observed = disconnects.clone();
        right.set_handlers(
            Box::new(|_| {}),
            Box::new(move || *observed.lock().unwrap() += 1),
        );

        left.disconnect();
        left.disconnect();
        scheduler.block_until_idle();
        assert_eq!(*disconnects.lock().unwrap(), 1);
        assert_eq!(left.write(1), Err(Disconnected));
        assert_eq!(right.write(2), Err(Disconnected));
    }
}
