//! The half-channel: one side of a channel, coupled in-process to a
//! producer that is not itself a channel.
//!
//! The owner supplies the outbound path (a write callback) and a teardown
//! notification at construction; external code injects inbound messages
//! with [`HalfChannel::receive`]. This is how asynchronous I/O
//! request/response pumps appear to the rest of the system as ordinary
//! channels.

use std::sync::{Arc, Mutex};

use crate::channel::{Channel, Disconnected, HandlerSlot, OnDisconnected, OnMessage};
use crate::scheduler::CallbackScheduler;

/// A one-sided channel driven by an external producer.
pub struct HalfChannel<TOut, TIn> {
    scheduler: Arc<CallbackScheduler>,
    slot: HandlerSlot<TIn>,
    write_callback: Arc<Mutex<Box<dyn FnMut(TOut) + Send>>>,
    owner_disconnected: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    disconnected: Mutex<bool>,
}

impl<TOut, TIn> HalfChannel<TOut, TIn>
where
    TOut: Send + 'static,
    TIn: Send + 'static,
{
    /// Builds a half-channel whose writes invoke `write_callback` on the
    /// scheduler and whose teardown invokes `on_disconnected` once.
    pub fn new(
        scheduler: Arc<CallbackScheduler>,
        write_callback: impl FnMut(TOut) + Send + 'static,
        on_disconnected: impl FnOnce() + Send + 'static,
    ) -> Arc<HalfChannel<TOut, TIn>> {
        Arc::new(HalfChannel {
            scheduler: scheduler.clone(),
            slot: HandlerSlot::new(scheduler),
            write_callback: Arc::new(Mutex::new(Box::new(write_callback))),
            owner_disconnected: Mutex::new(Some(Box::new(on_disconnected))),
            disconnected: Mutex::new(false),
        })
    }

    /// Injects an inbound message from the external producer.
    ///
    /// Queued until handlers are installed, then delivered via the
    /// scheduler.
    pub fn receive(&self, message: TIn) {
        self.slot.deliver(message);
    }
}

impl<TOut, TIn> Channel<TOut, TIn> for HalfChannel<TOut, TIn>
where
    TOut: Send + 'static,
    TIn: Send + 'static,
{
    fn write(&self, message: TOut) -> Result<(), Disconnected> {
        {
            let disconnected = self.disconnected.lock().expect("half channel poisoned");
            if *disconnected {
                return Err(Disconnected);
            }
        }
        let callback = self.write_callback.clone();
        self.scheduler.schedule_immediately(
            move || (callback.lock().expect("write callback poisoned"))(message),
            "HalfChannel::write",
        );
        Ok(())
    }

    fn disconnect(&self) {
        {
            let mut disconnected = self.disconnected.lock().expect("half channel poisoned");
            if *disconnected {
                return;
            }
            *disconnected = true;
        }
        if let Some(owner) = self
            .owner_disconnected
            .lock()
            .expect("half channel poisoned")
            .take()
        {
            owner();
        }
        self.slot.disconnect();
    }

    fn set_handlers(&self, on_message: OnMessage<TIn>, on_disconnected: OnDisconnected) {
        self.slot.set_handlers(on_message, on_disconnected);
    }

    fn scheduler(&self) -> Arc<CallbackScheduler> {
        self.scheduler.clone()
    }

    fn channel_type(&self) -> String {
        "HalfChannel".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_reach_the_owner_and_receives_reach_handlers() {
        let scheduler = CallbackScheduler::new("test");
        let written = Arc::new(Mutex::new(Vec::new()));
        let write_sink = written.clone();

        let half: Arc<HalfChannel<u32, String>> = HalfChannel::new(
            scheduler.clone(),
            move |message| write_sink.lock().unwrap().push(message),
            || {},
        );

        half.receive("early".to_owned());

        let received = Arc::new(Mutex::new(Vec::new()));
        let receive_sink = received.clone();
        half.set_handlers(
            Box::new(move |message| receive_sink.lock().unwrap().push(message)),
            Box::new(|| {}),
        );

        half.write(7).unwrap();
        half.receive("late".to_owned());
        scheduler.block_until_idle();

        assert_eq!(*written.lock().unwrap(), vec![7]);
        assert_eq!(*received.lock().unwrap(), vec!["early", "late"]);
    }

    #[test]
    fn disconnect_notifies_owner_once_and_fails_writes() {
        let scheduler = CallbackScheduler::new("test");
        let notified = Arc::new(Mutex::new(0));
        let observed = notified.clone();

        let half: Arc<HalfChannel<u32, u32>> = HalfChannel::new(
            scheduler.clone(),
            |_| {},
            move || *observed.lock().unwrap() += 1,
        );

        half.disconnect();
        half.disconnect();
        assert_eq!(*notified.lock().unwrap(), 1);
        assert_eq!(half.write(1), Err(Disconnected));
    }
}
