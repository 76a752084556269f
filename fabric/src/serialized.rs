//! The serialized channel: typed messages over a byte transport.
//!
//! Each direction owns a memoizing stream (a flattener out, an inflater
//! in), guarded by its own mutex so the tables see a single-writer and
//! single-reader discipline. Every public operation is rescheduled onto the
//! callback scheduler; the byte transport's threads never execute encoding,
//! decoding, or user handlers.

use std::any::type_name;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use weft_codec::memo::{FlattenedStream, InflatedStream};
use weft_codec::{Decode, Encode, Flattener, Inflater};

use crate::channel::{ByteChannel, Channel, Disconnected, OnDisconnected, OnMessage};
use crate::scheduler::CallbackScheduler;

/// Decodes slower than this are logged with type name and size.
const SLOW_DECODE: Duration = Duration::from_millis(100);

struct SerializedCore<TOut, TIn> {
    inner: Arc<ByteChannel>,
    scheduler: Arc<CallbackScheduler>,
    flattener: Mutex<FlattenedStream>,
    inflater: Arc<Mutex<InflatedStream>>,
    disconnected: Mutex<bool>,
    _types: PhantomData<fn(TOut) -> TIn>,
}

/// A typed channel over a byte transport, with per-direction memoization.
pub struct SerializedChannel<TOut, TIn> {
    core: Arc<SerializedCore<TOut, TIn>>,
}

impl<TOut, TIn> SerializedChannel<TOut, TIn>
where
    TOut: Encode<Flattener> + Send + 'static,
    TIn: Decode<Inflater> + Send + 'static,
{
    /// Wraps a byte transport, anchoring all callbacks to `scheduler`.
    pub fn new(
        scheduler: Arc<CallbackScheduler>,
        inner: Arc<ByteChannel>,
    ) -> Arc<SerializedChannel<TOut, TIn>> {
        Arc::new(SerializedChannel {
            core: Arc::new(SerializedCore {
                inner,
                scheduler,
                flattener: Mutex::new(FlattenedStream::new()),
                inflater: Arc::new(Mutex::new(InflatedStream::new())),
                disconnected: Mutex::new(false),
                _types: PhantomData,
            }),
        })
    }

    /// Seeds the outbound memo table; the peer must seed its inbound table
    /// identically before traffic starts.
    pub fn with_outbound_stream(&self, seed: impl FnOnce(&mut FlattenedStream)) {
        let mut stream = self.core.flattener.lock().expect("flattener poisoned");
        seed(&mut stream);
    }

    /// Seeds the inbound memo table; see
    /// [`SerializedChannel::with_outbound_stream`].
    pub fn with_inbound_stream(&self, seed: impl FnOnce(&mut InflatedStream)) {
        let mut stream = self.core.inflater.lock().expect("inflater poisoned");
        seed(&mut stream);
    }
}

impl<TOut, TIn> Channel<TOut, TIn> for SerializedChannel<TOut, TIn>
where
    TOut: Encode<Flattener> + Send + 'static,
    TIn: Decode<Inflater> + Send + 'static,
{
    fn write(&self, message: TOut) -> Result<(), Disconnected> {
        if *self.core.disconnected.lock().expect("serialized state poisoned") {
            return Err(Disconnected);
        }
        let core = self.core.clone();
        self.core.scheduler.schedule_immediately(
            move || {
                let frame = {
                    let mut flattener = core.flattener.lock().expect("flattener poisoned");
                    flattener.serialize(&message)
                };
                // A disconnect that races the write is surfaced by the
                // disconnect handler, not here.
                let _ = core.inner.write(frame);
            },
            "SerializedChannel::write",
        );
        Ok(())
    }

    fn disconnect(&self) {
        {
            let mut disconnected =
                self.core.disconnected.lock().expect("serialized state poisoned");
            if *disconnected {
                return;
            }
            *disconnected = true;
        }
        let core = self.core.clone();
        self.core.scheduler.schedule_immediately(
            move || core.inner.disconnect(),
            "SerializedChannel::disconnect",
        );
    }

    fn set_handlers(&self, on_message: OnMessage<TIn>, on_disconnected: OnDisconnected) {
        let core = self.core.clone();
        let handler = Arc::new(Mutex::new(on_message));

        self.core.inner.set_handlers(
            Box::new(move |frame: Vec<u8>| {
                let started = Instant::now();
                let length = frame.len();
                let decoded = {
                    let mut inflater = core.inflater.lock().expect("inflater poisoned");
                    inflater.deserialize::<TIn>(frame)
                };
                let elapsed = started.elapsed();
                if elapsed > SLOW_DECODE {
                    tracing::info!(
                        elapsed = ?elapsed,
                        megabytes = length as f64 / (1024.0 * 1024.0),
                        message_type = type_name::<TIn>(),
                        "slow deserialization"
                    );
                }
                match decoded {
                    Ok(message) => {
                        let handler = handler.clone();
                        core.scheduler.schedule_immediately(
                            move || (handler.lock().expect("message handler poisoned"))(message),
                            "SerializedChannel::on_message",
                        );
                    }
                    Err(error) => {
                        tracing::error!(
                            %error,
                            message_type = type_name::<TIn>(),
                            "malformed frame, disconnecting channel"
                        );
                        core.inner.disconnect();
                    }
                }
            }),
            // The byte transport already delivers this on the scheduler and
            // guarantees exactly-once.
            on_disconnected,
        );
    }

    fn scheduler(&self) -> Arc<CallbackScheduler> {
        self.core.scheduler.clone()
    }

    fn channel_type(&self) -> String {
        format!("SerializedChannel<{}>", self.core.inner.channel_type())
    }
}
