//! The framed socket transport.
//!
//! A socket channel owns one connected stream and, once handlers are
//! installed, a reader thread and a writer thread. The wire format is a
//! 32-bit little-endian length followed by that many payload bytes, in both
//! directions. Outbound frames queue unboundedly and drain on the writer
//! thread; inbound frames are delivered through the channel's handler slot,
//! so user code only ever runs on the callback scheduler.

use std::net::Shutdown;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context};
use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::channel::{Channel, Disconnected, HandlerSlot, OnDisconnected, OnMessage};
use crate::fd_registry::FdGuard;
use crate::logging::{EventLogger, MessageEvent, StateEvent};
use crate::scheduler::CallbackScheduler;
use crate::stream::Stream;

/// Frames beyond this size are read in pieces to limit allocation spikes.
const READ_CHUNK: usize = 1 << 20;

/// Transport threads get a small fixed stack; they only move bytes.
const THREAD_STACK: usize = 128 * 1024;

const RETRY_SLEEP_FLOOR: Duration = Duration::from_millis(1);
const RETRY_SLEEP_CEILING: Duration = Duration::from_secs(1);
const RETRY_BUDGET: Duration = Duration::from_secs(10);

/// Both transport threads register the descriptor.
const FD_REGISTRATIONS: usize = 2;

struct SocketState {
    disconnected: bool,
    threads_started: bool,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

struct SocketCore<S: Stream> {
    stream: S,
    slot: HandlerSlot<Vec<u8>>,
    write_queue: Sender<Option<Vec<u8>>>,
    write_source: Mutex<Option<Receiver<Option<Vec<u8>>>>>,
    state: Mutex<SocketState>,
    bytes_written: Mutex<u64>,
    description: Mutex<String>,
    logger: Option<EventLogger>,
}

/// A byte channel over a connected socket.
pub struct SocketChannel<S: Stream + 'static> {
    core: Arc<SocketCore<S>>,
}

impl<S: Stream + 'static> SocketChannel<S> {
    /// Wraps a connected stream. Transport threads start when handlers are
    /// installed.
    pub fn new(scheduler: Arc<CallbackScheduler>, stream: S) -> Arc<SocketChannel<S>> {
        SocketChannel::with_logger(scheduler, stream, None)
    }

    /// As [`SocketChannel::new`], with an event logger observing frames and
    /// thread transitions.
    pub fn with_logger(
        scheduler: Arc<CallbackScheduler>,
        stream: S,
        logger: Option<EventLogger>,
    ) -> Arc<SocketChannel<S>> {
        let (write_queue, write_source) = unbounded();
        Arc::new(SocketChannel {
            core: Arc::new(SocketCore {
                stream,
                slot: HandlerSlot::new(scheduler),
                write_queue,
                write_source: Mutex::new(Some(write_source)),
                state: Mutex::new(SocketState {
                    disconnected: false,
                    threads_started: false,
                    reader: None,
                    writer: None,
                }),
                bytes_written: Mutex::new(0),
                description: Mutex::new(String::new()),
                logger,
            }),
        })
    }

    /// Names the channel in byte-accounting logs.
    pub fn set_description(&self, description: &str) {
        *self.core.description.lock().expect("socket state poisoned") = description.to_owned();
    }

    fn ensure_threads_started(&self) {
        {
            let mut state = self.core.state.lock().expect("socket state poisoned");
            if state.threads_started || state.disconnected {
                return;
            }
            state.threads_started = true;

            let reader_core = self.core.clone();
            let reader = thread::Builder::new()
                .name("socket reader".to_owned())
                .stack_size(THREAD_STACK)
                .spawn(move || read_loop(reader_core));
            match reader {
                Ok(handle) => state.reader = Some(handle),
                Err(error) => {
                    tracing::warn!(%error, "failed to spawn socket reader");
                    drop(state);
                    disconnect_core(&self.core);
                    return;
                }
            }

            let writer_core = self.core.clone();
            let writer = thread::Builder::new()
                .name("socket writer".to_owned())
                .stack_size(THREAD_STACK)
                .spawn(move || write_loop(writer_core));
            match writer {
                Ok(handle) => state.writer = Some(handle),
                Err(error) => {
                    tracing::warn!(%error, "failed to spawn socket writer");
                    drop(state);
                    disconnect_core(&self.core);
                    return;
                }
            }
        }

        tracing::debug!(fd = self.core.stream.as_raw_fd(), "socket channel threads started");
    }
}

impl<S: Stream + 'static> Channel<Vec<u8>, Vec<u8>> for SocketChannel<S> {
    fn write(&self, message: Vec<u8>) -> Result<(), Disconnected> {
        {
            let state = self.core.state.lock().expect("socket state poisoned");
            if state.disconnected {
                return Err(Disconnected);
            }
        }
        self.core.account_write(message.len() as u64 + 4);
        // The queue outlives the writer thread; a send after writer exit
        // is silently dropped, matching a racing disconnect.
        let _ = self.core.write_queue.send(Some(message));
        Ok(())
    }

    fn disconnect(&self) {
        disconnect_core(&self.core);
    }

    fn set_handlers(&self, on_message: OnMessage<Vec<u8>>, on_disconnected: OnDisconnected) {
        self.core.slot.set_handlers(on_message, on_disconnected);
        self.ensure_threads_started();
    }

    fn scheduler(&self) -> Arc<CallbackScheduler> {
        self.core.slot.scheduler()
    }

    fn channel_type(&self) -> String {
        "SocketChannel".to_owned()
    }
}

impl<S: Stream> SocketCore<S> {
    fn account_write(&self, bytes: u64) {
        let mut total = self.bytes_written.lock().expect("socket state poisoned");
        if (*total + bytes) / 100_000 != *total / 100_000 {
            let description = self.description.lock().expect("socket state poisoned");
            tracing::debug!(
                description = description.as_str(),
                bytes_written = *total + bytes,
                "socket write accounting"
            );
        }
        *total += bytes;
    }

    fn is_disconnected(&self) -> bool {
        self.state.lock().expect("socket state poisoned").disconnected
    }

    fn emit(&self, event: impl Into<crate::logging::FabricEvent>) {
        if let Some(logger) = &self.logger {
            logger(event.into());
        }
    }
}

fn disconnect_core<S: Stream>(core: &Arc<SocketCore<S>>) {
    let (reader, writer) = {
        let mut state = core.state.lock().expect("socket state poisoned");
        if state.disconnected {
            return;
        }
        state.disconnected = true;

        tracing::debug!(
            fd = core.stream.as_raw_fd(),
            "socket channel disconnecting, closing descriptor"
        );

        // Wake the writer for a clean exit, then force both directions
        // down so a blocked reader returns.
        let _ = core.write_queue.send(None);
        if let Err(error) = core.stream.shutdown(Shutdown::Both) {
            tracing::debug!(%error, "error shutting down socket");
        }
        (state.reader.take(), state.writer.take())
    };

    for handle in [writer, reader].into_iter().flatten() {
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }

    core.slot.disconnect();
}

fn read_loop<S: Stream>(core: Arc<SocketCore<S>>) {
    let _guard = match FdGuard::acquire(core.stream.as_raw_fd(), FD_REGISTRATIONS) {
        Ok(guard) => guard,
        Err(error) => {
            tracing::warn!(%error, "reader could not register descriptor");
            disconnect_core(&core);
            return;
        }
    };

    core.emit(StateEvent { send: false, start: true });
    if let Err(error) = read_loop_inner(&core) {
        if !core.is_disconnected() {
            tracing::debug!(%error, "socket reader stopping");
        }
    }
    core.emit(StateEvent { send: false, start: false });
    disconnect_core(&core);
}

fn read_loop_inner<S: Stream>(core: &Arc<SocketCore<S>>) -> anyhow::Result<()> {
    let mut stream = core.stream.try_clone().context("cloning stream for reads")?;
    loop {
        let mut header = [0u8; 4];
        read_full(&mut stream, &mut header, core).context("reading frame length")?;
        let length = LittleEndian::read_u32(&header) as usize;

        // Large frames arrive in bounded pieces.
        let mut payload = Vec::with_capacity(length.min(READ_CHUNK));
        while payload.len() < length {
            let chunk = (length - payload.len()).min(READ_CHUNK);
            let start = payload.len();
            payload.resize(start + chunk, 0);
            read_full(&mut stream, &mut payload[start..], core).context("reading frame payload")?;
        }

        core.emit(MessageEvent { is_send: false, length });
        core.slot.deliver(payload);
    }
}

fn write_loop<S: Stream>(core: Arc<SocketCore<S>>) {
    let _guard = match FdGuard::acquire(core.stream.as_raw_fd(), FD_REGISTRATIONS) {
        Ok(guard) => guard,
        Err(error) => {
            tracing::warn!(%error, "writer could not register descriptor");
            disconnect_core(&core);
            return;
        }
    };

    core.emit(StateEvent { send: true, start: true });
    match write_loop_inner(&core) {
        Ok(()) => {}
        Err(error) => {
            if !core.is_disconnected() {
                tracing::debug!(%error, "socket writer stopping");
            }
        }
    }
    core.emit(StateEvent { send: true, start: false });
    disconnect_core(&core);
}

fn write_loop_inner<S: Stream>(core: &Arc<SocketCore<S>>) -> anyhow::Result<()> {
    let mut stream = core.stream.try_clone().context("cloning stream for writes")?;
    let source = {
        let mut slot = core.write_source.lock().expect("socket state poisoned");
        slot.take().expect("writer thread started twice")
    };

    while let Ok(item) = source.recv() {
        match item {
            Some(payload) => {
                let mut header = [0u8; 4];
                LittleEndian::write_u32(&mut header, payload.len() as u32);
                write_full(&mut stream, &header, core).context("writing frame length")?;
                write_full(&mut stream, &payload, core).context("writing frame payload")?;
                core.emit(MessageEvent { is_send: true, length: payload.len() });
            }
            // Clean shutdown.
            None => return Ok(()),
        }
    }
    Ok(())
}

fn transient(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
    )
}

fn read_full<S: Stream>(
    stream: &mut S,
    buf: &mut [u8],
    core: &SocketCore<S>,
) -> anyhow::Result<()> {
    let mut filled = 0;
    let mut total_wait = Duration::ZERO;
    let mut next_sleep = RETRY_SLEEP_FLOOR;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => bail!("peer closed the stream with {} of {} bytes read", filled, buf.len()),
            Ok(read) => {
                filled += read;
                total_wait = Duration::ZERO;
                next_sleep = RETRY_SLEEP_FLOOR;
            }
            Err(error) if transient(&error) => {
                if core.is_disconnected() {
                    bail!("channel disconnected during read");
                }
                if total_wait >= RETRY_BUDGET {
                    bail!("no read progress after {:?} of retries", RETRY_BUDGET);
                }
                if next_sleep >= RETRY_SLEEP_CEILING {
                    tracing::warn!(
                        sleep = ?next_sleep,
                        "retry sleep after failed socket read reached its ceiling"
                    );
                }
                thread::sleep(next_sleep);
                total_wait += next_sleep;
                next_sleep = (next_sleep * 2).min(RETRY_SLEEP_CEILING);
            }
            Err(error) => return Err(error).context("reading from socket"),
        }
    }
    Ok(())
}

// The Rust runtime ignores SIGPIPE, so a peer that closed surfaces as a
// broken-pipe error rather than a signal.
fn write_full<S: Stream>(
    stream: &mut S,
    buf: &[u8],
    core: &SocketCore<S>,
) -> anyhow::Result<()> {
    let mut written = 0;
    let mut total_wait = Duration::ZERO;
    let mut next_sleep = RETRY_SLEEP_FLOOR;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => bail!("socket accepted zero bytes"),
            Ok(count) => {
                written += count;
                total_wait = Duration::ZERO;
                next_sleep = RETRY_SLEEP_FLOOR;
            }
            Err(error) if transient(&error) => {
                if core.is_disconnected() {
                    bail!("channel disconnected during write");
                }
                if total_wait >= RETRY_BUDGET {
                    bail!("no write progress after {:?} of retries", RETRY_BUDGET);
                }
                thread::sleep(next_sleep);
                total_wait += next_sleep;
                next_sleep = (next_sleep * 2).min(RETRY_SLEEP_CEILING);
            }
            Err(error) => return Err(error).context("writing to socket"),
        }
    }
    Ok(())
}
