//! A statsd metrics sink over UDP datagrams.
//!
//! Configured once at startup; each thread lazily opens its own socket so
//! emission never contends on a lock. Failures are logged and swallowed —
//! metrics must never affect the fabric's behavior, and nothing here sits
//! on a critical path.

use std::cell::RefCell;
use std::fmt::Display;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Where and how metrics are emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsdConfig {
    /// Statsd host name or address.
    pub host: String,
    /// Statsd UDP port.
    pub port: u16,
    /// Prefix prepended to every metric name; may be empty.
    pub prefix: String,
}

static CONFIG: OnceLock<StatsdConfig> = OnceLock::new();

struct ThreadSocket {
    socket: UdpSocket,
    target: SocketAddr,
}

thread_local! {
    static SOCKET: RefCell<Option<Option<ThreadSocket>>> = const { RefCell::new(None) };
}

fn open_socket(config: &StatsdConfig) -> Option<ThreadSocket> {
    let target = match (config.host.as_str(), config.port).to_socket_addrs() {
        Ok(mut addrs) => addrs.next()?,
        Err(error) => {
            tracing::warn!(
                %error,
                host = config.host.as_str(),
                port = config.port,
                "failed to resolve statsd target"
            );
            return None;
        }
    };
    match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => Some(ThreadSocket { socket, target }),
        Err(error) => {
            tracing::warn!(%error, "failed to open statsd socket");
            None
        }
    }
}

fn send_metric(name: &str, value: impl Display, kind: &str) {
    let Some(config) = CONFIG.get() else { return };
    SOCKET.with(|slot| {
        let mut slot = slot.borrow_mut();
        let socket = slot.get_or_insert_with(|| open_socket(config));
        if let Some(socket) = socket {
            let datagram = format!("{}:{}|{}", name, value, kind);
            if let Err(error) = socket.socket.send_to(datagram.as_bytes(), socket.target) {
                tracing::warn!(%error, metric = name, "statsd send failed");
            }
        }
    });
}

/// A handle emitting metrics under an optional component segment.
#[derive(Debug, Clone, Default)]
pub struct Statsd {
    prefix: String,
}

impl Statsd {
    /// Sets the process-wide target; later calls are ignored with a log.
    pub fn configure(config: StatsdConfig) {
        if CONFIG.set(config).is_err() {
            tracing::warn!("statsd already configured; ignoring reconfiguration");
        }
    }

    /// A handle emitting under `component` within the global prefix.
    pub fn new(component: &str) -> Statsd {
        let global = CONFIG.get().map(|config| config.prefix.as_str()).unwrap_or("");
        let prefix = match (global.is_empty(), component.is_empty()) {
            (true, true) => String::new(),
            (true, false) => format!("{}.", component),
            (false, true) => format!("{}.", global),
            (false, false) => format!("{}.{}.", global, component),
        };
        Statsd { prefix }
    }

    fn qualify(&self, metric: &str) -> String {
        format!("{}{}", self.prefix, metric)
    }

    /// Adds to a counter.
    pub fn increment(&self, counter: &str, by: u64) {
        send_metric(&self.qualify(counter), by, "c");
    }

    /// Subtracts from a counter.
    pub fn decrement(&self, counter: &str, by: u64) {
        send_metric(&self.qualify(counter), -(by as i64), "c");
    }

    /// Sets a gauge.
    pub fn gauge(&self, gauge: &str, value: u64) {
        send_metric(&self.qualify(gauge), value, "g");
    }

    /// Records a histogram sample.
    pub fn histogram(&self, histogram: &str, value: u64) {
        send_metric(&self.qualify(histogram), value, "h");
    }

    /// Records a timing in milliseconds.
    pub fn timing(&self, timer: &str, milliseconds: u64) {
        send_metric(&self.qualify(timer), milliseconds, "ms");
    }

    /// Starts a timer that reports on [`Timer::stop`] or drop.
    pub fn timer(&self, timer: &str) -> Timer {
        Timer {
            name: self.qualify(timer),
            started: Instant::now(),
            running: true,
        }
    }
}

/// Measures a span on the monotonic clock and reports it once.
pub struct Timer {
    name: String,
    started: Instant,
    running: bool,
}

impl Timer {
    /// Stops the timer and reports its elapsed time.
    pub fn stop(mut self) {
        self.report();
    }

    fn report(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        let elapsed = self.started.elapsed().as_millis() as u64;
        send_metric(&self.name, elapsed, "ms");
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.report();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_emission_is_a_no_op() {
        // No configure() call in this test binary: everything must be
        // silently ignored.
        let statsd = Statsd::new("component");
        statsd.increment("counter", 1);
        statsd.gauge("gauge", 42);
        statsd.timer("span").stop();
    }

    #[test]
    fn prefixes_compose() {
        let statsd = Statsd::new("worker");
        assert_eq!(statsd.qualify("frames"), "worker.frames");
        let bare = Statsd::new("");
        assert_eq!(bare.qualify("frames"), "frames");
    }
}
