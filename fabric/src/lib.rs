//! The inter-node messaging fabric: transport-agnostic, ordered,
//! multiplexed channels with per-connection memoized serialization.
//!
//! A logical channel is built by stacking layers bottom-up:
//!
//! 1. a byte transport — [`SocketChannel`](socket::SocketChannel) over a
//!    connected stream, or an [`in_memory_pair`](in_memory::in_memory_pair)
//!    for tests and same-process links;
//! 2. a [`SerializedChannel`](serialized::SerializedChannel), which encodes
//!    typed messages into frames and holds a memoizing flattener/inflater
//!    pair per direction;
//! 3. optionally a [`MultiChannel`](multi::MultiChannel) fanning one
//!    logical stream over several physical ones by a priority function, or
//!    a [`RateLimitedChannelGroup`](rate_limit::RateLimitedChannelGroup)
//!    wrapper throttling by message cost.
//!
//! Any layer may further be wrapped by the queue-like adapter
//! ([`make_queuelike`](queuelike::make_queuelike)) to give a blocking pull
//! interface, and [`HalfChannel`](half::HalfChannel) exposes non-channel
//! producers as channels. All handler callbacks are posted to a shared
//! [`CallbackScheduler`](scheduler::CallbackScheduler), so user code never
//! runs on a transport thread, and within one serialized channel messages
//! arrive in send order.
//!
//! The only application-visible failure is
//! [`Disconnected`](channel::Disconnected), surfaced through each
//! channel's disconnect handler exactly once. Malformed frames and
//! memoization desync are fatal per channel and collapse into
//! disconnection; nobody reconnects automatically.

pub mod channel;
pub mod fd_registry;
pub mod half;
pub mod in_memory;
pub mod logging;
pub mod message;
pub mod multi;
pub mod queuelike;
pub mod rate_limit;
pub mod scheduler;
pub mod serialized;
pub mod socket;
pub mod statsd;
pub mod stream;

/// Result alias for the fabric's fallible plumbing.
pub type Result<T> = anyhow::Result<T>;

pub use channel::{ByteChannel, Channel, Disconnected, HandlerSlot, OnDisconnected, OnMessage};
pub use half::HalfChannel;
pub use in_memory::{in_memory_pair, InMemoryChannel};
pub use logging::{EventLogger, FabricEvent, MessageEvent, StateEvent};
pub use message::{Bundle, OrderedMessage};
pub use multi::{MultiChannel, PriorityFn};
pub use queuelike::{make_queuelike, QueuelikeChannel};
pub use rate_limit::{CostFn, RateLimitedChannel, RateLimitedChannelGroup, RateLimitedScheduler};
pub use scheduler::CallbackScheduler;
pub use serialized::SerializedChannel;
pub use socket::SocketChannel;
pub use statsd::{Statsd, StatsdConfig, Timer};
pub use stream::Stream;
