//! Type-directed serialization for the messaging fabric.
//!
//! Every supported value type describes how to encode itself against two
//! operations: write raw bytes, or recurse into a field. Several serializer
//! flavors share that protocol: a binary encoder that produces wire bytes, a
//! counting sink that pre-computes frame sizes, a hashing sink that digests
//! values without materializing their wire form, and a memoizing
//! flattener/inflater pair that avoids retransmitting object graphs a
//! connection has already exchanged.
//!
//! Encoding is infallible (sinks accept every write); decoding a malformed
//! or truncated stream reports a [`CodecError`], which the channel layer
//! treats as fatal for the connection that produced it.

pub mod constant;
pub mod encode;
pub mod hashing;
pub mod memo;
pub mod symbol;

pub use constant::{Constant, ConstantRegistry, ConstantType, NativeConstant, NativeLayout};
pub use encode::{
    byte_count, deep_clone, from_bytes, to_bytes, BinaryDecoder, BinaryEncoder, ByteCountSink,
    CodecError, Decode, Encode, PointerRecord, PointerSink, PointerSource, Sink, Source,
};
pub use hashing::{hash_value, DirectHashingSink, HashingSink};
pub use memo::{FlattenedStream, Flattener, InflatedStream, Inflater, Memo};
pub use symbol::Symbol;
