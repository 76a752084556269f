//! The memoizing object stream: a flattener/inflater pair that remembers,
//! per connection, which values it has already exchanged.
//!
//! Values wrapped in [`Memo`] are keyed by their content digest. The first
//! transmission writes a `new` record carrying the full encoding and
//! installs the digest in both tables; every later transmission writes a
//! five-byte `seen` record. Both ends may pre-seed their tables with a
//! value they already share (the built-ins graph every worker holds) via
//! [`FlattenedStream::consider_written`] and
//! [`InflatedStream::consider_read`]; the two sides must seed identically.
//! The tables move in lockstep and never evict; a receiver that observes an
//! index its table cannot satisfy reports [`CodecError::MemoDesync`], which
//! is unrecoverable for the stream.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use weft_hash::Hash;

use crate::encode::{
    BinaryDecoder, BinaryEncoder, CodecError, Decode, Encode, PointerRecord, PointerSink,
    PointerSource, Sink, Source,
};
use crate::hashing::{hash_value, HashingSink};

const TAG_SEEN: u8 = 0;
const TAG_NEW: u8 = 1;

/// A value tagged as memoizable, addressed by its content digest.
pub struct Memo<T> {
    value: Arc<T>,
    hash: Hash,
}

impl<T: Encode<HashingSink>> Memo<T> {
    /// Wraps a value, computing its digest.
    pub fn new(value: T) -> Self {
        Memo::from_arc(Arc::new(value))
    }

    /// Wraps an existing shared value, computing its digest.
    pub fn from_arc(value: Arc<T>) -> Self {
        let hash = hash_value(&*value);
        Memo { value, hash }
    }
}

impl<T> Memo<T> {
    /// The wrapped value.
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// The content digest the memo tables key on.
    pub fn hash(&self) -> Hash {
        self.hash
    }
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        Memo { value: self.value.clone(), hash: self.hash }
    }
}

impl<T> Deref for Memo<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> PartialEq for Memo<T> {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl<T> Eq for Memo<T> {}

impl<T: fmt::Debug> fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Memo({:?}, {:?})", self.hash, self.value)
    }
}

enum MemoIndex {
    Seen(u32),
    Fresh(u32),
}

/// The sending half: a binary encoder extended with the digest-to-index
/// memo table.
pub struct Flattener {
    encoder: BinaryEncoder,
    indices: HashMap<Hash, u32>,
}

impl Flattener {
    /// A flattener with empty tables.
    pub fn new() -> Self {
        Flattener { encoder: BinaryEncoder::new(), indices: HashMap::new() }
    }

    /// Drains the frame encoded so far, keeping all tables.
    pub fn take_frame(&mut self) -> Vec<u8> {
        self.encoder.take_frame()
    }

    /// Declares `hash` as already transmitted, assigning it the next index.
    ///
    /// Idempotent: a digest already in the table keeps its index.
    fn consider_written(&mut self, hash: Hash) {
        let next = self.indices.len() as u32;
        self.indices.entry(hash).or_insert(next);
    }

    fn memo_index(&mut self, hash: Hash) -> MemoIndex {
        if let Some(&index) = self.indices.get(&hash) {
            return MemoIndex::Seen(index);
        }
        let index = self.indices.len() as u32;
        self.indices.insert(hash, index);
        MemoIndex::Fresh(index)
    }
}

impl Default for Flattener {
    fn default() -> Self {
        Flattener::new()
    }
}

impl Sink for Flattener {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.encoder.write_bytes(bytes);
    }
}

impl PointerSink for Flattener {
    fn intern_pointer(&mut self, pointer: Arc<dyn Any + Send + Sync>) -> PointerRecord {
        self.encoder.intern_pointer(pointer)
    }
}

struct InflaterEntry {
    value: Arc<dyn Any + Send + Sync>,
    hash: Hash,
}

/// The receiving half: a binary decoder extended with the index-to-value
/// memo table.
pub struct Inflater {
    decoder: BinaryDecoder,
    entries: Vec<InflaterEntry>,
}

impl Inflater {
    /// An inflater with empty tables.
    pub fn new() -> Self {
        Inflater { decoder: BinaryDecoder::new(), entries: Vec::new() }
    }

    /// Loads the next frame, keeping all tables.
    pub fn provide(&mut self, frame: Vec<u8>) {
        self.decoder.provide(frame);
    }

    fn consider_read(&mut self, value: Arc<dyn Any + Send + Sync>, hash: Hash) {
        if self.entries.iter().any(|entry| entry.hash == hash) {
            return;
        }
        self.entries.push(InflaterEntry { value, hash });
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Inflater::new()
    }
}

impl Source for Inflater {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), CodecError> {
        self.decoder.read_bytes(buf)
    }
}

impl PointerSource for Inflater {
    fn pointer_table_len(&self) -> u32 {
        self.decoder.pointer_table_len()
    }

    fn reserve_pointer(&mut self) -> u32 {
        self.decoder.reserve_pointer()
    }

    fn install_pointer(&mut self, index: u32, value: Arc<dyn Any + Send + Sync>) {
        self.decoder.install_pointer(index, value);
    }

    fn lookup_pointer(&self, index: u32) -> Result<Arc<dyn Any + Send + Sync>, CodecError> {
        self.decoder.lookup_pointer(index)
    }
}

impl<T: Encode<Flattener> + Send + Sync + 'static> Encode<Flattener> for Memo<T> {
    fn encode(&self, sink: &mut Flattener) {
        match sink.memo_index(self.hash) {
            MemoIndex::Seen(index) => {
                TAG_SEEN.encode(sink);
                index.encode(sink);
            }
            MemoIndex::Fresh(index) => {
                TAG_NEW.encode(sink);
                index.encode(sink);
                (*self.value).encode(sink);
            }
        }
    }
}

/// The hashing flavor sees a memoized value as its digest, so containers of
/// memos hash without re-walking the wrapped graphs.
impl<T> Encode<HashingSink> for Memo<T> {
    fn encode(&self, sink: &mut HashingSink) {
        self.hash.encode(sink);
    }
}

impl<T> Decode<Inflater> for Memo<T>
where
    T: Decode<Inflater> + Encode<HashingSink> + Send + Sync + 'static,
{
    fn decode(source: &mut Inflater) -> Result<Self, CodecError> {
        let tag = u8::decode(source)?;
        let index = u32::decode(source)?;
        let len = source.entries.len() as u32;
        match tag {
            TAG_SEEN => {
                if index >= len {
                    return Err(CodecError::MemoDesync { index, len: len as usize });
                }
                let entry = &source.entries[index as usize];
                let hash = entry.hash;
                let value = entry
                    .value
                    .clone()
                    .downcast::<T>()
                    .map_err(|_| CodecError::MemoType(index))?;
                Ok(Memo { value, hash })
            }
            TAG_NEW => {
                if index != len {
                    return Err(CodecError::MemoDesync { index, len: len as usize });
                }
                let value = Arc::new(T::decode(source)?);
                let hash = hash_value(&*value);
                source.entries.push(InflaterEntry { value: value.clone(), hash });
                Ok(Memo { value, hash })
            }
            other => Err(CodecError::InvalidTag(other)),
        }
    }
}

/// A flattener bundled with frame production, one per connection direction.
pub struct FlattenedStream {
    flattener: Flattener,
}

impl FlattenedStream {
    /// A stream with empty tables.
    pub fn new() -> Self {
        FlattenedStream { flattener: Flattener::new() }
    }

    /// Encodes `value` and returns the frame carrying it.
    pub fn serialize<T: Encode<Flattener>>(&mut self, value: &T) -> Vec<u8> {
        value.encode(&mut self.flattener);
        self.flattener.take_frame()
    }

    /// Seeds the memo table with a value the peer also holds.
    pub fn consider_written<T>(&mut self, value: &Memo<T>) {
        self.flattener.consider_written(value.hash());
    }
}

impl Default for FlattenedStream {
    fn default() -> Self {
        FlattenedStream::new()
    }
}

/// An inflater bundled with frame consumption, one per connection direction.
pub struct InflatedStream {
    inflater: Inflater,
}

impl InflatedStream {
    /// A stream with empty tables.
    pub fn new() -> Self {
        InflatedStream { inflater: Inflater::new() }
    }

    /// Decodes one value from `frame`.
    pub fn deserialize<T: Decode<Inflater>>(&mut self, frame: Vec<u8>) -> Result<T, CodecError> {
        self.inflater.provide(frame);
        T::decode(&mut self.inflater)
    }

    /// Seeds the memo table with a value the peer also holds.
    ///
    /// Must mirror the peer's [`FlattenedStream::consider_written`] calls
    /// exactly, in the same order.
    pub fn consider_read<T: Send + Sync + 'static>(&mut self, value: &Memo<T>) {
        self.inflater.consider_read(value.value().clone(), value.hash());
    }
}

impl Default for InflatedStream {
    fn default() -> Self {
        InflatedStream::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_value_transmits_as_seen_record() {
        let big = Memo::new(vec![7u8; 64 * 1024]);

        let mut sender = FlattenedStream::new();
        let mut receiver = InflatedStream::new();
        sender.consider_written(&big);
        receiver.consider_read(&big);

        let frame = sender.serialize(&big);
        assert!(frame.len() <= 5);

        let decoded: Memo<Vec<u8>> = receiver.deserialize(frame).unwrap();
        assert_eq!(decoded, big);
        assert_eq!(decoded.value(), big.value());
    }

    #[test]
    fn second_transmission_reuses_the_first() {
        let memo = Memo::new("a sizable payload".to_owned());
        let mut sender = FlattenedStream::new();
        let mut receiver = InflatedStream::new();

        let first = sender.serialize(&memo);
        assert!(first.len() > 5);
        let second = sender.serialize(&memo);
        assert_eq!(second.len(), 5);

        let one: Memo<String> = receiver.deserialize(first).unwrap();
        let two: Memo<String> = receiver.deserialize(second).unwrap();
        assert_eq!(one, memo);
        assert!(Arc::ptr_eq(one.value(), two.value()));
    }

    #[test]
    fn unseeded_receiver_detects_desync() {
        let memo = Memo::new(1234u64);
        let mut sender = FlattenedStream::new();
        sender.consider_written(&memo);

        // The sender believes the value was exchanged; the receiver was
        // never seeded, so the seen-record index exceeds its table.
        let frame = sender.serialize(&memo);
        let mut receiver = InflatedStream::new();
        assert!(matches!(
            receiver.deserialize::<Memo<u64>>(frame),
            Err(CodecError::MemoDesync { index: 0, .. })
        ));
    }

    #[test]
    fn invalid_tag_is_an_error() {
        let mut receiver = InflatedStream::new();
        assert!(matches!(
            receiver.deserialize::<Memo<u64>>(vec![9, 0, 0, 0, 0]),
            Err(CodecError::InvalidTag(9))
        ));
    }

    #[test]
    fn memos_compare_by_digest() {
        let one = Memo::new(vec![1u8, 2, 3]);
        let two = Memo::new(vec![1u8, 2, 3]);
        let other = Memo::new(vec![4u8]);
        assert_eq!(one, two);
        assert_ne!(one, other);
    }
}
