//! Serializer flavors and the encodings of the primitive and container types.
//!
//! The two sides of the protocol are [`Sink`] (raw byte output plus, for
//! flavors that support it, a shared-pointer table) and [`Source`]. A value
//! type implements [`Encode`] and [`Decode`] once, generically over the
//! flavor, and thereby works against the binary encoder, the counting sink,
//! the hashing sink, and the memoizing streams alike.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

/// Fatal decoding failures.
///
/// A decoder that reports one of these has observed a malformed stream; the
/// channel that produced the bytes cannot be resynchronized and must
/// disconnect.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The stream ended before a read completed.
    #[error("byte stream ended with {requested} bytes requested, {available} available")]
    Truncated {
        /// Bytes the decoder asked for.
        requested: usize,
        /// Bytes that remained.
        available: usize,
    },
    /// A shared-pointer index beyond the table.
    #[error("shared pointer index {index} out of range for table of {len}")]
    SharedIndex {
        /// The received index.
        index: u32,
        /// Entries currently in the table.
        len: usize,
    },
    /// A back-reference into a pointee whose body is still being decoded.
    #[error("shared pointer index {0} refers into a value still being decoded")]
    SharedCycle(u32),
    /// A shared-pointer entry of a different type than requested.
    #[error("shared pointer index {0} holds a value of an unexpected type")]
    SharedType(u32),
    /// A memoization record inconsistent with the table, meaning the two
    /// ends of the stream have diverged.
    #[error("memoization desync: index {index} against table of {len}")]
    MemoDesync {
        /// The received index.
        index: u32,
        /// Entries currently in the table.
        len: usize,
    },
    /// A memoized entry of a different type than requested.
    #[error("memoized value at index {0} has an unexpected type")]
    MemoType(u32),
    /// A boolean encoded as something other than zero or one.
    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),
    /// An enumeration tag outside its range.
    #[error("invalid tag byte {0}")]
    InvalidTag(u8),
    /// String bytes that are not UTF-8.
    #[error("string bytes are not valid utf-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// A registered-constant type name with no registry entry.
    #[error("constant type {0:?} is not registered")]
    UnknownConstant(String),
}

/// Byte output, the write half of the serializer protocol.
pub trait Sink {
    /// Appends raw bytes.
    fn write_bytes(&mut self, bytes: &[u8]);
}

/// Byte input, the read half of the serializer protocol.
pub trait Source {
    /// Fills `buf` completely or fails.
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), CodecError>;
}

/// Values that can encode themselves into a sink of flavor `S`.
pub trait Encode<S: Sink + ?Sized> {
    /// Writes `self` into the sink.
    fn encode(&self, sink: &mut S);
}

/// Values that can decode themselves from a source of flavor `S`.
pub trait Decode<S: Source + ?Sized>: Sized {
    /// Reads a value from the source.
    fn decode(source: &mut S) -> Result<Self, CodecError>;
}

/// Outcome of presenting a pointer to a [`PointerSink`].
pub enum PointerRecord {
    /// The pointer was emitted before, at this index.
    Seen(u32),
    /// The pointer is new and was assigned this index, which equals the
    /// table size before the call.
    Fresh(u32),
}

/// Sinks that maintain an address-to-index table for shared pointers.
pub trait PointerSink: Sink {
    /// Looks up or assigns the dense index for `pointer`.
    ///
    /// The sink retains a reference so the allocation cannot be recycled
    /// into a colliding address while the stream is live.
    fn intern_pointer(&mut self, pointer: Arc<dyn Any + Send + Sync>) -> PointerRecord;
}

/// Sources that maintain the inverse index-to-object table.
pub trait PointerSource: Source {
    /// Entries in the table, including reserved slots.
    fn pointer_table_len(&self) -> u32;
    /// Reserves the next slot, returning its index.
    ///
    /// The slot is reserved before the pointee's body is decoded so that
    /// fresh pointers nested inside the body receive the indices the
    /// encoder assigned them.
    fn reserve_pointer(&mut self) -> u32;
    /// Fills a reserved slot.
    fn install_pointer(&mut self, index: u32, value: Arc<dyn Any + Send + Sync>);
    /// Retrieves a previously installed entry.
    fn lookup_pointer(&self, index: u32) -> Result<Arc<dyn Any + Send + Sync>, CodecError>;
}

/// Serializer flavor producing wire bytes, with shared-pointer support.
#[derive(Default)]
pub struct BinaryEncoder {
    bytes: Vec<u8>,
    indices: HashMap<usize, u32>,
    retained: Vec<Arc<dyn Any + Send + Sync>>,
}

impl BinaryEncoder {
    /// An encoder with empty output and an empty pointer table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when no bytes have been written.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consumes the encoder, returning its output.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Drains the output accumulated so far, keeping the pointer table.
    ///
    /// This is what lets one encoder serve a whole connection: each call
    /// yields one frame while indices assigned in earlier frames remain
    /// valid.
    pub fn take_frame(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

impl Sink for BinaryEncoder {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }
}

impl PointerSink for BinaryEncoder {
    fn intern_pointer(&mut self, pointer: Arc<dyn Any + Send + Sync>) -> PointerRecord {
        let addr = Arc::as_ptr(&pointer) as *const u8 as usize;
        if let Some(&index) = self.indices.get(&addr) {
            return PointerRecord::Seen(index);
        }
        let index = self.indices.len() as u32;
        self.indices.insert(addr, index);
        self.retained.push(pointer);
        PointerRecord::Fresh(index)
    }
}

/// Serializer flavor decoding wire bytes, with the inverse pointer table.
///
/// A decoder persists for the life of a connection: [`BinaryDecoder::provide`]
/// loads the next frame while the pointer table carries over.
#[derive(Default)]
pub struct BinaryDecoder {
    bytes: Vec<u8>,
    position: usize,
    pointers: Vec<Option<Arc<dyn Any + Send + Sync>>>,
}

impl BinaryDecoder {
    /// A decoder with no input and an empty pointer table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the input with a new frame, keeping the pointer table.
    pub fn provide(&mut self, frame: Vec<u8>) {
        self.bytes = frame;
        self.position = 0;
    }

    /// Bytes of the current frame not yet consumed.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }
}

impl Source for BinaryDecoder {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), CodecError> {
        let available = self.bytes.len() - self.position;
        if buf.len() > available {
            return Err(CodecError::Truncated { requested: buf.len(), available });
        }
        buf.copy_from_slice(&self.bytes[self.position..self.position + buf.len()]);
        self.position += buf.len();
        Ok(())
    }
}

impl PointerSource for BinaryDecoder {
    fn pointer_table_len(&self) -> u32 {
        self.pointers.len() as u32
    }

    fn reserve_pointer(&mut self) -> u32 {
        self.pointers.push(None);
        (self.pointers.len() - 1) as u32
    }

    fn install_pointer(&mut self, index: u32, value: Arc<dyn Any + Send + Sync>) {
        self.pointers[index as usize] = Some(value);
    }

    fn lookup_pointer(&self, index: u32) -> Result<Arc<dyn Any + Send + Sync>, CodecError> {
        match self.pointers.get(index as usize) {
            Some(Some(value)) => Ok(value.clone()),
            Some(None) => Err(CodecError::SharedCycle(index)),
            None => Err(CodecError::SharedIndex {
                index,
                len: self.pointers.len(),
            }),
        }
    }
}

/// Serializer flavor that never writes, only counts.
///
/// Used to pre-compute frame sizes before committing to an allocation.
#[derive(Default)]
pub struct ByteCountSink {
    count: u64,
}

impl ByteCountSink {
    /// A sink with nothing counted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes the writes so far would have occupied.
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Sink for ByteCountSink {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.count += bytes.len() as u64;
    }
}

/// Encodes `value` into a fresh byte vector.
pub fn to_bytes<T: Encode<BinaryEncoder>>(value: &T) -> Vec<u8> {
    let mut encoder = BinaryEncoder::new();
    value.encode(&mut encoder);
    encoder.into_bytes()
}

/// Decodes a value from `bytes`.
pub fn from_bytes<T: Decode<BinaryDecoder>>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut decoder = BinaryDecoder::new();
    decoder.provide(bytes.to_vec());
    T::decode(&mut decoder)
}

/// The wire size of `value`, without encoding it.
pub fn byte_count<T: Encode<ByteCountSink>>(value: &T) -> u64 {
    let mut sink = ByteCountSink::new();
    value.encode(&mut sink);
    sink.count()
}

/// Copies a value through its wire form.
pub fn deep_clone<T>(value: &T) -> Result<T, CodecError>
where
    T: Encode<BinaryEncoder> + Decode<BinaryDecoder>,
{
    from_bytes(&to_bytes(value))
}

macro_rules! scalar_codec {
    ($($t:ty),*) => {$(
        impl<S: Sink + ?Sized> Encode<S> for $t {
            fn encode(&self, sink: &mut S) {
                sink.write_bytes(&self.to_le_bytes());
            }
        }
        impl<S: Source + ?Sized> Decode<S> for $t {
            fn decode(source: &mut S) -> Result<Self, CodecError> {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                source.read_bytes(&mut raw)?;
                Ok(<$t>::from_le_bytes(raw))
            }
        }
    )*};
}

scalar_codec!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl<S: Sink + ?Sized> Encode<S> for bool {
    fn encode(&self, sink: &mut S) {
        sink.write_bytes(&[u8::from(*self)]);
    }
}

impl<S: Source + ?Sized> Decode<S> for bool {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        match u8::decode(source)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }
}

impl<S: Sink + ?Sized> Encode<S> for () {
    fn encode(&self, _sink: &mut S) {}
}

impl<S: Source + ?Sized> Decode<S> for () {
    fn decode(_source: &mut S) -> Result<Self, CodecError> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Encode<S> for str {
    fn encode(&self, sink: &mut S) {
        (self.len() as u32).encode(sink);
        sink.write_bytes(self.as_bytes());
    }
}

impl<S: Sink + ?Sized> Encode<S> for String {
    fn encode(&self, sink: &mut S) {
        self.as_str().encode(sink);
    }
}

impl<S: Source + ?Sized> Decode<S> for String {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        let len = u32::decode(source)? as usize;
        let mut raw = vec![0u8; len];
        source.read_bytes(&mut raw)?;
        Ok(String::from_utf8(raw)?)
    }
}

impl<S: Sink + ?Sized, T: Encode<S>> Encode<S> for Option<T> {
    fn encode(&self, sink: &mut S) {
        match self {
            None => false.encode(sink),
            Some(value) => {
                true.encode(sink);
                value.encode(sink);
            }
        }
    }
}

impl<S: Source + ?Sized, T: Decode<S>> Decode<S> for Option<T> {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        if bool::decode(source)? {
            Ok(Some(T::decode(source)?))
        } else {
            Ok(None)
        }
    }
}

impl<S: Sink + ?Sized, T: Encode<S>> Encode<S> for Vec<T> {
    fn encode(&self, sink: &mut S) {
        (self.len() as u32).encode(sink);
        for item in self {
            item.encode(sink);
        }
    }
}

impl<S: Source + ?Sized, T: Decode<S>> Decode<S> for Vec<T> {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        let len = u32::decode(source)? as usize;
        let mut items = Vec::with_capacity(len.min(1 << 20));
        for _ in 0..len {
            items.push(T::decode(source)?);
        }
        Ok(items)
    }
}

impl<S: Sink + ?Sized, A: Encode<S>, B: Encode<S>> Encode<S> for (A, B) {
    fn encode(&self, sink: &mut S) {
        self.0.encode(sink);
        self.1.encode(sink);
    }
}

impl<S: Source + ?Sized, A: Decode<S>, B: Decode<S>> Decode<S> for (A, B) {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        Ok((A::decode(source)?, B::decode(source)?))
    }
}

impl<S: Sink + ?Sized, A: Encode<S>, B: Encode<S>, C: Encode<S>> Encode<S> for (A, B, C) {
    fn encode(&self, sink: &mut S) {
        self.0.encode(sink);
        self.1.encode(sink);
        self.2.encode(sink);
    }
}

impl<S: Source + ?Sized, A: Decode<S>, B: Decode<S>, C: Decode<S>> Decode<S> for (A, B, C) {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        Ok((A::decode(source)?, B::decode(source)?, C::decode(source)?))
    }
}

impl<S: Sink + ?Sized, K: Encode<S>, V: Encode<S>> Encode<S> for BTreeMap<K, V> {
    fn encode(&self, sink: &mut S) {
        (self.len() as u32).encode(sink);
        for (key, value) in self {
            key.encode(sink);
            value.encode(sink);
        }
    }
}

impl<S: Source + ?Sized, K: Decode<S> + Ord, V: Decode<S>> Decode<S> for BTreeMap<K, V> {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        let len = u32::decode(source)? as usize;
        let mut map = BTreeMap::new();
        for _ in 0..len {
            let key = K::decode(source)?;
            let value = V::decode(source)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl<S: Sink + ?Sized, K: Encode<S>, V: Encode<S>> Encode<S> for HashMap<K, V> {
    fn encode(&self, sink: &mut S) {
        (self.len() as u32).encode(sink);
        for (key, value) in self {
            key.encode(sink);
            value.encode(sink);
        }
    }
}

impl<S, K, V> Decode<S> for HashMap<K, V>
where
    S: Source + ?Sized,
    K: Decode<S> + Eq + std::hash::Hash,
    V: Decode<S>,
{
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        let len = u32::decode(source)? as usize;
        let mut map = HashMap::with_capacity(len.min(1 << 20));
        for _ in 0..len {
            let key = K::decode(source)?;
            let value = V::decode(source)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl<S: Sink + ?Sized, T: Encode<S>> Encode<S> for BTreeSet<T> {
    fn encode(&self, sink: &mut S) {
        (self.len() as u32).encode(sink);
        for item in self {
            item.encode(sink);
        }
    }
}

impl<S: Source + ?Sized, T: Decode<S> + Ord> Decode<S> for BTreeSet<T> {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        let len = u32::decode(source)? as usize;
        let mut set = BTreeSet::new();
        for _ in 0..len {
            set.insert(T::decode(source)?);
        }
        Ok(set)
    }
}

impl<S: Sink + ?Sized, T: Encode<S>> Encode<S> for HashSet<T> {
    fn encode(&self, sink: &mut S) {
        (self.len() as u32).encode(sink);
        for item in self {
            item.encode(sink);
        }
    }
}

impl<S, T> Decode<S> for HashSet<T>
where
    S: Source + ?Sized,
    T: Decode<S> + Eq + std::hash::Hash,
{
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        let len = u32::decode(source)? as usize;
        let mut set = HashSet::with_capacity(len.min(1 << 20));
        for _ in 0..len {
            set.insert(T::decode(source)?);
        }
        Ok(set)
    }
}

/// Shared pointers encode as their dense table index; the body follows
/// inline exactly when the index is fresh. Nullability is expressed by
/// wrapping in `Option`, whose one-byte flag is the null prefix of the wire
/// format.
impl<S, T> Encode<S> for Arc<T>
where
    S: PointerSink + ?Sized,
    T: Encode<S> + Send + Sync + 'static,
{
    fn encode(&self, sink: &mut S) {
        match sink.intern_pointer(self.clone()) {
            PointerRecord::Seen(index) => index.encode(sink),
            PointerRecord::Fresh(index) => {
                index.encode(sink);
                (**self).encode(sink);
            }
        }
    }
}

impl<S, T> Decode<S> for Arc<T>
where
    S: PointerSource + ?Sized,
    T: Decode<S> + Send + Sync + 'static,
{
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        let index = u32::decode(source)?;
        let len = source.pointer_table_len();
        if index == len {
            let reserved = source.reserve_pointer();
            debug_assert_eq!(reserved, index);
            let value = Arc::new(T::decode(source)?);
            source.install_pointer(index, value.clone());
            Ok(value)
        } else if index < len {
            source
                .lookup_pointer(index)?
                .downcast::<T>()
                .map_err(|_| CodecError::SharedType(index))
        } else {
            Err(CodecError::SharedIndex {
                index,
                len: len as usize,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip() {
        assert_eq!(from_bytes::<u64>(&to_bytes(&42u64)).unwrap(), 42);
        assert_eq!(from_bytes::<i32>(&to_bytes(&-7i32)).unwrap(), -7);
        assert_eq!(from_bytes::<f64>(&to_bytes(&1.5f64)).unwrap(), 1.5);
        assert_eq!(from_bytes::<bool>(&to_bytes(&true)).unwrap(), true);
    }

    #[test]
    fn scalars_are_little_endian() {
        assert_eq!(to_bytes(&0x0102_0304u32), vec![4, 3, 2, 1]);
    }

    #[test]
    fn strings_are_length_prefixed() {
        let bytes = to_bytes(&"abc".to_owned());
        assert_eq!(bytes, vec![3, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(from_bytes::<String>(&bytes).unwrap(), "abc");
    }

    #[test]
    fn containers_round_trip() {
        let vec = vec![1u32, 2, 3];
        assert_eq!(from_bytes::<Vec<u32>>(&to_bytes(&vec)).unwrap(), vec);

        let mut map = BTreeMap::new();
        map.insert("one".to_owned(), 1u64);
        map.insert("two".to_owned(), 2u64);
        assert_eq!(
            from_bytes::<BTreeMap<String, u64>>(&to_bytes(&map)).unwrap(),
            map
        );

        let nested = vec![Some((1u8, "x".to_owned())), None];
        assert_eq!(
            from_bytes::<Vec<Option<(u8, String)>>>(&to_bytes(&nested)).unwrap(),
            nested
        );
        assert_eq!(deep_clone(&nested).unwrap(), nested);
    }

    #[test]
    fn option_is_one_byte_flag() {
        assert_eq!(to_bytes(&Option::<u32>::None), vec![0]);
        assert_eq!(to_bytes(&Some(1u8)), vec![1, 1]);
    }

    #[test]
    fn shared_pointers_preserve_aliasing() {
        let shared = Arc::new("pointee".to_owned());
        let triple = (shared.clone(), shared.clone(), shared);
        let decoded: (Arc<String>, Arc<String>, Arc<String>) =
            from_bytes(&to_bytes(&triple)).unwrap();

        assert_eq!(*decoded.0, "pointee");
        assert!(Arc::ptr_eq(&decoded.0, &decoded.1));
        assert!(Arc::ptr_eq(&decoded.1, &decoded.2));
        // One allocation, three handles; the decoder's table is gone.
        assert_eq!(Arc::strong_count(&decoded.0), 3);
    }

    #[test]
    fn repeated_pointers_encode_small() {
        let shared = Arc::new(vec![0u8; 1024]);
        let first = to_bytes(&shared);
        let mut encoder = BinaryEncoder::new();
        shared.encode(&mut encoder);
        shared.encode(&mut encoder);
        // The second occurrence costs only an index.
        assert_eq!(encoder.len(), first.len() + 4);
    }

    #[test]
    fn fresh_indices_are_dense() {
        let inner = Arc::new(7u32);
        let outer = Arc::new((inner.clone(), 8u32));
        let mut encoder = BinaryEncoder::new();
        outer.encode(&mut encoder);
        inner.encode(&mut encoder);
        let mut decoder = BinaryDecoder::new();
        decoder.provide(encoder.into_bytes());
        let outer2 = <Arc<(Arc<u32>, u32)>>::decode(&mut decoder).unwrap();
        let inner2 = <Arc<u32>>::decode(&mut decoder).unwrap();
        assert!(Arc::ptr_eq(&outer2.0, &inner2));
        assert_eq!(*inner2, 7);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let bytes = to_bytes(&12345u64);
        assert!(matches!(
            from_bytes::<u64>(&bytes[..4]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn invalid_bool_is_an_error() {
        assert!(matches!(
            from_bytes::<bool>(&[2]),
            Err(CodecError::InvalidBool(2))
        ));
    }

    #[test]
    fn out_of_range_pointer_index_is_an_error() {
        // Index 5 against an empty table.
        let bytes = to_bytes(&5u32);
        let mut decoder = BinaryDecoder::new();
        decoder.provide(bytes);
        assert!(matches!(
            <Arc<u32>>::decode(&mut decoder),
            Err(CodecError::SharedIndex { index: 5, .. })
        ));
    }

    #[test]
    fn byte_count_matches_encoding() {
        let value = (vec![1u64, 2, 3], Some("text".to_owned()));
        assert_eq!(byte_count(&value), to_bytes(&value).len() as u64);
    }

    #[test]
    fn random_byte_vectors_round_trip() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            let len = rng.gen_range(0..256);
            let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            assert_eq!(from_bytes::<Vec<u8>>(&to_bytes(&bytes)).unwrap(), bytes);
        }
    }
}
