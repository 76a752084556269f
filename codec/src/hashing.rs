//! The hashing serializer flavor: digests a value's wire form without
//! materializing it.

use weft_hash::{Hash, HashWriter};

use crate::encode::{CodecError, Decode, Encode, Sink, Source};

/// A sink that feeds every write into a streaming hash.
pub struct HashingSink {
    writer: HashWriter,
}

impl HashingSink {
    /// A sink with nothing hashed.
    pub fn new() -> Self {
        HashingSink { writer: HashWriter::new() }
    }

    /// Bytes hashed so far.
    pub fn position(&self) -> u64 {
        self.writer.position()
    }

    /// Finalizes the digest.
    pub fn finish(self) -> Hash {
        self.writer.finish()
    }
}

impl Default for HashingSink {
    fn default() -> Self {
        HashingSink::new()
    }
}

impl Sink for HashingSink {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.writer.write(bytes);
    }
}

/// A sink that hashes one level itself and delegates the rest.
///
/// Types that cache their own digest implement `Encode<HashingSink>` by
/// serializing the cached value; when a container instead wants the field
/// hashed afresh it encodes the field through a `DirectHashingSink`, whose
/// digest is then serialized into the outer stream.
pub struct DirectHashingSink<'a> {
    inner: &'a mut HashingSink,
}

impl<'a> DirectHashingSink<'a> {
    /// Wraps an outer hashing sink.
    pub fn new(inner: &'a mut HashingSink) -> Self {
        DirectHashingSink { inner }
    }
}

impl Sink for DirectHashingSink<'_> {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.inner.write_bytes(bytes);
    }
}

/// The digest of `value`'s type-directed encoding.
pub fn hash_value<T: Encode<HashingSink>>(value: &T) -> Hash {
    let mut sink = HashingSink::new();
    value.encode(&mut sink);
    sink.finish()
}

impl<S: Sink + ?Sized> Encode<S> for Hash {
    fn encode(&self, sink: &mut S) {
        sink.write_bytes(&self.to_bytes());
    }
}

impl<S: Source + ?Sized> Decode<S> for Hash {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        let mut raw = [0u8; weft_hash::HASH_BYTES];
        source.read_bytes(&mut raw)?;
        Ok(Hash::from_bytes(&raw))
    }
}
