//! 160-bit content digests used as message identities, memoization keys,
//! and symbol identities.
//!
//! A [`Hash`] is five 32-bit words. Two construction algorithms are
//! provided: a cryptographic one ([`Hash::digest`], SHA-1) and a fast one
//! ([`Hash::fast`], BLAKE3 truncated to 160 bits). Hashes compose: `a + b`
//! is the hash of a canonical concatenation of the two, and `a ^ b` is a
//! commutative word-wise accumulation. [`HashWriter`] builds a digest
//! incrementally so values can be hashed without materializing their wire
//! form.

use std::fmt;
use std::ops::{Add, BitXor};

use sha1::{Digest, Sha1};

/// Number of bytes in a [`Hash`].
pub const HASH_BYTES: usize = 20;

/// A 160-bit digest: five 32-bit words, compared most significant word first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u32; 5]);

impl Default for Hash {
    /// The unwritten digest, deliberately distinct from all-zero.
    fn default() -> Self {
        Hash([0, 1, 2, 3, 4])
    }
}

impl Hash {
    /// Constructs a hash directly from five words.
    pub fn from_words(words: [u32; 5]) -> Self {
        Hash(words)
    }

    /// The five words, most significant first.
    pub fn as_words(&self) -> &[u32; 5] {
        &self.0
    }

    /// Hashes `bytes` with the cryptographic algorithm.
    ///
    /// Empty input returns [`Hash::default`].
    pub fn digest(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Hash::default();
        }
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Hash::from_byte_array(hasher.finalize().into())
    }

    /// Hashes `bytes` with the fast algorithm.
    ///
    /// Empty input returns [`Hash::default`].
    pub fn fast(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Hash::default();
        }
        let digest = blake3::hash(bytes);
        let mut truncated = [0u8; HASH_BYTES];
        truncated.copy_from_slice(&digest.as_bytes()[..HASH_BYTES]);
        Hash::from_byte_array(truncated)
    }

    /// Builds a hash from up to twenty raw bytes, zero-padding the rest.
    ///
    /// Panics when `bytes` is empty or longer than twenty bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert!(!bytes.is_empty() && bytes.len() <= HASH_BYTES);
        let mut raw = [0u8; HASH_BYTES];
        raw[..bytes.len()].copy_from_slice(bytes);
        Hash::from_byte_array(raw)
    }

    /// The twenty-byte little-endian representation.
    pub fn to_bytes(self) -> [u8; HASH_BYTES] {
        let mut raw = [0u8; HASH_BYTES];
        for (chunk, word) in raw.chunks_exact_mut(4).zip(self.0.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        raw
    }

    /// Upper-case hex form, forty characters.
    pub fn to_hex(self) -> String {
        hex::encode_upper(self.to_bytes())
    }

    /// Parses a forty-character hex string, either case.
    pub fn from_hex(text: &str) -> Result<Self, hex::FromHexError> {
        let raw = hex::decode(text)?;
        if raw.len() != HASH_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        Ok(Hash::from_bytes(&raw))
    }

    fn from_byte_array(raw: [u8; HASH_BYTES]) -> Self {
        let mut words = [0u32; 5];
        for (word, chunk) in words.iter_mut().zip(raw.chunks_exact(4)) {
            *word = u32::from_le_bytes(chunk.try_into().expect("chunk of four bytes"));
        }
        Hash(words)
    }
}

/// The hash of the canonical concatenation of the two operands.
impl Add for Hash {
    type Output = Hash;
    fn add(self, other: Hash) -> Hash {
        let mut joined = [0u8; HASH_BYTES * 2];
        joined[..HASH_BYTES].copy_from_slice(&self.to_bytes());
        joined[HASH_BYTES..].copy_from_slice(&other.to_bytes());
        Hash::fast(&joined)
    }
}

/// Commutative word-wise accumulation.
impl BitXor for Hash {
    type Output = Hash;
    fn bitxor(self, other: Hash) -> Hash {
        let mut words = self.0;
        for (word, theirs) in words.iter_mut().zip(other.0.iter()) {
            *word ^= theirs;
        }
        Hash(words)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}...", &self.to_hex()[..12])
    }
}

impl serde::Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <String as serde::Deserialize>::deserialize(deserializer)?;
        Hash::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Streaming construction of a cryptographic [`Hash`].
///
/// Write any number of byte slices and call [`HashWriter::finish`]; the
/// result equals [`Hash::digest`] over the concatenation of the writes.
pub struct HashWriter {
    hasher: Sha1,
    position: u64,
}

impl HashWriter {
    /// Creates a writer with nothing written.
    pub fn new() -> Self {
        HashWriter { hasher: Sha1::new(), position: 0 }
    }

    /// Appends bytes to the digest.
    pub fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
    }

    /// Total bytes written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Finalizes the digest.
    pub fn finish(self) -> Hash {
        if self.position == 0 {
            return Hash::default();
        }
        Hash::from_byte_array(self.hasher.finalize().into())
    }
}

impl Default for HashWriter {
    fn default() -> Self {
        HashWriter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition_is_concatenation_hash() {
        let a = Hash::digest(b"left");
        let b = Hash::digest(b"right");
        let mut joined = Vec::new();
        joined.extend_from_slice(&a.to_bytes());
        joined.extend_from_slice(&b.to_bytes());
        assert_eq!(a + b, Hash::fast(&joined));
        assert_ne!(a + b, b + a);
    }

    #[test]
    fn xor_commutes() {
        let a = Hash::digest(b"left");
        let b = Hash::digest(b"right");
        assert_eq!(a ^ b, b ^ a);
        assert_eq!((a ^ b) ^ b, a);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut writer = HashWriter::new();
        writer.write(b"hello, ");
        writer.write(b"world");
        assert_eq!(writer.finish(), Hash::digest(b"hello, world"));
    }

    #[test]
    fn streaming_empty_is_default() {
        assert_eq!(HashWriter::new().finish(), Hash::default());
        assert_eq!(Hash::digest(b""), Hash::default());
    }

    #[test]
    fn hex_round_trips() {
        let hash = Hash::digest(b"round trip");
        let text = hash.to_hex();
        assert_eq!(text.len(), 40);
        assert_eq!(Hash::from_hex(&text).unwrap(), hash);
        assert_eq!(Hash::from_hex(&text.to_lowercase()).unwrap(), hash);
        assert!(Hash::from_hex("abc").is_err());
    }

    #[test]
    fn short_bytes_zero_pad() {
        let hash = Hash::from_bytes(&[7]);
        assert_eq!(hash.as_words()[0], 7);
        assert_eq!(&hash.as_words()[1..], &[0, 0, 0, 0]);
    }

    #[test]
    fn ordering_is_word_lexicographic() {
        let low = Hash::from_words([0, 9, 9, 9, 9]);
        let high = Hash::from_words([1, 0, 0, 0, 0]);
        assert!(low < high);
    }
}
