//! Message envelopes the embedding cluster sends over the fabric.

use smallvec::SmallVec;

use weft_codec::{CodecError, Decode, Encode, Sink, Source};

/// A sequence-stamped envelope.
///
/// Multi-channels do not order across sub-streams; senders that need a
/// global order stamp each message and let the application layer restore
/// it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedMessage<T> {
    /// Position in the sender's sequence.
    pub index: u64,
    /// The wrapped message.
    pub message: T,
}

impl<T> OrderedMessage<T> {
    /// Stamps `message` with `index`.
    pub fn new(index: u64, message: T) -> Self {
        OrderedMessage { index, message }
    }
}

impl<S: Sink + ?Sized, T: Encode<S>> Encode<S> for OrderedMessage<T> {
    fn encode(&self, sink: &mut S) {
        self.index.encode(sink);
        self.message.encode(sink);
    }
}

impl<S: Source + ?Sized, T: Decode<S>> Decode<S> for OrderedMessage<T> {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        Ok(OrderedMessage { index: u64::decode(source)?, message: T::decode(source)? })
    }
}

/// Several sub-messages carried transparently in one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle<T> {
    messages: SmallVec<[T; 4]>,
}

impl<T> Bundle<T> {
    /// An empty bundle.
    pub fn new() -> Self {
        Bundle { messages: SmallVec::new() }
    }

    /// Appends a sub-message.
    pub fn push(&mut self, message: T) {
        self.messages.push(message);
    }

    /// Number of sub-messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when the bundle carries nothing.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The sub-messages in order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.messages.iter()
    }
}

impl<T> Default for Bundle<T> {
    fn default() -> Self {
        Bundle::new()
    }
}

impl<T> FromIterator<T> for Bundle<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Bundle { messages: iter.into_iter().collect() }
    }
}

impl<T> IntoIterator for Bundle<T> {
    type Item = T;
    type IntoIter = smallvec::IntoIter<[T; 4]>;
    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl<S: Sink + ?Sized, T: Encode<S>> Encode<S> for Bundle<T> {
    fn encode(&self, sink: &mut S) {
        (self.messages.len() as u32).encode(sink);
        for message in &self.messages {
            message.encode(sink);
        }
    }
}

impl<S: Source + ?Sized, T: Decode<S>> Decode<S> for Bundle<T> {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        let len = u32::decode(source)? as usize;
        let mut messages = SmallVec::new();
        for _ in 0..len {
            messages.push(T::decode(source)?);
        }
        Ok(Bundle { messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_codec::{from_bytes, to_bytes};

    #[test]
    fn ordered_messages_round_trip() {
        let message = OrderedMessage::new(9, "payload".to_owned());
        let decoded: OrderedMessage<String> = from_bytes(&to_bytes(&message)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn bundles_round_trip_in_order() {
        let bundle: Bundle<u32> = (0..9).collect();
        let decoded: Bundle<u32> = from_bytes(&to_bytes(&bundle)).unwrap();
        assert_eq!(decoded, bundle);
        assert_eq!(decoded.iter().copied().collect::<Vec<_>>(), (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn bundle_wire_form_is_a_sequence() {
        let mut bundle = Bundle::new();
        bundle.push(1u8);
        bundle.push(2u8);
        assert_eq!(to_bytes(&bundle), to_bytes(&vec![1u8, 2]));
    }
}
