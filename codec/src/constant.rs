//! Registered opaque runtime constants.
//!
//! The code generator embeds arbitrary runtime values into generated code;
//! to round-trip them across the fabric, every such value carries a
//! registered type name, and the process-wide [`ConstantRegistry`] maps that
//! name to the descriptor that knows how to encode and decode it. Every
//! descriptor must be registered before a value of its type appears on the
//! wire. Two constants are equal exactly when their type names and digests
//! compare equal.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, OnceLock};

use weft_hash::Hash;

use crate::encode::{
    BinaryDecoder, BinaryEncoder, ByteCountSink, CodecError, Decode, Encode, Sink, Source,
};
use crate::hashing::HashingSink;
use crate::memo::{Flattener, Inflater};

/// The in-memory shape of a constant, as the code generator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeLayout {
    /// Size of the value in bytes.
    pub size: usize,
    /// Required alignment in bytes.
    pub align: usize,
}

/// An opaque runtime value that can be embedded in generated code.
pub trait NativeConstant: Send + Sync {
    /// The descriptor for this constant's registered type.
    fn constant_type(&self) -> &'static dyn ConstantType;
    /// The in-memory layout generated code reads the value with.
    fn layout(&self) -> NativeLayout;
    /// The start of the value's in-memory representation.
    fn data_ptr(&self) -> *const u8;
    /// A human-readable description.
    fn description(&self) -> String;
    /// The value's content digest.
    fn hash(&self) -> Hash;
}

/// A registered constant type: the name on the wire plus its codec.
pub trait ConstantType: Send + Sync {
    /// The registered type name.
    fn type_name(&self) -> &'static str;
    /// Encodes a constant of this type into payload bytes.
    fn encode_constant(&self, constant: &Constant) -> Vec<u8>;
    /// Reconstructs a constant of this type from payload bytes.
    fn decode_constant(&self, payload: &[u8]) -> Result<Constant, CodecError>;
}

/// A shared handle to a registered constant.
///
/// Equality and ordering are by `(type name, digest)`, which is how the
/// code generator distinguishes embedded values.
#[derive(Clone)]
pub struct Constant(Arc<dyn NativeConstant>);

impl Constant {
    /// Wraps a constant value.
    pub fn new<T: NativeConstant + 'static>(value: T) -> Constant {
        Constant(Arc::new(value))
    }

    /// Wraps an already shared constant value.
    pub fn from_arc(value: Arc<dyn NativeConstant>) -> Constant {
        Constant(value)
    }
}

impl Deref for Constant {
    type Target = dyn NativeConstant;
    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Constant) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Constant {}

impl PartialOrd for Constant {
    fn partial_cmp(&self, other: &Constant) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Constant {
    fn cmp(&self, other: &Constant) -> Ordering {
        self.constant_type()
            .type_name()
            .cmp(other.constant_type().type_name())
            .then_with(|| self.hash().cmp(&other.hash()))
    }
}

impl fmt::Debug for Constant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Constant({})", self.description())
    }
}

/// The process-wide type-name registry.
pub struct ConstantRegistry {
    types: Mutex<HashMap<&'static str, &'static dyn ConstantType>>,
}

impl ConstantRegistry {
    /// The singleton registry.
    pub fn global() -> &'static ConstantRegistry {
        static REGISTRY: OnceLock<ConstantRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| ConstantRegistry { types: Mutex::new(HashMap::new()) })
    }

    /// Registers a descriptor under its type name.
    ///
    /// Must happen before any value of the type appears on the wire.
    pub fn register(&self, descriptor: &'static dyn ConstantType) {
        let mut types = self.types.lock().expect("constant registry poisoned");
        types.insert(descriptor.type_name(), descriptor);
    }

    /// Looks up a descriptor by type name.
    pub fn lookup(&self, name: &str) -> Option<&'static dyn ConstantType> {
        let types = self.types.lock().expect("constant registry poisoned");
        types.get(name).copied()
    }
}

fn encode_wire_form<S: Sink + ?Sized>(constant: &Constant, sink: &mut S) {
    let descriptor = constant.constant_type();
    descriptor.type_name().encode(sink);
    descriptor.encode_constant(constant).encode(sink);
}

fn decode_wire_form<S: Source + ?Sized>(source: &mut S) -> Result<Constant, CodecError> {
    let name = String::decode(source)?;
    let payload = Vec::<u8>::decode(source)?;
    let descriptor = ConstantRegistry::global()
        .lookup(&name)
        .ok_or(CodecError::UnknownConstant(name))?;
    descriptor.decode_constant(&payload)
}

impl Encode<BinaryEncoder> for Constant {
    fn encode(&self, sink: &mut BinaryEncoder) {
        encode_wire_form(self, sink);
    }
}

impl Encode<Flattener> for Constant {
    fn encode(&self, sink: &mut Flattener) {
        encode_wire_form(self, sink);
    }
}

impl Encode<ByteCountSink> for Constant {
    fn encode(&self, sink: &mut ByteCountSink) {
        encode_wire_form(self, sink);
    }
}

/// The hashing flavor sees a constant as its name and digest, not its
/// payload bytes.
impl Encode<HashingSink> for Constant {
    fn encode(&self, sink: &mut HashingSink) {
        self.constant_type().type_name().encode(sink);
        self.hash().encode(sink);
    }
}

impl Decode<BinaryDecoder> for Constant {
    fn decode(source: &mut BinaryDecoder) -> Result<Self, CodecError> {
        decode_wire_form(source)
    }
}

impl Decode<Inflater> for Constant {
    fn decode(source: &mut Inflater) -> Result<Self, CodecError> {
        decode_wire_form(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{from_bytes, to_bytes};
    use crate::hashing::hash_value;

    struct WordConstantType;

    struct WordConstant {
        value: u64,
    }

    impl NativeConstant for WordConstant {
        fn constant_type(&self) -> &'static dyn ConstantType {
            &WordConstantType
        }
        fn layout(&self) -> NativeLayout {
            NativeLayout { size: 8, align: 8 }
        }
        fn data_ptr(&self) -> *const u8 {
            (&self.value as *const u64).cast()
        }
        fn description(&self) -> String {
            format!("Word({})", self.value)
        }
        fn hash(&self) -> Hash {
            hash_value(&self.value)
        }
    }

    impl ConstantType for WordConstantType {
        fn type_name(&self) -> &'static str {
            "Word"
        }
        fn encode_constant(&self, constant: &Constant) -> Vec<u8> {
            let mut payload = [0u8; 8];
            // The descriptor owns layout knowledge; a word is its raw bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(constant.data_ptr(), payload.as_mut_ptr(), 8);
            }
            payload.to_vec()
        }
        fn decode_constant(&self, payload: &[u8]) -> Result<Constant, CodecError> {
            let value = from_bytes::<u64>(payload)?;
            Ok(Constant::new(WordConstant { value }))
        }
    }

    #[test]
    fn registered_constants_round_trip() {
        ConstantRegistry::global().register(&WordConstantType);

        let constant = Constant::new(WordConstant { value: 90210 });
        let decoded: Constant = from_bytes(&to_bytes(&constant)).unwrap();

        assert_eq!(decoded, constant);
        assert_eq!(decoded.description(), "Word(90210)");
        assert_eq!(decoded.layout(), NativeLayout { size: 8, align: 8 });
    }

    #[test]
    fn unregistered_name_is_an_error() {
        let mut bytes = to_bytes(&"NoSuchType".to_owned());
        bytes.extend(to_bytes(&Vec::<u8>::new()));
        assert!(matches!(
            from_bytes::<Constant>(&bytes),
            Err(CodecError::UnknownConstant(_))
        ));
    }

    #[test]
    fn equality_is_name_and_digest() {
        let a = Constant::new(WordConstant { value: 1 });
        let b = Constant::new(WordConstant { value: 1 });
        let c = Constant::new(WordConstant { value: 2 });
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
