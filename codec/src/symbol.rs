//! Process-wide interning of byte strings to stable identities.
//!
//! Two symbols are equal exactly when their backing records are the same
//! record; the empty string maps to the null handle so the
//! default-constructed symbol is well-defined. Records live for the life of
//! the process and are never freed, bounding the table by the number of
//! distinct strings ever interned.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};

use weft_hash::Hash;

use crate::encode::{CodecError, Decode, Encode, Sink, Source};

struct SymbolRecord {
    text: String,
    hash: Hash,
}

fn table() -> &'static Mutex<HashMap<Hash, &'static SymbolRecord>> {
    static TABLE: OnceLock<Mutex<HashMap<Hash, &'static SymbolRecord>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// An interned string handle with pointer identity.
#[derive(Clone, Copy)]
pub struct Symbol(Option<&'static SymbolRecord>);

impl Symbol {
    /// Interns `text`, returning the one handle for it.
    ///
    /// Idempotent; the empty string returns the null handle.
    pub fn new(text: &str) -> Symbol {
        if text.is_empty() {
            return Symbol(None);
        }
        let hash = Hash::fast(text.as_bytes());
        let mut table = table().lock().expect("symbol table poisoned");
        if let Some(record) = table.get(&hash) {
            return Symbol(Some(record));
        }
        let record: &'static SymbolRecord =
            Box::leak(Box::new(SymbolRecord { text: text.to_owned(), hash }));
        table.insert(hash, record);
        Symbol(Some(record))
    }

    /// Interns `text` after replacing every byte outside `[0-9A-Za-z_]`
    /// with `_`.
    pub fn safe(text: &str) -> Symbol {
        let cleaned: String = text
            .bytes()
            .map(|byte| {
                if byte.is_ascii_alphanumeric() || byte == b'_' {
                    byte as char
                } else {
                    '_'
                }
            })
            .collect();
        Symbol::new(&cleaned)
    }

    /// The interned text; empty for the null handle.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            Some(record) => &record.text,
            None => "",
        }
    }

    /// Length of the interned text in bytes.
    pub fn len(&self) -> usize {
        self.as_str().len()
    }

    /// True for the null handle.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// The record's digest; the null handle digests as the default hash.
    pub fn hash(&self) -> Hash {
        match self.0 {
            Some(record) => record.hash,
            None => Hash::default(),
        }
    }
}

impl Default for Symbol {
    /// The null handle, backing the empty string.
    fn default() -> Symbol {
        Symbol(None)
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Symbol) -> bool {
        match (self.0, other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => std::ptr::eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Symbol {}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Symbol) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Symbol {
    /// Null orders first; interned records order by digest.
    fn cmp(&self, other: &Symbol) -> Ordering {
        match (self.0, other.0) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.hash.cmp(&b.hash),
        }
    }
}

impl std::hash::Hash for Symbol {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash().as_words().hash(state);
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Symbol({:?})", self.as_str())
    }
}

impl<S: Sink + ?Sized> Encode<S> for Symbol {
    fn encode(&self, sink: &mut S) {
        self.as_str().encode(sink);
    }
}

impl<S: Source + ?Sized> Decode<S> for Symbol {
    fn decode(source: &mut S) -> Result<Self, CodecError> {
        let text = String::decode(source)?;
        Ok(Symbol::new(&text))
    }
}

macro_rules! well_known_symbols {
    ($($method:ident => $text:expr,)*) => {
        /// Well-known symbols, interned on first use and memoized forever.
        impl Symbol {
            $(
                pub fn $method() -> Symbol {
                    static CELL: OnceLock<Symbol> = OnceLock::new();
                    *CELL.get_or_init(|| Symbol::new($text))
                }
            )*
        }
    };
}

well_known_symbols! {
    call => "Call",
    set_call => "SetCall",
    member => "Member",
    set_member => "SetMember",
    get_item => "GetItem",
    set_item => "SetItem",
    iter => "Iter",
    next => "Next",
    operator => "Operator",
    convert => "Convert",
    make_tuple => "MakeTuple",
    alternative => "Alternative",
    structure => "Structure",
    class => "Class",
    function => "Function",
    tuple => "Tuple",
    vector => "Vector",
    string => "String",
    integer => "Integer",
    float => "Float",
    nothing => "Nothing",
    dictionary => "Dictionary",
    extras => "Extras",
}
