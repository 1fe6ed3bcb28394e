//! Codec-neutral value tree exchanged with codec implementations.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered list of variants (WAMP `list`).
pub type Array = Vec<Variant>;

/// String-keyed dictionary of variants (WAMP `dict`).
///
/// A `BTreeMap` keeps key iteration deterministic, which matters for tests
/// and for reproducible wire output.
pub type Object = BTreeMap<String, Variant>;

/// A dynamically-typed WAMP value.
///
/// Codecs translate between byte buffers and `Variant` trees; everything
/// above the codec layer manipulates `Variant` only. Serde untagged
/// (de)serialization makes the JSON codec a direct `serde_json` pass-through
/// and keeps MsgPack/CBOR implementations trivial.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variant {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Real(f64),
    String(String),
    Array(Array),
    Object(Object),
}

/// Discriminant of a [`Variant`], used by the message validation table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariantKind {
    Null,
    Bool,
    Integer,
    Real,
    String,
    Array,
    Object,
}

impl fmt::Display for VariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VariantKind::Null => "null",
            VariantKind::Bool => "bool",
            VariantKind::Integer => "integer",
            VariantKind::Real => "real",
            VariantKind::String => "string",
            VariantKind::Array => "array",
            VariantKind::Object => "object",
        };
        f.write_str(name)
    }
}

impl Variant {
    pub fn kind(&self) -> VariantKind {
        match self {
            Variant::Null => VariantKind::Null,
            Variant::Bool(_) => VariantKind::Bool,
            Variant::Int(_) | Variant::UInt(_) => VariantKind::Integer,
            Variant::Real(_) => VariantKind::Real,
            Variant::String(_) => VariantKind::String,
            Variant::Array(_) => VariantKind::Array,
            Variant::Object(_) => VariantKind::Object,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Reads an unsigned integer, accepting non-negative `Int` values too
    /// since codecs are free to pick either representation.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Variant::UInt(u) => Some(*u),
            Variant::Int(i) if *i >= 0 => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Variant::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Variant::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Array> {
        match self {
            Variant::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<Object> {
        match self {
            Variant::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Variant::String(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness as used by feature dictionaries and option flags.
    pub fn truthy(&self) -> bool {
        match self {
            Variant::Bool(b) => *b,
            Variant::Int(i) => *i != 0,
            Variant::UInt(u) => *u != 0,
            _ => false,
        }
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Variant::Bool(value)
    }
}

impl From<i64> for Variant {
    fn from(value: i64) -> Self {
        Variant::Int(value)
    }
}

impl From<u64> for Variant {
    fn from(value: u64) -> Self {
        Variant::UInt(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Variant::Real(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant::String(value.to_owned())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Variant::String(value)
    }
}

impl From<Array> for Variant {
    fn from(value: Array) -> Self {
        Variant::Array(value)
    }
}

impl From<Object> for Variant {
    fn from(value: Object) -> Self {
        Variant::Object(value)
    }
}

impl<T: Into<Variant>> FromIterator<T> for Variant {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Variant::Array(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_accessor_accepts_both_signs() {
        assert_eq!(Variant::Int(42).as_u64(), Some(42));
        assert_eq!(Variant::UInt(42).as_u64(), Some(42));
        assert_eq!(Variant::Int(-1).as_u64(), None);
    }

    #[test]
    fn truthiness() {
        assert!(Variant::Bool(true).truthy());
        assert!(Variant::UInt(1).truthy());
        assert!(!Variant::UInt(0).truthy());
        assert!(!Variant::String("yes".into()).truthy());
        assert!(!Variant::Null.truthy());
    }

    #[test]
    fn json_round_trip() {
        let value = Variant::Array(vec![
            Variant::UInt(48),
            Variant::Object(Object::from([
                ("timeout".to_owned(), Variant::UInt(100)),
                ("receive_progress".to_owned(), Variant::Bool(true)),
            ])),
            Variant::String("com.myapp.echo".into()),
        ]);

        let bytes = serde_json::to_vec(&value).expect("serialize");
        let back: Variant = serde_json::from_slice(&bytes).expect("deserialize");
        assert_eq!(back, value);
    }
}
