//! Central per-kind message validation table.
//!
//! Every message kind has one row describing its wire shape (arity bounds and
//! positional field kinds), the peer directions it may travel in, and the
//! session states in which a router may legally receive it. Dispatch code
//! consults this table instead of scattering per-kind checks.

use bitflags::bitflags;

use crate::message::Kind;
use crate::variant::{Variant, VariantKind};

bitflags! {
    /// Session states in which an inbound message kind is legal.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StateMask: u8 {
        const ESTABLISHING = 1 << 0;
        const AUTHENTICATING = 1 << 1;
        const ESTABLISHED = 1 << 2;
        const SHUTTING_DOWN = 1 << 3;
    }
}

/// Expected kind of one positional message field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// The leading kind code.
    Code,
    Uint,
    Str,
    Dict,
    List,
}

impl FieldKind {
    fn admits(self, value: &Variant) -> bool {
        match self {
            FieldKind::Code | FieldKind::Uint => value.kind() == VariantKind::Integer,
            FieldKind::Str => value.kind() == VariantKind::String,
            FieldKind::Dict => value.kind() == VariantKind::Object,
            FieldKind::List => value.kind() == VariantKind::Array,
        }
    }

    pub fn expected_name(self) -> &'static str {
        match self {
            FieldKind::Code | FieldKind::Uint => "integer",
            FieldKind::Str => "string",
            FieldKind::Dict => "dict",
            FieldKind::List => "list",
        }
    }
}

/// One row of the validation table.
#[derive(Clone, Copy, Debug)]
pub struct MessageTraits {
    pub kind: Kind,
    pub name: &'static str,
    pub min_len: usize,
    pub max_len: usize,
    pub fields: &'static [FieldKind],
    /// States in which a *router* may receive this kind from a client.
    pub legal_states: StateMask,
    /// Whether a client may send this kind to a router.
    pub router_bound: bool,
    /// Whether a router may send this kind to a client.
    pub client_bound: bool,
}

impl MessageTraits {
    /// Checks arity and positional field kinds against a raw message array.
    pub fn check_shape(&self, fields: &[Variant]) -> Result<(), ShapeError> {
        if fields.len() < self.min_len || fields.len() > self.max_len {
            return Err(ShapeError::Length { len: fields.len() });
        }
        for (index, value) in fields.iter().enumerate().skip(1) {
            let expected = self.fields[index];
            if !expected.admits(value) {
                return Err(ShapeError::Field { index, expected });
            }
        }
        Ok(())
    }
}

/// Outcome detail of [`MessageTraits::check_shape`].
#[derive(Clone, Copy, Debug)]
pub enum ShapeError {
    Length { len: usize },
    Field { index: usize, expected: FieldKind },
}

use FieldKind::{Code, Dict, List, Str, Uint};

const NONE: StateMask = StateMask::empty();
const SESSION: StateMask = StateMask::ESTABLISHED;
const PRE_WELCOME: StateMask = StateMask::ESTABLISHING
    .union(StateMask::AUTHENTICATING)
    .union(StateMask::ESTABLISHED);
const CLOSING: StateMask = StateMask::ESTABLISHED.union(StateMask::SHUTTING_DOWN);

const fn row(
    kind: Kind,
    name: &'static str,
    min_len: usize,
    max_len: usize,
    fields: &'static [FieldKind],
    legal_states: StateMask,
    router_bound: bool,
    client_bound: bool,
) -> MessageTraits {
    MessageTraits {
        kind,
        name,
        min_len,
        max_len,
        fields,
        legal_states,
        router_bound,
        client_bound,
    }
}

static TABLE: [MessageTraits; 24] = [
    row(Kind::Hello, "HELLO", 3, 3, &[Code, Str, Dict], StateMask::ESTABLISHING, true, false),
    row(Kind::Welcome, "WELCOME", 3, 3, &[Code, Uint, Dict], NONE, false, true),
    row(Kind::Abort, "ABORT", 3, 3, &[Code, Dict, Str], PRE_WELCOME, true, true),
    row(Kind::Challenge, "CHALLENGE", 3, 3, &[Code, Str, Dict], NONE, false, true),
    row(Kind::Authenticate, "AUTHENTICATE", 3, 3, &[Code, Str, Dict], StateMask::AUTHENTICATING, true, false),
    row(Kind::Goodbye, "GOODBYE", 3, 3, &[Code, Dict, Str], CLOSING, true, true),
    row(Kind::Error, "ERROR", 5, 7, &[Code, Uint, Uint, Dict, Str, List, Dict], SESSION, true, true),
    row(Kind::Publish, "PUBLISH", 4, 6, &[Code, Uint, Dict, Str, List, Dict], SESSION, true, false),
    row(Kind::Published, "PUBLISHED", 3, 3, &[Code, Uint, Uint], NONE, false, true),
    row(Kind::Subscribe, "SUBSCRIBE", 4, 4, &[Code, Uint, Dict, Str], SESSION, true, false),
    row(Kind::Subscribed, "SUBSCRIBED", 3, 3, &[Code, Uint, Uint], NONE, false, true),
    row(Kind::Unsubscribe, "UNSUBSCRIBE", 3, 3, &[Code, Uint, Uint], SESSION, true, false),
    row(Kind::Unsubscribed, "UNSUBSCRIBED", 2, 2, &[Code, Uint], NONE, false, true),
    row(Kind::Event, "EVENT", 4, 6, &[Code, Uint, Uint, Dict, List, Dict], NONE, false, true),
    row(Kind::Call, "CALL", 4, 6, &[Code, Uint, Dict, Str, List, Dict], SESSION, true, false),
    row(Kind::Cancel, "CANCEL", 3, 3, &[Code, Uint, Dict], SESSION, true, false),
    row(Kind::Result, "RESULT", 3, 5, &[Code, Uint, Dict, List, Dict], NONE, false, true),
    row(Kind::Register, "REGISTER", 4, 4, &[Code, Uint, Dict, Str], SESSION, true, false),
    row(Kind::Registered, "REGISTERED", 3, 3, &[Code, Uint, Uint], NONE, false, true),
    row(Kind::Unregister, "UNREGISTER", 3, 3, &[Code, Uint, Uint], SESSION, true, false),
    row(Kind::Unregistered, "UNREGISTERED", 2, 2, &[Code, Uint], NONE, false, true),
    row(Kind::Invocation, "INVOCATION", 4, 6, &[Code, Uint, Uint, Dict, List, Dict], NONE, false, true),
    row(Kind::Interrupt, "INTERRUPT", 3, 3, &[Code, Uint, Dict], NONE, false, true),
    row(Kind::Yield, "YIELD", 3, 5, &[Code, Uint, Dict, List, Dict], SESSION, true, false),
];

/// Looks up the table row for a message kind.
pub fn traits_of(kind: Kind) -> &'static MessageTraits {
    let index = match kind {
        Kind::Hello => 0,
        Kind::Welcome => 1,
        Kind::Abort => 2,
        Kind::Challenge => 3,
        Kind::Authenticate => 4,
        Kind::Goodbye => 5,
        Kind::Error => 6,
        Kind::Publish => 7,
        Kind::Published => 8,
        Kind::Subscribe => 9,
        Kind::Subscribed => 10,
        Kind::Unsubscribe => 11,
        Kind::Unsubscribed => 12,
        Kind::Event => 13,
        Kind::Call => 14,
        Kind::Cancel => 15,
        Kind::Result => 16,
        Kind::Register => 17,
        Kind::Registered => 18,
        Kind::Unregister => 19,
        Kind::Unregistered => 20,
        Kind::Invocation => 21,
        Kind::Interrupt => 22,
        Kind::Yield => 23,
    };
    &TABLE[index]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::Object;

    #[test]
    fn table_rows_are_self_consistent() {
        for traits in &TABLE {
            assert_eq!(traits_of(traits.kind).kind, traits.kind);
            assert_eq!(traits.max_len, traits.fields.len(), "{}", traits.name);
            assert!(traits.min_len <= traits.max_len, "{}", traits.name);
            assert_eq!(traits.fields[0], FieldKind::Code, "{}", traits.name);
        }
    }

    #[test]
    fn shape_check_rejects_short_hello() {
        let traits = traits_of(Kind::Hello);
        let fields = vec![Variant::UInt(1), Variant::String("realm1".into())];
        assert!(matches!(traits.check_shape(&fields), Err(ShapeError::Length { len: 2 })));
    }

    #[test]
    fn shape_check_rejects_wrong_field_kind() {
        let traits = traits_of(Kind::Subscribe);
        let fields = vec![
            Variant::UInt(32),
            Variant::UInt(1),
            Variant::Object(Object::new()),
            Variant::UInt(7), // topic must be a string
        ];
        let err = traits.check_shape(&fields);
        assert!(matches!(err, Err(ShapeError::Field { index: 3, expected: FieldKind::Str })));
    }

    #[test]
    fn router_never_accepts_client_bound_kinds() {
        for kind in [Kind::Welcome, Kind::Challenge, Kind::Event, Kind::Result, Kind::Invocation, Kind::Interrupt] {
            let traits = traits_of(kind);
            assert!(!traits.router_bound, "{} must not be router-bound", traits.name);
            assert!(traits.legal_states.is_empty());
        }
    }
}
