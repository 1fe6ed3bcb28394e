//! Tagged sum over the WAMP message kinds and its array conversions.

use std::fmt;
use std::vec::IntoIter;

use thiserror::Error;

use crate::traits::{self, ShapeError};
use crate::variant::{Array, Object, Variant};

/// WAMP message kind codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Hello = 1,
    Welcome = 2,
    Abort = 3,
    Challenge = 4,
    Authenticate = 5,
    Goodbye = 6,
    Error = 8,
    Publish = 16,
    Published = 17,
    Subscribe = 32,
    Subscribed = 33,
    Unsubscribe = 34,
    Unsubscribed = 35,
    Event = 36,
    Call = 48,
    Cancel = 49,
    Result = 50,
    Register = 64,
    Registered = 65,
    Unregister = 66,
    Unregistered = 67,
    Invocation = 68,
    Interrupt = 69,
    Yield = 70,
}

impl Kind {
    pub fn from_code(code: u64) -> Option<Kind> {
        let kind = match code {
            1 => Kind::Hello,
            2 => Kind::Welcome,
            3 => Kind::Abort,
            4 => Kind::Challenge,
            5 => Kind::Authenticate,
            6 => Kind::Goodbye,
            8 => Kind::Error,
            16 => Kind::Publish,
            17 => Kind::Published,
            32 => Kind::Subscribe,
            33 => Kind::Subscribed,
            34 => Kind::Unsubscribe,
            35 => Kind::Unsubscribed,
            36 => Kind::Event,
            48 => Kind::Call,
            49 => Kind::Cancel,
            50 => Kind::Result,
            64 => Kind::Register,
            65 => Kind::Registered,
            66 => Kind::Unregister,
            67 => Kind::Unregistered,
            68 => Kind::Invocation,
            69 => Kind::Interrupt,
            70 => Kind::Yield,
            _ => return None,
        };
        Some(kind)
    }

    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn name(self) -> &'static str {
        traits::traits_of(self).name
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded WAMP message.
///
/// Field names follow the wire position tables of the protocol
/// specification. `args`/`kwargs` are `None` when absent on the wire; an
/// empty `args` list is emitted whenever `kwargs` is present.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Hello { realm: String, details: Object },
    Welcome { session_id: u64, details: Object },
    Abort { details: Object, reason: String },
    Challenge { auth_method: String, extra: Object },
    Authenticate { signature: String, extra: Object },
    Goodbye { details: Object, reason: String },
    Error {
        request_kind: Kind,
        request_id: u64,
        details: Object,
        error: String,
        args: Option<Array>,
        kwargs: Option<Object>,
    },
    Publish {
        request_id: u64,
        options: Object,
        topic: String,
        args: Option<Array>,
        kwargs: Option<Object>,
    },
    Published { request_id: u64, publication_id: u64 },
    Subscribe { request_id: u64, options: Object, topic: String },
    Subscribed { request_id: u64, subscription_id: u64 },
    Unsubscribe { request_id: u64, subscription_id: u64 },
    Unsubscribed { request_id: u64 },
    Event {
        subscription_id: u64,
        publication_id: u64,
        details: Object,
        args: Option<Array>,
        kwargs: Option<Object>,
    },
    Call {
        request_id: u64,
        options: Object,
        procedure: String,
        args: Option<Array>,
        kwargs: Option<Object>,
    },
    Cancel { request_id: u64, options: Object },
    Result {
        request_id: u64,
        details: Object,
        args: Option<Array>,
        kwargs: Option<Object>,
    },
    Register { request_id: u64, options: Object, procedure: String },
    Registered { request_id: u64, registration_id: u64 },
    Unregister { request_id: u64, registration_id: u64 },
    Unregistered { request_id: u64 },
    Invocation {
        request_id: u64,
        registration_id: u64,
        details: Object,
        args: Option<Array>,
        kwargs: Option<Object>,
    },
    Interrupt { request_id: u64, options: Object },
    Yield {
        request_id: u64,
        options: Object,
        args: Option<Array>,
        kwargs: Option<Object>,
    },
}

/// Reason a raw value failed to parse as a WAMP message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message is not an array")]
    NotAnArray,
    #[error("message array is empty")]
    Empty,
    #[error("message kind code is not an integer")]
    BadCode,
    #[error("unknown message kind code {0}")]
    UnknownKind(u64),
    #[error("{name} message has invalid length {len}")]
    BadLength { name: &'static str, len: usize },
    #[error("{name} message field {index} is not of kind {expected}")]
    BadField {
        name: &'static str,
        index: usize,
        expected: &'static str,
    },
    #[error("ERROR message references unknown request kind code {0}")]
    BadRequestKind(u64),
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::Hello { .. } => Kind::Hello,
            Message::Welcome { .. } => Kind::Welcome,
            Message::Abort { .. } => Kind::Abort,
            Message::Challenge { .. } => Kind::Challenge,
            Message::Authenticate { .. } => Kind::Authenticate,
            Message::Goodbye { .. } => Kind::Goodbye,
            Message::Error { .. } => Kind::Error,
            Message::Publish { .. } => Kind::Publish,
            Message::Published { .. } => Kind::Published,
            Message::Subscribe { .. } => Kind::Subscribe,
            Message::Subscribed { .. } => Kind::Subscribed,
            Message::Unsubscribe { .. } => Kind::Unsubscribe,
            Message::Unsubscribed { .. } => Kind::Unsubscribed,
            Message::Event { .. } => Kind::Event,
            Message::Call { .. } => Kind::Call,
            Message::Cancel { .. } => Kind::Cancel,
            Message::Result { .. } => Kind::Result,
            Message::Register { .. } => Kind::Register,
            Message::Registered { .. } => Kind::Registered,
            Message::Unregister { .. } => Kind::Unregister,
            Message::Unregistered { .. } => Kind::Unregistered,
            Message::Invocation { .. } => Kind::Invocation,
            Message::Interrupt { .. } => Kind::Interrupt,
            Message::Yield { .. } => Kind::Yield,
        }
    }

    /// The client-chosen request id correlating replies, when the kind
    /// carries one in its leading position.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Message::Error { request_id, .. }
            | Message::Publish { request_id, .. }
            | Message::Published { request_id, .. }
            | Message::Subscribe { request_id, .. }
            | Message::Subscribed { request_id, .. }
            | Message::Unsubscribe { request_id, .. }
            | Message::Unsubscribed { request_id, .. }
            | Message::Call { request_id, .. }
            | Message::Cancel { request_id, .. }
            | Message::Result { request_id, .. }
            | Message::Register { request_id, .. }
            | Message::Registered { request_id, .. }
            | Message::Unregister { request_id, .. }
            | Message::Unregistered { request_id, .. }
            | Message::Invocation { request_id, .. }
            | Message::Interrupt { request_id, .. }
            | Message::Yield { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Parses a decoded codec value into a message, enforcing the shape
    /// rules of the central validation table.
    pub fn parse(raw: Variant) -> Result<Message, MessageError> {
        let fields = raw.into_array().ok_or(MessageError::NotAnArray)?;
        let code = fields
            .first()
            .ok_or(MessageError::Empty)?
            .as_u64()
            .ok_or(MessageError::BadCode)?;
        let kind = Kind::from_code(code).ok_or(MessageError::UnknownKind(code))?;

        let traits = traits::traits_of(kind);
        traits.check_shape(&fields).map_err(|e| match e {
            ShapeError::Length { len } => MessageError::BadLength { name: traits.name, len },
            ShapeError::Field { index, expected } => MessageError::BadField {
                name: traits.name,
                index,
                expected: expected.expected_name(),
            },
        })?;

        let mut it = fields.into_iter();
        it.next(); // kind code, already consumed

        let message = match kind {
            Kind::Hello => Message::Hello {
                realm: next_string(&mut it),
                details: next_object(&mut it),
            },
            Kind::Welcome => Message::Welcome {
                session_id: next_u64(&mut it),
                details: next_object(&mut it),
            },
            Kind::Abort => Message::Abort {
                details: next_object(&mut it),
                reason: next_string(&mut it),
            },
            Kind::Challenge => Message::Challenge {
                auth_method: next_string(&mut it),
                extra: next_object(&mut it),
            },
            Kind::Authenticate => Message::Authenticate {
                signature: next_string(&mut it),
                extra: next_object(&mut it),
            },
            Kind::Goodbye => Message::Goodbye {
                details: next_object(&mut it),
                reason: next_string(&mut it),
            },
            Kind::Error => {
                let request_code = next_u64(&mut it);
                let request_kind = Kind::from_code(request_code)
                    .ok_or(MessageError::BadRequestKind(request_code))?;
                Message::Error {
                    request_kind,
                    request_id: next_u64(&mut it),
                    details: next_object(&mut it),
                    error: next_string(&mut it),
                    args: next_opt_array(&mut it),
                    kwargs: next_opt_object(&mut it),
                }
            }
            Kind::Publish => Message::Publish {
                request_id: next_u64(&mut it),
                options: next_object(&mut it),
                topic: next_string(&mut it),
                args: next_opt_array(&mut it),
                kwargs: next_opt_object(&mut it),
            },
            Kind::Published => Message::Published {
                request_id: next_u64(&mut it),
                publication_id: next_u64(&mut it),
            },
            Kind::Subscribe => Message::Subscribe {
                request_id: next_u64(&mut it),
                options: next_object(&mut it),
                topic: next_string(&mut it),
            },
            Kind::Subscribed => Message::Subscribed {
                request_id: next_u64(&mut it),
                subscription_id: next_u64(&mut it),
            },
            Kind::Unsubscribe => Message::Unsubscribe {
                request_id: next_u64(&mut it),
                subscription_id: next_u64(&mut it),
            },
            Kind::Unsubscribed => Message::Unsubscribed {
                request_id: next_u64(&mut it),
            },
            Kind::Event => Message::Event {
                subscription_id: next_u64(&mut it),
                publication_id: next_u64(&mut it),
                details: next_object(&mut it),
                args: next_opt_array(&mut it),
                kwargs: next_opt_object(&mut it),
            },
            Kind::Call => Message::Call {
                request_id: next_u64(&mut it),
                options: next_object(&mut it),
                procedure: next_string(&mut it),
                args: next_opt_array(&mut it),
                kwargs: next_opt_object(&mut it),
            },
            Kind::Cancel => Message::Cancel {
                request_id: next_u64(&mut it),
                options: next_object(&mut it),
            },
            Kind::Result => Message::Result {
                request_id: next_u64(&mut it),
                details: next_object(&mut it),
                args: next_opt_array(&mut it),
                kwargs: next_opt_object(&mut it),
            },
            Kind::Register => Message::Register {
                request_id: next_u64(&mut it),
                options: next_object(&mut it),
                procedure: next_string(&mut it),
            },
            Kind::Registered => Message::Registered {
                request_id: next_u64(&mut it),
                registration_id: next_u64(&mut it),
            },
            Kind::Unregister => Message::Unregister {
                request_id: next_u64(&mut it),
                registration_id: next_u64(&mut it),
            },
            Kind::Unregistered => Message::Unregistered {
                request_id: next_u64(&mut it),
            },
            Kind::Invocation => Message::Invocation {
                request_id: next_u64(&mut it),
                registration_id: next_u64(&mut it),
                details: next_object(&mut it),
                args: next_opt_array(&mut it),
                kwargs: next_opt_object(&mut it),
            },
            Kind::Interrupt => Message::Interrupt {
                request_id: next_u64(&mut it),
                options: next_object(&mut it),
            },
            Kind::Yield => Message::Yield {
                request_id: next_u64(&mut it),
                options: next_object(&mut it),
                args: next_opt_array(&mut it),
                kwargs: next_opt_object(&mut it),
            },
        };

        Ok(message)
    }

    /// Converts the message back into its wire array form.
    pub fn into_variant(self) -> Variant {
        let kind = self.kind();
        let mut fields: Array = vec![Variant::UInt(kind.code())];

        match self {
            Message::Hello { realm, details } => {
                fields.push(realm.into());
                fields.push(details.into());
            }
            Message::Welcome { session_id, details } => {
                fields.push(session_id.into());
                fields.push(details.into());
            }
            Message::Abort { details, reason } => {
                fields.push(details.into());
                fields.push(reason.into());
            }
            Message::Challenge { auth_method, extra } => {
                fields.push(auth_method.into());
                fields.push(extra.into());
            }
            Message::Authenticate { signature, extra } => {
                fields.push(signature.into());
                fields.push(extra.into());
            }
            Message::Goodbye { details, reason } => {
                fields.push(details.into());
                fields.push(reason.into());
            }
            Message::Error {
                request_kind,
                request_id,
                details,
                error,
                args,
                kwargs,
            } => {
                fields.push(request_kind.code().into());
                fields.push(request_id.into());
                fields.push(details.into());
                fields.push(error.into());
                push_payload(&mut fields, args, kwargs);
            }
            Message::Publish { request_id, options, topic, args, kwargs } => {
                fields.push(request_id.into());
                fields.push(options.into());
                fields.push(topic.into());
                push_payload(&mut fields, args, kwargs);
            }
            Message::Published { request_id, publication_id } => {
                fields.push(request_id.into());
                fields.push(publication_id.into());
            }
            Message::Subscribe { request_id, options, topic } => {
                fields.push(request_id.into());
                fields.push(options.into());
                fields.push(topic.into());
            }
            Message::Subscribed { request_id, subscription_id } => {
                fields.push(request_id.into());
                fields.push(subscription_id.into());
            }
            Message::Unsubscribe { request_id, subscription_id } => {
                fields.push(request_id.into());
                fields.push(subscription_id.into());
            }
            Message::Unsubscribed { request_id } => {
                fields.push(request_id.into());
            }
            Message::Event {
                subscription_id,
                publication_id,
                details,
                args,
                kwargs,
            } => {
                fields.push(subscription_id.into());
                fields.push(publication_id.into());
                fields.push(details.into());
                push_payload(&mut fields, args, kwargs);
            }
            Message::Call { request_id, options, procedure, args, kwargs } => {
                fields.push(request_id.into());
                fields.push(options.into());
                fields.push(procedure.into());
                push_payload(&mut fields, args, kwargs);
            }
            Message::Cancel { request_id, options } => {
                fields.push(request_id.into());
                fields.push(options.into());
            }
            Message::Result { request_id, details, args, kwargs } => {
                fields.push(request_id.into());
                fields.push(details.into());
                push_payload(&mut fields, args, kwargs);
            }
            Message::Register { request_id, options, procedure } => {
                fields.push(request_id.into());
                fields.push(options.into());
                fields.push(procedure.into());
            }
            Message::Registered { request_id, registration_id } => {
                fields.push(request_id.into());
                fields.push(registration_id.into());
            }
            Message::Unregister { request_id, registration_id } => {
                fields.push(request_id.into());
                fields.push(registration_id.into());
            }
            Message::Unregistered { request_id } => {
                fields.push(request_id.into());
            }
            Message::Invocation {
                request_id,
                registration_id,
                details,
                args,
                kwargs,
            } => {
                fields.push(request_id.into());
                fields.push(registration_id.into());
                fields.push(details.into());
                push_payload(&mut fields, args, kwargs);
            }
            Message::Interrupt { request_id, options } => {
                fields.push(request_id.into());
                fields.push(options.into());
            }
            Message::Yield { request_id, options, args, kwargs } => {
                fields.push(request_id.into());
                fields.push(options.into());
                push_payload(&mut fields, args, kwargs);
            }
        }

        Variant::Array(fields)
    }
}

// The extractors below run strictly after a successful shape check, so a
// missing or mistyped field would be a table bug; they default rather than
// panic to keep the parse path total.

fn next_u64(it: &mut IntoIter<Variant>) -> u64 {
    it.next().and_then(|v| v.as_u64()).unwrap_or_default()
}

fn next_string(it: &mut IntoIter<Variant>) -> String {
    it.next().and_then(Variant::into_string).unwrap_or_default()
}

fn next_object(it: &mut IntoIter<Variant>) -> Object {
    it.next().and_then(Variant::into_object).unwrap_or_default()
}

fn next_opt_array(it: &mut IntoIter<Variant>) -> Option<Array> {
    it.next().and_then(Variant::into_array)
}

fn next_opt_object(it: &mut IntoIter<Variant>) -> Option<Object> {
    it.next().and_then(Variant::into_object)
}

fn push_payload(fields: &mut Array, args: Option<Array>, kwargs: Option<Object>) {
    match (args, kwargs) {
        (None, None) => {}
        (args, None) => fields.push(Variant::Array(args.unwrap_or_default())),
        (args, Some(kwargs)) => {
            fields.push(Variant::Array(args.unwrap_or_default()));
            fields.push(Variant::Object(kwargs));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let parsed = Message::parse(message.clone().into_variant()).expect("round trip");
        assert_eq!(parsed, message);
    }

    #[test]
    fn hello_round_trip() {
        round_trip(Message::Hello {
            realm: "com.example.realm".into(),
            details: Object::from([("agent".to_owned(), Variant::from("test"))]),
        });
    }

    #[test]
    fn call_with_payload_round_trip() {
        round_trip(Message::Call {
            request_id: 7,
            options: Object::new(),
            procedure: "com.myapp.echo".into(),
            args: Some(vec![Variant::UInt(1), Variant::from("x")]),
            kwargs: Some(Object::from([("k".to_owned(), Variant::Bool(true))])),
        });
    }

    #[test]
    fn kwargs_forces_empty_args_on_wire() {
        let message = Message::Yield {
            request_id: 3,
            options: Object::new(),
            args: None,
            kwargs: Some(Object::from([("k".to_owned(), Variant::UInt(1))])),
        };
        let raw = message.into_variant();
        let fields = raw.as_array().expect("array");
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[3], Variant::Array(Array::new()));
    }

    #[test]
    fn unknown_code_is_rejected() {
        let raw = Variant::Array(vec![Variant::UInt(99)]);
        assert_eq!(Message::parse(raw), Err(MessageError::UnknownKind(99)));
    }

    #[test]
    fn error_preserves_request_kind() {
        let raw = Variant::Array(vec![
            Variant::UInt(8),
            Variant::UInt(48),
            Variant::UInt(10),
            Variant::Object(Object::new()),
            Variant::from("wamp.error.no_such_procedure"),
        ]);
        match Message::parse(raw).expect("parse") {
            Message::Error { request_kind, request_id, error, .. } => {
                assert_eq!(request_kind, Kind::Call);
                assert_eq!(request_id, 10);
                assert_eq!(error, "wamp.error.no_such_procedure");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
