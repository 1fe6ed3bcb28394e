//! Contracts consumed from codec implementations.
//!
//! The router never touches bytes itself: a negotiated [`Codec`] turns
//! transport frames into [`Variant`] trees and back. JSON ships here because
//! it falls out of the serde model for free and the test suite needs one
//! concrete codec; MsgPack and CBOR live with their transports.

use std::fmt;

use thiserror::Error;

use crate::variant::Variant;

/// Registered codec identifier, matching the WAMP serializer ids used during
/// transport handshakes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CodecId(pub u8);

impl CodecId {
    pub const JSON: CodecId = CodecId(1);
    pub const MSGPACK: CodecId = CodecId(2);
    pub const CBOR: CodecId = CodecId(3);
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CodecId::JSON => f.write_str("json"),
            CodecId::MSGPACK => f.write_str("msgpack"),
            CodecId::CBOR => f.write_str("cbor"),
            CodecId(other) => write!(f, "codec-{other}"),
        }
    }
}

#[derive(Debug, Error)]
#[error("codec failure: {0}")]
pub struct CodecError(pub String);

/// Byte-level (de)serialization of [`Variant`] trees.
pub trait Codec: Send + Sync {
    fn id(&self) -> CodecId;

    fn encode(&self, value: &Variant) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Variant, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn id(&self) -> CodecId {
        CodecId::JSON
    }

    fn encode(&self, value: &Variant) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Variant, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::variant::Object;

    #[test]
    fn json_codec_round_trips_a_message() {
        let codec = JsonCodec;
        let message = Message::Subscribe {
            request_id: 1,
            options: Object::new(),
            topic: "com.example.topic".into(),
        };

        let bytes = codec.encode(&message.clone().into_variant()).expect("encode");
        let raw = codec.decode(&bytes).expect("decode");
        assert_eq!(Message::parse(raw).expect("parse"), message);
    }

    #[test]
    fn json_codec_reports_garbage() {
        assert!(JsonCodec.decode(b"{not json").is_err());
    }
}
