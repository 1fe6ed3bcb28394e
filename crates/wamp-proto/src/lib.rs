//! Wire-protocol model for the WAMP router.
//!
//! This crate is deliberately free of I/O and async code: it defines the
//! codec-neutral [`Variant`] value tree, the tagged [`Message`] sum over all
//! WAMP message kinds, the central per-kind validation table, and the
//! contracts consumed from codec implementations. The router crate layers
//! sessions, realms and transports on top.

pub mod codec;
pub mod message;
pub mod traits;
pub mod variant;

pub use codec::{Codec, CodecError, CodecId, JsonCodec};
pub use message::{Kind, Message, MessageError};
pub use traits::{FieldKind, MessageTraits, StateMask};
pub use variant::{Array, Object, Variant};
