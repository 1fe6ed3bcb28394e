//! Error vocabularies: standard WAMP error/close URIs and the typed errors
//! crossing the routing seams.

use thiserror::Error;
use wamp_proto::{Kind, MessageError};

use crate::uri::Uri;

/// Standard WAMP error URIs the router produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum WampError {
    #[error("wamp.error.no_such_realm")]
    NoSuchRealm,
    #[error("wamp.error.no_such_procedure")]
    NoSuchProcedure,
    #[error("wamp.error.no_such_subscription")]
    NoSuchSubscription,
    #[error("wamp.error.no_such_registration")]
    NoSuchRegistration,
    #[error("wamp.error.no_such_session")]
    NoSuchSession,
    #[error("wamp.error.procedure_already_exists")]
    ProcedureAlreadyExists,
    #[error("wamp.error.authorization_denied")]
    AuthorizationDenied,
    #[error("wamp.error.authorization_failed")]
    AuthorizationFailed,
    #[error("wamp.error.authorization_required")]
    AuthorizationRequired,
    #[error("wamp.error.disclose_me_disallowed")]
    DiscloseMeDisallowed,
    #[error("wamp.error.invalid_uri")]
    InvalidUri,
    #[error("wamp.error.invalid_argument")]
    InvalidArgument,
    #[error("wamp.error.payload_size_exceeded")]
    PayloadSizeExceeded,
    #[error("wamp.error.canceled")]
    Canceled,
    #[error("wamp.error.timeout")]
    Timeout,
    #[error("wamp.error.session_killed")]
    SessionKilled,
    #[error("wamp.error.protocol_violation")]
    ProtocolViolation,
    #[error("wamp.error.option_not_allowed")]
    OptionNotAllowed,
    #[error("wamp.error.feature_not_supported")]
    FeatureNotSupported,
    #[error("wamp.error.cannot_authenticate")]
    CannotAuthenticate,
    #[error("wamp.error.network_failure")]
    NetworkFailure,
    #[error("wamp.error.internal_error")]
    InternalError,
}

impl WampError {
    pub fn uri(self) -> &'static str {
        // The Display impl is the URI.
        match self {
            WampError::NoSuchRealm => "wamp.error.no_such_realm",
            WampError::NoSuchProcedure => "wamp.error.no_such_procedure",
            WampError::NoSuchSubscription => "wamp.error.no_such_subscription",
            WampError::NoSuchRegistration => "wamp.error.no_such_registration",
            WampError::NoSuchSession => "wamp.error.no_such_session",
            WampError::ProcedureAlreadyExists => "wamp.error.procedure_already_exists",
            WampError::AuthorizationDenied => "wamp.error.authorization_denied",
            WampError::AuthorizationFailed => "wamp.error.authorization_failed",
            WampError::AuthorizationRequired => "wamp.error.authorization_required",
            WampError::DiscloseMeDisallowed => "wamp.error.disclose_me_disallowed",
            WampError::InvalidUri => "wamp.error.invalid_uri",
            WampError::InvalidArgument => "wamp.error.invalid_argument",
            WampError::PayloadSizeExceeded => "wamp.error.payload_size_exceeded",
            WampError::Canceled => "wamp.error.canceled",
            WampError::Timeout => "wamp.error.timeout",
            WampError::SessionKilled => "wamp.error.session_killed",
            WampError::ProtocolViolation => "wamp.error.protocol_violation",
            WampError::OptionNotAllowed => "wamp.error.option_not_allowed",
            WampError::FeatureNotSupported => "wamp.error.feature_not_supported",
            WampError::CannotAuthenticate => "wamp.error.cannot_authenticate",
            WampError::NetworkFailure => "wamp.error.network_failure",
            WampError::InternalError => "wamp.error.internal_error",
        }
    }

    pub fn from_uri(uri: &str) -> Option<WampError> {
        let kind = match uri {
            "wamp.error.no_such_realm" => WampError::NoSuchRealm,
            "wamp.error.no_such_procedure" => WampError::NoSuchProcedure,
            "wamp.error.no_such_subscription" => WampError::NoSuchSubscription,
            "wamp.error.no_such_registration" => WampError::NoSuchRegistration,
            "wamp.error.no_such_session" => WampError::NoSuchSession,
            "wamp.error.procedure_already_exists" => WampError::ProcedureAlreadyExists,
            "wamp.error.authorization_denied" => WampError::AuthorizationDenied,
            "wamp.error.authorization_failed" => WampError::AuthorizationFailed,
            "wamp.error.authorization_required" => WampError::AuthorizationRequired,
            "wamp.error.disclose_me_disallowed" => WampError::DiscloseMeDisallowed,
            "wamp.error.invalid_uri" => WampError::InvalidUri,
            "wamp.error.invalid_argument" => WampError::InvalidArgument,
            "wamp.error.payload_size_exceeded" => WampError::PayloadSizeExceeded,
            "wamp.error.canceled" => WampError::Canceled,
            "wamp.error.timeout" => WampError::Timeout,
            "wamp.error.session_killed" => WampError::SessionKilled,
            "wamp.error.protocol_violation" => WampError::ProtocolViolation,
            "wamp.error.option_not_allowed" => WampError::OptionNotAllowed,
            "wamp.error.feature_not_supported" => WampError::FeatureNotSupported,
            "wamp.error.cannot_authenticate" => WampError::CannotAuthenticate,
            "wamp.error.network_failure" => WampError::NetworkFailure,
            "wamp.error.internal_error" => WampError::InternalError,
            _ => return None,
        };
        Some(kind)
    }
}

/// Standard WAMP close/GOODBYE reason URIs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    GoodbyeAndOut,
    SystemShutdown,
    CloseRealm,
    Killed,
}

impl CloseReason {
    pub fn uri(self) -> &'static str {
        match self {
            CloseReason::GoodbyeAndOut => "wamp.close.goodbye_and_out",
            CloseReason::SystemShutdown => "wamp.close.system_shutdown",
            CloseReason::CloseRealm => "wamp.close.close_realm",
            CloseReason::Killed => "wamp.close.killed",
        }
    }
}

/// A violation that aborts the offending session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("undecodable frame: {0}")]
    Codec(String),
    #[error("{kind} message is not allowed in the {state} state")]
    WrongState { kind: Kind, state: &'static str },
    #[error("{kind} messages are not router-bound")]
    NotRouterBound { kind: Kind },
    #[error("malformed URI `{0}`")]
    BadUri(Uri),
    #[error("request id {request_id} is already in use")]
    RequestIdInUse { request_id: u64 },
    #[error("no pending invocation with request id {request_id}")]
    UnknownInvocation { request_id: u64 },
    #[error("unsolicited progressive result for request id {request_id}")]
    UnsolicitedProgress { request_id: u64 },
    #[error("first message must be HELLO")]
    ExpectedHello,
}

/// Failure of a routed request, answered with an ERROR reply.
///
/// `message` feeds the reply's `message` detail; `diagnostics` carries the
/// two positional payload arguments used when an authorizer fails with an
/// unknown code.
#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct InteractionError {
    pub kind: WampError,
    pub message: Option<String>,
    pub diagnostics: Option<(String, String)>,
}

impl InteractionError {
    pub fn new(kind: WampError) -> Self {
        InteractionError {
            kind,
            message: None,
            diagnostics: None,
        }
    }

    pub fn with_message(kind: WampError, message: impl Into<String>) -> Self {
        InteractionError {
            kind,
            message: Some(message.into()),
            diagnostics: None,
        }
    }
}

impl From<WampError> for InteractionError {
    fn from(kind: WampError) -> Self {
        InteractionError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_uri() {
        assert_eq!(WampError::NoSuchProcedure.to_string(), WampError::NoSuchProcedure.uri());
        assert_eq!(WampError::Canceled.uri(), "wamp.error.canceled");
    }

    #[test]
    fn uri_round_trip() {
        for kind in [
            WampError::NoSuchRealm,
            WampError::AuthorizationDenied,
            WampError::DiscloseMeDisallowed,
            WampError::SessionKilled,
            WampError::ProtocolViolation,
        ] {
            assert_eq!(WampError::from_uri(kind.uri()), Some(kind));
        }
        assert_eq!(WampError::from_uri("com.example.custom"), None);
    }
}
