//! Session-level types: identity snapshots, the lifecycle state machine and
//! the outbound channel between a realm and the session's connection task.

use tokio::sync::mpsc;
use wamp_proto::{Message, Object, traits};

use crate::auth::AuthInfo;
use crate::error::{CloseReason, ProtocolError};
use crate::features::ClientFeatures;
use crate::ids::SessionId;
use crate::uri::Uri;

/// Immutable snapshot of an established session's identity, shared with
/// authorizers, observers and the meta-API.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub realm: Uri,
    pub auth: AuthInfo,
    pub agent: Option<String>,
    pub features: ClientFeatures,
}

/// Lifecycle state of one session.
///
/// `Establishing` covers accepted-but-silent transports up to HELLO;
/// `Authenticating` spans CHALLENGE to AUTHENTICATE rounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Establishing,
    Authenticating,
    Established,
    ShuttingDown,
    Closed,
    Failed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Establishing => "establishing",
            SessionState::Authenticating => "authenticating",
            SessionState::Established => "established",
            SessionState::ShuttingDown => "shutting-down",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    fn mask(self) -> traits::StateMask {
        match self {
            SessionState::Establishing => traits::StateMask::ESTABLISHING,
            SessionState::Authenticating => traits::StateMask::AUTHENTICATING,
            SessionState::Established => traits::StateMask::ESTABLISHED,
            SessionState::ShuttingDown => traits::StateMask::SHUTTING_DOWN,
            SessionState::Closed | SessionState::Failed => traits::StateMask::empty(),
        }
    }
}

/// Checks an inbound message against the validation table: the kind must be
/// router-bound and legal in the session's current state.
pub fn validate_inbound(message: &Message, state: SessionState) -> Result<(), ProtocolError> {
    let kind = message.kind();
    let traits = traits::traits_of(kind);

    if !traits.router_bound {
        return Err(ProtocolError::NotRouterBound { kind });
    }
    if !traits.legal_states.intersects(state.mask()) {
        return Err(ProtocolError::WrongState {
            kind,
            state: state.name(),
        });
    }
    Ok(())
}

/// Realm → connection-task traffic.
#[derive(Debug)]
pub enum SessionOutput {
    /// A routed message to encode and send.
    Message(Message),
    /// Abort the session: send ABORT with the given reason URI and details,
    /// then close the transport.
    Kick { reason: String, details: Object },
    /// Close gracefully with a router-initiated GOODBYE.
    Goodbye { reason: CloseReason },
}

pub type SessionSender = mpsc::Sender<SessionOutput>;
pub type SessionReceiver = mpsc::Receiver<SessionOutput>;

/// Bounded outbound queue; realm-side submission order is delivery order.
pub fn session_channel() -> (SessionSender, SessionReceiver) {
    mpsc::channel(64)
}

#[cfg(test)]
mod tests {
    use wamp_proto::Kind;

    use super::*;

    fn subscribe() -> Message {
        Message::Subscribe {
            request_id: 1,
            options: Object::new(),
            topic: "com.example.topic".into(),
        }
    }

    #[test]
    fn session_traffic_requires_established_state() {
        assert!(validate_inbound(&subscribe(), SessionState::Established).is_ok());

        let err = validate_inbound(&subscribe(), SessionState::Establishing).expect_err("wrong state");
        assert!(matches!(
            err,
            ProtocolError::WrongState {
                kind: Kind::Subscribe,
                ..
            }
        ));
    }

    #[test]
    fn hello_is_only_legal_before_welcome() {
        let hello = Message::Hello {
            realm: "com.example.realm".into(),
            details: Object::new(),
        };
        assert!(validate_inbound(&hello, SessionState::Establishing).is_ok());
        assert!(validate_inbound(&hello, SessionState::Established).is_err());
    }

    #[test]
    fn client_bound_kinds_are_rejected() {
        let event = Message::Event {
            subscription_id: 1,
            publication_id: 2,
            details: Object::new(),
            args: None,
            kwargs: None,
        };
        let err = validate_inbound(&event, SessionState::Established).expect_err("not router bound");
        assert!(matches!(err, ProtocolError::NotRouterBound { kind: Kind::Event }));
    }

    #[test]
    fn goodbye_is_legal_while_shutting_down() {
        let goodbye = Message::Goodbye {
            details: Object::new(),
            reason: CloseReason::GoodbyeAndOut.uri().to_owned(),
        };
        assert!(validate_inbound(&goodbye, SessionState::ShuttingDown).is_ok());
        assert!(validate_inbound(&goodbye, SessionState::Authenticating).is_err());
    }
}
