//! Access logging: one structured entry per admitted connection and per
//! client action.
//!
//! Entries are emitted as `tracing` events on the dedicated `access_log`
//! target so embedders can route them to their own sink without touching the
//! diagnostic log stream.

use time::OffsetDateTime;

use crate::ids::SessionId;

/// Target used for every access-log event.
pub const TARGET: &str = "access_log";

/// The client/server action an entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessAction {
    ClientConnect,
    ClientDisconnect,
    ClientHello,
    ClientAbort,
    ClientAuthenticate,
    ClientGoodbye,
    ClientPublish,
    ClientSubscribe,
    ClientUnsubscribe,
    ClientCall,
    ClientCancel,
    ClientRegister,
    ClientUnregister,
    ServerReject,
    ServerWelcome,
    ServerAbort,
    ServerChallenge,
    ServerGoodbye,
}

impl AccessAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessAction::ClientConnect => "client-connect",
            AccessAction::ClientDisconnect => "client-disconnect",
            AccessAction::ClientHello => "client-hello",
            AccessAction::ClientAbort => "client-abort",
            AccessAction::ClientAuthenticate => "client-authenticate",
            AccessAction::ClientGoodbye => "client-goodbye",
            AccessAction::ClientPublish => "client-publish",
            AccessAction::ClientSubscribe => "client-subscribe",
            AccessAction::ClientUnsubscribe => "client-unsubscribe",
            AccessAction::ClientCall => "client-call",
            AccessAction::ClientCancel => "client-cancel",
            AccessAction::ClientRegister => "client-register",
            AccessAction::ClientUnregister => "client-unregister",
            AccessAction::ServerReject => "server-reject",
            AccessAction::ServerWelcome => "server-welcome",
            AccessAction::ServerAbort => "server-abort",
            AccessAction::ServerChallenge => "server-challenge",
            AccessAction::ServerGoodbye => "server-goodbye",
        }
    }
}

/// Session identification carried by every entry once known.
#[derive(Clone, Debug, Default)]
pub struct AccessSessionInfo {
    pub server_name: String,
    pub endpoint: Option<String>,
    pub session_id: Option<SessionId>,
    pub agent: Option<String>,
    pub auth_id: Option<String>,
    pub auth_role: Option<String>,
}

/// One access-log record.
#[derive(Clone, Debug)]
pub struct AccessLogEntry {
    pub when: OffsetDateTime,
    pub session: AccessSessionInfo,
    pub action: AccessAction,
    pub target: Option<String>,
    pub error_uri: Option<String>,
}

impl AccessLogEntry {
    pub fn new(session: AccessSessionInfo, action: AccessAction) -> Self {
        AccessLogEntry {
            when: OffsetDateTime::now_utc(),
            session,
            action,
            target: None,
            error_uri: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_error_uri(mut self, error_uri: impl Into<String>) -> Self {
        self.error_uri = Some(error_uri.into());
        self
    }

    /// Emits the entry on the `access_log` target.
    pub fn emit(&self) {
        tracing::info!(
            target: TARGET,
            action = self.action.as_str(),
            server = %self.session.server_name,
            endpoint = self.session.endpoint.as_deref().unwrap_or(""),
            session.id = self.session.session_id.unwrap_or_default(),
            agent = self.session.agent.as_deref().unwrap_or(""),
            auth.id = self.session.auth_id.as_deref().unwrap_or(""),
            auth.role = self.session.auth_role.as_deref().unwrap_or(""),
            request.target = self.target.as_deref().unwrap_or(""),
            error.uri = self.error_uri.as_deref().unwrap_or(""),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_populates_optional_fields() {
        let entry = AccessLogEntry::new(
            AccessSessionInfo {
                server_name: "main".to_owned(),
                ..Default::default()
            },
            AccessAction::ClientSubscribe,
        )
        .with_target("com.example.topic")
        .with_error_uri("wamp.error.authorization_denied");

        assert_eq!(entry.action.as_str(), "client-subscribe");
        assert_eq!(entry.target.as_deref(), Some("com.example.topic"));
        assert_eq!(entry.error_uri.as_deref(), Some("wamp.error.authorization_denied"));
        // Emission must not panic without a subscriber installed.
        entry.emit();
    }
}
