//! Per-connection session driver: transport admission, the
//! HELLO↔CHALLENGE↔AUTHENTICATE round, realm attachment and the
//! established-session relay loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use wamp_proto::{Codec, Message, Object, Variant};

use crate::access_log::{AccessAction, AccessLogEntry, AccessSessionInfo};
use crate::admission::{ConnectionGuard, Kill};
use crate::auth::{AuthDecision, AuthExchange, Authentication, Authenticator};
use crate::error::{CloseReason, ProtocolError, WampError};
use crate::features::ClientFeatures;
use crate::ids::SessionId;
use crate::realm::{JoinRequest, RealmHandle};
use crate::router::RealmDirectory;
use crate::server::CodecSet;
use crate::session::{self, SessionOutput, SessionReceiver, SessionState};
use crate::task::ShutdownSignal;
use crate::transport::{AdmitMode, AdmitOutcome, Transport, TransportError};
use crate::uri::Uri;

/// Grace period for the peer's GOODBYE reply during a router-initiated
/// close.
const GOODBYE_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct SessionConnection {
    pub server_name: String,
    pub agent: String,
    pub transport: Box<dyn Transport>,
    pub codecs: CodecSet,
    pub authenticator: Arc<dyn Authenticator>,
    pub realms: RealmDirectory,
    pub guard: ConnectionGuard,
    pub admit_mode: AdmitMode,
    pub hello_timeout: Duration,
    pub challenge_timeout: Duration,
    pub shutdown_signal: ShutdownSignal,
}

impl SessionConnection {
    fn access(&self) -> AccessSessionInfo {
        AccessSessionInfo {
            server_name: self.server_name.clone(),
            endpoint: Some(self.transport.peer()),
            ..Default::default()
        }
    }

    pub(crate) async fn serve(mut self) -> anyhow::Result<()> {
        let outcome = self
            .transport
            .admit(self.admit_mode)
            .await
            .context("transport admission failed")?;

        let codec = match outcome {
            AdmitOutcome::Wamp(codec_id) => self
                .codecs
                .get(codec_id)
                .with_context(|| format!("transport negotiated unknown codec {codec_id}"))?,
            AdmitOutcome::Shedded => {
                AccessLogEntry::new(self.access(), AccessAction::ServerReject)
                    .with_error_uri("shedded")
                    .emit();
                return Ok(());
            }
            AdmitOutcome::Rejected(reason) => {
                AccessLogEntry::new(self.access(), AccessAction::ServerReject)
                    .with_error_uri(reason)
                    .emit();
                return Ok(());
            }
            AdmitOutcome::Failed(reason) => {
                tracing::warn!(peer = %self.transport.peer(), %reason, "Transport handshake failed");
                return Ok(());
            }
            AdmitOutcome::Responded => return Ok(()),
        };

        AccessLogEntry::new(self.access(), AccessAction::ClientConnect).emit();

        match self.establish(codec.as_ref()).await? {
            Some(established) => self.relay(codec.as_ref(), established).await,
            None => Ok(()),
        }
    }

    /// Runs the session up to WELCOME. `None` means the session ended
    /// before establishment (abort, reject, timeout).
    async fn establish(&mut self, codec: &dyn Codec) -> anyhow::Result<Option<Established>> {
        // HELLO must arrive within the hello timeout, counted from accept.
        let hello = match tokio::time::timeout(self.hello_timeout, self.recv(codec, SessionState::Establishing)).await
        {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) | Ok(Err(_)) => return Ok(None),
            Err(_elapsed) => {
                self.abort_handshake(codec, WampError::SessionKilled.uri(), "hello timed out")
                    .await;
                return Ok(None);
            }
        };

        let (realm, details) = match hello {
            Message::Hello { realm, details } => (realm, details),
            Message::Abort { reason, .. } => {
                AccessLogEntry::new(self.access(), AccessAction::ClientAbort)
                    .with_error_uri(reason)
                    .emit();
                return Ok(None);
            }
            _ => {
                self.abort_handshake(codec, WampError::ProtocolViolation.uri(), "first message must be HELLO")
                    .await;
                return Ok(None);
            }
        };

        let mut access = self.access();
        access.agent = details.get("agent").and_then(Variant::as_str).map(str::to_owned);
        AccessLogEntry::new(access.clone(), AccessAction::ClientHello)
            .with_target(realm.as_str())
            .emit();

        let realm_uri = Uri::new(realm);
        let Some(realm_handle) = self.realms.get(&realm_uri) else {
            self.abort_handshake(codec, WampError::NoSuchRealm.uri(), "no such realm")
                .await;
            return Ok(None);
        };

        let features = details
            .get("roles")
            .and_then(Variant::as_object)
            .map(ClientFeatures::parse)
            .unwrap_or_default();
        let agent = access.agent.clone();

        // The authentication round; the exchange carries state between
        // challenges so authenticators can stay stateless.
        let mut exchange = AuthExchange::new(realm_uri.clone(), details);
        let mut decision = self.authenticator.on_hello(&exchange).await;

        let auth = loop {
            match decision {
                AuthDecision::Welcome(auth) => break auth,
                AuthDecision::Reject { reason } => {
                    AccessLogEntry::new(access.clone(), AccessAction::ServerReject)
                        .with_error_uri(reason.uri())
                        .emit();
                    self.abort_handshake(codec, reason.uri(), "authentication rejected").await;
                    return Ok(None);
                }
                AuthDecision::Challenge { challenge, note } => {
                    exchange.record_challenge(note);
                    AccessLogEntry::new(access.clone(), AccessAction::ServerChallenge).emit();
                    self.send(
                        codec,
                        Message::Challenge {
                            auth_method: challenge.auth_method,
                            extra: challenge.extra,
                        },
                    )
                    .await?;

                    let reply = match tokio::time::timeout(
                        self.challenge_timeout,
                        self.recv(codec, SessionState::Authenticating),
                    )
                    .await
                    {
                        Ok(Ok(Some(message))) => message,
                        Ok(Ok(None)) | Ok(Err(_)) => return Ok(None),
                        Err(_elapsed) => {
                            self.abort_handshake(codec, WampError::SessionKilled.uri(), "challenge timed out")
                                .await;
                            return Ok(None);
                        }
                    };

                    match reply {
                        Message::Authenticate { signature, extra } => {
                            AccessLogEntry::new(access.clone(), AccessAction::ClientAuthenticate).emit();
                            let authentication = Authentication { signature, extra };
                            decision = self.authenticator.on_authenticate(&exchange, &authentication).await;
                        }
                        Message::Abort { reason, .. } => {
                            AccessLogEntry::new(access.clone(), AccessAction::ClientAbort)
                                .with_error_uri(reason)
                                .emit();
                            return Ok(None);
                        }
                        _ => {
                            self.abort_handshake(
                                codec,
                                WampError::ProtocolViolation.uri(),
                                "expected AUTHENTICATE",
                            )
                            .await;
                            return Ok(None);
                        }
                    }
                }
            }
        };

        let (sender, receiver) = session::session_channel();
        let join = JoinRequest {
            auth: auth.clone(),
            agent: agent.clone(),
            features,
            sender,
            access: access.clone(),
        };

        let grant = match realm_handle.join(join).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(refusal)) => {
                self.abort_handshake(codec, refusal.uri(), "realm refused the session").await;
                return Ok(None);
            }
            Err(_) => {
                self.abort_handshake(codec, WampError::NoSuchRealm.uri(), "realm is shutting down")
                    .await;
                return Ok(None);
            }
        };

        let mut welcome_details = Object::from([
            ("agent".to_owned(), Variant::from(self.agent.as_str())),
            ("roles".to_owned(), Variant::Object(grant.router_roles)),
            ("realm".to_owned(), Variant::from(realm_uri.as_str())),
            ("authid".to_owned(), Variant::from(auth.id.as_str())),
            ("authrole".to_owned(), Variant::from(auth.role.as_str())),
            ("authmethod".to_owned(), Variant::from(auth.method.as_str())),
            ("authprovider".to_owned(), Variant::from(auth.provider.as_str())),
        ]);
        if !auth.extra.is_empty() {
            welcome_details.insert("authextra".to_owned(), Variant::Object(auth.extra.clone()));
        }

        self.send(
            codec,
            Message::Welcome {
                session_id: grant.session_id,
                details: welcome_details,
            },
        )
        .await?;

        access.session_id = Some(grant.session_id);
        access.auth_id = Some(auth.id);
        access.auth_role = Some(auth.role);
        AccessLogEntry::new(access, AccessAction::ServerWelcome).emit();

        Ok(Some(Established {
            session_id: grant.session_id,
            realm: realm_handle,
            receiver,
        }))
    }

    /// The steady-state relay: inbound frames to the realm, realm output to
    /// the transport, kill and shutdown signals interleaved.
    async fn relay(&mut self, codec: &dyn Codec, established: Established) -> anyhow::Result<()> {
        let Established {
            session_id,
            realm,
            mut receiver,
        } = established;
        let mut state = SessionState::Established;
        let mut shutdown_signal = self.shutdown_signal.clone();

        loop {
            tokio::select! {
                output = receiver.recv() => {
                    match output {
                        Some(SessionOutput::Message(message)) => {
                            let closing = matches!(message, Message::Goodbye { .. });
                            self.send(codec, message).await?;
                            if closing {
                                // GOODBYE reply to a client-initiated close.
                                let _ = self.transport.shutdown().await;
                                state = SessionState::Closed;
                                break;
                            }
                        }
                        Some(SessionOutput::Kick { reason, details }) => {
                            AccessLogEntry::new(self.access(), AccessAction::ServerAbort)
                                .with_error_uri(reason.as_str())
                                .emit();
                            self.send_abort(codec, details, reason).await;
                            state = SessionState::Closed;
                            break;
                        }
                        Some(SessionOutput::Goodbye { reason }) => {
                            self.close_gracefully(codec, reason).await;
                            state = SessionState::Closed;
                            break;
                        }
                        None => {
                            // The realm dropped us (already retired).
                            let _ = self.transport.shutdown().await;
                            state = SessionState::Closed;
                            break;
                        }
                    }
                }
                inbound = Self::receive_message(&mut self.transport, codec) => {
                    match inbound {
                        Ok(message) => {
                            self.guard.record().touch();
                            match session::validate_inbound(&message, state) {
                                Ok(()) => {
                                    if matches!(message, Message::Goodbye { .. }) {
                                        state = SessionState::ShuttingDown;
                                    }
                                    if realm.inbound(session_id, message).await.is_err() {
                                        self.close_gracefully(codec, CloseReason::SystemShutdown).await;
                                        state = SessionState::Closed;
                                        break;
                                    }
                                }
                                Err(violation) => {
                                    if state == SessionState::ShuttingDown {
                                        // Late traffic while closing is dropped.
                                        continue;
                                    }
                                    self.protocol_abort(codec, &violation).await;
                                    realm.leave(session_id).await;
                                    state = SessionState::Failed;
                                    break;
                                }
                            }
                        }
                        Err(ReceiveError::Closed) => {
                            tracing::debug!(session.id = session_id, "Transport closed by peer");
                            AccessLogEntry::new(self.access(), AccessAction::ClientDisconnect).emit();
                            realm.leave(session_id).await;
                            state = SessionState::Closed;
                            break;
                        }
                        Err(ReceiveError::Transport(error)) => {
                            tracing::warn!(session.id = session_id, %error, "Transport failure");
                            realm.leave(session_id).await;
                            state = SessionState::Failed;
                            break;
                        }
                        Err(ReceiveError::Protocol(violation)) => {
                            self.protocol_abort(codec, &violation).await;
                            realm.leave(session_id).await;
                            state = SessionState::Failed;
                            break;
                        }
                    }
                }
                kill = self.guard.record().kill.killed() => {
                    self.killed(codec, &kill).await;
                    realm.leave(session_id).await;
                    state = SessionState::Closed;
                    break;
                }
                () = shutdown_signal.wait() => {
                    self.close_gracefully(codec, CloseReason::SystemShutdown).await;
                    realm.leave(session_id).await;
                    state = SessionState::Closed;
                    break;
                }
            }
        }

        tracing::debug!(session.id = session_id, state = state.name(), "Session ended");
        self.transport.close();
        Ok(())
    }

    async fn receive_message(
        transport: &mut Box<dyn Transport>,
        codec: &dyn Codec,
    ) -> Result<Message, ReceiveError> {
        let frame = transport.receive().await.map_err(|error| match error {
            TransportError::Eof => ReceiveError::Closed,
            other => ReceiveError::Transport(other),
        })?;
        let raw = codec
            .decode(&frame)
            .map_err(|error| ReceiveError::Protocol(ProtocolError::Codec(error.to_string())))?;
        Message::parse(raw).map_err(|error| ReceiveError::Protocol(ProtocolError::Message(error)))
    }

    /// Receives one message during establishment, aborting on violations.
    async fn recv(
        &mut self,
        codec: &dyn Codec,
        state: SessionState,
    ) -> Result<Option<Message>, TransportError> {
        match Self::receive_message(&mut self.transport, codec).await {
            Ok(message) => {
                self.guard.record().touch();
                match session::validate_inbound(&message, state) {
                    Ok(()) => Ok(Some(message)),
                    Err(violation) => {
                        self.protocol_abort(codec, &violation).await;
                        Ok(None)
                    }
                }
            }
            Err(ReceiveError::Closed) => Ok(None),
            Err(ReceiveError::Transport(error)) => Err(error),
            Err(ReceiveError::Protocol(violation)) => {
                self.protocol_abort(codec, &violation).await;
                Ok(None)
            }
        }
    }

    async fn send(&mut self, codec: &dyn Codec, message: Message) -> anyhow::Result<()> {
        let bytes = codec
            .encode(&message.into_variant())
            .context("failed to encode outbound message")?;
        self.transport
            .send(Bytes::from(bytes))
            .await
            .context("failed to send outbound message")?;
        Ok(())
    }

    async fn send_abort(&mut self, codec: &dyn Codec, details: Object, reason: String) {
        let abort = Message::Abort { details, reason };
        if let Ok(bytes) = codec.encode(&abort.into_variant()) {
            let _ = self.transport.abort(Bytes::from(bytes)).await;
        } else {
            self.transport.close();
        }
    }

    async fn abort_handshake(&mut self, codec: &dyn Codec, reason: &str, message: &str) {
        AccessLogEntry::new(self.access(), AccessAction::ServerAbort)
            .with_error_uri(reason)
            .emit();
        let details = Object::from([("message".to_owned(), Variant::from(message))]);
        self.send_abort(codec, details, reason.to_owned()).await;
    }

    async fn protocol_abort(&mut self, codec: &dyn Codec, violation: &ProtocolError) {
        tracing::warn!(error = %violation, "Protocol violation, aborting session");
        self.abort_handshake(codec, WampError::ProtocolViolation.uri(), &violation.to_string())
            .await;
    }

    /// Abort issued by the connection monitor (stale, overstay, eviction).
    async fn killed(&mut self, codec: &dyn Codec, kill: &Kill) {
        AccessLogEntry::new(self.access(), AccessAction::ServerAbort)
            .with_error_uri(kill.kind.as_str())
            .emit();
        let details = Object::from([
            ("message".to_owned(), Variant::from(kill.message.as_str())),
            ("kind".to_owned(), Variant::from(kill.kind.as_str())),
        ]);
        self.send_abort(codec, details, WampError::SessionKilled.uri().to_owned())
            .await;
    }

    /// Router-initiated GOODBYE: announce, give the peer a moment to
    /// confirm, then shut the transport down.
    async fn close_gracefully(&mut self, codec: &dyn Codec, reason: CloseReason) {
        AccessLogEntry::new(self.access(), AccessAction::ServerGoodbye)
            .with_error_uri(reason.uri())
            .emit();
        let goodbye = Message::Goodbye {
            details: Object::new(),
            reason: reason.uri().to_owned(),
        };
        if self.send(codec, goodbye).await.is_err() {
            self.transport.close();
            return;
        }

        let reply = tokio::time::timeout(GOODBYE_REPLY_TIMEOUT, async {
            loop {
                match Self::receive_message(&mut self.transport, codec).await {
                    Ok(Message::Goodbye { .. }) | Err(_) => break,
                    Ok(_) => {} // Drain in-flight traffic.
                }
            }
        })
        .await;

        if reply.is_err() {
            tracing::debug!("Peer did not confirm GOODBYE in time");
        }
        let _ = self.transport.shutdown().await;
    }
}

struct Established {
    session_id: SessionId,
    realm: RealmHandle,
    receiver: SessionReceiver,
}

enum ReceiveError {
    Closed,
    Transport(TransportError),
    Protocol(ProtocolError),
}
