//! Authentication: identity records, the HELLO↔CHALLENGE↔AUTHENTICATE
//! exchange and the authenticator contract.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use wamp_proto::{Object, Variant};

use crate::error::WampError;
use crate::ids::RandomIdGenerator;
use crate::task::ChildTask;
use crate::uri::Uri;

/// Identity assigned to a session by its authenticator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthInfo {
    pub id: String,
    pub role: String,
    pub method: String,
    pub provider: String,
    pub extra: Object,
}

impl AuthInfo {
    pub fn new(
        id: impl Into<String>,
        role: impl Into<String>,
        method: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        AuthInfo {
            id: id.into(),
            role: role.into(),
            method: method.into(),
            provider: provider.into(),
            extra: Object::new(),
        }
    }

    pub fn with_extra(mut self, extra: Object) -> Self {
        self.extra = extra;
        self
    }
}

/// CHALLENGE payload solicited by an authenticator.
#[derive(Clone, Debug, PartialEq)]
pub struct Challenge {
    pub auth_method: String,
    pub extra: Object,
}

impl Challenge {
    pub fn new(auth_method: impl Into<String>) -> Self {
        Challenge {
            auth_method: auth_method.into(),
            extra: Object::new(),
        }
    }

    pub fn with_extra(mut self, extra: Object) -> Self {
        self.extra = extra;
        self
    }
}

/// AUTHENTICATE payload received from the client.
#[derive(Clone, Debug, PartialEq)]
pub struct Authentication {
    pub signature: String,
    pub extra: Object,
}

/// State of one authentication round.
///
/// The exchange survives across challenges; the `note` slot lets a stateless
/// authenticator stash whatever it needs between its callbacks.
#[derive(Clone, Debug)]
pub struct AuthExchange {
    realm: Uri,
    hello_details: Object,
    challenge_count: u32,
    note: Option<Variant>,
}

impl AuthExchange {
    pub(crate) fn new(realm: Uri, hello_details: Object) -> Self {
        AuthExchange {
            realm,
            hello_details,
            challenge_count: 0,
            note: None,
        }
    }

    pub fn realm(&self) -> &Uri {
        &self.realm
    }

    /// The details dictionary of the client's HELLO.
    pub fn hello_details(&self) -> &Object {
        &self.hello_details
    }

    /// The `authid` the client asked for, if any.
    pub fn requested_auth_id(&self) -> Option<&str> {
        self.hello_details.get("authid").and_then(Variant::as_str)
    }

    /// Authentication methods offered by the client.
    pub fn auth_methods(&self) -> Vec<&str> {
        self.hello_details
            .get("authmethods")
            .and_then(Variant::as_array)
            .map(|methods| methods.iter().filter_map(Variant::as_str).collect())
            .unwrap_or_default()
    }

    /// Number of CHALLENGE messages sent so far in this exchange.
    pub fn challenge_count(&self) -> u32 {
        self.challenge_count
    }

    /// The opaque value stashed by the authenticator at the last challenge.
    pub fn note(&self) -> Option<&Variant> {
        self.note.as_ref()
    }

    pub(crate) fn record_challenge(&mut self, note: Option<Variant>) {
        self.challenge_count += 1;
        self.note = note;
    }
}

/// Verdict of one authenticator callback.
#[derive(Clone, Debug)]
pub enum AuthDecision {
    /// Finalize the session with this identity.
    Welcome(AuthInfo),
    /// Solicit AUTHENTICATE; `note` is stashed on the exchange.
    Challenge {
        challenge: Challenge,
        note: Option<Variant>,
    },
    /// Deny the session; the reason becomes the ABORT URI.
    Reject { reason: WampError },
}

impl AuthDecision {
    pub fn reject() -> Self {
        AuthDecision::Reject {
            reason: WampError::CannotAuthenticate,
        }
    }
}

/// Server-side authentication policy.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Invoked when HELLO arrives.
    async fn on_hello(&self, exchange: &AuthExchange) -> AuthDecision;

    /// Invoked when AUTHENTICATE answers a prior challenge. Authenticators
    /// that never challenge keep the default rejection.
    async fn on_authenticate(
        &self,
        exchange: &AuthExchange,
        authentication: &Authentication,
    ) -> AuthDecision {
        let _ = (exchange, authentication);
        AuthDecision::reject()
    }
}

/// Default authenticator: welcomes everyone with a random anonymous id.
pub struct AnonymousAuthenticator {
    auth_role: String,
    rng: Mutex<RandomIdGenerator>,
}

impl AnonymousAuthenticator {
    pub fn new() -> Self {
        Self::with_role("anonymous")
    }

    pub fn with_role(auth_role: impl Into<String>) -> Self {
        AnonymousAuthenticator {
            auth_role: auth_role.into(),
            rng: Mutex::new(RandomIdGenerator::new()),
        }
    }
}

impl Default for AnonymousAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn on_hello(&self, _exchange: &AuthExchange) -> AuthDecision {
        let id = format!("{:016x}", self.rng.lock().next_id());
        AuthDecision::Welcome(AuthInfo::new(id, self.auth_role.clone(), "anonymous", "static"))
    }
}

enum AuthJob {
    Hello {
        exchange: AuthExchange,
        reply: oneshot::Sender<AuthDecision>,
    },
    Authenticate {
        exchange: AuthExchange,
        authentication: Authentication,
        reply: oneshot::Sender<AuthDecision>,
    },
}

/// Runs a wrapped authenticator on its own worker task, keeping slow
/// user-supplied authentication logic off the session's I/O task.
pub struct PostingAuthenticator {
    tx: mpsc::Sender<AuthJob>,
    _worker: ChildTask<()>,
}

impl PostingAuthenticator {
    pub fn new(inner: Arc<dyn Authenticator>) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuthJob>(16);

        let worker = ChildTask::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    AuthJob::Hello { exchange, reply } => {
                        let decision = inner.on_hello(&exchange).await;
                        let _ = reply.send(decision);
                    }
                    AuthJob::Authenticate {
                        exchange,
                        authentication,
                        reply,
                    } => {
                        let decision = inner.on_authenticate(&exchange, &authentication).await;
                        let _ = reply.send(decision);
                    }
                }
            }
        });

        PostingAuthenticator { tx, _worker: worker }
    }

    async fn post(&self, job: AuthJob, rx: oneshot::Receiver<AuthDecision>) -> AuthDecision {
        if self.tx.send(job).await.is_err() {
            return AuthDecision::reject();
        }
        rx.await.unwrap_or_else(|_| AuthDecision::reject())
    }
}

#[async_trait]
impl Authenticator for PostingAuthenticator {
    async fn on_hello(&self, exchange: &AuthExchange) -> AuthDecision {
        let (reply, rx) = oneshot::channel();
        let job = AuthJob::Hello {
            exchange: exchange.clone(),
            reply,
        };
        self.post(job, rx).await
    }

    async fn on_authenticate(
        &self,
        exchange: &AuthExchange,
        authentication: &Authentication,
    ) -> AuthDecision {
        let (reply, rx) = oneshot::channel();
        let job = AuthJob::Authenticate {
            exchange: exchange.clone(),
            authentication: authentication.clone(),
            reply,
        };
        self.post(job, rx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> AuthExchange {
        AuthExchange::new(
            Uri::new("com.example.realm"),
            Object::from([
                ("authid".to_owned(), Variant::from("alice")),
                (
                    "authmethods".to_owned(),
                    Variant::Array(vec![Variant::from("ticket"), Variant::from("anonymous")]),
                ),
            ]),
        )
    }

    #[test]
    fn exchange_exposes_hello_details() {
        let exchange = exchange();
        assert_eq!(exchange.requested_auth_id(), Some("alice"));
        assert_eq!(exchange.auth_methods(), vec!["ticket", "anonymous"]);
        assert_eq!(exchange.challenge_count(), 0);
    }

    #[test]
    fn recording_a_challenge_increments_count_and_stashes_note() {
        let mut exchange = exchange();
        exchange.record_challenge(Some(Variant::from("nonce-1")));
        assert_eq!(exchange.challenge_count(), 1);
        assert_eq!(exchange.note(), Some(&Variant::from("nonce-1")));

        exchange.record_challenge(None);
        assert_eq!(exchange.challenge_count(), 2);
        assert_eq!(exchange.note(), None);
    }

    #[tokio::test]
    async fn anonymous_authenticator_welcomes_with_random_id() {
        let authenticator = AnonymousAuthenticator::new();
        let first = authenticator.on_hello(&exchange()).await;
        let second = authenticator.on_hello(&exchange()).await;

        let AuthDecision::Welcome(first) = first else {
            panic!("expected welcome");
        };
        let AuthDecision::Welcome(second) = second else {
            panic!("expected welcome");
        };

        assert_eq!(first.role, "anonymous");
        assert_eq!(first.method, "anonymous");
        assert_eq!(first.provider, "static");
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn posting_authenticator_delegates() {
        let posting = PostingAuthenticator::new(Arc::new(AnonymousAuthenticator::with_role("guest")));
        let decision = posting.on_hello(&exchange()).await;
        let AuthDecision::Welcome(info) = decision else {
            panic!("expected welcome");
        };
        assert_eq!(info.role, "guest");
    }
}
