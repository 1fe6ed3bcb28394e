//! The authorizer chain: per-operation permit/deny decisions, optional
//! disclosure overrides, posting onto a worker task and LRU caching.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::cache::LruCache;
use crate::disclosure::DisclosureRule;
use crate::error::{InteractionError, WampError};
use crate::ids::SessionId;
use crate::realm::{RegistrationDetails, SubscriptionDetails};
use crate::session::SessionInfo;
use crate::task::ChildTask;
use crate::uri::{MatchPolicy, Uri};

/// The operation classes an authorizer rules on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Subscribe,
    Publish,
    Register,
    Call,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Subscribe => "subscribe",
            Action::Publish => "publish",
            Action::Register => "register",
            Action::Call => "call",
        }
    }
}

/// A subscribe request under authorization.
#[derive(Clone, Debug)]
pub struct Topic {
    pub uri: Uri,
    pub policy: MatchPolicy,
}

/// A publish request under authorization.
#[derive(Clone, Debug)]
pub struct Pub {
    pub uri: Uri,
}

/// A register request under authorization.
#[derive(Clone, Debug)]
pub struct Procedure {
    pub uri: Uri,
    pub policy: MatchPolicy,
}

/// A call request under authorization.
#[derive(Clone, Debug)]
pub struct Rpc {
    pub uri: Uri,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Decision {
    Granted,
    Denied,
    /// The authorization operation itself failed with a known error kind.
    Failed(WampError),
    /// The authorization operation failed with a code outside the standard
    /// vocabulary.
    FailedOther { code: String, message: String },
}

/// Verdict of one authorize operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Authorization {
    decision: Decision,
    disclosure: DisclosureRule,
    cache: bool,
}

impl Authorization {
    pub fn granted() -> Self {
        Authorization {
            decision: Decision::Granted,
            disclosure: DisclosureRule::Preset,
            cache: false,
        }
    }

    pub fn denied() -> Self {
        Authorization {
            decision: Decision::Denied,
            disclosure: DisclosureRule::Preset,
            cache: false,
        }
    }

    pub fn failed(kind: WampError) -> Self {
        Authorization {
            decision: Decision::Failed(kind),
            disclosure: DisclosureRule::Preset,
            cache: false,
        }
    }

    /// Failure with a non-standard code; surfaces as `authorization_failed`
    /// with the code and message as positional diagnostics.
    pub fn failed_other(code: impl Into<String>, message: impl Into<String>) -> Self {
        Authorization {
            decision: Decision::FailedOther {
                code: code.into(),
                message: message.into(),
            },
            disclosure: DisclosureRule::Preset,
            cache: false,
        }
    }

    /// Overrides the realm's disclosure rule for this one operation.
    pub fn with_disclosure(mut self, rule: DisclosureRule) -> Self {
        self.disclosure = rule;
        self
    }

    /// Asks a caching authorizer wrapping this one to store the verdict.
    pub fn with_caching(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn allowed(&self) -> bool {
        self.decision == Decision::Granted
    }

    pub fn disclosure(&self) -> DisclosureRule {
        self.disclosure
    }

    pub fn should_cache(&self) -> bool {
        self.cache
    }

    /// Converts a non-granted verdict into the ERROR reply it produces.
    pub fn to_error(&self) -> Option<InteractionError> {
        match &self.decision {
            Decision::Granted => None,
            Decision::Denied => Some(InteractionError::new(WampError::AuthorizationDenied)),
            Decision::Failed(kind) => match kind {
                WampError::AuthorizationDenied
                | WampError::AuthorizationFailed
                | WampError::AuthorizationRequired
                | WampError::DiscloseMeDisallowed => Some(InteractionError::new(*kind)),
                other => Some(InteractionError {
                    kind: WampError::AuthorizationFailed,
                    message: None,
                    diagnostics: Some((other.uri().to_owned(), other.to_string())),
                }),
            },
            Decision::FailedOther { code, message } => Some(InteractionError {
                kind: WampError::AuthorizationFailed,
                message: None,
                diagnostics: Some((code.clone(), message.clone())),
            }),
        }
    }
}

/// Capability set of the authorizer chain.
///
/// The four authorize operations rule on requests; the uncache hooks let
/// caching links drop entries when the realm retires the underlying state.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize_subscribe(&self, topic: &Topic, session: &SessionInfo) -> Authorization;

    async fn authorize_publish(&self, publish: &Pub, session: &SessionInfo) -> Authorization;

    async fn authorize_register(&self, procedure: &Procedure, session: &SessionInfo) -> Authorization;

    async fn authorize_call(&self, rpc: &Rpc, session: &SessionInfo) -> Authorization;

    /// Called when a session leaves or is kicked from the realm.
    fn uncache_session(&self, session: &SessionInfo) {
        let _ = session;
    }

    /// Called when a subscription is removed.
    fn uncache_topic(&self, subscription: &SubscriptionDetails) {
        let _ = subscription;
    }

    /// Called when a registration is removed.
    fn uncache_procedure(&self, registration: &RegistrationDetails) {
        let _ = registration;
    }
}

/// Grants everything; the realm default when no authorizer is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultAuthorizer;

#[async_trait]
impl Authorizer for DefaultAuthorizer {
    async fn authorize_subscribe(&self, _: &Topic, _: &SessionInfo) -> Authorization {
        Authorization::granted()
    }

    async fn authorize_publish(&self, _: &Pub, _: &SessionInfo) -> Authorization {
        Authorization::granted()
    }

    async fn authorize_register(&self, _: &Procedure, _: &SessionInfo) -> Authorization {
        Authorization::granted()
    }

    async fn authorize_call(&self, _: &Rpc, _: &SessionInfo) -> Authorization {
        Authorization::granted()
    }
}

enum AuthorizeJob {
    Subscribe(Topic, SessionInfo, oneshot::Sender<Authorization>),
    Publish(Pub, SessionInfo, oneshot::Sender<Authorization>),
    Register(Procedure, SessionInfo, oneshot::Sender<Authorization>),
    Call(Rpc, SessionInfo, oneshot::Sender<Authorization>),
}

/// Posts the wrapped authorizer's operations onto a dedicated worker task,
/// keeping user authorization code off the realm task.
pub struct PostingAuthorizer {
    inner: Arc<dyn Authorizer>,
    tx: mpsc::Sender<AuthorizeJob>,
    _worker: ChildTask<()>,
}

impl PostingAuthorizer {
    pub fn new(inner: Arc<dyn Authorizer>) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuthorizeJob>(16);
        let worker_inner = Arc::clone(&inner);

        let worker = ChildTask::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    AuthorizeJob::Subscribe(topic, session, reply) => {
                        let _ = reply.send(worker_inner.authorize_subscribe(&topic, &session).await);
                    }
                    AuthorizeJob::Publish(publish, session, reply) => {
                        let _ = reply.send(worker_inner.authorize_publish(&publish, &session).await);
                    }
                    AuthorizeJob::Register(procedure, session, reply) => {
                        let _ = reply.send(worker_inner.authorize_register(&procedure, &session).await);
                    }
                    AuthorizeJob::Call(rpc, session, reply) => {
                        let _ = reply.send(worker_inner.authorize_call(&rpc, &session).await);
                    }
                }
            }
        });

        PostingAuthorizer {
            inner,
            tx,
            _worker: worker,
        }
    }

    async fn post(&self, job: AuthorizeJob, rx: oneshot::Receiver<Authorization>) -> Authorization {
        if self.tx.send(job).await.is_err() {
            return Authorization::failed(WampError::AuthorizationFailed);
        }
        rx.await
            .unwrap_or_else(|_| Authorization::failed(WampError::AuthorizationFailed))
    }
}

#[async_trait]
impl Authorizer for PostingAuthorizer {
    async fn authorize_subscribe(&self, topic: &Topic, session: &SessionInfo) -> Authorization {
        let (reply, rx) = oneshot::channel();
        self.post(AuthorizeJob::Subscribe(topic.clone(), session.clone(), reply), rx)
            .await
    }

    async fn authorize_publish(&self, publish: &Pub, session: &SessionInfo) -> Authorization {
        let (reply, rx) = oneshot::channel();
        self.post(AuthorizeJob::Publish(publish.clone(), session.clone(), reply), rx)
            .await
    }

    async fn authorize_register(&self, procedure: &Procedure, session: &SessionInfo) -> Authorization {
        let (reply, rx) = oneshot::channel();
        self.post(AuthorizeJob::Register(procedure.clone(), session.clone(), reply), rx)
            .await
    }

    async fn authorize_call(&self, rpc: &Rpc, session: &SessionInfo) -> Authorization {
        let (reply, rx) = oneshot::channel();
        self.post(AuthorizeJob::Call(rpc.clone(), session.clone(), reply), rx).await
    }

    fn uncache_session(&self, session: &SessionInfo) {
        self.inner.uncache_session(session);
    }

    fn uncache_topic(&self, subscription: &SubscriptionDetails) {
        self.inner.uncache_topic(subscription);
    }

    fn uncache_procedure(&self, registration: &RegistrationDetails) {
        self.inner.uncache_procedure(registration);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    uri: Uri,
    policy: Option<MatchPolicy>,
    action: Action,
}

struct CacheEntry {
    subject: SessionInfo,
    authorization: Authorization,
}

fn same_subject(entry: &SessionInfo, session: &SessionInfo) -> bool {
    entry.session_id == session.session_id
        && entry.auth.id == session.auth.id
        && entry.auth.role == session.auth.role
}

/// Wraps another authorizer with an LRU over `(uri, match-policy, action)`,
/// scoped to the requesting session's auth identity.
///
/// The cache is the one piece of authorization state shared across realm
/// tasks, hence the mutex.
pub struct CachingAuthorizer {
    inner: Arc<dyn Authorizer>,
    cache: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl CachingAuthorizer {
    pub fn new(inner: Arc<dyn Authorizer>, capacity: usize) -> Self {
        CachingAuthorizer {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.lock().capacity()
    }

    pub fn load_factor(&self) -> f32 {
        self.cache.lock().load_factor()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn evict_by_session_id(&self, session_id: SessionId) {
        self.cache
            .lock()
            .evict_if(|_, entry| entry.subject.session_id == session_id);
    }

    pub fn evict_by_auth_id(&self, auth_id: &str) {
        self.cache.lock().evict_if(|_, entry| entry.subject.auth.id == auth_id);
    }

    pub fn evict_by_auth_role(&self, auth_role: &str) {
        self.cache
            .lock()
            .evict_if(|_, entry| entry.subject.auth.role == auth_role);
    }

    /// Removes every entry whose stored subject snapshot matches the
    /// predicate.
    pub fn evict_if(&self, mut predicate: impl FnMut(&SessionInfo) -> bool) {
        self.cache.lock().evict_if(|_, entry| predicate(&entry.subject));
    }

    async fn cached_authorize(
        &self,
        key: CacheKey,
        session: &SessionInfo,
        request: AuthRequest<'_>,
    ) -> Authorization {
        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.lookup(&key) {
                if same_subject(&entry.subject, session) {
                    return entry.authorization.clone();
                }
            }
        }

        // The lock is not held across the delegated authorization.
        let authorization = match request {
            AuthRequest::Subscribe(topic) => self.inner.authorize_subscribe(topic, session).await,
            AuthRequest::Publish(publish) => self.inner.authorize_publish(publish, session).await,
            AuthRequest::Register(procedure) => self.inner.authorize_register(procedure, session).await,
            AuthRequest::Call(rpc) => self.inner.authorize_call(rpc, session).await,
        };

        if authorization.should_cache() {
            self.cache.lock().upsert(
                key,
                CacheEntry {
                    subject: session.clone(),
                    authorization: authorization.clone(),
                },
            );
        }

        authorization
    }
}

enum AuthRequest<'a> {
    Subscribe(&'a Topic),
    Publish(&'a Pub),
    Register(&'a Procedure),
    Call(&'a Rpc),
}

#[async_trait]
impl Authorizer for CachingAuthorizer {
    async fn authorize_subscribe(&self, topic: &Topic, session: &SessionInfo) -> Authorization {
        let key = CacheKey {
            uri: topic.uri.clone(),
            policy: Some(topic.policy),
            action: Action::Subscribe,
        };
        self.cached_authorize(key, session, AuthRequest::Subscribe(topic)).await
    }

    async fn authorize_publish(&self, publish: &Pub, session: &SessionInfo) -> Authorization {
        let key = CacheKey {
            uri: publish.uri.clone(),
            policy: None,
            action: Action::Publish,
        };
        self.cached_authorize(key, session, AuthRequest::Publish(publish)).await
    }

    async fn authorize_register(&self, procedure: &Procedure, session: &SessionInfo) -> Authorization {
        let key = CacheKey {
            uri: procedure.uri.clone(),
            policy: Some(procedure.policy),
            action: Action::Register,
        };
        self.cached_authorize(key, session, AuthRequest::Register(procedure)).await
    }

    async fn authorize_call(&self, rpc: &Rpc, session: &SessionInfo) -> Authorization {
        let key = CacheKey {
            uri: rpc.uri.clone(),
            policy: None,
            action: Action::Call,
        };
        self.cached_authorize(key, session, AuthRequest::Call(rpc)).await
    }

    fn uncache_session(&self, session: &SessionInfo) {
        self.evict_by_session_id(session.session_id);
        self.inner.uncache_session(session);
    }

    fn uncache_topic(&self, subscription: &SubscriptionDetails) {
        {
            let mut cache = self.cache.lock();
            cache.evict_if(|key, _| {
                match key.action {
                    // Subscribe entries cache the pattern itself.
                    Action::Subscribe => {
                        key.uri == subscription.uri && key.policy == Some(subscription.match_policy)
                    }
                    // Publish entries cache concrete topics the retired
                    // pattern may have matched.
                    Action::Publish => subscription.match_policy.matches(&subscription.uri, &key.uri),
                    _ => false,
                }
            });
        }
        self.inner.uncache_topic(subscription);
    }

    fn uncache_procedure(&self, registration: &RegistrationDetails) {
        {
            let mut cache = self.cache.lock();
            cache.evict_if(|key, _| match key.action {
                Action::Register => {
                    key.uri == registration.uri && key.policy == Some(registration.match_policy)
                }
                Action::Call => registration.match_policy.matches(&registration.uri, &key.uri),
                _ => false,
            });
        }
        self.inner.uncache_procedure(registration);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use time::OffsetDateTime;

    use super::*;
    use crate::auth::AuthInfo;
    use crate::features::ClientFeatures;

    fn session(session_id: SessionId, auth_id: &str, auth_role: &str) -> SessionInfo {
        SessionInfo {
            session_id,
            realm: Uri::new("com.example.realm"),
            auth: AuthInfo::new(auth_id, auth_role, "anonymous", "static"),
            agent: None,
            features: ClientFeatures::default(),
        }
    }

    fn topic(uri: &str) -> Topic {
        Topic {
            uri: Uri::new(uri),
            policy: MatchPolicy::Exact,
        }
    }

    struct Counting {
        calls: AtomicUsize,
        verdict: fn() -> Authorization,
    }

    impl Counting {
        fn new(verdict: fn() -> Authorization) -> Arc<Self> {
            Arc::new(Counting {
                calls: AtomicUsize::new(0),
                verdict,
            })
        }

        fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authorizer for Counting {
        async fn authorize_subscribe(&self, _: &Topic, _: &SessionInfo) -> Authorization {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.verdict)()
        }

        async fn authorize_publish(&self, _: &Pub, _: &SessionInfo) -> Authorization {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.verdict)()
        }

        async fn authorize_register(&self, _: &Procedure, _: &SessionInfo) -> Authorization {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.verdict)()
        }

        async fn authorize_call(&self, _: &Rpc, _: &SessionInfo) -> Authorization {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.verdict)()
        }
    }

    #[test]
    fn denied_maps_to_authorization_denied() {
        let error = Authorization::denied().to_error().expect("denied");
        assert_eq!(error.kind, WampError::AuthorizationDenied);
        assert!(Authorization::granted().to_error().is_none());
    }

    #[test]
    fn known_failure_kinds_keep_their_uri() {
        let error = Authorization::failed(WampError::AuthorizationRequired)
            .to_error()
            .expect("failed");
        assert_eq!(error.kind, WampError::AuthorizationRequired);
        assert!(error.diagnostics.is_none());
    }

    #[test]
    fn unknown_failure_kinds_become_authorization_failed_with_diagnostics() {
        let error = Authorization::failed(WampError::NetworkFailure).to_error().expect("failed");
        assert_eq!(error.kind, WampError::AuthorizationFailed);
        let (code, _) = error.diagnostics.expect("diagnostics");
        assert_eq!(code, "wamp.error.network_failure");

        let error = Authorization::failed_other("com.vendor.quota_exceeded", "quota exceeded")
            .to_error()
            .expect("failed");
        assert_eq!(error.kind, WampError::AuthorizationFailed);
        assert_eq!(
            error.diagnostics,
            Some(("com.vendor.quota_exceeded".to_owned(), "quota exceeded".to_owned()))
        );
    }

    #[tokio::test]
    async fn caching_stores_only_when_requested() {
        let inner = Counting::new(|| Authorization::granted());
        let caching = CachingAuthorizer::new(Arc::clone(&inner) as Arc<dyn Authorizer>, 8);
        let alice = session(1, "alice", "user");

        caching.authorize_subscribe(&topic("t"), &alice).await;
        caching.authorize_subscribe(&topic("t"), &alice).await;
        assert_eq!(inner.count(), 2, "uncached verdicts always delegate");
        assert!(caching.is_empty());
    }

    #[tokio::test]
    async fn cache_hits_are_scoped_to_the_subject() {
        let inner = Counting::new(|| Authorization::granted().with_caching());
        let caching = CachingAuthorizer::new(Arc::clone(&inner) as Arc<dyn Authorizer>, 8);
        let alice = session(1, "alice", "user");
        let bob = session(2, "bob", "user");

        caching.authorize_subscribe(&topic("t"), &alice).await;
        caching.authorize_subscribe(&topic("t"), &alice).await;
        assert_eq!(inner.count(), 1, "second ask hits the cache");

        // Same key, different subject: the cached verdict must not leak.
        caching.authorize_subscribe(&topic("t"), &bob).await;
        assert_eq!(inner.count(), 2);
    }

    #[tokio::test]
    async fn uncache_session_evicts_the_subjects_entries() {
        let inner = Counting::new(|| Authorization::granted().with_caching());
        let caching = CachingAuthorizer::new(Arc::clone(&inner) as Arc<dyn Authorizer>, 8);
        let alice = session(1, "alice", "user");

        caching.authorize_subscribe(&topic("t"), &alice).await;
        caching.uncache_session(&alice);
        caching.authorize_subscribe(&topic("t"), &alice).await;
        assert_eq!(inner.count(), 2);
    }

    #[tokio::test]
    async fn uncache_topic_evicts_matching_publish_entries() {
        let inner = Counting::new(|| Authorization::granted().with_caching());
        let caching = CachingAuthorizer::new(Arc::clone(&inner) as Arc<dyn Authorizer>, 8);
        let alice = session(1, "alice", "user");

        let publish = Pub {
            uri: Uri::new("com.myapp.events.started"),
        };
        caching.authorize_publish(&publish, &alice).await;
        assert_eq!(caching.len(), 1);

        caching.uncache_topic(&SubscriptionDetails {
            id: 7,
            uri: Uri::new("com.myapp"),
            match_policy: MatchPolicy::Prefix,
            created: OffsetDateTime::UNIX_EPOCH,
            subscribers: Vec::new(),
        });
        assert!(caching.is_empty());
    }

    #[tokio::test]
    async fn targeted_eviction_by_auth_identity() {
        let inner = Counting::new(|| Authorization::granted().with_caching());
        let caching = CachingAuthorizer::new(Arc::clone(&inner) as Arc<dyn Authorizer>, 8);

        caching.authorize_subscribe(&topic("a"), &session(1, "alice", "admin")).await;
        caching.authorize_subscribe(&topic("b"), &session(2, "bob", "user")).await;
        assert_eq!(caching.len(), 2);

        caching.evict_by_auth_role("admin");
        assert_eq!(caching.len(), 1);
        caching.evict_by_auth_id("bob");
        assert!(caching.is_empty());
    }

    #[tokio::test]
    async fn posting_authorizer_delegates_off_task_and_forwards_uncaches() {
        let inner = Counting::new(|| Authorization::denied());
        let posting = PostingAuthorizer::new(Arc::clone(&inner) as Arc<dyn Authorizer>);
        let alice = session(1, "alice", "user");

        let verdict = posting.authorize_call(&Rpc { uri: Uri::new("p") }, &alice).await;
        assert!(!verdict.allowed());
        assert_eq!(inner.count(), 1);

        // Uncache hooks pass straight through to the wrapped authorizer.
        posting.uncache_session(&alice);
    }
}
