//! The realm: one URI-scoped routing namespace running as a single actor
//! task.
//!
//! All broker/dealer/session state is confined to the realm task; commands
//! arrive over an mpsc channel carried by [`RealmHandle`] clones and replies
//! travel back on oneshot channels, so no routing state needs a lock.
//! Observer callbacks are posted to a separate notifier task and can never
//! affect routing outcomes.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::{Arc, Weak};

use anyhow::Context as _;
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use wamp_proto::{Array, Kind, Message, Object, Variant};

use crate::access_log::{AccessAction, AccessLogEntry, AccessSessionInfo};
use crate::auth::AuthInfo;
use crate::authorizer::{Authorizer, DefaultAuthorizer, Pub, Procedure, Rpc, Topic};
use crate::broker::{Broker, EventFilter, SubscriberOptions, UnsubscribeOutcome};
pub use crate::broker::{SubscriptionDetails, SubscriptionLists};
use crate::config::{RealmOptions, RouterOptions};
use crate::dealer::{
    CallError, CancelMode, Dealer, ReplyOutcome, UnregisterOutcome,
};
pub use crate::dealer::{InvocationPolicy, RegistrationDetails, RegistrationLists};
use crate::disclosure;
use crate::error::{CloseReason, InteractionError, WampError};
use crate::features::{ClientFeatures, RouterFeatures};
use crate::ids::{RandomIdGenerator, SessionId};
use crate::meta;
use crate::session::{SessionInfo, SessionOutput, SessionSender};
use crate::task::{ChildTask, ShutdownSignal, Task};
use crate::uri::{MatchPolicy, Uri, UriValidation};
use crate::utils::TimestampPrecision;

/// Receives realm lifecycle and routing events.
///
/// The realm keeps only a weak reference; callbacks run on the realm's
/// notifier task with posted copies and their panics are caught and logged.
pub trait RealmObserver: Send + Sync {
    fn on_realm_closed(&self, realm: &Uri) {
        let _ = realm;
    }
    fn on_join(&self, session: &SessionInfo) {
        let _ = session;
    }
    fn on_leave(&self, session: &SessionInfo) {
        let _ = session;
    }
    fn on_subscription_created(&self, subscription: &SubscriptionDetails) {
        let _ = subscription;
    }
    fn on_subscription_deleted(&self, subscription: &SubscriptionDetails) {
        let _ = subscription;
    }
    fn on_subscribe(&self, session: &SessionInfo, subscription: &SubscriptionDetails) {
        let _ = (session, subscription);
    }
    fn on_unsubscribe(&self, session: &SessionInfo, subscription: &SubscriptionDetails) {
        let _ = (session, subscription);
    }
    fn on_registration_created(&self, registration: &RegistrationDetails) {
        let _ = registration;
    }
    fn on_registration_deleted(&self, registration: &RegistrationDetails) {
        let _ = registration;
    }
    fn on_register(&self, session: &SessionInfo, registration: &RegistrationDetails) {
        let _ = (session, registration);
    }
    fn on_unregister(&self, session: &SessionInfo, registration: &RegistrationDetails) {
        let _ = (session, registration);
    }
}

enum RealmEvent {
    Closed(Uri),
    Join(SessionInfo),
    Leave(SessionInfo),
    SubscriptionCreated(SubscriptionDetails),
    SubscriptionDeleted(SubscriptionDetails),
    Subscribe(SessionInfo, SubscriptionDetails),
    Unsubscribe(SessionInfo, SubscriptionDetails),
    RegistrationCreated(RegistrationDetails),
    RegistrationDeleted(RegistrationDetails),
    Register(SessionInfo, RegistrationDetails),
    Unregister(SessionInfo, RegistrationDetails),
}

enum NotifierMsg {
    Event(RealmEvent),
    Observe(Weak<dyn RealmObserver>),
}

/// Fans realm events out to observers, isolated from the routing path.
async fn notifier_task(mut rx: mpsc::UnboundedReceiver<NotifierMsg>) {
    let mut observers: Vec<Weak<dyn RealmObserver>> = Vec::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            NotifierMsg::Observe(observer) => observers.push(observer),
            NotifierMsg::Event(event) => {
                observers.retain(|weak| weak.strong_count() > 0);
                for weak in &observers {
                    let Some(observer) = weak.upgrade() else {
                        continue;
                    };
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| match &event {
                        RealmEvent::Closed(uri) => observer.on_realm_closed(uri),
                        RealmEvent::Join(session) => observer.on_join(session),
                        RealmEvent::Leave(session) => observer.on_leave(session),
                        RealmEvent::SubscriptionCreated(details) => observer.on_subscription_created(details),
                        RealmEvent::SubscriptionDeleted(details) => observer.on_subscription_deleted(details),
                        RealmEvent::Subscribe(session, details) => observer.on_subscribe(session, details),
                        RealmEvent::Unsubscribe(session, details) => observer.on_unsubscribe(session, details),
                        RealmEvent::RegistrationCreated(details) => observer.on_registration_created(details),
                        RealmEvent::RegistrationDeleted(details) => observer.on_registration_deleted(details),
                        RealmEvent::Register(session, details) => observer.on_register(session, details),
                        RealmEvent::Unregister(session, details) => observer.on_unregister(session, details),
                    }));
                    if result.is_err() {
                        tracing::error!("A realm observer panicked; observers never affect routing");
                    }
                }
            }
        }
    }
}

/// A session's application to join a realm.
pub struct JoinRequest {
    pub auth: AuthInfo,
    pub agent: Option<String>,
    pub features: ClientFeatures,
    pub sender: SessionSender,
    /// Access-log identification accumulated by the connection task.
    pub access: AccessSessionInfo,
}

/// A granted join.
#[derive(Debug)]
pub struct JoinGrant {
    pub session_id: SessionId,
    pub router_roles: Object,
}

enum RealmCommand {
    Join {
        request: Box<JoinRequest>,
        reply: oneshot::Sender<Result<JoinGrant, WampError>>,
    },
    Inbound {
        session_id: SessionId,
        message: Message,
    },
    Leave {
        session_id: SessionId,
    },
    Observe {
        observer: Weak<dyn RealmObserver>,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
    KillSession {
        session_id: SessionId,
        reason: String,
        message: Option<String>,
        reply: oneshot::Sender<bool>,
    },
    Close,
}

/// Cloneable handle to a realm task.
#[derive(Clone)]
pub struct RealmHandle {
    uri: Uri,
    tx: mpsc::Sender<RealmCommand>,
}

impl RealmHandle {
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub async fn join(&self, request: JoinRequest) -> anyhow::Result<Result<JoinGrant, WampError>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RealmCommand::Join {
                request: Box::new(request),
                reply,
            })
            .await
            .ok()
            .context("realm is gone")?;
        rx.await.context("realm dropped the join request")
    }

    pub async fn inbound(&self, session_id: SessionId, message: Message) -> anyhow::Result<()> {
        self.tx
            .send(RealmCommand::Inbound { session_id, message })
            .await
            .ok()
            .context("realm is gone")
    }

    pub async fn leave(&self, session_id: SessionId) {
        let _ = self.tx.send(RealmCommand::Leave { session_id }).await;
    }

    /// Attaches an observer; the realm holds only the weak reference.
    pub async fn observe(&self, observer: Weak<dyn RealmObserver>) -> anyhow::Result<()> {
        self.tx
            .send(RealmCommand::Observe { observer })
            .await
            .ok()
            .context("realm is gone")
    }

    pub async fn session_count(&self) -> anyhow::Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RealmCommand::SessionCount { reply })
            .await
            .ok()
            .context("realm is gone")?;
        rx.await.context("realm dropped the count request")
    }

    /// Administrative kill, same semantics as `wamp.session.kill`.
    pub async fn kill_session(
        &self,
        session_id: SessionId,
        reason: impl Into<String>,
        message: Option<String>,
    ) -> anyhow::Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RealmCommand::KillSession {
                session_id,
                reason: reason.into(),
                message,
                reply,
            })
            .await
            .ok()
            .context("realm is gone")?;
        rx.await.context("realm dropped the kill request")
    }

    /// Initiates realm shutdown; sessions are closed with `close_realm`.
    pub async fn close(&self) {
        let _ = self.tx.send(RealmCommand::Close).await;
    }
}

pub(crate) struct SessionRecord {
    pub info: SessionInfo,
    pub sender: SessionSender,
    pub access: AccessSessionInfo,
}

/// The realm actor.
pub struct RealmTask {
    uri: Uri,
    options: RealmOptions,
    uri_validation: UriValidation,
    precision: TimestampPrecision,
    authorizer: Arc<dyn Authorizer>,
    tx: mpsc::Sender<RealmCommand>,
    rx: mpsc::Receiver<RealmCommand>,
    sessions: HashMap<SessionId, SessionRecord>,
    broker: Broker,
    dealer: Dealer,
    ids: RandomIdGenerator,
    publication_counter: u64,
    notifier_tx: mpsc::UnboundedSender<NotifierMsg>,
    notifier: Option<ChildTask<()>>,
}

impl RealmTask {
    pub fn new(options: RealmOptions, router_options: &RouterOptions) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (notifier_tx, notifier_rx) = mpsc::unbounded_channel();
        let notifier = ChildTask::spawn(notifier_task(notifier_rx));

        let ids = match router_options.id_seed {
            Some(seed) => RandomIdGenerator::from_seed(seed),
            None => RandomIdGenerator::new(),
        };

        RealmTask {
            uri: options.uri.clone(),
            authorizer: options
                .authorizer()
                .map(Arc::clone)
                .unwrap_or_else(|| Arc::new(DefaultAuthorizer)),
            uri_validation: router_options.uri_validation,
            precision: router_options.timestamp_precision,
            options,
            tx,
            rx,
            sessions: HashMap::new(),
            broker: Broker::new(),
            dealer: Dealer::new(),
            ids,
            publication_counter: 0,
            notifier_tx,
            notifier: Some(notifier),
        }
    }

    pub fn handle(&self) -> RealmHandle {
        RealmHandle {
            uri: self.uri.clone(),
            tx: self.tx.clone(),
        }
    }

    fn emit(&self, event: RealmEvent) {
        let _ = self.notifier_tx.send(NotifierMsg::Event(event));
    }

    fn send_to(&self, session_id: SessionId, message: Message) {
        let Some(record) = self.sessions.get(&session_id) else {
            return;
        };
        if let Err(error) = record.sender.try_send(SessionOutput::Message(message)) {
            tracing::warn!(session.id = session_id, %error, "Failed to enqueue outbound message");
        }
    }

    fn reply_error(&self, session_id: SessionId, kind: Kind, request_id: u64, error: &InteractionError) {
        self.send_to(session_id, error_reply(kind, request_id, error));
    }

    fn access_entry(&self, session_id: SessionId, action: AccessAction) -> Option<AccessLogEntry> {
        self.sessions
            .get(&session_id)
            .map(|record| AccessLogEntry::new(record.access.clone(), action))
    }

    fn log_action(&self, session_id: SessionId, action: AccessAction, target: &Uri, error: Option<&WampError>) {
        if let Some(mut entry) = self.access_entry(session_id, action) {
            entry = entry.with_target(target.as_str());
            if let Some(error) = error {
                entry = entry.with_error_uri(error.uri());
            }
            entry.emit();
        }
    }

    async fn run_inner(mut self, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
        tracing::debug!(realm = %self.uri, "Task started");

        let call_timer = tokio::time::sleep_until(Instant::now());
        let mut call_timer = pin!(call_timer);
        (&mut call_timer).await; // Consume the initial expiry.

        let mut close_reason = CloseReason::CloseRealm;

        loop {
            tokio::select! {
                () = &mut call_timer, if self.dealer.next_deadline().is_some() => {
                    self.expire_calls();
                    if let Some(next) = self.dealer.next_deadline() {
                        call_timer.as_mut().reset(next);
                    }
                }
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    match command {
                        RealmCommand::Close => break,
                        other => {
                            self.handle_command(other).await;
                            // Re-arm when a new deadline became the soonest.
                            if let Some(next) = self.dealer.next_deadline() {
                                if call_timer.is_elapsed() || next < call_timer.deadline() {
                                    call_timer.as_mut().reset(next);
                                }
                            }
                        }
                    }
                }
                () = shutdown_signal.wait() => {
                    close_reason = CloseReason::SystemShutdown;
                    break;
                }
            }
        }

        self.close(close_reason);
        tracing::debug!(realm = %self.uri, "Task terminated");
        Ok(())
    }

    async fn handle_command(&mut self, command: RealmCommand) {
        match command {
            RealmCommand::Join { request, reply } => {
                let grant = self.handle_join(*request);
                let _ = reply.send(grant);
            }
            RealmCommand::Inbound { session_id, message } => {
                self.handle_inbound(session_id, message).await;
            }
            RealmCommand::Leave { session_id } => {
                self.remove_session(session_id);
            }
            RealmCommand::Observe { observer } => {
                let _ = self.notifier_tx.send(NotifierMsg::Observe(observer));
            }
            RealmCommand::SessionCount { reply } => {
                let _ = reply.send(self.sessions.len());
            }
            RealmCommand::KillSession {
                session_id,
                reason,
                message,
                reply,
            } => {
                let killed = self.kill_session(session_id, &reason, message.as_deref());
                let _ = reply.send(killed);
            }
            RealmCommand::Close => unreachable!("Close is intercepted by the run loop"),
        }
    }

    fn handle_join(&mut self, request: JoinRequest) -> Result<JoinGrant, WampError> {
        let session_id = self.ids.next_free(|candidate| self.sessions.contains_key(&candidate));

        let info = SessionInfo {
            session_id,
            realm: self.uri.clone(),
            auth: request.auth,
            agent: request.agent,
            features: request.features,
        };

        let mut access = request.access;
        access.session_id = Some(session_id);
        access.auth_id = Some(info.auth.id.clone());
        access.auth_role = Some(info.auth.role.clone());

        self.sessions.insert(
            session_id,
            SessionRecord {
                info: info.clone(),
                sender: request.sender,
                access,
            },
        );

        // The join is committed; now the meta-event and observers.
        self.meta_publish(
            "wamp.session.on_join",
            vec![Variant::Object(meta::session_summary(&info))],
        );
        self.emit(RealmEvent::Join(info));

        Ok(JoinGrant {
            session_id,
            router_roles: RouterFeatures::provided().roles_dict(),
        })
    }

    async fn handle_inbound(&mut self, session_id: SessionId, message: Message) {
        if !self.sessions.contains_key(&session_id) {
            tracing::debug!(session.id = session_id, "Dropping message from departed session");
            return;
        }

        match message {
            Message::Subscribe {
                request_id,
                options,
                topic,
            } => self.handle_subscribe(session_id, request_id, &options, topic).await,
            Message::Unsubscribe {
                request_id,
                subscription_id,
            } => self.handle_unsubscribe(session_id, request_id, subscription_id),
            Message::Publish {
                request_id,
                options,
                topic,
                args,
                kwargs,
            } => {
                self.handle_publish(session_id, request_id, &options, topic, args, kwargs)
                    .await;
            }
            Message::Register {
                request_id,
                options,
                procedure,
            } => self.handle_register(session_id, request_id, &options, procedure).await,
            Message::Unregister {
                request_id,
                registration_id,
            } => self.handle_unregister(session_id, request_id, registration_id),
            Message::Call {
                request_id,
                options,
                procedure,
                args,
                kwargs,
            } => {
                self.handle_call(session_id, request_id, &options, procedure, args, kwargs)
                    .await;
            }
            Message::Cancel { request_id, options } => self.handle_cancel(session_id, request_id, &options),
            Message::Yield {
                request_id,
                options,
                args,
                kwargs,
            } => self.handle_yield(session_id, request_id, &options, args, kwargs),
            Message::Error {
                request_kind: Kind::Invocation,
                request_id,
                details,
                error,
                args,
                kwargs,
            } => self.handle_invocation_error(session_id, request_id, details, error, args, kwargs),
            Message::Goodbye { reason, .. } => self.handle_goodbye(session_id, &reason),
            Message::Abort { reason, .. } => {
                tracing::debug!(session.id = session_id, %reason, "Session aborted by client");
                self.remove_session(session_id);
            }
            other => {
                self.kick(
                    session_id,
                    WampError::ProtocolViolation.uri(),
                    Some(&format!("{} is not routable in this realm", other.kind())),
                );
                self.remove_session(session_id);
            }
        }
    }

    // === Broker operations ===

    async fn handle_subscribe(&mut self, session_id: SessionId, request_id: u64, options: &Object, topic: String) {
        let uri = Uri::new(topic);

        let Some(policy) = MatchPolicy::from_option(options.get("match").and_then(Variant::as_str)) else {
            self.log_action(session_id, AccessAction::ClientSubscribe, &uri, Some(&WampError::OptionNotAllowed));
            self.reply_error(
                session_id,
                Kind::Subscribe,
                request_id,
                &WampError::OptionNotAllowed.into(),
            );
            return;
        };

        if !self.check_uri(&uri, policy != MatchPolicy::Exact) {
            self.log_action(session_id, AccessAction::ClientSubscribe, &uri, Some(&WampError::InvalidUri));
            self.reply_error(session_id, Kind::Subscribe, request_id, &WampError::InvalidUri.into());
            return;
        }

        let info = self.sessions[&session_id].info.clone();
        let topic = Topic {
            uri: uri.clone(),
            policy,
        };
        let authorization = self.authorizer.authorize_subscribe(&topic, &info).await;
        if let Some(error) = authorization.to_error() {
            self.log_action(session_id, AccessAction::ClientSubscribe, &uri, Some(&error.kind));
            self.reply_error(session_id, Kind::Subscribe, request_id, &error);
            return;
        }

        let outcome = self.broker.subscribe(
            session_id,
            &uri,
            policy,
            SubscriberOptions::parse(options),
            &mut self.ids,
            OffsetDateTime::now_utc(),
        );

        self.log_action(session_id, AccessAction::ClientSubscribe, &uri, None);
        self.send_to(
            session_id,
            Message::Subscribed {
                request_id,
                subscription_id: outcome.subscription_id,
            },
        );

        if outcome.created {
            self.meta_publish(
                "wamp.subscription.on_create",
                vec![
                    Variant::UInt(session_id),
                    Variant::Object(meta::subscription_summary(&outcome.details, self.precision)),
                ],
            );
            self.emit(RealmEvent::SubscriptionCreated(outcome.details.clone()));
        }
        self.meta_publish(
            "wamp.subscription.on_subscribe",
            vec![Variant::UInt(session_id), Variant::UInt(outcome.subscription_id)],
        );
        self.emit(RealmEvent::Subscribe(info, outcome.details));
    }

    fn handle_unsubscribe(&mut self, session_id: SessionId, request_id: u64, subscription_id: u64) {
        match self.broker.unsubscribe(session_id, subscription_id) {
            Ok(outcome) => {
                let uri = outcome.details.uri.clone();
                self.log_action(session_id, AccessAction::ClientUnsubscribe, &uri, None);
                self.send_to(session_id, Message::Unsubscribed { request_id });
                self.subscription_retired(session_id, outcome);
            }
            Err(error) => {
                self.reply_error(session_id, Kind::Unsubscribe, request_id, &error);
            }
        }
    }

    /// Meta-events and cache upkeep shared by UNSUBSCRIBE and session
    /// removal.
    fn subscription_retired(&mut self, session_id: SessionId, outcome: UnsubscribeOutcome) {
        self.meta_publish(
            "wamp.subscription.on_unsubscribe",
            vec![Variant::UInt(session_id), Variant::UInt(outcome.details.id)],
        );
        if outcome.deleted {
            self.meta_publish(
                "wamp.subscription.on_delete",
                vec![Variant::UInt(session_id), Variant::UInt(outcome.details.id)],
            );
            self.authorizer.uncache_topic(&outcome.details);
            self.emit(RealmEvent::SubscriptionDeleted(outcome.details.clone()));
        }
        if let Some(record) = self.sessions.get(&session_id) {
            self.emit(RealmEvent::Unsubscribe(record.info.clone(), outcome.details));
        }
    }

    async fn handle_publish(
        &mut self,
        session_id: SessionId,
        request_id: u64,
        options: &Object,
        topic: String,
        args: Option<Array>,
        kwargs: Option<Object>,
    ) {
        let uri = Uri::new(topic);
        let acknowledge = options.get("acknowledge").is_some_and(Variant::truthy);

        let fail = |realm: &Self, kind: WampError| {
            realm.log_action(session_id, AccessAction::ClientPublish, &uri, Some(&kind));
            if acknowledge {
                realm.reply_error(session_id, Kind::Publish, request_id, &kind.into());
            }
        };

        if !self.check_uri(&uri, false) {
            fail(self, WampError::InvalidUri);
            return;
        }

        // Client publishes to the reserved meta namespace are refused
        // unless the realm explicitly allows them.
        if uri.is_reserved() && !self.options.meta_topic_publication_allowed {
            fail(self, WampError::InvalidUri);
            return;
        }

        let info = self.sessions[&session_id].info.clone();
        let authorization = self.authorizer.authorize_publish(&Pub { uri: uri.clone() }, &info).await;
        if let Some(error) = authorization.to_error() {
            self.log_action(session_id, AccessAction::ClientPublish, &uri, Some(&error.kind));
            if acknowledge {
                self.reply_error(session_id, Kind::Publish, request_id, &error);
            }
            return;
        }

        let disclose_me = options.get("disclose_me").is_some_and(Variant::truthy);

        // A strict-conceal policy rejects the publish outright; the
        // per-subscriber flag cannot change that outcome.
        if let Err(kind) = disclosure::resolve(
            self.options.publisher_disclosure,
            authorization.disclosure(),
            disclose_me,
            false,
        ) {
            fail(self, kind);
            return;
        }

        let publication_id = self.next_publication_id();
        let filter = EventFilter::parse(options);

        struct Delivery {
            subscriber: SessionId,
            message: Message,
        }
        let mut deliveries: Vec<Delivery> = Vec::new();

        for subscription in self.broker.matches(&uri) {
            let pattern_differs = subscription.uri != uri;

            for (&subscriber, subscriber_options) in &subscription.subscribers {
                let Some(record) = self.sessions.get(&subscriber) else {
                    continue;
                };
                if !filter.admits(session_id, subscriber, &record.info.auth.id, &record.info.auth.role) {
                    continue;
                }

                let disclosed = disclosure::resolve(
                    self.options.publisher_disclosure,
                    authorization.disclosure(),
                    disclose_me,
                    subscriber_options.disclose_publisher,
                )
                .unwrap_or(false);

                let mut details = Object::new();
                if pattern_differs {
                    details.insert("topic".to_owned(), Variant::from(uri.as_str()));
                }
                if disclosed {
                    details.insert("publisher".to_owned(), Variant::UInt(session_id));
                    details.insert("publisher_authid".to_owned(), Variant::from(info.auth.id.as_str()));
                    details.insert(
                        "publisher_authrole".to_owned(),
                        Variant::from(info.auth.role.as_str()),
                    );
                }

                deliveries.push(Delivery {
                    subscriber,
                    message: Message::Event {
                        subscription_id: subscription.id,
                        publication_id,
                        details,
                        args: args.clone(),
                        kwargs: kwargs.clone(),
                    },
                });
            }
        }

        for delivery in deliveries {
            self.send_to(delivery.subscriber, delivery.message);
        }

        self.log_action(session_id, AccessAction::ClientPublish, &uri, None);
        if acknowledge {
            self.send_to(
                session_id,
                Message::Published {
                    request_id,
                    publication_id,
                },
            );
        }
    }

    /// Publishes a meta-event through the normal subscription index with
    /// the privileged subject: no filtering, no disclosure.
    fn meta_publish(&mut self, topic: &str, args: Array) {
        let uri = Uri::new(topic);
        let matches = self.broker.matches(&uri);
        if matches.is_empty() {
            return;
        }

        struct Delivery {
            subscriber: SessionId,
            subscription_id: u64,
            pattern_differs: bool,
        }
        let deliveries: Vec<Delivery> = matches
            .into_iter()
            .flat_map(|subscription| {
                let pattern_differs = subscription.uri != uri;
                let subscription_id = subscription.id;
                subscription
                    .subscribers
                    .keys()
                    .map(move |&subscriber| Delivery {
                        subscriber,
                        subscription_id,
                        pattern_differs,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let publication_id = self.next_publication_id();
        for delivery in deliveries {
            let mut details = Object::new();
            if delivery.pattern_differs {
                details.insert("topic".to_owned(), Variant::from(uri.as_str()));
            }
            self.send_to(
                delivery.subscriber,
                Message::Event {
                    subscription_id: delivery.subscription_id,
                    publication_id,
                    details,
                    args: Some(args.clone()),
                    kwargs: None,
                },
            );
        }
    }

    fn next_publication_id(&mut self) -> u64 {
        self.publication_counter += 1;
        self.publication_counter
    }

    // === Dealer operations ===

    async fn handle_register(&mut self, session_id: SessionId, request_id: u64, options: &Object, procedure: String) {
        let uri = Uri::new(procedure);

        let Some(policy) = MatchPolicy::from_option(options.get("match").and_then(Variant::as_str)) else {
            self.reply_error(
                session_id,
                Kind::Register,
                request_id,
                &WampError::OptionNotAllowed.into(),
            );
            return;
        };

        if !self.check_uri(&uri, policy != MatchPolicy::Exact) {
            self.log_action(session_id, AccessAction::ClientRegister, &uri, Some(&WampError::InvalidUri));
            self.reply_error(session_id, Kind::Register, request_id, &WampError::InvalidUri.into());
            return;
        }

        if uri.is_reserved() && !self.options.meta_procedure_registration_allowed {
            self.log_action(session_id, AccessAction::ClientRegister, &uri, Some(&WampError::InvalidUri));
            self.reply_error(session_id, Kind::Register, request_id, &WampError::InvalidUri.into());
            return;
        }

        let info = self.sessions[&session_id].info.clone();
        let request = Procedure {
            uri: uri.clone(),
            policy,
        };
        let authorization = self.authorizer.authorize_register(&request, &info).await;
        if let Some(error) = authorization.to_error() {
            self.log_action(session_id, AccessAction::ClientRegister, &uri, Some(&error.kind));
            self.reply_error(session_id, Kind::Register, request_id, &error);
            return;
        }

        match self
            .dealer
            .register(&info, &uri, policy, options, &mut self.ids, OffsetDateTime::now_utc())
        {
            Ok(outcome) => {
                self.log_action(session_id, AccessAction::ClientRegister, &uri, None);
                self.send_to(
                    session_id,
                    Message::Registered {
                        request_id,
                        registration_id: outcome.registration_id,
                    },
                );

                if outcome.created {
                    self.meta_publish(
                        "wamp.registration.on_create",
                        vec![
                            Variant::UInt(session_id),
                            Variant::Object(meta::registration_summary(&outcome.details, self.precision)),
                        ],
                    );
                    self.emit(RealmEvent::RegistrationCreated(outcome.details.clone()));
                }
                self.meta_publish(
                    "wamp.registration.on_register",
                    vec![Variant::UInt(session_id), Variant::UInt(outcome.registration_id)],
                );
                self.emit(RealmEvent::Register(info, outcome.details));
            }
            Err(error) => {
                self.log_action(session_id, AccessAction::ClientRegister, &uri, Some(&error.kind));
                self.reply_error(session_id, Kind::Register, request_id, &error);
            }
        }
    }

    fn handle_unregister(&mut self, session_id: SessionId, request_id: u64, registration_id: u64) {
        match self.dealer.unregister(session_id, registration_id) {
            Ok(outcome) => {
                let uri = outcome.details.uri.clone();
                self.log_action(session_id, AccessAction::ClientUnregister, &uri, None);
                self.send_to(session_id, Message::Unregistered { request_id });
                self.registration_retired(session_id, outcome);
            }
            Err(error) => {
                self.reply_error(session_id, Kind::Unregister, request_id, &error);
            }
        }
    }

    /// Meta-events, caller notifications and cache upkeep shared by
    /// UNREGISTER and session removal.
    fn registration_retired(&mut self, session_id: SessionId, outcome: UnregisterOutcome) {
        for canceled in &outcome.canceled {
            self.reply_error(
                canceled.caller,
                Kind::Call,
                canceled.caller_request_id,
                &WampError::Canceled.into(),
            );
        }

        self.meta_publish(
            "wamp.registration.on_unregister",
            vec![Variant::UInt(session_id), Variant::UInt(outcome.details.id)],
        );
        if outcome.deleted {
            self.meta_publish(
                "wamp.registration.on_delete",
                vec![Variant::UInt(session_id), Variant::UInt(outcome.details.id)],
            );
            self.authorizer.uncache_procedure(&outcome.details);
            self.emit(RealmEvent::RegistrationDeleted(outcome.details.clone()));
        }
        if let Some(record) = self.sessions.get(&session_id) {
            self.emit(RealmEvent::Unregister(record.info.clone(), outcome.details));
        }
    }

    async fn handle_call(
        &mut self,
        session_id: SessionId,
        request_id: u64,
        options: &Object,
        procedure: String,
        args: Option<Array>,
        kwargs: Option<Object>,
    ) {
        let uri = Uri::new(procedure);

        if !self.check_uri(&uri, false) {
            self.log_action(session_id, AccessAction::ClientCall, &uri, Some(&WampError::InvalidUri));
            self.reply_error(session_id, Kind::Call, request_id, &WampError::InvalidUri.into());
            return;
        }

        let info = self.sessions[&session_id].info.clone();
        let authorization = self.authorizer.authorize_call(&Rpc { uri: uri.clone() }, &info).await;
        if let Some(error) = authorization.to_error() {
            self.log_action(session_id, AccessAction::ClientCall, &uri, Some(&error.kind));
            self.reply_error(session_id, Kind::Call, request_id, &error);
            return;
        }

        if uri.is_reserved() && self.options.meta_api_enabled {
            self.handle_meta_call(session_id, request_id, &uri, args, kwargs);
            return;
        }

        let dispatch = self.dealer.call(
            &info,
            request_id,
            &uri,
            options,
            args,
            kwargs,
            self.options.call_timeout_forwarding,
            self.options.caller_disclosure,
            authorization.disclosure(),
            &mut self.ids,
            Instant::now(),
        );

        match dispatch {
            Ok(dispatch) => {
                self.log_action(session_id, AccessAction::ClientCall, &uri, None);
                self.send_to(dispatch.callee, dispatch.invocation);
            }
            Err(CallError::Reply(error)) => {
                self.log_action(session_id, AccessAction::ClientCall, &uri, Some(&error.kind));
                self.reply_error(session_id, Kind::Call, request_id, &error);
            }
            Err(CallError::Violation(violation)) => {
                tracing::warn!(session.id = session_id, %violation, "Protocol violation on CALL");
                self.kick(session_id, WampError::ProtocolViolation.uri(), Some(&violation.to_string()));
                self.remove_session(session_id);
            }
        }
    }

    fn handle_meta_call(
        &mut self,
        session_id: SessionId,
        request_id: u64,
        procedure: &Uri,
        args: Option<Array>,
        kwargs: Option<Object>,
    ) {
        let outcome = meta::dispatch(
            meta::MetaContext {
                sessions: &self.sessions,
                broker: &self.broker,
                dealer: &self.dealer,
                precision: self.precision,
                caller: session_id,
            },
            procedure,
            args.as_ref(),
            kwargs.as_ref(),
        );

        match outcome {
            meta::MetaOutcome::Reply { args, kwargs } => {
                self.log_action(session_id, AccessAction::ClientCall, procedure, None);
                self.send_to(
                    session_id,
                    Message::Result {
                        request_id,
                        details: Object::new(),
                        args,
                        kwargs,
                    },
                );
            }
            meta::MetaOutcome::Error(error) => {
                self.log_action(session_id, AccessAction::ClientCall, procedure, Some(&error.kind));
                self.reply_error(session_id, Kind::Call, request_id, &error);
            }
            meta::MetaOutcome::Kill {
                targets,
                reason,
                message,
                reply,
            } => {
                for target in &targets {
                    self.kill_session(*target, &reason, message.as_deref());
                }
                self.log_action(session_id, AccessAction::ClientCall, procedure, None);
                self.send_to(
                    session_id,
                    Message::Result {
                        request_id,
                        details: Object::new(),
                        args: reply,
                        kwargs: None,
                    },
                );
            }
        }
    }

    fn handle_cancel(&mut self, session_id: SessionId, request_id: u64, options: &Object) {
        let Some(mode) = CancelMode::from_option(options.get("mode").and_then(Variant::as_str)) else {
            tracing::debug!(session.id = session_id, "CANCEL with unknown mode ignored");
            return;
        };

        // Unknown request ids and already-completed calls are ignored:
        // the CANCEL raced the terminal result.
        let Some(outcome) = self.dealer.cancel(session_id, request_id, mode) else {
            tracing::debug!(session.id = session_id, request.id = request_id, "CANCEL had nothing to cancel");
            return;
        };

        if let Some(entry) = self.access_entry(session_id, AccessAction::ClientCancel) {
            entry.emit();
        }
        if let Some((callee, interrupt)) = outcome.interrupt {
            self.send_to(callee, interrupt);
        }
        if let Some(reply) = outcome.reply {
            self.send_to(session_id, reply);
        }
    }

    fn handle_yield(
        &mut self,
        session_id: SessionId,
        request_id: u64,
        options: &Object,
        args: Option<Array>,
        kwargs: Option<Object>,
    ) {
        match self.dealer.yield_result(session_id, request_id, options, args, kwargs) {
            Ok(ReplyOutcome::Forward { caller, message }) => self.send_to(caller, message),
            Ok(ReplyOutcome::Discarded) => {}
            Err(violation) => {
                tracing::warn!(session.id = session_id, %violation, "Protocol violation on YIELD");
                self.kick(session_id, WampError::ProtocolViolation.uri(), Some(&violation.to_string()));
                self.remove_session(session_id);
            }
        }
    }

    fn handle_invocation_error(
        &mut self,
        session_id: SessionId,
        request_id: u64,
        details: Object,
        error: String,
        args: Option<Array>,
        kwargs: Option<Object>,
    ) {
        match self
            .dealer
            .error_result(session_id, request_id, details, error, args, kwargs)
        {
            Ok(ReplyOutcome::Forward { caller, message }) => self.send_to(caller, message),
            Ok(ReplyOutcome::Discarded) => {}
            Err(violation) => {
                tracing::warn!(session.id = session_id, %violation, "Protocol violation on ERROR");
                self.kick(session_id, WampError::ProtocolViolation.uri(), Some(&violation.to_string()));
                self.remove_session(session_id);
            }
        }
    }

    fn expire_calls(&mut self) {
        for expiry in self.dealer.expire(Instant::now()) {
            self.reply_error(
                expiry.caller,
                Kind::Call,
                expiry.caller_request_id,
                &WampError::Canceled.into(),
            );
            let (callee, interrupt) = expiry.interrupt;
            self.send_to(callee, interrupt);
        }
    }

    // === Session lifecycle ===

    fn handle_goodbye(&mut self, session_id: SessionId, reason: &str) {
        tracing::debug!(session.id = session_id, %reason, "Session said goodbye");
        if let Some(entry) = self.access_entry(session_id, AccessAction::ClientGoodbye) {
            entry.emit();
        }
        self.send_to(
            session_id,
            Message::Goodbye {
                details: Object::new(),
                reason: CloseReason::GoodbyeAndOut.uri().to_owned(),
            },
        );
        self.remove_session(session_id);
    }

    fn kick(&self, session_id: SessionId, reason: &str, message: Option<&str>) {
        let Some(record) = self.sessions.get(&session_id) else {
            return;
        };
        let mut details = Object::new();
        if let Some(message) = message {
            details.insert("message".to_owned(), Variant::from(message));
        }
        let _ = record.sender.try_send(SessionOutput::Kick {
            reason: reason.to_owned(),
            details,
        });
    }

    /// Kills an established session the way `wamp.session.kill` demands:
    /// abort the transport with the supplied reason, then retire the
    /// session state.
    fn kill_session(&mut self, session_id: SessionId, reason: &str, message: Option<&str>) -> bool {
        if !self.sessions.contains_key(&session_id) {
            return false;
        }
        self.kick(session_id, reason, message);
        self.remove_session(session_id);
        true
    }

    /// Retires all of a session's routing state. The order matters: state
    /// changes commit first, meta-events follow.
    fn remove_session(&mut self, session_id: SessionId) {
        let Some(record) = self.sessions.remove(&session_id) else {
            return;
        };
        let info = record.info;

        for outcome in self.broker.remove_session(session_id) {
            self.subscription_retired(session_id, outcome);
        }

        for (callee, interrupt) in self.dealer.remove_caller(session_id) {
            self.send_to(callee, interrupt);
        }

        let removal = self.dealer.remove_callee(session_id);
        for canceled in removal.canceled {
            self.reply_error(
                canceled.caller,
                Kind::Call,
                canceled.caller_request_id,
                &WampError::Canceled.into(),
            );
        }
        for outcome in removal.unregistered {
            self.registration_retired(session_id, outcome);
        }

        self.authorizer.uncache_session(&info);

        self.meta_publish(
            "wamp.session.on_leave",
            vec![
                Variant::UInt(session_id),
                Variant::from(info.auth.id.as_str()),
                Variant::from(info.auth.role.as_str()),
            ],
        );
        self.emit(RealmEvent::Leave(info));
    }

    fn check_uri(&self, uri: &Uri, is_pattern: bool) -> bool {
        self.uri_validation.check(uri, is_pattern)
    }

    fn close(&mut self, reason: CloseReason) {
        tracing::info!(realm = %self.uri, reason = reason.uri(), "Closing realm");

        let session_ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session_id in session_ids {
            if let Some(record) = self.sessions.get(&session_id) {
                let _ = record.sender.try_send(SessionOutput::Goodbye { reason });
            }
            self.remove_session(session_id);
        }

        self.emit(RealmEvent::Closed(self.uri.clone()));
        self.broker.clear();
        self.dealer.clear();
    }
}

#[async_trait]
impl Task for RealmTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "realm";

    async fn run(mut self, shutdown_signal: ShutdownSignal) -> Self::Output {
        let notifier = self.notifier.take();
        let result = self.run_inner(shutdown_signal).await;
        if let Some(notifier) = notifier {
            // The notifier drains queued events once the realm's sender side
            // is gone.
            let _ = notifier.join().await;
        }
        result
    }
}

pub(crate) fn error_reply(kind: Kind, request_id: u64, error: &InteractionError) -> Message {
    let mut details = Object::new();
    if let Some(message) = &error.message {
        details.insert("message".to_owned(), Variant::from(message.as_str()));
    }
    let args = error
        .diagnostics
        .as_ref()
        .map(|(code, message)| vec![Variant::from(code.as_str()), Variant::from(message.as_str())]);

    Message::Error {
        request_kind: kind,
        request_id,
        details,
        error: error.kind.uri().to_owned(),
        args,
        kwargs: None,
    }
}
