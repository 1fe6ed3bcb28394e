//! The per-realm dealer: registrations, call dispatch, pending-invocation
//! tracking, call timeouts and cancellation.
//!
//! All state is owned by the realm task. Call deadlines sit in a binary heap
//! ordered soonest-first; the realm re-arms a single sleep from
//! [`Dealer::next_deadline`] and drains [`Dealer::expire`] when it fires.

use std::cmp;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;
use wamp_proto::{Array, Kind, Message, Object, Variant};

use crate::config::CallTimeoutForwardingRule;
use crate::disclosure::{self, DisclosurePolicy, DisclosureRule};
use crate::error::{InteractionError, ProtocolError, WampError};
use crate::features::CalleeFeatures;
use crate::ids::{RandomIdGenerator, RegistrationId, RequestId, SequentialIdGenerator, SessionId};
use crate::session::SessionInfo;
use crate::trie::UriMatchIndex;
use crate::uri::{MatchPolicy, Uri};

/// How a shared registration spreads invocations over its callees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InvocationPolicy {
    #[default]
    Single,
    RoundRobin,
    Random,
    First,
    Last,
}

impl InvocationPolicy {
    /// Parses the `invoke` option of REGISTER. Absence means single.
    pub fn from_option(value: Option<&str>) -> Option<InvocationPolicy> {
        match value {
            None | Some("single") => Some(InvocationPolicy::Single),
            Some("roundrobin") => Some(InvocationPolicy::RoundRobin),
            Some("random") => Some(InvocationPolicy::Random),
            Some("first") => Some(InvocationPolicy::First),
            Some("last") => Some(InvocationPolicy::Last),
            Some(_) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InvocationPolicy::Single => "single",
            InvocationPolicy::RoundRobin => "roundrobin",
            InvocationPolicy::Random => "random",
            InvocationPolicy::First => "first",
            InvocationPolicy::Last => "last",
        }
    }
}

/// One callee's membership in a registration, with the options it chose at
/// REGISTER time.
#[derive(Clone, Debug)]
pub(crate) struct CalleeEntry {
    pub session_id: SessionId,
    pub forward_timeouts: bool,
    pub disclose_caller: bool,
    pub features: CalleeFeatures,
}

#[derive(Clone, Debug)]
pub(crate) struct Registration {
    pub id: RegistrationId,
    pub uri: Uri,
    pub policy: MatchPolicy,
    pub invocation: InvocationPolicy,
    pub created: OffsetDateTime,
    pub callees: Vec<CalleeEntry>,
    rr_cursor: usize,
}

/// Introspection snapshot handed to observers, the meta-API and the
/// authorizer uncache hooks.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistrationDetails {
    pub id: RegistrationId,
    pub uri: Uri,
    pub match_policy: MatchPolicy,
    pub invocation_policy: InvocationPolicy,
    pub created: OffsetDateTime,
    pub callees: Vec<SessionId>,
}

impl Registration {
    fn details(&self) -> RegistrationDetails {
        RegistrationDetails {
            id: self.id,
            uri: self.uri.clone(),
            match_policy: self.policy,
            invocation_policy: self.invocation,
            created: self.created,
            callees: self.callees.iter().map(|c| c.session_id).collect(),
        }
    }

    /// Picks the callee receiving the next invocation, in registration-join
    /// order for the ordered policies.
    fn select(&mut self, rng: &mut RandomIdGenerator) -> &CalleeEntry {
        debug_assert!(!self.callees.is_empty());
        let index = match self.invocation {
            InvocationPolicy::Single | InvocationPolicy::First => 0,
            InvocationPolicy::Last => self.callees.len() - 1,
            InvocationPolicy::Random => rng.pick(self.callees.len()),
            InvocationPolicy::RoundRobin => {
                let index = self.rr_cursor % self.callees.len();
                self.rr_cursor = (index + 1) % self.callees.len();
                index
            }
        };
        &self.callees[index]
    }
}

/// Registration ids grouped by match policy, as the meta-API reports them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistrationLists {
    pub exact: Vec<RegistrationId>,
    pub prefix: Vec<RegistrationId>,
    pub wildcard: Vec<RegistrationId>,
}

/// CANCEL modes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum CancelMode {
    Skip,
    #[default]
    KillNoWait,
    Kill,
}

impl CancelMode {
    pub(crate) fn from_option(value: Option<&str>) -> Option<CancelMode> {
        match value {
            None | Some("killnowait") => Some(CancelMode::KillNoWait),
            Some("kill") => Some(CancelMode::Kill),
            Some("skip") => Some(CancelMode::Skip),
            Some(_) => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            CancelMode::Skip => "skip",
            CancelMode::KillNoWait => "killnowait",
            CancelMode::Kill => "kill",
        }
    }
}

#[derive(Debug)]
struct PendingInvocation {
    caller: SessionId,
    caller_request_id: RequestId,
    callee: SessionId,
    callee_request_id: RequestId,
    registration_id: RegistrationId,
    deadline: Option<Instant>,
    /// Caller asked for progressive results and the callee can produce them.
    progressive_results: bool,
    /// Caller is streaming progressive invocations.
    progressive_invocations: bool,
    /// Caller may still send continuation CALLs.
    stream_open: bool,
    /// A kill-mode cancel is outstanding; the callee's reply resolves it.
    kill_pending: bool,
    /// The caller side is already answered (or gone); swallow callee replies.
    discard: bool,
}

/// Heap entry; inverted ordering makes the `BinaryHeap` a min-heap on the
/// deadline.
struct InvocationDeadline {
    deadline: Instant,
    key: (SessionId, RequestId),
}

impl PartialEq for InvocationDeadline {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline) && self.key.eq(&other.key)
    }
}

impl Eq for InvocationDeadline {}

impl PartialOrd for InvocationDeadline {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InvocationDeadline {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        match self.deadline.cmp(&other.deadline) {
            cmp::Ordering::Less => cmp::Ordering::Greater,
            cmp::Ordering::Equal => self.key.cmp(&other.key),
            cmp::Ordering::Greater => cmp::Ordering::Less,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RegisterOutcome {
    pub registration_id: RegistrationId,
    /// First callee created the registration.
    pub created: bool,
    pub details: RegistrationDetails,
}

#[derive(Debug)]
pub(crate) struct UnregisterOutcome {
    pub details: RegistrationDetails,
    pub deleted: bool,
    /// Calls answered with `canceled` because their invocation died with
    /// the registration.
    pub canceled: Vec<CanceledCall>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CanceledCall {
    pub caller: SessionId,
    pub caller_request_id: RequestId,
}

pub(crate) struct CallDispatch {
    pub callee: SessionId,
    pub invocation: Message,
}

pub(crate) enum CallError {
    /// Answer the caller with an ERROR reply.
    Reply(InteractionError),
    /// Abort the caller's session.
    Violation(ProtocolError),
}

impl From<InteractionError> for CallError {
    fn from(error: InteractionError) -> Self {
        CallError::Reply(error)
    }
}

#[derive(Debug)]
pub(crate) enum ReplyOutcome {
    Forward { caller: SessionId, message: Message },
    /// The caller side was already resolved; the reply is swallowed.
    Discarded,
}

pub(crate) struct CancelOutcome {
    pub interrupt: Option<(SessionId, Message)>,
    /// Immediate ERROR `canceled` back to the caller (skip/killnowait).
    pub reply: Option<Message>,
}

pub(crate) struct Expiry {
    pub caller: SessionId,
    pub caller_request_id: RequestId,
    pub interrupt: (SessionId, Message),
}

pub(crate) struct CalleeRemoval {
    pub canceled: Vec<CanceledCall>,
    pub unregistered: Vec<UnregisterOutcome>,
}

#[derive(Default)]
pub(crate) struct Dealer {
    index: UriMatchIndex<RegistrationId>,
    registrations: HashMap<RegistrationId, Registration>,
    /// Keyed by `(callee, callee_request_id)`, the correlation YIELD/ERROR
    /// arrive with.
    pending: HashMap<(SessionId, RequestId), PendingInvocation>,
    by_caller: HashMap<(SessionId, RequestId), (SessionId, RequestId)>,
    invocation_ids: HashMap<SessionId, SequentialIdGenerator>,
    deadlines: BinaryHeap<InvocationDeadline>,
}

impl Dealer {
    pub(crate) fn new() -> Self {
        Dealer::default()
    }

    pub(crate) fn register(
        &mut self,
        session: &SessionInfo,
        uri: &Uri,
        policy: MatchPolicy,
        options: &Object,
        ids: &mut RandomIdGenerator,
        now: OffsetDateTime,
    ) -> Result<RegisterOutcome, InteractionError> {
        let invocation = InvocationPolicy::from_option(options.get("invoke").and_then(Variant::as_str))
            .ok_or(WampError::OptionNotAllowed)?;

        let entry = CalleeEntry {
            session_id: session.session_id,
            forward_timeouts: options.get("forward_timeouts").is_some_and(Variant::truthy),
            disclose_caller: options.get("disclose_caller").is_some_and(Variant::truthy),
            features: session.features.callee,
        };

        if let Some(&existing) = self.index.find_pattern(uri, policy) {
            let registration = self
                .registrations
                .get_mut(&existing)
                .expect("indexed registration must exist");

            if registration.invocation == InvocationPolicy::Single
                || invocation == InvocationPolicy::Single
                || registration.invocation != invocation
                || registration
                    .callees
                    .iter()
                    .any(|c| c.session_id == session.session_id)
            {
                return Err(WampError::ProcedureAlreadyExists.into());
            }

            registration.callees.push(entry);
            return Ok(RegisterOutcome {
                registration_id: existing,
                created: false,
                details: registration.details(),
            });
        }

        let id = ids.next_free(|candidate| self.registrations.contains_key(&candidate));
        let registration = Registration {
            id,
            uri: uri.clone(),
            policy,
            invocation,
            created: now,
            callees: vec![entry],
            rr_cursor: 0,
        };
        let details = registration.details();

        self.index
            .insert(uri, policy, id)
            .unwrap_or_else(|_| unreachable!("pattern slot was checked to be vacant"));
        self.registrations.insert(id, registration);

        Ok(RegisterOutcome {
            registration_id: id,
            created: true,
            details,
        })
    }

    pub(crate) fn unregister(
        &mut self,
        session_id: SessionId,
        registration_id: RegistrationId,
    ) -> Result<UnregisterOutcome, InteractionError> {
        let registration = self
            .registrations
            .get_mut(&registration_id)
            .ok_or(WampError::NoSuchRegistration)?;
        let position = registration
            .callees
            .iter()
            .position(|c| c.session_id == session_id)
            .ok_or(WampError::NoSuchRegistration)?;

        registration.callees.remove(position);
        if position < registration.rr_cursor {
            registration.rr_cursor -= 1;
        }

        let details = registration.details();
        let deleted = registration.callees.is_empty();
        if deleted {
            let (uri, policy) = (registration.uri.clone(), registration.policy);
            self.registrations.remove(&registration_id);
            self.index.remove(&uri, policy);
        }

        let canceled = self.drop_invocations(|p| {
            p.registration_id == registration_id && p.callee == session_id
        });

        Ok(UnregisterOutcome {
            details,
            deleted,
            canceled,
        })
    }

    /// Removes pendings matching the predicate, reporting the callers that
    /// still await an answer.
    fn drop_invocations(&mut self, predicate: impl Fn(&PendingInvocation) -> bool) -> Vec<CanceledCall> {
        let keys: Vec<(SessionId, RequestId)> = self
            .pending
            .iter()
            .filter(|(_, p)| predicate(p))
            .map(|(&k, _)| k)
            .collect();

        let mut canceled = Vec::new();
        for key in keys {
            let Some(pending) = self.pending.remove(&key) else {
                continue;
            };
            self.by_caller.remove(&(pending.caller, pending.caller_request_id));
            if !pending.discard {
                canceled.push(CanceledCall {
                    caller: pending.caller,
                    caller_request_id: pending.caller_request_id,
                });
            }
        }
        canceled
    }

    /// Best-match lookup for CALL: exact before prefix before wildcard;
    /// within prefix, longest wins; within wildcard, lexicographic token
    /// order.
    pub(crate) fn match_best(&self, uri: &Uri) -> Option<RegistrationId> {
        self.index
            .find_exact(uri)
            .or_else(|| self.index.best_prefix(uri))
            .or_else(|| self.index.first_wildcard(uri))
            .copied()
    }

    /// Routes a CALL after authorization: either dispatches a fresh
    /// invocation or continues a progressive-invocation stream.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn call(
        &mut self,
        caller: &SessionInfo,
        request_id: RequestId,
        uri: &Uri,
        options: &Object,
        args: Option<Array>,
        kwargs: Option<Object>,
        forwarding_rule: CallTimeoutForwardingRule,
        disclosure_policy: DisclosurePolicy,
        auth_disclosure: DisclosureRule,
        rng: &mut RandomIdGenerator,
        now: Instant,
    ) -> Result<CallDispatch, CallError> {
        let progress = options.get("progress").is_some_and(Variant::truthy);

        if let Some(&pending_key) = self.by_caller.get(&(caller.session_id, request_id)) {
            return self.continue_call(pending_key, request_id, progress, args, kwargs);
        }

        let registration_id = self
            .match_best(uri)
            .ok_or_else(|| InteractionError::new(WampError::NoSuchProcedure))?;
        let registration = self
            .registrations
            .get_mut(&registration_id)
            .expect("matched registration must exist");
        let pattern_based = registration.policy != MatchPolicy::Exact;
        let callee = registration.select(rng).clone();

        let disclose_me = options.get("disclose_me").is_some_and(Variant::truthy);
        let disclosed = disclosure::resolve(
            disclosure_policy,
            auth_disclosure,
            disclose_me,
            callee.disclose_caller,
        )
        .map_err(|kind| CallError::Reply(kind.into()))?;

        let receive_progress = options.get("receive_progress").is_some_and(Variant::truthy)
            && callee.features.contains(CalleeFeatures::PROGRESSIVE_CALL_RESULTS);

        if progress && !callee.features.contains(CalleeFeatures::PROGRESSIVE_CALL_INVOCATIONS) {
            return Err(CallError::Reply(InteractionError::with_message(
                WampError::FeatureNotSupported,
                "callee does not support progressive call invocations",
            )));
        }

        let mut details = Object::new();
        if pattern_based {
            details.insert("procedure".to_owned(), Variant::from(uri.as_str()));
        }
        if receive_progress {
            details.insert("receive_progress".to_owned(), Variant::Bool(true));
        }
        if progress {
            details.insert("progress".to_owned(), Variant::Bool(true));
        }
        if disclosed {
            details.insert("caller".to_owned(), Variant::UInt(caller.session_id));
            details.insert("caller_authid".to_owned(), Variant::from(caller.auth.id.as_str()));
            details.insert("caller_authrole".to_owned(), Variant::from(caller.auth.role.as_str()));
        }

        // Forwarded timeouts become the callee's responsibility; otherwise
        // the router arms its own deadline.
        let timeout_ms = options.get("timeout").and_then(Variant::as_u64).unwrap_or(0);
        let mut deadline = None;
        if timeout_ms > 0 {
            let forward = match forwarding_rule {
                CallTimeoutForwardingRule::PerRegistration => callee.forward_timeouts,
                CallTimeoutForwardingRule::PerFeature => {
                    callee.features.contains(CalleeFeatures::CALL_TIMEOUT)
                }
                CallTimeoutForwardingRule::Never => false,
            };
            if forward {
                details.insert("timeout".to_owned(), Variant::UInt(timeout_ms));
            } else {
                deadline = Some(now + Duration::from_millis(timeout_ms));
            }
        }

        let callee_request_id = self
            .invocation_ids
            .entry(callee.session_id)
            .or_default()
            .next_id();
        let key = (callee.session_id, callee_request_id);

        self.pending.insert(
            key,
            PendingInvocation {
                caller: caller.session_id,
                caller_request_id: request_id,
                callee: callee.session_id,
                callee_request_id,
                registration_id,
                deadline,
                progressive_results: receive_progress,
                progressive_invocations: progress,
                stream_open: progress,
                kill_pending: false,
                discard: false,
            },
        );
        self.by_caller.insert((caller.session_id, request_id), key);

        if let Some(deadline) = deadline {
            self.deadlines.push(InvocationDeadline { deadline, key });
        }

        Ok(CallDispatch {
            callee: callee.session_id,
            invocation: Message::Invocation {
                request_id: callee_request_id,
                registration_id,
                details,
                args,
                kwargs,
            },
        })
    }

    fn continue_call(
        &mut self,
        key: (SessionId, RequestId),
        request_id: RequestId,
        progress: bool,
        args: Option<Array>,
        kwargs: Option<Object>,
    ) -> Result<CallDispatch, CallError> {
        let Some(pending) = self.pending.get_mut(&key) else {
            return Err(CallError::Violation(ProtocolError::RequestIdInUse { request_id }));
        };
        if !pending.progressive_invocations || !pending.stream_open || pending.discard {
            return Err(CallError::Violation(ProtocolError::RequestIdInUse { request_id }));
        }

        if !progress {
            pending.stream_open = false;
        }

        let mut details = Object::new();
        if progress {
            details.insert("progress".to_owned(), Variant::Bool(true));
        }

        Ok(CallDispatch {
            callee: pending.callee,
            invocation: Message::Invocation {
                request_id: pending.callee_request_id,
                registration_id: pending.registration_id,
                details,
                args,
                kwargs,
            },
        })
    }

    /// Handles a callee's YIELD: forwards a RESULT, progressively or
    /// terminally.
    pub(crate) fn yield_result(
        &mut self,
        callee: SessionId,
        request_id: RequestId,
        options: &Object,
        args: Option<Array>,
        kwargs: Option<Object>,
    ) -> Result<ReplyOutcome, ProtocolError> {
        let key = (callee, request_id);
        let pending = self
            .pending
            .get(&key)
            .ok_or(ProtocolError::UnknownInvocation { request_id })?;
        let progress = options.get("progress").is_some_and(Variant::truthy);

        if pending.discard {
            if !progress {
                self.remove_pending(key);
            }
            return Ok(ReplyOutcome::Discarded);
        }

        if progress && !pending.progressive_results {
            return Err(ProtocolError::UnsolicitedProgress { request_id });
        }

        let caller = pending.caller;
        let caller_request_id = pending.caller_request_id;

        let mut details = Object::new();
        if progress {
            details.insert("progress".to_owned(), Variant::Bool(true));
        } else {
            self.remove_pending(key);
        }

        Ok(ReplyOutcome::Forward {
            caller,
            message: Message::Result {
                request_id: caller_request_id,
                details,
                args,
                kwargs,
            },
        })
    }

    /// Handles a callee's ERROR reply to an INVOCATION; always terminal.
    pub(crate) fn error_result(
        &mut self,
        callee: SessionId,
        request_id: RequestId,
        details: Object,
        error: String,
        args: Option<Array>,
        kwargs: Option<Object>,
    ) -> Result<ReplyOutcome, ProtocolError> {
        let key = (callee, request_id);
        let pending = self
            .pending
            .get(&key)
            .ok_or(ProtocolError::UnknownInvocation { request_id })?;

        let discard = pending.discard;
        let caller = pending.caller;
        let caller_request_id = pending.caller_request_id;
        self.remove_pending(key);

        if discard {
            return Ok(ReplyOutcome::Discarded);
        }

        Ok(ReplyOutcome::Forward {
            caller,
            message: Message::Error {
                request_kind: Kind::Call,
                request_id: caller_request_id,
                details,
                error,
                args,
                kwargs,
            },
        })
    }

    /// Executes a CANCEL. Returns `None` when there is nothing to cancel
    /// (unknown request id, already completed or already canceled).
    pub(crate) fn cancel(
        &mut self,
        caller: SessionId,
        request_id: RequestId,
        mode: CancelMode,
    ) -> Option<CancelOutcome> {
        let key = *self.by_caller.get(&(caller, request_id))?;
        let pending = self.pending.get_mut(&key)?;
        if pending.kill_pending || pending.discard {
            return None;
        }

        let interrupt = |p: &PendingInvocation| {
            (
                p.callee,
                Message::Interrupt {
                    request_id: p.callee_request_id,
                    options: Object::from([("mode".to_owned(), Variant::from(mode.as_str()))]),
                },
            )
        };

        match mode {
            CancelMode::Kill => {
                pending.kill_pending = true;
                Some(CancelOutcome {
                    interrupt: Some(interrupt(pending)),
                    reply: None,
                })
            }
            CancelMode::KillNoWait | CancelMode::Skip => {
                pending.discard = true;
                let send_interrupt = (mode == CancelMode::KillNoWait).then(|| interrupt(pending));
                let reply = Message::Error {
                    request_kind: Kind::Call,
                    request_id,
                    details: Object::new(),
                    error: WampError::Canceled.uri().to_owned(),
                    args: None,
                    kwargs: None,
                };
                self.by_caller.remove(&(caller, request_id));
                Some(CancelOutcome {
                    interrupt: send_interrupt,
                    reply: Some(reply),
                })
            }
        }
    }

    /// Earliest armed deadline, for the realm's timer.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek().map(|d| d.deadline)
    }

    /// Fires every deadline at or before `now`. Stale heap entries (pending
    /// already resolved) are skipped.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<Expiry> {
        let mut expired = Vec::new();

        while let Some(head) = self.deadlines.peek() {
            if head.deadline > now {
                break;
            }
            let entry = self.deadlines.pop().expect("peeked entry must exist");

            let Some(pending) = self.pending.get_mut(&entry.key) else {
                continue;
            };
            if pending.deadline != Some(entry.deadline) || pending.discard || pending.kill_pending {
                continue;
            }

            pending.discard = true;
            self.by_caller.remove(&(pending.caller, pending.caller_request_id));
            expired.push(Expiry {
                caller: pending.caller,
                caller_request_id: pending.caller_request_id,
                interrupt: (
                    pending.callee,
                    Message::Interrupt {
                        request_id: pending.callee_request_id,
                        options: Object::from([(
                            "mode".to_owned(),
                            Variant::from(CancelMode::KillNoWait.as_str()),
                        )]),
                    },
                ),
            });
        }

        expired
    }

    /// A caller left: its pendings are discarded and callees told to stop.
    pub(crate) fn remove_caller(&mut self, session_id: SessionId) -> Vec<(SessionId, Message)> {
        let keys: Vec<(SessionId, RequestId)> = self
            .by_caller
            .iter()
            .filter(|((caller, _), _)| *caller == session_id)
            .map(|(_, &key)| key)
            .collect();

        let mut interrupts = Vec::new();
        for key in keys {
            let Some(pending) = self.pending.get_mut(&key) else {
                continue;
            };
            self.by_caller.remove(&(pending.caller, pending.caller_request_id));
            if !pending.discard {
                pending.discard = true;
                // A kill-mode cancel already interrupted this callee.
                if !pending.kill_pending {
                    interrupts.push((
                        pending.callee,
                        Message::Interrupt {
                            request_id: pending.callee_request_id,
                            options: Object::from([(
                                "mode".to_owned(),
                                Variant::from(CancelMode::KillNoWait.as_str()),
                            )]),
                        },
                    ));
                }
            }
        }
        interrupts
    }

    /// A callee left: its registrations shrink or die and its outstanding
    /// invocations answer `canceled`.
    pub(crate) fn remove_callee(&mut self, session_id: SessionId) -> CalleeRemoval {
        let canceled = self.drop_invocations(|p| p.callee == session_id);
        self.invocation_ids.remove(&session_id);

        let affected: Vec<RegistrationId> = self
            .registrations
            .values()
            .filter(|r| r.callees.iter().any(|c| c.session_id == session_id))
            .map(|r| r.id)
            .collect();

        let unregistered = affected
            .into_iter()
            .filter_map(|id| self.unregister(session_id, id).ok())
            .collect();

        CalleeRemoval {
            canceled,
            unregistered,
        }
    }

    fn remove_pending(&mut self, key: (SessionId, RequestId)) {
        if let Some(pending) = self.pending.remove(&key) {
            self.by_caller.remove(&(pending.caller, pending.caller_request_id));
        }
    }

    pub(crate) fn registration(&self, id: RegistrationId) -> Option<&Registration> {
        self.registrations.get(&id)
    }

    pub(crate) fn details(&self, id: RegistrationId) -> Option<RegistrationDetails> {
        self.registrations.get(&id).map(Registration::details)
    }

    pub(crate) fn lookup(&self, uri: &Uri, policy: MatchPolicy) -> Option<RegistrationId> {
        self.index.find_pattern(uri, policy).copied()
    }

    pub(crate) fn list_ids(&self) -> RegistrationLists {
        let mut lists = RegistrationLists::default();
        self.index.for_each(MatchPolicy::Exact, |_, id| lists.exact.push(*id));
        self.index.for_each(MatchPolicy::Prefix, |_, id| lists.prefix.push(*id));
        self.index
            .for_each(MatchPolicy::Wildcard, |_, id| lists.wildcard.push(*id));
        lists
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.index = UriMatchIndex::new();
        self.registrations.clear();
        self.pending.clear();
        self.by_caller.clear();
        self.invocation_ids.clear();
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthInfo;
    use crate::features::ClientFeatures;

    fn caller(session_id: SessionId) -> SessionInfo {
        SessionInfo {
            session_id,
            realm: Uri::new("com.example.realm"),
            auth: AuthInfo::new(format!("user-{session_id}"), "user", "anonymous", "static"),
            agent: None,
            features: ClientFeatures::default(),
        }
    }

    fn callee(session_id: SessionId, features: &[(&str, bool)]) -> SessionInfo {
        let mut dict = Object::new();
        for (name, value) in features {
            dict.insert((*name).to_owned(), Variant::Bool(*value));
        }
        let roles = Object::from([(
            "callee".to_owned(),
            Variant::Object(Object::from([("features".to_owned(), Variant::Object(dict))])),
        )]);
        SessionInfo {
            features: ClientFeatures::parse(&roles),
            ..caller(session_id)
        }
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    fn register(
        dealer: &mut Dealer,
        ids: &mut RandomIdGenerator,
        session: &SessionInfo,
        uri: &str,
        options: Object,
    ) -> RegistrationId {
        dealer
            .register(session, &Uri::new(uri), MatchPolicy::Exact, &options, ids, now())
            .expect("register")
            .registration_id
    }

    fn plain_call(
        dealer: &mut Dealer,
        ids: &mut RandomIdGenerator,
        session: &SessionInfo,
        request_id: u64,
        uri: &str,
        options: Object,
    ) -> Result<CallDispatch, CallError> {
        dealer.call(
            session,
            request_id,
            &Uri::new(uri),
            &options,
            None,
            None,
            CallTimeoutForwardingRule::PerRegistration,
            DisclosurePolicy::default(),
            DisclosureRule::Preset,
            ids,
            Instant::now(),
        )
    }

    fn invoke_options(invoke: &str) -> Object {
        Object::from([("invoke".to_owned(), Variant::from(invoke))])
    }

    #[tokio::test]
    async fn single_policy_rejects_second_callee() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);
        let first = callee(1, &[]);
        let second = callee(2, &[]);

        register(&mut dealer, &mut ids, &first, "com.example.echo", Object::new());
        let err = dealer
            .register(&second, &Uri::new("com.example.echo"), MatchPolicy::Exact, &Object::new(), &mut ids, now())
            .expect_err("single policy must refuse a second callee");
        assert_eq!(err.kind, WampError::ProcedureAlreadyExists);
    }

    #[tokio::test]
    async fn shared_registration_requires_matching_policy() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);

        register(&mut dealer, &mut ids, &callee(1, &[]), "p", invoke_options("roundrobin"));
        let err = dealer
            .register(
                &callee(2, &[]),
                &Uri::new("p"),
                MatchPolicy::Exact,
                &invoke_options("random"),
                &mut ids,
                now(),
            )
            .expect_err("policy mismatch");
        assert_eq!(err.kind, WampError::ProcedureAlreadyExists);
    }

    #[tokio::test]
    async fn round_robin_rotates_in_join_order() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);

        for sid in [1, 2, 3] {
            register(&mut dealer, &mut ids, &callee(sid, &[]), "p", invoke_options("roundrobin"));
        }

        let a = caller(9);
        let mut targets = Vec::new();
        for request_id in 1..=6 {
            let dispatch = plain_call(&mut dealer, &mut ids, &a, request_id, "p", Object::new())
                .unwrap_or_else(|_| panic!("call {request_id} must dispatch"));
            targets.push(dispatch.callee);

            // Resolve each call so request ids do not collide.
            let request = dispatch.invocation.request_id().expect("invocation id");
            let _ = dealer.yield_result(dispatch.callee, request, &Object::new(), None, None);
        }

        assert_eq!(targets, vec![1, 2, 3, 1, 2, 3]);
    }

    #[tokio::test]
    async fn call_without_registration_errors() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);
        let outcome = plain_call(&mut dealer, &mut ids, &caller(9), 1, "nope", Object::new());
        match outcome {
            Err(CallError::Reply(error)) => assert_eq!(error.kind, WampError::NoSuchProcedure),
            _ => panic!("expected no_such_procedure"),
        }
    }

    #[tokio::test]
    async fn duplicate_outstanding_request_id_is_a_violation() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);
        register(&mut dealer, &mut ids, &callee(1, &[]), "p", Object::new());

        let a = caller(9);
        plain_call(&mut dealer, &mut ids, &a, 7, "p", Object::new()).unwrap_or_else(|_| panic!("first call"));
        match plain_call(&mut dealer, &mut ids, &a, 7, "p", Object::new()) {
            Err(CallError::Violation(ProtocolError::RequestIdInUse { request_id: 7 })) => {}
            _ => panic!("expected request-id-in-use violation"),
        }
    }

    #[tokio::test]
    async fn timeout_is_forwarded_per_registration_flag() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);

        let forwarding = callee(1, &[]);
        register(
            &mut dealer,
            &mut ids,
            &forwarding,
            "rpc1",
            Object::from([("forward_timeouts".to_owned(), Variant::Bool(true))]),
        );
        register(&mut dealer, &mut ids, &callee(2, &[]), "rpc2", Object::new());

        let a = caller(9);
        let timeout = Object::from([("timeout".to_owned(), Variant::UInt(10))]);

        let forwarded = plain_call(&mut dealer, &mut ids, &a, 1, "rpc1", timeout.clone())
            .unwrap_or_else(|_| panic!("rpc1 call"));
        let Message::Invocation { details, .. } = &forwarded.invocation else {
            panic!("expected invocation");
        };
        assert_eq!(details.get("timeout"), Some(&Variant::UInt(10)));
        assert!(dealer.next_deadline().is_none(), "forwarded timeouts are not armed");

        let routed = plain_call(&mut dealer, &mut ids, &a, 2, "rpc2", timeout)
            .unwrap_or_else(|_| panic!("rpc2 call"));
        let Message::Invocation { details, .. } = &routed.invocation else {
            panic!("expected invocation");
        };
        assert!(!details.contains_key("timeout"));
        assert!(dealer.next_deadline().is_some(), "router must arm the deadline");
    }

    #[tokio::test]
    async fn timeout_is_forwarded_per_feature_flag() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);
        register(&mut dealer, &mut ids, &callee(1, &[("call_timeout", true)]), "p", Object::new());

        let dispatch = dealer
            .call(
                &caller(9),
                1,
                &Uri::new("p"),
                &Object::from([("timeout".to_owned(), Variant::UInt(25))]),
                None,
                None,
                CallTimeoutForwardingRule::PerFeature,
                DisclosurePolicy::default(),
                DisclosureRule::Preset,
                &mut ids,
                Instant::now(),
            )
            .unwrap_or_else(|_| panic!("call"));
        let Message::Invocation { details, .. } = &dispatch.invocation else {
            panic!("expected invocation");
        };
        assert_eq!(details.get("timeout"), Some(&Variant::UInt(25)));
    }

    #[tokio::test]
    async fn expiry_discards_the_call_and_interrupts_the_callee() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);
        register(&mut dealer, &mut ids, &callee(1, &[]), "p", Object::new());

        let start = Instant::now();
        let a = caller(9);
        dealer
            .call(
                &a,
                1,
                &Uri::new("p"),
                &Object::from([("timeout".to_owned(), Variant::UInt(10))]),
                None,
                None,
                CallTimeoutForwardingRule::Never,
                DisclosurePolicy::default(),
                DisclosureRule::Preset,
                &mut ids,
                start,
            )
            .unwrap_or_else(|_| panic!("call"));

        assert!(dealer.expire(start).is_empty());
        let expired = dealer.expire(start + Duration::from_millis(11));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].caller, 9);
        assert_eq!(expired[0].caller_request_id, 1);

        // The caller slot is free again; a late YIELD is swallowed.
        let (callee_sid, interrupt) = &expired[0].interrupt;
        let request_id = interrupt.request_id().expect("interrupt id");
        let outcome = dealer
            .yield_result(*callee_sid, request_id, &Object::new(), None, None)
            .expect("late yield");
        assert!(matches!(outcome, ReplyOutcome::Discarded));
        assert!(!dealer.has_pending());
    }

    #[tokio::test]
    async fn progressive_results_flow_until_terminal() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);
        register(
            &mut dealer,
            &mut ids,
            &callee(1, &[("progressive_call_results", true)]),
            "p",
            Object::new(),
        );

        let dispatch = plain_call(
            &mut dealer,
            &mut ids,
            &caller(9),
            1,
            "p",
            Object::from([("receive_progress".to_owned(), Variant::Bool(true))]),
        )
        .unwrap_or_else(|_| panic!("call"));
        let Message::Invocation { request_id, details, .. } = &dispatch.invocation else {
            panic!("expected invocation");
        };
        assert_eq!(details.get("receive_progress"), Some(&Variant::Bool(true)));

        let progress_options = Object::from([("progress".to_owned(), Variant::Bool(true))]);
        let first = dealer
            .yield_result(1, *request_id, &progress_options, None, None)
            .expect("progressive yield");
        let ReplyOutcome::Forward { message, .. } = first else {
            panic!("expected forward");
        };
        let Message::Result { details, .. } = message else {
            panic!("expected result");
        };
        assert_eq!(details.get("progress"), Some(&Variant::Bool(true)));
        assert!(dealer.has_pending());

        let terminal = dealer
            .yield_result(1, *request_id, &Object::new(), None, None)
            .expect("terminal yield");
        assert!(matches!(terminal, ReplyOutcome::Forward { .. }));
        assert!(!dealer.has_pending());
    }

    #[tokio::test]
    async fn unsolicited_progress_is_a_violation() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);
        register(&mut dealer, &mut ids, &callee(1, &[]), "p", Object::new());

        let dispatch = plain_call(&mut dealer, &mut ids, &caller(9), 1, "p", Object::new())
            .unwrap_or_else(|_| panic!("call"));
        let request_id = dispatch.invocation.request_id().expect("invocation id");

        let progress_options = Object::from([("progress".to_owned(), Variant::Bool(true))]);
        let err = dealer
            .yield_result(1, request_id, &progress_options, None, None)
            .expect_err("caller never asked for progress");
        assert!(matches!(err, ProtocolError::UnsolicitedProgress { .. }));
    }

    #[tokio::test]
    async fn cancel_modes() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);
        register(&mut dealer, &mut ids, &callee(1, &[]), "p", Object::new());
        let a = caller(9);

        // skip: caller answered immediately, callee left alone.
        plain_call(&mut dealer, &mut ids, &a, 1, "p", Object::new()).unwrap_or_else(|_| panic!("call"));
        let outcome = dealer.cancel(9, 1, CancelMode::Skip).expect("cancelable");
        assert!(outcome.interrupt.is_none());
        assert!(outcome.reply.is_some());

        // killnowait: caller answered immediately, callee interrupted.
        plain_call(&mut dealer, &mut ids, &a, 2, "p", Object::new()).unwrap_or_else(|_| panic!("call"));
        let outcome = dealer.cancel(9, 2, CancelMode::KillNoWait).expect("cancelable");
        assert!(outcome.interrupt.is_some());
        assert!(outcome.reply.is_some());

        // kill: callee interrupted, caller waits for the callee's reply.
        plain_call(&mut dealer, &mut ids, &a, 3, "p", Object::new()).unwrap_or_else(|_| panic!("call"));
        let outcome = dealer.cancel(9, 3, CancelMode::Kill).expect("cancelable");
        let (callee_sid, interrupt) = outcome.interrupt.expect("interrupt");
        assert!(outcome.reply.is_none());

        let request_id = interrupt.request_id().expect("interrupt id");
        let reply = dealer
            .error_result(
                callee_sid,
                request_id,
                Object::new(),
                WampError::Canceled.uri().to_owned(),
                None,
                None,
            )
            .expect("callee reply");
        match reply {
            ReplyOutcome::Forward { caller, message } => {
                assert_eq!(caller, 9);
                let Message::Error { request_id, error, .. } = message else {
                    panic!("expected error reply");
                };
                assert_eq!(request_id, 3);
                assert_eq!(error, WampError::Canceled.uri());
            }
            ReplyOutcome::Discarded => panic!("kill-mode reply must reach the caller"),
        }

        // A second cancel of a completed call has nothing to do.
        assert!(dealer.cancel(9, 3, CancelMode::Kill).is_none());
    }

    #[tokio::test]
    async fn callee_disconnect_cancels_outstanding_calls() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);
        register(&mut dealer, &mut ids, &callee(1, &[]), "p", Object::new());

        plain_call(&mut dealer, &mut ids, &caller(9), 1, "p", Object::new())
            .unwrap_or_else(|_| panic!("call"));

        let removal = dealer.remove_callee(1);
        assert_eq!(
            removal.canceled,
            vec![CanceledCall {
                caller: 9,
                caller_request_id: 1
            }]
        );
        assert_eq!(removal.unregistered.len(), 1);
        assert!(removal.unregistered[0].deleted);
        assert!(dealer.registration(removal.unregistered[0].details.id).is_none());
        assert!(dealer.match_best(&Uri::new("p")).is_none());
    }

    #[tokio::test]
    async fn caller_disconnect_interrupts_the_callee() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);
        register(&mut dealer, &mut ids, &callee(1, &[]), "p", Object::new());

        plain_call(&mut dealer, &mut ids, &caller(9), 1, "p", Object::new())
            .unwrap_or_else(|_| panic!("call"));

        let interrupts = dealer.remove_caller(9);
        assert_eq!(interrupts.len(), 1);
        assert_eq!(interrupts[0].0, 1);

        // The callee's eventual YIELD is swallowed.
        let request_id = interrupts[0].1.request_id().expect("interrupt id");
        let outcome = dealer
            .yield_result(1, request_id, &Object::new(), None, None)
            .expect("late yield");
        assert!(matches!(outcome, ReplyOutcome::Discarded));
    }

    #[tokio::test]
    async fn best_match_prefers_exact_then_longest_prefix() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);

        let exact = dealer
            .register(&callee(1, &[]), &Uri::new("a.b.c"), MatchPolicy::Exact, &Object::new(), &mut ids, now())
            .expect("register")
            .registration_id;
        let short_prefix = dealer
            .register(&callee(2, &[]), &Uri::new("a"), MatchPolicy::Prefix, &Object::new(), &mut ids, now())
            .expect("register")
            .registration_id;
        let long_prefix = dealer
            .register(&callee(3, &[]), &Uri::new("a.b"), MatchPolicy::Prefix, &Object::new(), &mut ids, now())
            .expect("register")
            .registration_id;
        let wildcard = dealer
            .register(&callee(4, &[]), &Uri::new("a..d"), MatchPolicy::Wildcard, &Object::new(), &mut ids, now())
            .expect("register")
            .registration_id;

        assert_eq!(dealer.match_best(&Uri::new("a.b.c")), Some(exact));
        assert_eq!(dealer.match_best(&Uri::new("a.b.x")), Some(long_prefix));
        assert_eq!(dealer.match_best(&Uri::new("a.x")), Some(short_prefix));
        assert_eq!(dealer.match_best(&Uri::new("a.b.d")), Some(long_prefix), "prefix beats wildcard");
        assert_eq!(dealer.match_best(&Uri::new("b.c.d")), None);
        let _ = wildcard;
    }

    #[tokio::test]
    async fn wildcard_match_applies_when_no_prefix_covers() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);
        let wildcard = dealer
            .register(&callee(4, &[]), &Uri::new("a..d"), MatchPolicy::Wildcard, &Object::new(), &mut ids, now())
            .expect("register")
            .registration_id;
        assert_eq!(dealer.match_best(&Uri::new("a.x.d")), Some(wildcard));
        assert_eq!(dealer.match_best(&Uri::new("a.x.e")), None);
    }

    #[tokio::test]
    async fn caller_disclosure_fields_follow_resolution() {
        let mut dealer = Dealer::new();
        let mut ids = RandomIdGenerator::from_seed(3);
        register(&mut dealer, &mut ids, &callee(1, &[]), "p", Object::new());

        let a = caller(9);
        let dispatch = plain_call(
            &mut dealer,
            &mut ids,
            &a,
            1,
            "p",
            Object::from([("disclose_me".to_owned(), Variant::Bool(true))]),
        )
        .unwrap_or_else(|_| panic!("call"));
        let Message::Invocation { details, .. } = &dispatch.invocation else {
            panic!("expected invocation");
        };
        assert_eq!(details.get("caller"), Some(&Variant::UInt(9)));
        assert_eq!(details.get("caller_authid"), Some(&Variant::from("user-9")));

        let concealed = plain_call(&mut dealer, &mut ids, &a, 2, "p", Object::new())
            .unwrap_or_else(|_| panic!("call"));
        let Message::Invocation { details, .. } = &concealed.invocation else {
            panic!("expected invocation");
        };
        assert!(!details.contains_key("caller"));
    }
}
