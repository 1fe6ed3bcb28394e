//! The per-realm broker: the subscription side of publish/subscribe.
//!
//! The broker owns the subscription index and subscriber bookkeeping. Event
//! fan-out (disclosure, per-subscriber EVENT construction) happens on the
//! realm task, which owns the session records; the subscriber filtering
//! rules live here as [`EventFilter`].

use std::collections::{BTreeMap, HashMap, HashSet};

use time::OffsetDateTime;
use wamp_proto::{Object, Variant};

use crate::error::{InteractionError, WampError};
use crate::ids::{RandomIdGenerator, SessionId, SubscriptionId};
use crate::trie::UriMatchIndex;
use crate::uri::{MatchPolicy, Uri};

/// Per-subscriber options recorded at SUBSCRIBE time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SubscriberOptions {
    /// The subscriber asked for publisher disclosure.
    pub disclose_publisher: bool,
}

impl SubscriberOptions {
    pub(crate) fn parse(options: &Object) -> Self {
        SubscriberOptions {
            disclose_publisher: options.get("disclose_publisher").is_some_and(Variant::truthy),
        }
    }
}

/// A shared subscription: all sessions subscribing to the same
/// `(uri, policy)` pair share one subscription id.
#[derive(Clone, Debug)]
pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub uri: Uri,
    pub policy: MatchPolicy,
    pub created: OffsetDateTime,
    pub subscribers: BTreeMap<SessionId, SubscriberOptions>,
}

/// Introspection snapshot handed to observers, the meta-API and the
/// authorizer uncache hooks.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionDetails {
    pub id: SubscriptionId,
    pub uri: Uri,
    pub match_policy: MatchPolicy,
    pub created: OffsetDateTime,
    pub subscribers: Vec<SessionId>,
}

impl Subscription {
    fn details(&self) -> SubscriptionDetails {
        SubscriptionDetails {
            id: self.id,
            uri: self.uri.clone(),
            match_policy: self.policy,
            created: self.created,
            subscribers: self.subscribers.keys().copied().collect(),
        }
    }
}

/// Subscription ids grouped by match policy, as the meta-API reports them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionLists {
    pub exact: Vec<SubscriptionId>,
    pub prefix: Vec<SubscriptionId>,
    pub wildcard: Vec<SubscriptionId>,
}

#[derive(Debug)]
pub(crate) struct SubscribeOutcome {
    pub subscription_id: SubscriptionId,
    /// First subscriber created the subscription.
    pub created: bool,
    pub details: SubscriptionDetails,
}

#[derive(Debug)]
pub(crate) struct UnsubscribeOutcome {
    /// Snapshot taken after the subscriber was removed.
    pub details: SubscriptionDetails,
    /// Last subscriber left; the subscription is gone from the index.
    pub deleted: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Broker {
    index: UriMatchIndex<SubscriptionId>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl Broker {
    pub(crate) fn new() -> Self {
        Broker::default()
    }

    pub(crate) fn subscribe(
        &mut self,
        session_id: SessionId,
        uri: &Uri,
        policy: MatchPolicy,
        options: SubscriberOptions,
        ids: &mut RandomIdGenerator,
        now: OffsetDateTime,
    ) -> SubscribeOutcome {
        if let Some(&existing) = self.index.find_pattern(uri, policy) {
            let subscription = self
                .subscriptions
                .get_mut(&existing)
                .expect("indexed subscription must exist");
            subscription.subscribers.insert(session_id, options);
            return SubscribeOutcome {
                subscription_id: existing,
                created: false,
                details: subscription.details(),
            };
        }

        let id = ids.next_free(|candidate| self.subscriptions.contains_key(&candidate));
        let mut subscription = Subscription {
            id,
            uri: uri.clone(),
            policy,
            created: now,
            subscribers: BTreeMap::new(),
        };
        subscription.subscribers.insert(session_id, options);
        let details = subscription.details();

        self.index
            .insert(uri, policy, id)
            .unwrap_or_else(|_| unreachable!("pattern slot was checked to be vacant"));
        self.subscriptions.insert(id, subscription);

        SubscribeOutcome {
            subscription_id: id,
            created: true,
            details,
        }
    }

    pub(crate) fn unsubscribe(
        &mut self,
        session_id: SessionId,
        subscription_id: SubscriptionId,
    ) -> Result<UnsubscribeOutcome, InteractionError> {
        let subscription = self
            .subscriptions
            .get_mut(&subscription_id)
            .ok_or(WampError::NoSuchSubscription)?;
        if subscription.subscribers.remove(&session_id).is_none() {
            return Err(WampError::NoSuchSubscription.into());
        }

        let details = subscription.details();
        let deleted = subscription.subscribers.is_empty();
        if deleted {
            let (uri, policy) = (subscription.uri.clone(), subscription.policy);
            self.subscriptions.remove(&subscription_id);
            self.index.remove(&uri, policy);
        }

        Ok(UnsubscribeOutcome { details, deleted })
    }

    /// Drops a leaving session from every subscription. Returns the
    /// affected snapshots with their deletion flags.
    pub(crate) fn remove_session(&mut self, session_id: SessionId) -> Vec<UnsubscribeOutcome> {
        let affected: Vec<SubscriptionId> = self
            .subscriptions
            .values()
            .filter(|s| s.subscribers.contains_key(&session_id))
            .map(|s| s.id)
            .collect();

        affected
            .into_iter()
            .filter_map(|id| self.unsubscribe(session_id, id).ok())
            .collect()
    }

    pub(crate) fn subscription(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    pub(crate) fn details(&self, id: SubscriptionId) -> Option<SubscriptionDetails> {
        self.subscriptions.get(&id).map(Subscription::details)
    }

    /// Subscriptions matching a published topic, deterministically ordered
    /// exact → prefix → wildcard.
    pub(crate) fn matches(&self, topic: &Uri) -> Vec<&Subscription> {
        self.index
            .find_matching(topic)
            .filter_map(|id| self.subscriptions.get(id))
            .collect()
    }

    /// The subscription holding exactly this `(uri, policy)` pattern.
    pub(crate) fn lookup(&self, uri: &Uri, policy: MatchPolicy) -> Option<SubscriptionId> {
        self.index.find_pattern(uri, policy).copied()
    }

    pub(crate) fn list_ids(&self) -> SubscriptionLists {
        let mut lists = SubscriptionLists::default();
        self.index.for_each(MatchPolicy::Exact, |_, id| lists.exact.push(*id));
        self.index.for_each(MatchPolicy::Prefix, |_, id| lists.prefix.push(*id));
        self.index
            .for_each(MatchPolicy::Wildcard, |_, id| lists.wildcard.push(*id));
        lists
    }

    pub(crate) fn match_ids(&self, topic: &Uri) -> Vec<SubscriptionId> {
        self.index.find_matching(topic).copied().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.index = UriMatchIndex::new();
        self.subscriptions.clear();
    }
}

/// The subscriber black/white-listing rules of a PUBLISH, applied in
/// specification order: eligibility first, then exclusions, then publisher
/// self-exclusion.
#[derive(Clone, Debug, Default)]
pub(crate) struct EventFilter {
    eligible: Option<HashSet<SessionId>>,
    eligible_auth_id: Option<HashSet<String>>,
    eligible_auth_role: Option<HashSet<String>>,
    exclude: HashSet<SessionId>,
    exclude_auth_id: HashSet<String>,
    exclude_auth_role: HashSet<String>,
    exclude_me: bool,
}

fn id_set(options: &Object, key: &str) -> Option<HashSet<SessionId>> {
    let list = options.get(key)?.as_array()?;
    Some(list.iter().filter_map(Variant::as_u64).collect())
}

fn string_set(options: &Object, key: &str) -> Option<HashSet<String>> {
    let list = options.get(key)?.as_array()?;
    Some(list.iter().filter_map(Variant::as_str).map(str::to_owned).collect())
}

impl EventFilter {
    pub(crate) fn parse(options: &Object) -> Self {
        EventFilter {
            eligible: id_set(options, "eligible"),
            eligible_auth_id: string_set(options, "eligible_authid"),
            eligible_auth_role: string_set(options, "eligible_authrole"),
            exclude: id_set(options, "exclude").unwrap_or_default(),
            exclude_auth_id: string_set(options, "exclude_authid").unwrap_or_default(),
            exclude_auth_role: string_set(options, "exclude_authrole").unwrap_or_default(),
            exclude_me: options
                .get("exclude_me")
                .map_or(true, Variant::truthy),
        }
    }

    pub(crate) fn admits(
        &self,
        publisher: SessionId,
        subscriber: SessionId,
        auth_id: &str,
        auth_role: &str,
    ) -> bool {
        if let Some(eligible) = &self.eligible {
            if !eligible.contains(&subscriber) {
                return false;
            }
        }
        if let Some(eligible) = &self.eligible_auth_id {
            if !eligible.contains(auth_id) {
                return false;
            }
        }
        if let Some(eligible) = &self.eligible_auth_role {
            if !eligible.contains(auth_role) {
                return false;
            }
        }

        if self.exclude.contains(&subscriber)
            || self.exclude_auth_id.contains(auth_id)
            || self.exclude_auth_role.contains(auth_role)
        {
            return false;
        }

        !(self.exclude_me && subscriber == publisher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    fn subscribe(broker: &mut Broker, ids: &mut RandomIdGenerator, sid: SessionId, uri: &str, policy: MatchPolicy) -> SubscribeOutcome {
        broker.subscribe(sid, &Uri::new(uri), policy, SubscriberOptions::default(), ids, now())
    }

    #[test]
    fn same_pattern_shares_one_subscription() {
        let mut broker = Broker::new();
        let mut ids = RandomIdGenerator::from_seed(1);

        let first = subscribe(&mut broker, &mut ids, 11, "com.example.topic", MatchPolicy::Exact);
        let second = subscribe(&mut broker, &mut ids, 22, "com.example.topic", MatchPolicy::Exact);

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.subscription_id, second.subscription_id);

        // A different policy over the same URI is a distinct subscription.
        let third = subscribe(&mut broker, &mut ids, 11, "com.example.topic", MatchPolicy::Prefix);
        assert!(third.created);
        assert_ne!(third.subscription_id, first.subscription_id);
    }

    #[test]
    fn last_unsubscribe_deletes_the_subscription() {
        let mut broker = Broker::new();
        let mut ids = RandomIdGenerator::from_seed(1);

        let outcome = subscribe(&mut broker, &mut ids, 11, "t", MatchPolicy::Exact);
        subscribe(&mut broker, &mut ids, 22, "t", MatchPolicy::Exact);

        let first = broker.unsubscribe(11, outcome.subscription_id).expect("unsubscribe");
        assert!(!first.deleted);

        let second = broker.unsubscribe(22, outcome.subscription_id).expect("unsubscribe");
        assert!(second.deleted);
        assert!(broker.matches(&Uri::new("t")).is_empty());
        assert!(broker.is_empty());
    }

    #[test]
    fn unsubscribe_of_foreign_subscription_fails() {
        let mut broker = Broker::new();
        let mut ids = RandomIdGenerator::from_seed(1);

        let outcome = subscribe(&mut broker, &mut ids, 11, "t", MatchPolicy::Exact);
        let err = broker.unsubscribe(22, outcome.subscription_id).expect_err("not a subscriber");
        assert_eq!(err.kind, WampError::NoSuchSubscription);
        assert_eq!(broker.unsubscribe(11, 424242).expect_err("bogus id").kind, WampError::NoSuchSubscription);
    }

    #[test]
    fn matches_cover_all_three_policies() {
        let mut broker = Broker::new();
        let mut ids = RandomIdGenerator::from_seed(1);

        subscribe(&mut broker, &mut ids, 1, "com.myapp.on_event", MatchPolicy::Exact);
        subscribe(&mut broker, &mut ids, 2, "com.myapp", MatchPolicy::Prefix);
        subscribe(&mut broker, &mut ids, 3, "com..on_event", MatchPolicy::Wildcard);

        let matched: Vec<&Uri> = broker
            .matches(&Uri::new("com.myapp.on_event"))
            .iter()
            .map(|s| &s.uri)
            .collect();
        assert_eq!(
            matched,
            vec![
                &Uri::new("com.myapp.on_event"),
                &Uri::new("com.myapp"),
                &Uri::new("com..on_event")
            ]
        );
    }

    #[test]
    fn remove_session_reports_deletions() {
        let mut broker = Broker::new();
        let mut ids = RandomIdGenerator::from_seed(1);

        subscribe(&mut broker, &mut ids, 11, "a", MatchPolicy::Exact);
        subscribe(&mut broker, &mut ids, 11, "b", MatchPolicy::Exact);
        subscribe(&mut broker, &mut ids, 22, "b", MatchPolicy::Exact);

        let outcomes = broker.remove_session(11);
        assert_eq!(outcomes.len(), 2);
        let deleted: Vec<bool> = outcomes.iter().map(|o| o.deleted).collect();
        // "a" dies with its only subscriber, "b" survives through 22.
        assert!(deleted.contains(&true));
        assert!(deleted.contains(&false));
        assert_eq!(broker.list_ids().exact.len(), 1);
    }

    #[test]
    fn filter_defaults_exclude_the_publisher() {
        let filter = EventFilter::parse(&Object::new());
        assert!(!filter.admits(7, 7, "alice", "user"));
        assert!(filter.admits(7, 8, "bob", "user"));
    }

    #[test]
    fn filter_exclude_me_false_includes_the_publisher() {
        let options = Object::from([("exclude_me".to_owned(), Variant::Bool(false))]);
        let filter = EventFilter::parse(&options);
        assert!(filter.admits(7, 7, "alice", "user"));
    }

    #[test]
    fn filter_eligibility_is_applied_before_exclusions() {
        let options = Object::from([
            (
                "eligible".to_owned(),
                Variant::Array(vec![Variant::UInt(1), Variant::UInt(2)]),
            ),
            ("exclude".to_owned(), Variant::Array(vec![Variant::UInt(2)])),
        ]);
        let filter = EventFilter::parse(&options);

        assert!(filter.admits(9, 1, "a", "r"));
        assert!(!filter.admits(9, 2, "a", "r")); // eligible but excluded
        assert!(!filter.admits(9, 3, "a", "r")); // not eligible
    }

    #[test]
    fn filter_auth_rules() {
        let options = Object::from([
            (
                "eligible_authrole".to_owned(),
                Variant::Array(vec![Variant::from("admin")]),
            ),
            (
                "exclude_authid".to_owned(),
                Variant::Array(vec![Variant::from("mallory")]),
            ),
        ]);
        let filter = EventFilter::parse(&options);

        assert!(filter.admits(9, 1, "alice", "admin"));
        assert!(!filter.admits(9, 1, "alice", "user"));
        assert!(!filter.admits(9, 1, "mallory", "admin"));
    }
}
