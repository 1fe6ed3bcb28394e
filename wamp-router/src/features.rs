//! Role feature announcements as typed bitflags.
//!
//! HELLO carries a `roles` dictionary announcing per-role features; WELCOME
//! answers with the router's. Each role gets its own flag set so feature
//! checks are plain bit tests. Unknown feature names are ignored; the legacy
//! spellings `progressive_calls` and `call_cancelling` are accepted on input
//! only.

use bitflags::{Flags, bitflags};
use wamp_proto::{Object, Variant};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CalleeFeatures: u16 {
        /// The role dictionary was present at all.
        const BASIC = 1 << 0;
        const CALL_CANCELING = 1 << 1;
        const CALL_TIMEOUT = 1 << 2;
        const CALL_TRUSTLEVELS = 1 << 3;
        const CALLER_IDENTIFICATION = 1 << 4;
        const PATTERN_BASED_REGISTRATION = 1 << 5;
        const PROGRESSIVE_CALL_INVOCATIONS = 1 << 6;
        const PROGRESSIVE_CALL_RESULTS = 1 << 7;
        const SHARED_REGISTRATION = 1 << 8;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CallerFeatures: u16 {
        const BASIC = 1 << 0;
        const CALL_CANCELING = 1 << 1;
        const CALL_TIMEOUT = 1 << 2;
        const CALLER_IDENTIFICATION = 1 << 3;
        const PROGRESSIVE_CALL_INVOCATIONS = 1 << 4;
        const PROGRESSIVE_CALL_RESULTS = 1 << 5;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PublisherFeatures: u16 {
        const BASIC = 1 << 0;
        const PUBLISHER_EXCLUSION = 1 << 1;
        const PUBLISHER_IDENTIFICATION = 1 << 2;
        const SUBSCRIBER_BLACKWHITE_LISTING = 1 << 3;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SubscriberFeatures: u16 {
        const BASIC = 1 << 0;
        const PATTERN_BASED_SUBSCRIPTION = 1 << 1;
        const PUBLICATION_TRUSTLEVELS = 1 << 2;
        const PUBLISHER_IDENTIFICATION = 1 << 3;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BrokerFeatures: u16 {
        const BASIC = 1 << 0;
        const PATTERN_BASED_SUBSCRIPTION = 1 << 1;
        const PUBLICATION_TRUSTLEVELS = 1 << 2;
        const PUBLISHER_EXCLUSION = 1 << 3;
        const PUBLISHER_IDENTIFICATION = 1 << 4;
        const SESSION_META_API = 1 << 5;
        const SUBSCRIBER_BLACKWHITE_LISTING = 1 << 6;
        const SUBSCRIPTION_META_API = 1 << 7;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DealerFeatures: u16 {
        const BASIC = 1 << 0;
        const CALL_CANCELING = 1 << 1;
        const CALL_TIMEOUT = 1 << 2;
        const CALL_TRUSTLEVELS = 1 << 3;
        const CALLER_IDENTIFICATION = 1 << 4;
        const PROGRESSIVE_CALL_INVOCATIONS = 1 << 5;
        const PROGRESSIVE_CALL_RESULTS = 1 << 6;
        const REGISTRATION_META_API = 1 << 7;
        const SESSION_META_API = 1 << 8;
        const SHARED_REGISTRATION = 1 << 9;
    }
}

const CALLEE_TABLE: &[(&str, CalleeFeatures)] = &[
    ("call_canceling", CalleeFeatures::CALL_CANCELING),
    ("call_timeout", CalleeFeatures::CALL_TIMEOUT),
    ("call_trustlevels", CalleeFeatures::CALL_TRUSTLEVELS),
    ("caller_identification", CalleeFeatures::CALLER_IDENTIFICATION),
    ("pattern_based_registration", CalleeFeatures::PATTERN_BASED_REGISTRATION),
    ("progressive_call_invocations", CalleeFeatures::PROGRESSIVE_CALL_INVOCATIONS),
    ("progressive_call_results", CalleeFeatures::PROGRESSIVE_CALL_RESULTS),
    ("shared_registration", CalleeFeatures::SHARED_REGISTRATION),
    // Legacy spellings, input only.
    ("progressive_calls", CalleeFeatures::PROGRESSIVE_CALL_INVOCATIONS),
    ("call_cancelling", CalleeFeatures::CALL_CANCELING),
];

const CALLER_TABLE: &[(&str, CallerFeatures)] = &[
    ("call_canceling", CallerFeatures::CALL_CANCELING),
    ("call_timeout", CallerFeatures::CALL_TIMEOUT),
    ("caller_identification", CallerFeatures::CALLER_IDENTIFICATION),
    ("progressive_call_invocations", CallerFeatures::PROGRESSIVE_CALL_INVOCATIONS),
    ("progressive_call_results", CallerFeatures::PROGRESSIVE_CALL_RESULTS),
    // Legacy spellings, input only.
    ("progressive_calls", CallerFeatures::PROGRESSIVE_CALL_INVOCATIONS),
    ("call_cancelling", CallerFeatures::CALL_CANCELING),
];

const PUBLISHER_TABLE: &[(&str, PublisherFeatures)] = &[
    ("publisher_exclusion", PublisherFeatures::PUBLISHER_EXCLUSION),
    ("publisher_identification", PublisherFeatures::PUBLISHER_IDENTIFICATION),
    ("subscriber_blackwhite_listing", PublisherFeatures::SUBSCRIBER_BLACKWHITE_LISTING),
];

const SUBSCRIBER_TABLE: &[(&str, SubscriberFeatures)] = &[
    ("pattern_based_subscription", SubscriberFeatures::PATTERN_BASED_SUBSCRIPTION),
    ("publication_trustlevels", SubscriberFeatures::PUBLICATION_TRUSTLEVELS),
    ("publisher_identification", SubscriberFeatures::PUBLISHER_IDENTIFICATION),
];

const BROKER_TABLE: &[(&str, BrokerFeatures)] = &[
    ("pattern_based_subscription", BrokerFeatures::PATTERN_BASED_SUBSCRIPTION),
    ("publication_trustlevels", BrokerFeatures::PUBLICATION_TRUSTLEVELS),
    ("publisher_exclusion", BrokerFeatures::PUBLISHER_EXCLUSION),
    ("publisher_identification", BrokerFeatures::PUBLISHER_IDENTIFICATION),
    ("session_meta_api", BrokerFeatures::SESSION_META_API),
    ("subscriber_blackwhite_listing", BrokerFeatures::SUBSCRIBER_BLACKWHITE_LISTING),
    ("subscription_meta_api", BrokerFeatures::SUBSCRIPTION_META_API),
];

const DEALER_TABLE: &[(&str, DealerFeatures)] = &[
    ("call_canceling", DealerFeatures::CALL_CANCELING),
    ("call_timeout", DealerFeatures::CALL_TIMEOUT),
    ("call_trustlevels", DealerFeatures::CALL_TRUSTLEVELS),
    ("caller_identification", DealerFeatures::CALLER_IDENTIFICATION),
    ("progressive_call_invocations", DealerFeatures::PROGRESSIVE_CALL_INVOCATIONS),
    ("progressive_call_results", DealerFeatures::PROGRESSIVE_CALL_RESULTS),
    ("registration_meta_api", DealerFeatures::REGISTRATION_META_API),
    ("session_meta_api", DealerFeatures::SESSION_META_API),
    ("shared_registration", DealerFeatures::SHARED_REGISTRATION),
];

fn features_dict<'a>(roles: &'a Object, role: &str) -> Option<&'a Object> {
    roles.get(role)?.as_object()?.get("features")?.as_object()
}

fn parse_flags<F>(roles: &Object, role: &str, basic: F, table: &[(&str, F)]) -> F
where
    F: Flags + Copy,
{
    let mut flags = F::empty();
    let Some(role_dict) = roles.get(role).and_then(Variant::as_object) else {
        return flags;
    };
    // Announcing the role at all sets the role's BASIC bit.
    flags.insert(basic);
    if let Some(dict) = role_dict.get("features").and_then(Variant::as_object) {
        for (name, flag) in table {
            if dict.get(*name).is_some_and(Variant::truthy) {
                flags.insert(*flag);
            }
        }
    }
    flags
}

fn emit_flags<F>(flags: F, table: &[(&str, F)], emitted: &mut Object)
where
    F: Flags + Copy,
{
    for (name, flag) in table {
        if flags.contains(*flag) && !emitted.contains_key(*name) {
            emitted.insert((*name).to_owned(), Variant::Bool(true));
        }
    }
}

/// Features announced by a client, one flag set per client role.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientFeatures {
    pub callee: CalleeFeatures,
    pub caller: CallerFeatures,
    pub publisher: PublisherFeatures,
    pub subscriber: SubscriberFeatures,
}

impl ClientFeatures {
    /// Parses a HELLO `roles` dictionary. Unknown roles and unknown feature
    /// names are ignored.
    pub fn parse(roles: &Object) -> Self {
        ClientFeatures {
            callee: parse_flags(roles, "callee", CalleeFeatures::BASIC, CALLEE_TABLE),
            caller: parse_flags(roles, "caller", CallerFeatures::BASIC, CALLER_TABLE),
            publisher: parse_flags(roles, "publisher", PublisherFeatures::BASIC, PUBLISHER_TABLE),
            subscriber: parse_flags(roles, "subscriber", SubscriberFeatures::BASIC, SUBSCRIBER_TABLE),
        }
    }

    /// True iff every flag of `required` is announced.
    pub fn supports(&self, required: ClientFeatures) -> bool {
        self.callee.contains(required.callee)
            && self.caller.contains(required.caller)
            && self.publisher.contains(required.publisher)
            && self.subscriber.contains(required.subscriber)
    }
}

/// Features the router itself provides and advertises in WELCOME.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouterFeatures {
    pub broker: BrokerFeatures,
    pub dealer: DealerFeatures,
}

impl RouterFeatures {
    pub fn provided() -> Self {
        RouterFeatures {
            broker: BrokerFeatures::all(),
            dealer: DealerFeatures::all(),
        }
    }

    pub fn supports(&self, required: RouterFeatures) -> bool {
        self.broker.contains(required.broker) && self.dealer.contains(required.dealer)
    }

    /// Emits the `roles` dictionary advertised in WELCOME details.
    pub fn roles_dict(&self) -> Object {
        let mut roles = Object::new();

        let mut broker_features = Object::new();
        emit_flags(self.broker, BROKER_TABLE, &mut broker_features);
        roles.insert(
            "broker".to_owned(),
            Variant::Object(Object::from([(
                "features".to_owned(),
                Variant::Object(broker_features),
            )])),
        );

        let mut dealer_features = Object::new();
        emit_flags(self.dealer, DEALER_TABLE, &mut dealer_features);
        roles.insert(
            "dealer".to_owned(),
            Variant::Object(Object::from([(
                "features".to_owned(),
                Variant::Object(dealer_features),
            )])),
        );

        roles
    }
}

impl Default for RouterFeatures {
    fn default() -> Self {
        Self::provided()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles_with(role: &str, features: &[(&str, bool)]) -> Object {
        let mut dict = Object::new();
        for (name, value) in features {
            dict.insert((*name).to_owned(), Variant::Bool(*value));
        }
        Object::from([(
            role.to_owned(),
            Variant::Object(Object::from([("features".to_owned(), Variant::Object(dict))])),
        )])
    }

    #[test]
    fn parses_announced_features() {
        let roles = roles_with("callee", &[("call_timeout", true), ("progressive_call_results", true)]);
        let features = ClientFeatures::parse(&roles);

        assert!(features.callee.contains(CalleeFeatures::BASIC));
        assert!(features.callee.contains(CalleeFeatures::CALL_TIMEOUT));
        assert!(features.callee.contains(CalleeFeatures::PROGRESSIVE_CALL_RESULTS));
        assert!(!features.callee.contains(CalleeFeatures::CALL_CANCELING));
        assert!(!features.caller.contains(CallerFeatures::BASIC));
    }

    #[test]
    fn falsy_feature_values_are_not_announced() {
        let roles = roles_with("caller", &[("call_timeout", false)]);
        let features = ClientFeatures::parse(&roles);
        assert!(!features.caller.contains(CallerFeatures::CALL_TIMEOUT));
    }

    #[test]
    fn legacy_aliases_are_accepted_on_input() {
        let roles = roles_with("caller", &[("progressive_calls", true), ("call_cancelling", true)]);
        let features = ClientFeatures::parse(&roles);

        assert!(features.caller.contains(CallerFeatures::PROGRESSIVE_CALL_INVOCATIONS));
        assert!(features.caller.contains(CallerFeatures::CALL_CANCELING));
    }

    #[test]
    fn unknown_features_are_ignored() {
        let roles = roles_with("subscriber", &[("sharded_subscription", true)]);
        let features = ClientFeatures::parse(&roles);
        assert_eq!(
            features.subscriber,
            SubscriberFeatures::BASIC,
            "only the role announcement itself should register"
        );
    }

    #[test]
    fn supports_requires_all_flags() {
        let announced = ClientFeatures::parse(&roles_with("caller", &[("call_timeout", true)]));
        let mut required = ClientFeatures::default();
        required.caller = CallerFeatures::CALL_TIMEOUT;
        assert!(announced.supports(required));

        required.caller |= CallerFeatures::CALL_CANCELING;
        assert!(!announced.supports(required));
    }

    #[test]
    fn advertised_roles_never_use_legacy_spellings() {
        let roles = RouterFeatures::provided().roles_dict();
        let dealer = roles["dealer"].as_object().expect("dealer role");
        let features = dealer["features"].as_object().expect("features");

        assert!(features.contains_key("progressive_call_invocations"));
        assert!(!features.contains_key("progressive_calls"));
        assert!(features.contains_key("call_canceling"));
        assert!(!features.contains_key("call_cancelling"));
    }
}
