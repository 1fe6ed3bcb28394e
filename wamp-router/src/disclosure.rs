//! Originator disclosure rules and their resolution.
//!
//! Whether a caller or publisher identity is revealed to the consumer is
//! decided from the realm policy, an optional per-authorization override,
//! the originator's `disclose_me` request and the consumer's
//! `disclose_caller`/`disclose_publisher` request.

use serde::{Deserialize, Serialize};

use crate::error::WampError;

/// Disclosure rule vocabulary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisclosureRule {
    /// Defer to the next policy level; at the realm level this means
    /// `producer`.
    #[default]
    Preset,
    /// Disclosed iff the originator requested it.
    Producer,
    /// Disclosed iff the consumer requested it.
    Consumer,
    /// Disclosed iff either side requested it.
    Either,
    /// Disclosed iff both sides requested it.
    Both,
    /// Always disclosed.
    Reveal,
    /// Never disclosed.
    Conceal,
}

/// A realm-level disclosure policy: the rule plus strictness.
///
/// Under a strict policy, an originator asking to be revealed while the rule
/// categorically forbids it is an error instead of a silent conceal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisclosurePolicy {
    pub rule: DisclosureRule,
    pub strict: bool,
}

impl DisclosurePolicy {
    pub fn new(rule: DisclosureRule) -> Self {
        DisclosurePolicy { rule, strict: false }
    }

    pub fn strict(rule: DisclosureRule) -> Self {
        DisclosurePolicy { rule, strict: true }
    }
}

/// Computes the effective disclosure decision.
///
/// `authorization_override` is the rule attached to an [`Authorization`] by
/// an authorizer, `Preset` meaning "use the realm policy".
///
/// [`Authorization`]: crate::authorizer::Authorization
pub fn resolve(
    policy: DisclosurePolicy,
    authorization_override: DisclosureRule,
    producer_requested: bool,
    consumer_requested: bool,
) -> Result<bool, WampError> {
    let mut rule = match authorization_override {
        DisclosureRule::Preset => policy.rule,
        other => other,
    };
    if rule == DisclosureRule::Preset {
        rule = DisclosureRule::Producer;
    }

    // Conceal is the one rule under which no originator request can ever
    // succeed, so it is the one strictness rejects.
    if policy.strict && producer_requested && rule == DisclosureRule::Conceal {
        return Err(WampError::DiscloseMeDisallowed);
    }

    let disclosed = match rule {
        DisclosureRule::Preset => unreachable!("preset was mapped above"),
        DisclosureRule::Producer => producer_requested,
        DisclosureRule::Consumer => consumer_requested,
        DisclosureRule::Either => producer_requested || consumer_requested,
        DisclosureRule::Both => producer_requested && consumer_requested,
        DisclosureRule::Reveal => true,
        DisclosureRule::Conceal => false,
    };

    Ok(disclosed)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(DisclosureRule::Reveal, false, false, true)]
    #[case(DisclosureRule::Conceal, true, true, false)]
    #[case(DisclosureRule::Producer, true, false, true)]
    #[case(DisclosureRule::Producer, false, true, false)]
    #[case(DisclosureRule::Consumer, false, true, true)]
    #[case(DisclosureRule::Consumer, true, false, false)]
    #[case(DisclosureRule::Either, true, false, true)]
    #[case(DisclosureRule::Either, false, false, false)]
    #[case(DisclosureRule::Both, true, true, true)]
    #[case(DisclosureRule::Both, true, false, false)]
    fn rule_resolution(
        #[case] rule: DisclosureRule,
        #[case] producer: bool,
        #[case] consumer: bool,
        #[case] expected: bool,
    ) {
        let policy = DisclosurePolicy::new(rule);
        assert_eq!(resolve(policy, DisclosureRule::Preset, producer, consumer), Ok(expected));
    }

    #[test]
    fn realm_preset_means_producer() {
        let policy = DisclosurePolicy::default();
        assert_eq!(resolve(policy, DisclosureRule::Preset, true, false), Ok(true));
        assert_eq!(resolve(policy, DisclosureRule::Preset, false, false), Ok(false));
    }

    #[test]
    fn authorization_override_takes_precedence() {
        let policy = DisclosurePolicy::new(DisclosureRule::Conceal);
        assert_eq!(resolve(policy, DisclosureRule::Reveal, false, false), Ok(true));
    }

    #[test]
    fn strict_conceal_rejects_disclose_me() {
        let policy = DisclosurePolicy::strict(DisclosureRule::Conceal);
        assert_eq!(
            resolve(policy, DisclosureRule::Preset, true, false),
            Err(WampError::DiscloseMeDisallowed)
        );
        // Without the originator request there is nothing to reject.
        assert_eq!(resolve(policy, DisclosureRule::Preset, false, true), Ok(false));
        // Lenient conceal silently conceals.
        let lenient = DisclosurePolicy::new(DisclosureRule::Conceal);
        assert_eq!(resolve(lenient, DisclosureRule::Preset, true, false), Ok(false));
    }
}
