//! Router, realm and server options.
//!
//! Plain-data knobs carry serde derives so embedders can load them from
//! config files; handles to authenticators/authorizers are attached through
//! the `with_*` builders. Defaults follow battle-tested server practice:
//! soft limit 512 / hard limit 768 connections, 1 s monitoring granularity,
//! 30 s negotiation timeouts, 300 s stale timeout, 625 ms..10 s accept
//! backoff.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Authenticator;
use crate::authorizer::Authorizer;
use crate::disclosure::DisclosurePolicy;
use crate::uri::{Uri, UriValidation};
use crate::utils::TimestampPrecision;

/// Determines how call timeouts are forwarded to callees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallTimeoutForwardingRule {
    /// Forward iff the `forward_timeouts` option was set during procedure
    /// registration.
    #[default]
    PerRegistration,
    /// Forward iff the callee announced support for call timeouts under the
    /// `callee` role.
    PerFeature,
    /// Never forward; the router handles every deadline itself.
    Never,
}

/// Per-realm options.
#[derive(Clone)]
pub struct RealmOptions {
    pub uri: Uri,
    pub caller_disclosure: DisclosurePolicy,
    pub publisher_disclosure: DisclosurePolicy,
    pub call_timeout_forwarding: CallTimeoutForwardingRule,
    pub meta_api_enabled: bool,
    pub meta_procedure_registration_allowed: bool,
    pub meta_topic_publication_allowed: bool,
    pub(crate) authorizer: Option<Arc<dyn Authorizer>>,
}

impl RealmOptions {
    pub fn new(uri: impl Into<Uri>) -> Self {
        RealmOptions {
            uri: uri.into(),
            caller_disclosure: DisclosurePolicy::default(),
            publisher_disclosure: DisclosurePolicy::default(),
            call_timeout_forwarding: CallTimeoutForwardingRule::default(),
            meta_api_enabled: false,
            meta_procedure_registration_allowed: false,
            meta_topic_publication_allowed: false,
            authorizer: None,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_caller_disclosure(mut self, policy: DisclosurePolicy) -> Self {
        self.caller_disclosure = policy;
        self
    }

    pub fn with_publisher_disclosure(mut self, policy: DisclosurePolicy) -> Self {
        self.publisher_disclosure = policy;
        self
    }

    pub fn with_call_timeout_forwarding_rule(mut self, rule: CallTimeoutForwardingRule) -> Self {
        self.call_timeout_forwarding = rule;
        self
    }

    pub fn with_meta_api_enabled(mut self, enabled: bool) -> Self {
        self.meta_api_enabled = enabled;
        self
    }

    pub fn with_meta_procedure_registration_allowed(mut self, allowed: bool) -> Self {
        self.meta_procedure_registration_allowed = allowed;
        self
    }

    pub fn with_meta_topic_publication_allowed(mut self, allowed: bool) -> Self {
        self.meta_topic_publication_allowed = allowed;
        self
    }

    pub fn authorizer(&self) -> Option<&Arc<dyn Authorizer>> {
        self.authorizer.as_ref()
    }
}

impl fmt::Debug for RealmOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealmOptions")
            .field("uri", &self.uri)
            .field("caller_disclosure", &self.caller_disclosure)
            .field("publisher_disclosure", &self.publisher_disclosure)
            .field("call_timeout_forwarding", &self.call_timeout_forwarding)
            .field("meta_api_enabled", &self.meta_api_enabled)
            .field(
                "meta_procedure_registration_allowed",
                &self.meta_procedure_registration_allowed,
            )
            .field("meta_topic_publication_allowed", &self.meta_topic_publication_allowed)
            .field("authorizer", &self.authorizer.is_some())
            .finish()
    }
}

/// Binary-exponential backoff bounds for a server's accept loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptBackoff {
    pub min: Duration,
    pub max: Duration,
}

impl AcceptBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        AcceptBackoff { min, max }
    }

    /// Single-delay mode: min == max disables doubling.
    pub fn fixed(delay: Duration) -> Self {
        AcceptBackoff { min: delay, max: delay }
    }

    pub fn is_fixed(self) -> bool {
        self.min == self.max
    }
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        // Start near a typical accept-mutex delay, cap at a conservative max.
        AcceptBackoff {
            min: Duration::from_millis(625),
            max: Duration::from_secs(10),
        }
    }
}

/// Per-server options: identity, admission limits and timeouts.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    pub name: String,
    pub agent: String,
    pub soft_connection_limit: usize,
    pub hard_connection_limit: usize,
    pub monitoring_interval: Duration,
    pub hello_timeout: Duration,
    pub challenge_timeout: Duration,
    pub stale_timeout: Duration,
    /// Maximum allowable continuous connection time; `None` disables the
    /// limit.
    pub overstay_timeout: Option<Duration>,
    pub accept_backoff: AcceptBackoff,
    #[serde(skip)]
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
}

impl ServerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        ServerOptions {
            name: name.into(),
            agent: crate::utils::server_agent(),
            soft_connection_limit: 512,
            hard_connection_limit: 768,
            monitoring_interval: Duration::from_secs(1),
            hello_timeout: Duration::from_secs(30),
            challenge_timeout: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(300),
            overstay_timeout: None,
            accept_backoff: AcceptBackoff::default(),
            authenticator: None,
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_soft_connection_limit(mut self, limit: usize) -> Self {
        self.soft_connection_limit = limit;
        self
    }

    pub fn with_hard_connection_limit(mut self, limit: usize) -> Self {
        self.hard_connection_limit = limit;
        self
    }

    pub fn with_monitoring_interval(mut self, interval: Duration) -> Self {
        self.monitoring_interval = interval;
        self
    }

    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    pub fn with_challenge_timeout(mut self, timeout: Duration) -> Self {
        self.challenge_timeout = timeout;
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    pub fn with_overstay_timeout(mut self, timeout: Duration) -> Self {
        self.overstay_timeout = Some(timeout);
        self
    }

    pub fn with_accept_backoff(mut self, backoff: AcceptBackoff) -> Self {
        self.accept_backoff = backoff;
        self
    }

    pub fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.authenticator.as_ref()
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("name", &self.name)
            .field("agent", &self.agent)
            .field("soft_connection_limit", &self.soft_connection_limit)
            .field("hard_connection_limit", &self.hard_connection_limit)
            .field("monitoring_interval", &self.monitoring_interval)
            .field("hello_timeout", &self.hello_timeout)
            .field("challenge_timeout", &self.challenge_timeout)
            .field("stale_timeout", &self.stale_timeout)
            .field("overstay_timeout", &self.overstay_timeout)
            .field("accept_backoff", &self.accept_backoff)
            .field("authenticator", &self.authenticator.is_some())
            .finish()
    }
}

/// Process-wide router options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RouterOptions {
    pub uri_validation: UriValidation,
    pub timestamp_precision: TimestampPrecision,
    /// Seed for the id generators; meant for reproducible tests.
    pub id_seed: Option<u64>,
}

impl RouterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_uri_validation(mut self, validation: UriValidation) -> Self {
        self.uri_validation = validation;
        self
    }

    pub fn with_timestamp_precision(mut self, precision: TimestampPrecision) -> Self {
        self.timestamp_precision = precision;
        self
    }

    pub fn with_id_seed(mut self, seed: u64) -> Self {
        self.id_seed = Some(seed);
        self
    }
}
