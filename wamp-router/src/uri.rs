//! URI handling: tokenization, validation policies and match policies.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A dot-separated WAMP URI.
///
/// Plain URIs name one resource; pattern URIs may contain empty tokens
/// marking wildcard positions. `Uri` stores the raw string and leaves
/// pattern semantics to [`MatchPolicy`] and the match index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    pub fn new(uri: impl Into<String>) -> Self {
        Uri(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Splits into tokens. A trailing `.` yields an empty trailing token,
    /// matching the tokenization rules of the protocol specification.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    pub fn token_vec(&self) -> Vec<String> {
        self.tokens().map(str::to_owned).collect()
    }

    /// Whether any token is empty, i.e. the URI is only usable as a
    /// wildcard pattern.
    pub fn has_empty_tokens(&self) -> bool {
        self.tokens().any(str::is_empty)
    }

    /// Whether this URI names or falls under the reserved `wamp.` namespace.
    pub fn is_reserved(&self) -> bool {
        self.0 == "wamp" || self.0.starts_with("wamp.")
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uri {
    fn from(value: &str) -> Self {
        Uri(value.to_owned())
    }
}

impl From<String> for Uri {
    fn from(value: String) -> Self {
        Uri(value)
    }
}

impl Borrow<str> for Uri {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// How a stored pattern URI is compared against a concrete URI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    #[default]
    Exact,
    Prefix,
    Wildcard,
}

impl MatchPolicy {
    /// Parses the `match` option of SUBSCRIBE/REGISTER. Absence means exact;
    /// an unknown value is an invalid argument.
    pub fn from_option(value: Option<&str>) -> Option<MatchPolicy> {
        match value {
            None | Some("exact") => Some(MatchPolicy::Exact),
            Some("prefix") => Some(MatchPolicy::Prefix),
            Some("wildcard") => Some(MatchPolicy::Wildcard),
            Some(_) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchPolicy::Exact => "exact",
            MatchPolicy::Prefix => "prefix",
            MatchPolicy::Wildcard => "wildcard",
        }
    }

    /// Whether `pattern` matches the concrete `uri` under this policy.
    ///
    /// The match index answers this for whole pattern sets; this scalar
    /// form serves cache invalidation and meta-API lookups.
    pub fn matches(self, pattern: &Uri, uri: &Uri) -> bool {
        match self {
            MatchPolicy::Exact => pattern == uri,
            MatchPolicy::Prefix => {
                let mut uri_tokens = uri.tokens();
                pattern.tokens().all(|p| uri_tokens.next() == Some(p))
            }
            MatchPolicy::Wildcard => {
                let pattern_tokens: Vec<&str> = pattern.tokens().collect();
                let uri_tokens: Vec<&str> = uri.tokens().collect();
                pattern_tokens.len() == uri_tokens.len()
                    && pattern_tokens
                        .iter()
                        .zip(&uri_tokens)
                        .all(|(p, u)| p.is_empty() || p == u)
            }
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URI character validation policy.
///
/// *Relaxed* forbids `#` and whitespace within tokens; *strict* permits only
/// lowercase letters, digits and underscore.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UriValidation {
    #[default]
    Relaxed,
    Strict,
}

impl UriValidation {
    fn char_is_valid(self, c: char) -> bool {
        match self {
            UriValidation::Relaxed => !c.is_whitespace() && c != '#',
            UriValidation::Strict => c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_',
        }
    }

    /// Validates a resource URI: every token non-empty and well-formed.
    pub fn check_resource(self, uri: &Uri) -> bool {
        !uri.is_empty() && uri.tokens().all(|t| !t.is_empty() && t.chars().all(|c| self.char_is_valid(c)))
    }

    /// Validates a pattern URI: tokens may be empty (wildcard positions).
    pub fn check_pattern(self, uri: &Uri) -> bool {
        uri.tokens().all(|t| t.chars().all(|c| self.char_is_valid(c)))
    }

    /// Dispatches on whether the URI is used as a pattern.
    pub fn check(self, uri: &Uri, is_pattern: bool) -> bool {
        if is_pattern {
            self.check_pattern(uri)
        } else {
            self.check_resource(uri)
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn trailing_dot_yields_empty_token() {
        let uri = Uri::new("com.myapp.");
        let tokens: Vec<_> = uri.tokens().collect();
        assert_eq!(tokens, vec!["com", "myapp", ""]);
    }

    #[rstest]
    #[case("com.myapp.topic", true)]
    #[case("com.myapp..topic", false)] // empty token
    #[case("com.my app", false)] // whitespace
    #[case("com.my#app", false)]
    #[case("CamelCase.ok", true)] // relaxed allows upper case
    fn relaxed_resource_validation(#[case] uri: &str, #[case] valid: bool) {
        assert_eq!(UriValidation::Relaxed.check_resource(&Uri::new(uri)), valid);
    }

    #[rstest]
    #[case("com.myapp.topic_1", true)]
    #[case("com.MyApp.topic", false)]
    #[case("com.my-app.topic", false)]
    fn strict_resource_validation(#[case] uri: &str, #[case] valid: bool) {
        assert_eq!(UriValidation::Strict.check_resource(&Uri::new(uri)), valid);
    }

    #[test]
    fn pattern_validation_allows_empty_tokens() {
        assert!(UriValidation::Strict.check_pattern(&Uri::new("com..on_event")));
        assert!(!UriValidation::Strict.check_resource(&Uri::new("com..on_event")));
    }

    #[test]
    fn match_policy_option_parsing() {
        assert_eq!(MatchPolicy::from_option(None), Some(MatchPolicy::Exact));
        assert_eq!(MatchPolicy::from_option(Some("prefix")), Some(MatchPolicy::Prefix));
        assert_eq!(MatchPolicy::from_option(Some("bogus")), None);
    }

    #[rstest]
    #[case(MatchPolicy::Exact, "a.b", "a.b", true)]
    #[case(MatchPolicy::Exact, "a.b", "a.b.c", false)]
    #[case(MatchPolicy::Prefix, "a.b", "a.b.c", true)]
    #[case(MatchPolicy::Prefix, "a.b", "a.b", true)]
    #[case(MatchPolicy::Prefix, "a.b", "a.bc", false)]
    #[case(MatchPolicy::Wildcard, "a..c", "a.b.c", true)]
    #[case(MatchPolicy::Wildcard, "a..c", "a.b.b.c", false)]
    #[case(MatchPolicy::Wildcard, "a..c", "a.b.d", false)]
    fn scalar_pattern_matching(
        #[case] policy: MatchPolicy,
        #[case] pattern: &str,
        #[case] uri: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(policy.matches(&Uri::new(pattern), &Uri::new(uri)), expected);
    }

    #[test]
    fn reserved_namespace() {
        assert!(Uri::new("wamp.session.on_join").is_reserved());
        assert!(!Uri::new("wampish.topic").is_reserved());
    }
}
