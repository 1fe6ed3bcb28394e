//! Token-trie match index over dot-separated URIs.
//!
//! One [`TokenTrie`] holds the patterns of a single match policy; a
//! [`UriMatchIndex`] bundles the three policy tries and answers the broker
//! and dealer queries. Children live in a `BTreeMap` so iteration is
//! lexicographic and deterministic across platforms, which the test suite
//! relies on.

use std::collections::BTreeMap;

use crate::uri::{MatchPolicy, Uri};

#[derive(Clone, Debug, PartialEq)]
struct Node<V> {
    children: BTreeMap<String, Node<V>>,
    terminal: Option<V>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Node {
            children: BTreeMap::new(),
            terminal: None,
        }
    }
}

/// Trie keyed by URI token sequences.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenTrie<V> {
    root: Node<V>,
    len: usize,
}

impl<V> Default for TokenTrie<V> {
    fn default() -> Self {
        TokenTrie {
            root: Node::default(),
            len: 0,
        }
    }
}

impl<V> TokenTrie<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Attaches `value` at the node addressed by `uri`'s token sequence.
    /// Returns the value back if the slot is already occupied.
    pub fn insert(&mut self, uri: &Uri, value: V) -> Result<(), V> {
        let mut node = &mut self.root;
        for token in uri.tokens() {
            node = node.children.entry(token.to_owned()).or_default();
        }
        if node.terminal.is_some() {
            return Err(value);
        }
        node.terminal = Some(value);
        self.len += 1;
        Ok(())
    }

    /// Looks up the value stored for exactly this token sequence.
    pub fn get(&self, uri: &Uri) -> Option<&V> {
        let mut node = &self.root;
        for token in uri.tokens() {
            node = node.children.get(token)?;
        }
        node.terminal.as_ref()
    }

    pub fn get_mut(&mut self, uri: &Uri) -> Option<&mut V> {
        let mut node = &mut self.root;
        for token in uri.tokens() {
            node = node.children.get_mut(token)?;
        }
        node.terminal.as_mut()
    }

    /// Clears the terminal for `uri` and prunes the now-empty ancestor
    /// chain up to the first node still carrying a terminal or a surviving
    /// child.
    pub fn remove(&mut self, uri: &Uri) -> Option<V> {
        fn recurse<V>(node: &mut Node<V>, tokens: &[&str]) -> (Option<V>, bool) {
            match tokens.split_first() {
                None => {
                    let removed = node.terminal.take();
                    let prune = removed.is_some() && node.children.is_empty();
                    (removed, prune)
                }
                Some((head, rest)) => {
                    let Some(child) = node.children.get_mut(*head) else {
                        return (None, false);
                    };
                    let (removed, prune_child) = recurse(child, rest);
                    if prune_child {
                        node.children.remove(*head);
                    }
                    let prune = removed.is_some() && node.terminal.is_none() && node.children.is_empty();
                    (removed, prune)
                }
            }
        }

        let tokens: Vec<&str> = uri.tokens().collect();
        let (removed, _) = recurse(&mut self.root, &tokens);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Visits every `(tokens, value)` pair in depth-first lexicographic
    /// order.
    pub fn for_each(&self, mut f: impl FnMut(&[String], &V)) {
        fn recurse<V>(node: &Node<V>, path: &mut Vec<String>, f: &mut impl FnMut(&[String], &V)) {
            if let Some(value) = &node.terminal {
                f(path, value);
            }
            for (token, child) in &node.children {
                path.push(token.clone());
                recurse(child, path, f);
                path.pop();
            }
        }
        let mut path = Vec::new();
        recurse(&self.root, &mut path, &mut f);
    }

    /// Terminals whose pattern is a token-prefix of `query` (or equals it),
    /// shallowest first.
    fn prefix_matches<'t>(&'t self, query: &Uri) -> PrefixMatches<'t, V> {
        PrefixMatches {
            query: query.tokens().map(str::to_owned).collect(),
            node: Some(&self.root),
            depth: 0,
        }
    }

    /// Terminals whose pattern has the same token count as `query` and
    /// matches it with empty tokens acting as wildcards, in depth-first
    /// lexicographic order.
    fn wildcard_matches<'t>(&'t self, query: &Uri) -> WildcardMatches<'t, V> {
        let query: Vec<String> = query.tokens().map(str::to_owned).collect();
        WildcardMatches {
            stack: vec![(&self.root, 0)],
            query,
        }
    }
}

/// Lazy iterator over prefix-policy matches.
struct PrefixMatches<'t, V> {
    query: Vec<String>,
    node: Option<&'t Node<V>>,
    depth: usize,
}

impl<'t, V> Iterator for PrefixMatches<'t, V> {
    type Item = &'t V;

    fn next(&mut self) -> Option<&'t V> {
        while let Some(node) = self.node {
            let terminal = node.terminal.as_ref();

            if self.depth < self.query.len() {
                self.node = node.children.get(self.query[self.depth].as_str());
                self.depth += 1;
            } else {
                self.node = None;
            }

            if terminal.is_some() {
                return terminal;
            }
        }
        None
    }
}

/// Lazy iterator over wildcard-policy matches.
struct WildcardMatches<'t, V> {
    query: Vec<String>,
    stack: Vec<(&'t Node<V>, usize)>,
}

impl<'t, V> Iterator for WildcardMatches<'t, V> {
    type Item = &'t V;

    fn next(&mut self) -> Option<&'t V> {
        while let Some((node, depth)) = self.stack.pop() {
            if depth == self.query.len() {
                if let Some(value) = &node.terminal {
                    return Some(value);
                }
                continue;
            }

            // LIFO stack: push the literal branch first so the empty-token
            // branch, which sorts lexicographically first, pops first.
            let token = self.query[depth].as_str();
            if let Some(child) = node.children.get(token) {
                self.stack.push((child, depth + 1));
            }
            if !token.is_empty() {
                if let Some(child) = node.children.get("") {
                    self.stack.push((child, depth + 1));
                }
            }
        }
        None
    }
}

/// The three policy tries bundled behind the queries the broker and dealer
/// actually ask.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UriMatchIndex<V> {
    exact: TokenTrie<V>,
    prefix: TokenTrie<V>,
    wildcard: TokenTrie<V>,
}

impl<V> UriMatchIndex<V> {
    pub fn new() -> Self {
        UriMatchIndex {
            exact: TokenTrie::new(),
            prefix: TokenTrie::new(),
            wildcard: TokenTrie::new(),
        }
    }

    fn trie(&self, policy: MatchPolicy) -> &TokenTrie<V> {
        match policy {
            MatchPolicy::Exact => &self.exact,
            MatchPolicy::Prefix => &self.prefix,
            MatchPolicy::Wildcard => &self.wildcard,
        }
    }

    fn trie_mut(&mut self, policy: MatchPolicy) -> &mut TokenTrie<V> {
        match policy {
            MatchPolicy::Exact => &mut self.exact,
            MatchPolicy::Prefix => &mut self.prefix,
            MatchPolicy::Wildcard => &mut self.wildcard,
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefix.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `value` under `(uri, policy)`; fails when the slot is taken.
    pub fn insert(&mut self, uri: &Uri, policy: MatchPolicy, value: V) -> Result<(), V> {
        self.trie_mut(policy).insert(uri, value)
    }

    /// Removes the entry stored under `(uri, policy)`.
    pub fn remove(&mut self, uri: &Uri, policy: MatchPolicy) -> Option<V> {
        self.trie_mut(policy).remove(uri)
    }

    /// Looks up the entry stored under exactly `(uri, policy)`; this is a
    /// pattern lookup, not a match query.
    pub fn find_pattern(&self, uri: &Uri, policy: MatchPolicy) -> Option<&V> {
        self.trie(policy).get(uri)
    }

    pub fn find_pattern_mut(&mut self, uri: &Uri, policy: MatchPolicy) -> Option<&mut V> {
        self.trie_mut(policy).get_mut(uri)
    }

    /// The exact-policy entry for `uri`, if any.
    pub fn find_exact(&self, uri: &Uri) -> Option<&V> {
        self.exact.get(uri)
    }

    /// All entries matching `uri`, grouped exact → prefix → wildcard, each
    /// group in its deterministic traversal order.
    pub fn find_matching<'a>(&'a self, uri: &Uri) -> impl Iterator<Item = &'a V> {
        self.exact
            .get(uri)
            .into_iter()
            .chain(self.prefix.prefix_matches(uri))
            .chain(self.wildcard.wildcard_matches(uri))
    }

    /// Visits every entry of one policy trie in deterministic order.
    pub fn for_each(&self, policy: MatchPolicy, f: impl FnMut(&[String], &V)) {
        self.trie(policy).for_each(f);
    }

    /// The deepest prefix-policy entry matching `uri` (longest match wins).
    pub fn best_prefix(&self, uri: &Uri) -> Option<&V> {
        self.prefix.prefix_matches(uri).last()
    }

    /// The first wildcard-policy entry matching `uri` in traversal order
    /// (ties break by lexicographic token order).
    pub fn first_wildcard(&self, uri: &Uri) -> Option<&V> {
        self.wildcard.wildcard_matches(uri).next()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn collect<'a>(index: &'a UriMatchIndex<u64>, uri: &str) -> Vec<u64> {
        index.find_matching(&Uri::new(uri)).copied().collect()
    }

    #[test]
    fn exact_lookup_only_matches_same_uri() {
        let mut index = UriMatchIndex::new();
        index.insert(&Uri::new("com.myapp.topic"), MatchPolicy::Exact, 1).expect("insert");

        assert_eq!(collect(&index, "com.myapp.topic"), vec![1]);
        assert!(collect(&index, "com.myapp.topic2").is_empty());
        assert!(collect(&index, "com.myapp").is_empty());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut index = UriMatchIndex::new();
        index.insert(&Uri::new("a.b"), MatchPolicy::Prefix, 1).expect("insert");
        assert_eq!(index.insert(&Uri::new("a.b"), MatchPolicy::Prefix, 2), Err(2));
        // Same URI under a different policy is a distinct slot.
        index.insert(&Uri::new("a.b"), MatchPolicy::Exact, 3).expect("insert");
    }

    #[test]
    fn prefix_matches_include_equal_uri() {
        let mut index = UriMatchIndex::new();
        index.insert(&Uri::new("com"), MatchPolicy::Prefix, 1).expect("insert");
        index.insert(&Uri::new("com.myapp"), MatchPolicy::Prefix, 2).expect("insert");
        index.insert(&Uri::new("com.myapp.topic"), MatchPolicy::Prefix, 3).expect("insert");
        index.insert(&Uri::new("com.other"), MatchPolicy::Prefix, 4).expect("insert");

        assert_eq!(collect(&index, "com.myapp.topic"), vec![1, 2, 3]);
        assert_eq!(collect(&index, "com.myapp"), vec![1, 2]);
    }

    #[test]
    fn wildcard_matches_require_same_token_count() {
        let mut index = UriMatchIndex::new();
        index.insert(&Uri::new("com..on_event"), MatchPolicy::Wildcard, 1).expect("insert");

        assert_eq!(collect(&index, "com.foo.on_event"), vec![1]);
        assert_eq!(collect(&index, "com.myapp.on_event"), vec![1]);
        assert!(collect(&index, "com.foo.bar.on_event").is_empty());
        assert!(collect(&index, "com.on_event").is_empty());
    }

    #[test]
    fn matching_order_is_exact_then_prefix_then_wildcard() {
        let mut index = UriMatchIndex::new();
        index.insert(&Uri::new("com.myapp.on_event"), MatchPolicy::Exact, 10).expect("insert");
        index.insert(&Uri::new("com.myapp"), MatchPolicy::Prefix, 20).expect("insert");
        index.insert(&Uri::new("com..on_event"), MatchPolicy::Wildcard, 30).expect("insert");
        index.insert(&Uri::new("com.myapp.on_event"), MatchPolicy::Wildcard, 31).expect("insert");

        // Within the wildcard group, the empty-token branch sorts first.
        assert_eq!(collect(&index, "com.myapp.on_event"), vec![10, 20, 30, 31]);
    }

    #[test]
    fn removal_prunes_ancestors() {
        let mut trie = TokenTrie::new();
        trie.insert(&Uri::new("a.b.c"), 1).expect("insert");
        trie.insert(&Uri::new("a.b"), 2).expect("insert");

        assert_eq!(trie.remove(&Uri::new("a.b.c")), Some(1));
        // `a.b` still terminates, so the chain survives up to it.
        assert_eq!(trie.get(&Uri::new("a.b")), Some(&2));
        assert_eq!(trie.remove(&Uri::new("a.b")), Some(2));
        assert!(trie.is_empty());
        assert_eq!(trie, TokenTrie::new());
    }

    #[test]
    fn remove_of_absent_entry_is_a_no_op() {
        let mut trie = TokenTrie::new();
        trie.insert(&Uri::new("a.b"), 1).expect("insert");
        assert_eq!(trie.remove(&Uri::new("a.b.c")), None);
        assert_eq!(trie.remove(&Uri::new("x")), None);
        assert_eq!(trie.len(), 1);
    }

    proptest! {
        // Inserting then removing a pattern restores the trie to its prior
        // state, including pruned interior nodes.
        #[test]
        fn insert_remove_round_trip(
            base in prop::collection::vec("[a-c]{1,2}(\\.[a-c]{0,2}){0,3}", 0..8),
            extra in "[a-c]{1,2}(\\.[a-c]{0,2}){0,3}",
        ) {
            let mut trie = TokenTrie::new();
            for (i, uri) in base.iter().enumerate() {
                let _ = trie.insert(&Uri::new(uri.clone()), i);
            }
            let snapshot = trie.clone();

            let extra_uri = Uri::new(extra);
            if trie.insert(&extra_uri, 999).is_ok() {
                prop_assert_eq!(trie.remove(&extra_uri), Some(999));
            }
            prop_assert_eq!(trie, snapshot);
        }
    }
}
