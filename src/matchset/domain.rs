//! Domain suffix set
//!
//! A label-level trie over FQDNs. Membership asks whether any suffix of
//! the query name, on label boundaries, is present in the set: inserting
//! `example.com.` matches `example.com.` and `sub.example.com.` but not
//! `notexample.com.` or `example.com.foo.`.
//!
//! Names are normalized to lowercase ASCII without the trailing dot
//! before insertion and lookup, so matching is case-insensitive per
//! RFC 1035.
//!
//! # Example
//!
//! ```
//! use racedns::matchset::DomainSet;
//!
//! let mut set = DomainSet::new();
//! set.insert("example.com.");
//!
//! assert!(set.contains("a.b.Example.COM."));
//! assert!(!set.contains("notexample.com."));
//! ```

use std::collections::HashMap;

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    terminal: bool,
}

/// A set of domain suffixes with label-boundary matching
#[derive(Debug, Default)]
pub struct DomainSet {
    root: Node,
    len: usize,
}

impl DomainSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an FQDN
    ///
    /// Re-inserting an existing name is a no-op.
    pub fn insert(&mut self, name: &str) {
        let mut node = &mut self.root;
        for label in Self::labels(name) {
            node = node.children.entry(label.to_ascii_lowercase()).or_default();
        }
        if !node.terminal {
            node.terminal = true;
            self.len += 1;
        }
    }

    /// Test whether any suffix of `name` is present in the set
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        let mut node = &self.root;
        for label in Self::labels(name) {
            let Some(child) = node.children.get(&label.to_ascii_lowercase()) else {
                return false;
            };
            node = child;
            if node.terminal {
                return true;
            }
        }
        false
    }

    /// Number of entries in the set
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the set holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Labels of `name` from the rightmost to the leftmost, ignoring a
    /// trailing dot
    fn labels(name: &str) -> impl Iterator<Item = &str> {
        name.trim_end_matches('.')
            .rsplit('.')
            .filter(|label| !label.is_empty())
    }
}
