//! Match accelerators for response policies
//!
//! Two immutable set types back the policy filters: a domain suffix trie
//! ([`DomainSet`]) and a sorted CIDR list ([`IpList`]). Sets are loaded
//! from text files at startup, collected into a named [`MatchSets`]
//! registry, and resolved into policy handles during config validation;
//! after that they are read lock-free from any task.
//!
//! # File format
//!
//! One entry per line. `#` starts a comment (whole-line or trailing),
//! blank lines are ignored, and an invalid entry is a startup error.

mod domain;
mod iplist;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

pub use domain::DomainSet;
pub use iplist::{Cidr, IpList};

use crate::error::{DnsError, DnsResult};

/// Significant payload of each line: comments stripped, blanks skipped
fn entries(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| {
            let line = line.split('#').next().unwrap_or("").trim();
            (i + 1, line)
        })
        .filter(|(_, line)| !line.is_empty())
}

/// Load a domain set from a file
///
/// # Errors
///
/// Returns `DnsError::Config` when the file cannot be read or a line is
/// not a plausible domain name.
pub fn load_domain_set(path: &Path) -> DnsResult<DomainSet> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DnsError::config(format!("cannot read domain set {}: {e}", path.display())))?;

    let mut set = DomainSet::new();
    for (line_no, entry) in entries(&content) {
        if !entry
            .trim_end_matches('.')
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '*'))
        {
            return Err(DnsError::config(format!(
                "invalid domain '{entry}' at {}:{line_no}",
                path.display()
            )));
        }
        set.insert(entry);
    }

    debug!(path = %path.display(), entries = set.len(), "domain set loaded");
    Ok(set)
}

/// Load a CIDR list from a file
///
/// # Errors
///
/// Returns `DnsError::Config` when the file cannot be read or a line is
/// not a CIDR or bare address.
pub fn load_ip_list(path: &Path) -> DnsResult<IpList> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DnsError::config(format!("cannot read ip list {}: {e}", path.display())))?;

    let mut list = IpList::new();
    for (line_no, entry) in entries(&content) {
        let cidr: Cidr = entry.parse().map_err(|e| {
            DnsError::config(format!("{e} at {}:{line_no}", path.display()))
        })?;
        list.insert(cidr);
    }
    list.finalize();

    debug!(path = %path.display(), entries = list.len(), "ip list loaded");
    Ok(list)
}

/// Named registry of loaded match sets
///
/// Built once at startup; policy references (`"[!]set-name"`) resolve
/// against it during config validation.
#[derive(Debug, Default)]
pub struct MatchSets {
    domains: HashMap<String, Arc<DomainSet>>,
    ips: HashMap<String, Arc<IpList>>,
}

impl MatchSets {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every named set file
    ///
    /// # Errors
    ///
    /// Fails on the first unreadable or malformed file.
    pub fn load<'a>(
        domain_files: impl IntoIterator<Item = (&'a str, &'a Path)>,
        ip_files: impl IntoIterator<Item = (&'a str, &'a Path)>,
    ) -> DnsResult<Self> {
        let mut sets = Self::new();
        for (name, path) in domain_files {
            sets.domains
                .insert(name.to_string(), Arc::new(load_domain_set(path)?));
        }
        for (name, path) in ip_files {
            sets.ips
                .insert(name.to_string(), Arc::new(load_ip_list(path)?));
        }
        Ok(sets)
    }

    /// Register a domain set under a name
    pub fn add_domain_set(&mut self, name: impl Into<String>, set: DomainSet) {
        self.domains.insert(name.into(), Arc::new(set));
    }

    /// Register an IP list under a name
    pub fn add_ip_list(&mut self, name: impl Into<String>, list: IpList) {
        self.ips.insert(name.into(), Arc::new(list));
    }

    /// Look up a domain set by name
    #[must_use]
    pub fn domain_set(&self, name: &str) -> Option<Arc<DomainSet>> {
        self.domains.get(name).cloned()
    }

    /// Look up an IP list by name
    #[must_use]
    pub fn ip_list(&self, name: &str) -> Option<Arc<IpList>> {
        self.ips.get(name).cloned()
    }
}
