//! racedns: racing DNS forwarder with per-upstream response policies
//!
//! Every client query fans out to all configured upstream resolvers in
//! parallel; each candidate reply passes through its upstream's response
//! policy, and the first accepted reply wins while the losers are
//! cancelled. Policies exist to sanitize regionally polluted answers:
//! a fast-but-untrusted upstream can be constrained to a domain or IP
//! set, while a trusted-but-slow one backstops everything else.
//!
//! # Architecture
//!
//! ```text
//! Listener (udp/tcp) → Dispatcher ─┬─ Upstream "local"  ─ policy ─┐
//!        │                cache    ├─ Upstream "remote" ─ policy ─┤→ first
//!        └── reply ←───────────────┴─ ...                         ┘  accepted
//! ```
//!
//! # Modules
//!
//! - [`cache`]: bounded TTL cache of serialized replies
//! - [`config`]: configuration tree, loading, validation
//! - [`dispatcher`]: cache probe, fan-out, race, TTL rewrite
//! - [`error`]: crate-wide error types
//! - [`matchset`]: domain-suffix trie and sorted CIDR list
//! - [`message`]: wire message helpers over `hickory_proto`
//! - [`policy`]: per-upstream response acceptance policies
//! - [`server`]: UDP and TCP listeners
//! - [`upstream`]: UDP/TCP/DoT/DoH clients with dedup and pooling

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod matchset;
pub mod message;
pub mod policy;
pub mod server;
pub mod upstream;

pub use cache::ResponseCache;
pub use config::{BindAddr, BindProtocol, Config, Protocol, UpstreamOptions};
pub use dispatcher::Dispatcher;
pub use error::{DnsError, DnsResult, UpstreamErrorKind};
pub use matchset::{Cidr, DomainSet, IpList, MatchSets};
pub use message::QuestionKey;
pub use policy::{PolicyDecision, ResponsePolicy, SetRef};
pub use server::{TcpServer, UdpServer};
pub use upstream::{Transport, Upstream};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
