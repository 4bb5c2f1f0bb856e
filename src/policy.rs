//! Per-upstream response policies
//!
//! A [`ResponsePolicy`] decides whether a candidate reply from one
//! upstream is acceptable. The checks run in a fixed order and
//! short-circuit on the first rejection:
//!
//! 1. `deny_unhandlable_types` - the query type must be one this
//!    upstream can meaningfully answer (A and AAAA)
//! 2. `deny_error_rcode` - the reply RCODE must be NOERROR
//! 3. `domain` - the query name must fall inside (or, inverted, outside)
//!    the referenced domain set
//! 4. `check_cname` - every CNAME target in the answer passes the same
//!    domain-set rule
//! 5. `deny_empty_ip_reply` - a NOERROR reply must carry at least one
//!    A/AAAA record
//! 6. `ip` - some answer address must fall inside (or, inverted, none
//!    inside) the referenced IP set; skipped when the answer carries no
//!    addresses
//!
//! Policies are pure and lock-free; the set references are resolved from
//! `"[!]set-name"` strings at startup. Rejections carry a reason that the
//! dispatcher logs at debug level; they never reach the client.

use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{RData, RecordType};

use crate::matchset::{DomainSet, IpList};

/// Query types every upstream is expected to answer
///
/// Anything else is rejected by `deny_unhandlable_types`.
pub const HANDLED_QUERY_TYPES: &[RecordType] = &[RecordType::A, RecordType::AAAA];

/// A resolved set reference with its polarity
///
/// `negate` is true for references written with a leading `!`: the
/// check then requires absence instead of presence.
#[derive(Debug)]
pub struct SetRef<T> {
    set: Arc<T>,
    negate: bool,
}

impl<T> Clone for SetRef<T> {
    fn clone(&self) -> Self {
        Self {
            set: Arc::clone(&self.set),
            negate: self.negate,
        }
    }
}

impl<T> SetRef<T> {
    /// Create a reference to `set`, inverted when `negate` is true
    #[must_use]
    pub fn new(set: Arc<T>, negate: bool) -> Self {
        Self { set, negate }
    }
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The reply may win the race
    Accept,
    /// The reply is discarded; the reason is logged at debug level
    Reject(&'static str),
}

impl PolicyDecision {
    /// True for [`PolicyDecision::Accept`]
    #[must_use]
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Resolved acceptance policy for one upstream
#[derive(Debug, Clone, Default)]
pub struct ResponsePolicy {
    deny_unhandlable_types: bool,
    domain: Option<SetRef<DomainSet>>,
    deny_error_rcode: bool,
    check_cname: bool,
    deny_empty_ip_reply: bool,
    ip: Option<SetRef<IpList>>,
}

impl ResponsePolicy {
    /// A policy that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject queries for types outside [`HANDLED_QUERY_TYPES`]
    #[must_use]
    pub fn with_deny_unhandlable_types(mut self, deny: bool) -> Self {
        self.deny_unhandlable_types = deny;
        self
    }

    /// Constrain the query name to a domain set
    #[must_use]
    pub fn with_domain_set(mut self, set: SetRef<DomainSet>) -> Self {
        self.domain = Some(set);
        self
    }

    /// Reject replies with a non-zero RCODE
    #[must_use]
    pub fn with_deny_error_rcode(mut self, deny: bool) -> Self {
        self.deny_error_rcode = deny;
        self
    }

    /// Apply the domain set to CNAME targets as well
    #[must_use]
    pub fn with_check_cname(mut self, check: bool) -> Self {
        self.check_cname = check;
        self
    }

    /// Reject NOERROR replies that carry no A/AAAA records
    #[must_use]
    pub fn with_deny_empty_ip_reply(mut self, deny: bool) -> Self {
        self.deny_empty_ip_reply = deny;
        self
    }

    /// Constrain answer addresses to an IP set
    #[must_use]
    pub fn with_ip_set(mut self, set: SetRef<IpList>) -> Self {
        self.ip = Some(set);
        self
    }

    /// Resolve `"[!]set-name"` references into a usable policy
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` when a referenced set is not in the
    /// registry; dangling references are a startup error, never a
    /// runtime one.
    pub fn from_options(
        options: &crate::config::PolicyOptions,
        sets: &crate::matchset::MatchSets,
    ) -> crate::error::DnsResult<Self> {
        use crate::config::parse_set_ref;
        use crate::error::DnsError;

        let mut policy = Self::new()
            .with_deny_unhandlable_types(options.deny_unhandlable_types)
            .with_deny_error_rcode(options.deny_error_rcode)
            .with_check_cname(options.check_cname)
            .with_deny_empty_ip_reply(options.deny_empty_ip_reply);

        if let Some(reference) = &options.domain {
            let (negate, name) = parse_set_ref(reference);
            let set = sets.domain_set(name).ok_or_else(|| {
                DnsError::config_field(
                    format!("unknown domain set '{name}'"),
                    "policies.domain",
                )
            })?;
            policy = policy.with_domain_set(SetRef::new(set, negate));
        }

        if let Some(reference) = &options.ip {
            let (negate, name) = parse_set_ref(reference);
            let set = sets.ip_list(name).ok_or_else(|| {
                DnsError::config_field(format!("unknown ip set '{name}'"), "policies.ip")
            })?;
            policy = policy.with_ip_set(SetRef::new(set, negate));
        }

        Ok(policy)
    }

    /// Decide whether `reply` is an acceptable answer to `query`
    ///
    /// A query without a question section is not filterable and is
    /// accepted as-is.
    #[must_use]
    pub fn evaluate(&self, query: &Message, reply: &Message) -> PolicyDecision {
        let Some(question) = query.queries().first() else {
            return PolicyDecision::Accept;
        };

        if self.deny_unhandlable_types && !HANDLED_QUERY_TYPES.contains(&question.query_type()) {
            return PolicyDecision::Reject("unhandlable query type");
        }

        if self.deny_error_rcode && reply.response_code() != ResponseCode::NoError {
            return PolicyDecision::Reject("error rcode");
        }

        if let Some(domain) = &self.domain {
            let qname = question.name().to_string();
            let hit = domain.set.contains(&qname);
            if hit == domain.negate {
                return PolicyDecision::Reject(if domain.negate {
                    "name inside excluded domain set"
                } else {
                    "name outside domain set"
                });
            }

            if self.check_cname {
                for target in cname_targets(reply) {
                    let hit = domain.set.contains(&target);
                    if hit == domain.negate {
                        return PolicyDecision::Reject(if domain.negate {
                            "cname target inside excluded domain set"
                        } else {
                            "cname target outside domain set"
                        });
                    }
                }
            }
        }

        let addrs = answer_addrs(reply);

        if self.deny_empty_ip_reply
            && reply.response_code() == ResponseCode::NoError
            && addrs.is_empty()
        {
            return PolicyDecision::Reject("no addresses in reply");
        }

        if let Some(ip) = &self.ip {
            if !addrs.is_empty() {
                let hit = addrs.iter().any(|addr| ip.set.contains(*addr));
                if hit == ip.negate {
                    return PolicyDecision::Reject(if ip.negate {
                        "answer address inside excluded ip set"
                    } else {
                        "answer address outside ip set"
                    });
                }
            }
        }

        PolicyDecision::Accept
    }
}

/// A/AAAA addresses in the answer section
fn answer_addrs(reply: &Message) -> Vec<IpAddr> {
    reply
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// CNAME targets in the answer section
fn cname_targets(reply: &Message) -> Vec<String> {
    reply
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::CNAME(target)) => Some(target.0.to_string()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::{A, CNAME};
    use hickory_proto::rr::{DNSClass, Name, Record};

    use super::*;

    fn query(domain: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1000);
        msg.add_query(Query::query(Name::from_str(domain).unwrap(), qtype));
        msg
    }

    fn reply_with_ips(domain: &str, ips: &[Ipv4Addr]) -> Message {
        let mut msg = query(domain, RecordType::A);
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(ResponseCode::NoError);
        for ip in ips {
            let mut r = Record::new();
            r.set_name(Name::from_str(domain).unwrap());
            r.set_record_type(RecordType::A);
            r.set_dns_class(DNSClass::IN);
            r.set_ttl(300);
            r.set_data(Some(RData::A(A(*ip))));
            msg.add_answer(r);
        }
        msg
    }

    fn domain_set(names: &[&str]) -> Arc<DomainSet> {
        let mut set = DomainSet::new();
        for n in names {
            set.insert(n);
        }
        Arc::new(set)
    }

    fn ip_set(cidrs: &[&str]) -> Arc<IpList> {
        let mut list = IpList::new();
        for c in cidrs {
            list.insert(c.parse().unwrap());
        }
        list.finalize();
        Arc::new(list)
    }

    // ========================================================================
    // Individual checks
    // ========================================================================

    #[test]
    fn test_empty_policy_accepts() {
        let policy = ResponsePolicy::new();
        let q = query("example.com.", RecordType::A);
        let r = reply_with_ips("example.com.", &[Ipv4Addr::new(1, 1, 1, 1)]);
        assert!(policy.evaluate(&q, &r).is_accept());
    }

    #[test]
    fn test_deny_unhandlable_types() {
        let policy = ResponsePolicy::new().with_deny_unhandlable_types(true);

        let q = query("example.com.", RecordType::MX);
        let r = reply_with_ips("example.com.", &[]);
        assert_eq!(
            policy.evaluate(&q, &r),
            PolicyDecision::Reject("unhandlable query type")
        );

        let q = query("example.com.", RecordType::AAAA);
        assert!(policy.evaluate(&q, &r).is_accept());
    }

    #[test]
    fn test_deny_error_rcode() {
        let policy = ResponsePolicy::new().with_deny_error_rcode(true);
        let q = query("example.com.", RecordType::A);

        let mut r = reply_with_ips("example.com.", &[Ipv4Addr::new(1, 1, 1, 1)]);
        r.set_response_code(ResponseCode::ServFail);
        assert_eq!(policy.evaluate(&q, &r), PolicyDecision::Reject("error rcode"));

        r.set_response_code(ResponseCode::NoError);
        assert!(policy.evaluate(&q, &r).is_accept());
    }

    #[test]
    fn test_domain_set_accept_if_present() {
        let policy = ResponsePolicy::new()
            .with_domain_set(SetRef::new(domain_set(&["example.com."]), false));
        let r = reply_with_ips("a.example.com.", &[Ipv4Addr::new(1, 1, 1, 1)]);

        assert!(policy
            .evaluate(&query("a.example.com.", RecordType::A), &r)
            .is_accept());
        assert!(!policy
            .evaluate(&query("other.org.", RecordType::A), &r)
            .is_accept());
    }

    #[test]
    fn test_domain_set_inverted() {
        let policy = ResponsePolicy::new()
            .with_domain_set(SetRef::new(domain_set(&["example.com."]), true));
        let r = reply_with_ips("other.org.", &[Ipv4Addr::new(1, 1, 1, 1)]);

        assert!(policy
            .evaluate(&query("other.org.", RecordType::A), &r)
            .is_accept());
        assert!(!policy
            .evaluate(&query("a.example.com.", RecordType::A), &r)
            .is_accept());
    }

    #[test]
    fn test_check_cname_applies_set_to_targets() {
        let policy = ResponsePolicy::new()
            .with_domain_set(SetRef::new(domain_set(&["example.com."]), false))
            .with_check_cname(true);

        let q = query("www.example.com.", RecordType::A);

        let mut inside = query("www.example.com.", RecordType::A);
        inside.set_message_type(MessageType::Response);
        let mut r = Record::new();
        r.set_name(Name::from_str("www.example.com.").unwrap());
        r.set_record_type(RecordType::CNAME);
        r.set_dns_class(DNSClass::IN);
        r.set_ttl(300);
        r.set_data(Some(RData::CNAME(CNAME(
            Name::from_str("cdn.example.com.").unwrap(),
        ))));
        inside.add_answer(r);
        assert!(policy.evaluate(&q, &inside).is_accept());

        let mut outside = query("www.example.com.", RecordType::A);
        outside.set_message_type(MessageType::Response);
        let mut r = Record::new();
        r.set_name(Name::from_str("www.example.com.").unwrap());
        r.set_record_type(RecordType::CNAME);
        r.set_dns_class(DNSClass::IN);
        r.set_ttl(300);
        r.set_data(Some(RData::CNAME(CNAME(
            Name::from_str("edge.cdn-vendor.net.").unwrap(),
        ))));
        outside.add_answer(r);
        assert_eq!(
            policy.evaluate(&q, &outside),
            PolicyDecision::Reject("cname target outside domain set")
        );
    }

    #[test]
    fn test_deny_empty_ip_reply() {
        let policy = ResponsePolicy::new().with_deny_empty_ip_reply(true);
        let q = query("example.com.", RecordType::A);

        let empty = reply_with_ips("example.com.", &[]);
        assert_eq!(
            policy.evaluate(&q, &empty),
            PolicyDecision::Reject("no addresses in reply")
        );

        let full = reply_with_ips("example.com.", &[Ipv4Addr::new(1, 1, 1, 1)]);
        assert!(policy.evaluate(&q, &full).is_accept());
    }

    #[test]
    fn test_deny_empty_ip_reply_ignores_error_rcode() {
        let policy = ResponsePolicy::new().with_deny_empty_ip_reply(true);
        let q = query("example.com.", RecordType::A);

        let mut r = reply_with_ips("example.com.", &[]);
        r.set_response_code(ResponseCode::NXDomain);
        assert!(policy.evaluate(&q, &r).is_accept());
    }

    #[test]
    fn test_ip_set_accepts_contained_answers() {
        let policy =
            ResponsePolicy::new().with_ip_set(SetRef::new(ip_set(&["10.0.0.0/8"]), false));
        let q = query("example.com.", RecordType::A);

        let inside = reply_with_ips("example.com.", &[Ipv4Addr::new(10, 1, 2, 3)]);
        assert!(policy.evaluate(&q, &inside).is_accept());

        let outside = reply_with_ips("example.com.", &[Ipv4Addr::new(8, 8, 8, 8)]);
        assert_eq!(
            policy.evaluate(&q, &outside),
            PolicyDecision::Reject("answer address outside ip set")
        );
    }

    #[test]
    fn test_ip_set_inverted_rejects_contained_answers() {
        let policy =
            ResponsePolicy::new().with_ip_set(SetRef::new(ip_set(&["127.0.0.0/8"]), true));
        let q = query("example.com.", RecordType::A);

        let polluted = reply_with_ips("example.com.", &[Ipv4Addr::new(127, 0, 0, 1)]);
        assert_eq!(
            policy.evaluate(&q, &polluted),
            PolicyDecision::Reject("answer address inside excluded ip set")
        );

        let clean = reply_with_ips("example.com.", &[Ipv4Addr::new(8, 8, 8, 8)]);
        assert!(policy.evaluate(&q, &clean).is_accept());
    }

    #[test]
    fn test_ip_set_skipped_without_addresses() {
        let policy =
            ResponsePolicy::new().with_ip_set(SetRef::new(ip_set(&["10.0.0.0/8"]), false));
        let q = query("example.com.", RecordType::A);

        let no_addrs = reply_with_ips("example.com.", &[]);
        assert!(policy.evaluate(&q, &no_addrs).is_accept());
    }

    #[test]
    fn test_question_less_query_not_filterable() {
        let policy = ResponsePolicy::new()
            .with_deny_error_rcode(true)
            .with_deny_empty_ip_reply(true);

        let q = Message::new();
        let mut r = Message::new();
        r.set_response_code(ResponseCode::ServFail);
        assert!(policy.evaluate(&q, &r).is_accept());
    }

    // ========================================================================
    // Reference resolution
    // ========================================================================

    #[test]
    fn test_from_options_resolves_references() {
        use crate::config::PolicyOptions;
        use crate::matchset::MatchSets;

        let mut sets = MatchSets::new();
        let mut domains = DomainSet::new();
        domains.insert("example.com.");
        sets.add_domain_set("cn", domains);

        let options = PolicyOptions {
            domain: Some("!cn".to_string()),
            deny_error_rcode: true,
            ..PolicyOptions::default()
        };
        let policy = ResponsePolicy::from_options(&options, &sets).unwrap();

        // inverted set: names inside the set are rejected
        let r = reply_with_ips("other.org.", &[Ipv4Addr::new(1, 1, 1, 1)]);
        assert!(!policy
            .evaluate(&query("a.example.com.", RecordType::A), &r)
            .is_accept());
    }

    #[test]
    fn test_from_options_dangling_reference_is_config_error() {
        use crate::config::PolicyOptions;
        use crate::matchset::MatchSets;

        let options = PolicyOptions {
            ip: Some("missing".to_string()),
            ..PolicyOptions::default()
        };
        let err = ResponsePolicy::from_options(&options, &MatchSets::new()).unwrap_err();
        assert!(err.to_string().contains("unknown ip set"));
    }

    // ========================================================================
    // Check ordering
    // ========================================================================

    #[test]
    fn test_rcode_check_precedes_domain_check() {
        let policy = ResponsePolicy::new()
            .with_deny_error_rcode(true)
            .with_domain_set(SetRef::new(domain_set(&["example.com."]), false));

        let q = query("other.org.", RecordType::A);
        let mut r = reply_with_ips("other.org.", &[]);
        r.set_response_code(ResponseCode::Refused);

        // both checks fail; the rcode one fires first
        assert_eq!(policy.evaluate(&q, &r), PolicyDecision::Reject("error rcode"));
    }
}
