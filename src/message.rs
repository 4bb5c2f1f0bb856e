//! Wire message helpers
//!
//! Thin operations over `hickory_proto::op::Message`: parsing and
//! serialization with crate-local errors, question fingerprinting, TTL
//! rewriting, EDNS client-subnet handling, and reply builders for the
//! server layer.
//!
//! A message with no question is accepted by [`parse`] but yields no
//! [`QuestionKey`], which keeps it out of the cache and the dedup
//! registry. Unknown record types and unknown OPT options survive a
//! parse/serialize round trip untouched; hickory keeps them as opaque
//! bytes.

use std::net::IpAddr;

use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::RecordType;

use crate::error::{DnsError, DnsResult};

/// Length of the fixed DNS header
pub const DNS_HEADER_LEN: usize = 12;

/// EDNS payload size advertised when this forwarder has to create the OPT
/// record itself (for client-subnet injection)
const INJECTED_EDNS_PAYLOAD: u16 = 1232;

/// Normalized question fingerprint
///
/// Used as the cache key and the dedup key. The name is lowercased ASCII
/// with a trailing dot, per RFC 1035 case-insensitive comparison rules.
///
/// # Example
///
/// ```
/// use racedns::message::QuestionKey;
///
/// let a = QuestionKey::new("Example.COM.", 1, 1);
/// let b = QuestionKey::new("example.com", 1, 1);
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuestionKey {
    name: String,
    qtype: u16,
    qclass: u16,
}

impl QuestionKey {
    /// Create a key from raw parts, normalizing the name
    #[must_use]
    pub fn new(name: impl AsRef<str>, qtype: u16, qclass: u16) -> Self {
        let mut name = name.as_ref().to_ascii_lowercase();
        if !name.ends_with('.') {
            name.push('.');
        }
        Self {
            name,
            qtype,
            qclass,
        }
    }

    /// Fingerprint a message's question section
    ///
    /// Returns `None` unless the message carries exactly one question;
    /// such messages are neither cacheable nor deduplicatable.
    #[must_use]
    pub fn from_message(msg: &Message) -> Option<Self> {
        if msg.queries().len() != 1 {
            return None;
        }
        let q = &msg.queries()[0];
        Some(Self::new(
            q.name().to_string(),
            q.query_type().into(),
            u16::from(q.query_class()),
        ))
    }

    /// The normalized query name (lowercase, trailing dot)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The query type
    #[must_use]
    pub fn qtype(&self) -> u16 {
        self.qtype
    }

    /// The query class
    #[must_use]
    pub fn qclass(&self) -> u16 {
        self.qclass
    }
}

/// Decode a wire message
///
/// # Errors
///
/// Returns `DnsError::Parse` on malformed input, including compression
/// pointer loops and truncated labels; never panics.
pub fn parse(bytes: &[u8]) -> DnsResult<Message> {
    Message::from_vec(bytes).map_err(|e| DnsError::parse(e.to_string()))
}

/// Encode a message to wire format with name compression
///
/// # Errors
///
/// Returns `DnsError::Serialize` if encoding fails.
pub fn serialize(msg: &Message) -> DnsResult<Vec<u8>> {
    msg.to_vec().map_err(|e| DnsError::serialize(e.to_string()))
}

/// Overwrite the TTL of every record in the answer, authority, and
/// additional sections
///
/// The OPT pseudo-record is unaffected; hickory keeps it out of the
/// additional section, and its TTL field carries EDNS flags rather than
/// a lifetime.
pub fn set_ttl(msg: &mut Message, ttl: u32) {
    let mut answers = msg.take_answers();
    for r in &mut answers {
        r.set_ttl(ttl);
    }
    msg.insert_answers(answers);

    let mut authority = msg.take_name_servers();
    for r in &mut authority {
        r.set_ttl(ttl);
    }
    msg.insert_name_servers(authority);

    let mut additionals = msg.take_additionals();
    for r in &mut additionals {
        if r.record_type() != RecordType::OPT {
            r.set_ttl(ttl);
        }
    }
    msg.insert_additionals(additionals);
}

/// Minimum TTL across the answer section, or 0 when it is empty
#[must_use]
pub fn min_answer_ttl(msg: &Message) -> u32 {
    msg.answers().iter().map(|r| r.ttl()).min().unwrap_or(0)
}

/// True if the message carries an EDNS client-subnet option
#[must_use]
pub fn has_ecs(msg: &Message) -> bool {
    msg.extensions()
        .as_ref()
        .is_some_and(|edns| edns.option(EdnsCode::Subnet).is_some())
}

/// Inject the configured client subnet into the query's OPT record
///
/// Creates the OPT record when absent. An existing subnet option is left
/// alone unless `overwrite` is set. The source prefix length is taken
/// verbatim from configuration; the scope prefix is always 0 on queries.
pub fn ensure_client_subnet(msg: &mut Message, addr: IpAddr, prefix: u8, overwrite: bool) {
    let edns = msg.extensions_mut().get_or_insert_with(|| {
        let mut edns = Edns::new();
        edns.set_max_payload(INJECTED_EDNS_PAYLOAD);
        edns
    });

    if overwrite || edns.option(EdnsCode::Subnet).is_none() {
        edns.options_mut()
            .insert(EdnsOption::Subnet(ClientSubnet::new(addr, prefix, 0)));
    }
}

/// Build a SERVFAIL reply mirroring the client's id and question
#[must_use]
pub fn reply_servfail(query: &Message) -> Message {
    let mut reply = Message::new();
    reply.set_id(query.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(query.op_code());
    reply.set_recursion_desired(query.recursion_desired());
    reply.set_recursion_available(true);
    reply.set_response_code(ResponseCode::ServFail);
    for q in query.queries() {
        reply.add_query(q.clone());
    }
    reply
}

/// Truncate an oversized UDP reply in place
///
/// Cuts the wire bytes back to the fixed header, sets the TC flag, and
/// zeroes all section counts; the client is expected to retry over TCP.
/// A no-op for replies within `max_size` or shorter than a header.
pub fn truncate_for_udp(bytes: &mut Vec<u8>, max_size: usize) {
    if bytes.len() <= max_size || bytes.len() < DNS_HEADER_LEN {
        return;
    }
    bytes.truncate(DNS_HEADER_LEN);
    // TC is bit 1 of the third header byte
    bytes[2] |= 0x02;
    for b in &mut bytes[4..DNS_HEADER_LEN] {
        *b = 0;
    }
}

/// Patch the transaction id of a serialized message in place
///
/// The id occupies the first two header bytes in network order. Used on
/// cache hits so the stored bytes never have to be re-encoded.
pub fn patch_id(bytes: &mut [u8], id: u16) {
    if bytes.len() >= 2 {
        bytes[..2].copy_from_slice(&id.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::{A, SOA};
    use hickory_proto::rr::{DNSClass, Name, RData, Record};

    use super::*;

    fn query_message(domain: &str, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_recursion_desired(true);
        let name = Name::from_str(domain).unwrap();
        msg.add_query(Query::query(name, RecordType::A));
        msg
    }

    fn a_record(domain: &str, ttl: u32, ip: Ipv4Addr) -> Record {
        let mut record = Record::new();
        record.set_name(Name::from_str(domain).unwrap());
        record.set_record_type(RecordType::A);
        record.set_dns_class(DNSClass::IN);
        record.set_ttl(ttl);
        record.set_data(Some(RData::A(A(ip))));
        record
    }

    // ========================================================================
    // QuestionKey
    // ========================================================================

    #[test]
    fn test_question_key_case_insensitive() {
        let a = QuestionKey::new("ExAmPlE.CoM.", 1, 1);
        let b = QuestionKey::new("example.com.", 1, 1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_question_key_appends_trailing_dot() {
        let key = QuestionKey::new("example.com", 28, 1);
        assert_eq!(key.name(), "example.com.");
        assert_eq!(key.qtype(), 28);
    }

    #[test]
    fn test_question_key_from_message() {
        let msg = query_message("example.com.", 0x1234);
        let key = QuestionKey::from_message(&msg).unwrap();
        assert_eq!(key.name(), "example.com.");
        assert_eq!(key.qtype(), 1);
        assert_eq!(key.qclass(), 1);
    }

    #[test]
    fn test_question_key_requires_exactly_one_question() {
        let empty = Message::new();
        assert!(QuestionKey::from_message(&empty).is_none());

        let mut two = query_message("a.com.", 1);
        two.add_query(Query::query(Name::from_str("b.com.").unwrap(), RecordType::A));
        assert!(QuestionKey::from_message(&two).is_none());
    }

    // ========================================================================
    // Parse / serialize
    // ========================================================================

    #[test]
    fn test_parse_round_trip() {
        let msg = query_message("example.com.", 0xBEEF);
        let bytes = serialize(&msg).unwrap();
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.id(), 0xBEEF);
        assert_eq!(parsed.queries().len(), 1);
    }

    #[test]
    fn test_parse_garbage_is_error_not_panic() {
        assert!(parse(&[0xFF; 5]).is_err());
        assert!(parse(&[]).is_err());
    }

    // ========================================================================
    // TTL operations
    // ========================================================================

    #[test]
    fn test_set_ttl_rewrites_all_sections() {
        let mut msg = query_message("example.com.", 1);
        msg.add_answer(a_record("example.com.", 300, Ipv4Addr::new(1, 2, 3, 4)));
        msg.add_answer(a_record("example.com.", 60, Ipv4Addr::new(5, 6, 7, 8)));

        let mut soa = Record::new();
        soa.set_name(Name::from_str("example.com.").unwrap());
        soa.set_record_type(RecordType::SOA);
        soa.set_dns_class(DNSClass::IN);
        soa.set_ttl(900);
        soa.set_data(Some(RData::SOA(SOA::new(
            Name::from_str("ns.example.com.").unwrap(),
            Name::from_str("admin.example.com.").unwrap(),
            1,
            3600,
            600,
            86400,
            60,
        ))));
        msg.add_name_server(soa);

        set_ttl(&mut msg, 120);

        assert!(msg.answers().iter().all(|r| r.ttl() == 120));
        assert!(msg.name_servers().iter().all(|r| r.ttl() == 120));
    }

    #[test]
    fn test_min_answer_ttl() {
        let mut msg = query_message("example.com.", 1);
        assert_eq!(min_answer_ttl(&msg), 0);

        msg.add_answer(a_record("example.com.", 300, Ipv4Addr::new(1, 2, 3, 4)));
        msg.add_answer(a_record("example.com.", 45, Ipv4Addr::new(5, 6, 7, 8)));
        assert_eq!(min_answer_ttl(&msg), 45);
    }

    // ========================================================================
    // EDNS client subnet
    // ========================================================================

    #[test]
    fn test_has_ecs_false_without_opt() {
        let msg = query_message("example.com.", 1);
        assert!(!has_ecs(&msg));
    }

    #[test]
    fn test_ensure_client_subnet_creates_opt() {
        let mut msg = query_message("example.com.", 1);
        ensure_client_subnet(&mut msg, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 0)), 24, false);

        assert!(has_ecs(&msg));
        let bytes = serialize(&msg).unwrap();
        assert!(has_ecs(&parse(&bytes).unwrap()));
    }

    #[test]
    fn test_ensure_client_subnet_keeps_existing_without_overwrite() {
        let mut msg = query_message("example.com.", 1);
        ensure_client_subnet(&mut msg, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 0)), 24, false);
        ensure_client_subnet(&mut msg, IpAddr::V4(Ipv4Addr::new(9, 9, 9, 0)), 16, false);

        let edns = msg.extensions().as_ref().unwrap();
        let Some(EdnsOption::Subnet(subnet)) = edns.option(EdnsCode::Subnet) else {
            panic!("subnet option missing");
        };
        assert_eq!(
            *subnet,
            ClientSubnet::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 0)), 24, 0)
        );
    }

    #[test]
    fn test_ensure_client_subnet_overwrite() {
        let mut msg = query_message("example.com.", 1);
        ensure_client_subnet(&mut msg, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 0)), 24, false);
        ensure_client_subnet(&mut msg, IpAddr::V4(Ipv4Addr::new(9, 9, 9, 0)), 16, true);

        let edns = msg.extensions().as_ref().unwrap();
        let Some(EdnsOption::Subnet(subnet)) = edns.option(EdnsCode::Subnet) else {
            panic!("subnet option missing");
        };
        assert_eq!(
            *subnet,
            ClientSubnet::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 0)), 16, 0)
        );
    }

    // ========================================================================
    // Reply builders
    // ========================================================================

    #[test]
    fn test_reply_servfail_mirrors_query() {
        let query = query_message("fail.example.", 0xABCD);
        let reply = reply_servfail(&query);

        assert_eq!(reply.id(), 0xABCD);
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert_eq!(reply.queries(), query.queries());
        assert!(reply.recursion_available());
    }

    #[test]
    fn test_truncate_for_udp() {
        let mut msg = query_message("example.com.", 0x0102);
        msg.set_message_type(MessageType::Response);
        for i in 0..60 {
            msg.add_answer(a_record("example.com.", 300, Ipv4Addr::new(10, 0, 0, i)));
        }
        let mut bytes = serialize(&msg).unwrap();
        assert!(bytes.len() > 512);

        truncate_for_udp(&mut bytes, 512);

        assert_eq!(bytes.len(), DNS_HEADER_LEN);
        let parsed = parse(&bytes).unwrap();
        assert!(parsed.truncated());
        assert_eq!(parsed.id(), 0x0102);
        assert!(parsed.answers().is_empty());
        assert!(parsed.queries().is_empty());
    }

    #[test]
    fn test_truncate_for_udp_noop_when_small() {
        let msg = query_message("example.com.", 1);
        let mut bytes = serialize(&msg).unwrap();
        let before = bytes.clone();
        truncate_for_udp(&mut bytes, 1480);
        assert_eq!(bytes, before);
    }

    #[test]
    fn test_patch_id() {
        let msg = query_message("example.com.", 0x1111);
        let mut bytes = serialize(&msg).unwrap();
        patch_id(&mut bytes, 0x2222);
        assert_eq!(parse(&bytes).unwrap().id(), 0x2222);
    }
}
