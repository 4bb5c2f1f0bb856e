//! Client-facing listeners
//!
//! A [`UdpServer`] and a [`TcpServer`] accept wire queries and hand them
//! to the shared [`Dispatcher`]. Both parse each message, dispatch it
//! with the per-dispatch deadline, and write a reply back:
//!
//! - an accepted upstream reply, serialized as-is
//! - SERVFAIL mirroring the client's id and question when the dispatch
//!   failed or timed out
//! - nothing at all when the query itself was unparseable
//!
//! Servers run until their shutdown receiver fires, then stop accepting
//! and abort in-flight handler tasks, which cancels the dispatches
//! underneath promptly.

mod tcp;
mod udp;

pub use tcp::TcpServer;
pub use udp::UdpServer;

use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::message;

/// Parse, dispatch, and serialize one wire query
///
/// Returns `None` when the datagram is unparseable or the reply cannot
/// be serialized; the caller drops the query silently.
pub(crate) async fn handle_wire(dispatcher: &Dispatcher, wire: &[u8]) -> Option<Vec<u8>> {
    let query = match message::parse(wire) {
        Ok(query) => query,
        Err(e) => {
            debug!(error = %e, "dropping malformed query");
            return None;
        }
    };

    let reply = match dispatcher.serve(&query).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!(error = %e, "dispatch failed, answering SERVFAIL");
            message::reply_servfail(&query)
        }
    };

    match message::serialize(&reply) {
        Ok(wire) => Some(wire),
        Err(e) => {
            warn!(error = %e, "reply serialization failed");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use hickory_proto::op::{Message, MessageType};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, RData, Record, RecordType};

    use crate::error::DnsResult;
    use crate::upstream::{Transport, Upstream};

    /// Answers every A query with one fixed address; queries whose name
    /// starts with "slow" are delayed
    #[derive(Debug)]
    pub(crate) struct StaticResolver {
        pub(crate) ip: Ipv4Addr,
        pub(crate) slow_delay: Duration,
    }

    #[async_trait]
    impl Transport for StaticResolver {
        async fn exchange(&self, query: &Message) -> DnsResult<Message> {
            let name = query.queries()[0].name().clone();
            if name.to_string().starts_with("slow") {
                tokio::time::sleep(self.slow_delay).await;
            }

            let mut reply = query.clone();
            reply.set_message_type(MessageType::Response);
            let mut record = Record::new();
            record.set_name(name);
            record.set_record_type(RecordType::A);
            record.set_dns_class(DNSClass::IN);
            record.set_ttl(60);
            record.set_data(Some(RData::A(A(self.ip))));
            reply.add_answer(record);
            Ok(reply)
        }
    }

    pub(crate) fn upstream(ip: Ipv4Addr) -> Arc<Upstream> {
        Arc::new(Upstream::new(
            "static",
            Arc::new(StaticResolver {
                ip,
                slow_delay: Duration::from_millis(80),
            }),
        ))
    }
}
