//! Upstream resolvers
//!
//! One [`Upstream`] per configured resolver endpoint. The transport
//! variants (UDP, TCP, DoT, DoH) all satisfy the [`Transport`] trait;
//! [`Upstream`] layers the cross-cutting behavior on top:
//!
//! - per-exchange deadline
//! - concurrency cap (`max_concurrent_queries`)
//! - in-flight deduplication (`deduplicate`)
//! - EDNS client-subnet injection
//! - the resolved response policy, applied by the dispatcher via
//!   [`Upstream::filter`]
//!
//! Upstreams are built once at startup from validated configuration and
//! shared immutably between dispatch tasks.

mod dedup;
mod demux;
mod doh;
mod dot;
mod pipeline;
mod socks5;
mod tcp;
mod tls;
mod udp;

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::sync::Semaphore;

pub use dedup::InflightRegistry;
pub use doh::DohTransport;
pub use dot::DotTransport;
pub use tcp::TcpTransport;
pub use tls::TlsSettings;
pub use udp::UdpTransport;

use crate::config::{Protocol, UpstreamOptions};
use crate::error::{DnsError, DnsResult};
use crate::matchset::MatchSets;
use crate::message::{self, QuestionKey};
use crate::policy::{PolicyDecision, ResponsePolicy};

/// One resolver endpoint: send a query, await the matching reply
///
/// Implementations multiplex concurrent exchanges internally and must
/// tolerate having their futures dropped at any suspension point.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Exchange one query; the reply carries the query's transaction id
    async fn exchange(&self, query: &Message) -> DnsResult<Message>;
}

/// A configured upstream with its policy and exchange discipline
#[derive(Debug)]
pub struct Upstream {
    tag: String,
    transport: Arc<dyn Transport>,
    policy: ResponsePolicy,
    timeout: Duration,
    client_subnet: Option<(IpAddr, u8, bool)>,
    dedup: Option<InflightRegistry>,
    limit: Option<Arc<Semaphore>>,
}

impl Upstream {
    /// Wrap a transport with default settings and an accept-all policy
    #[must_use]
    pub fn new(tag: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            tag: tag.into(),
            transport,
            policy: ResponsePolicy::new(),
            timeout: Duration::from_secs(5),
            client_subnet: None,
            dedup: None,
            limit: None,
        }
    }

    /// Build an upstream from validated configuration
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` for unresolvable addresses, bad TLS
    /// server names, or dangling policy set references.
    pub fn from_options(
        tag: &str,
        options: &UpstreamOptions,
        sets: &MatchSets,
        tls: &TlsSettings,
    ) -> DnsResult<Self> {
        let policy = ResponsePolicy::from_options(&options.policies, sets)?;
        let proxy = options
            .socks5
            .as_deref()
            .map(|addr| resolve_addr(tag, addr))
            .transpose()?;

        let transport: Arc<dyn Transport> = match options.protocol {
            Protocol::Udp => Arc::new(UdpTransport::new(tag, resolve_addr(tag, &options.addr)?)),
            Protocol::Tcp => Arc::new(TcpTransport::new(
                tag,
                resolve_addr(tag, &options.addr)?,
                proxy,
                Duration::from_secs(options.tcp.idle_timeout.max(1)),
            )),
            Protocol::Dot => {
                let server = resolve_addr(tag, &options.addr)?;
                let sni = if options.dot.server_name.is_empty() {
                    host_part(&options.addr)
                } else {
                    options.dot.server_name.as_str()
                };
                Arc::new(DotTransport::new(
                    tag,
                    server,
                    TlsSettings::server_name(sni)?,
                    proxy,
                    Duration::from_secs(options.dot.idle_timeout.max(1)),
                    tls.client_config(options.insecure_skip_verify),
                ))
            }
            Protocol::Doh => Arc::new(DohTransport::new(
                tag,
                &options.doh.url,
                tls.client_config(options.insecure_skip_verify),
            )?),
        };

        let mut upstream = Self::new(tag, transport)
            .with_policy(policy)
            .with_timeout(Duration::from_secs(options.timeout.max(1)))
            .with_deduplicate(options.deduplicate);
        if options.max_concurrent_queries > 0 {
            upstream = upstream.with_max_concurrent(options.max_concurrent_queries);
        }
        if let Some(subnet) = options.client_subnet()? {
            upstream = upstream.with_client_subnet(
                subnet.addr(),
                subnet.prefix(),
                options.edns0.overwrite_ecs,
            );
        }
        Ok(upstream)
    }

    /// Replace the response policy
    #[must_use]
    pub fn with_policy(mut self, policy: ResponsePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the per-exchange deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable in-flight deduplication
    #[must_use]
    pub fn with_deduplicate(mut self, dedup: bool) -> Self {
        self.dedup = dedup.then(InflightRegistry::new);
        self
    }

    /// Cap simultaneous exchanges
    #[must_use]
    pub fn with_max_concurrent(mut self, cap: usize) -> Self {
        self.limit = Some(Arc::new(Semaphore::new(cap)));
        self
    }

    /// Inject this client subnet before each exchange
    #[must_use]
    pub fn with_client_subnet(mut self, addr: IpAddr, prefix: u8, overwrite: bool) -> Self {
        self.client_subnet = Some((addr, prefix, overwrite));
        self
    }

    /// The configured tag
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Apply this upstream's policy to a candidate reply
    #[must_use]
    pub fn filter(&self, query: &Message, reply: &Message) -> PolicyDecision {
        self.policy.evaluate(query, reply)
    }

    /// Exchange one query, honoring dedup, cap, and deadline
    ///
    /// # Errors
    ///
    /// Returns an `Upstream` error; the dispatcher recovers it at the
    /// task boundary.
    pub async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        match (&self.dedup, QuestionKey::from_message(query)) {
            (Some(registry), Some(key)) => {
                registry
                    .exchange(&self.tag, key, query.id(), self.exchange_direct(query))
                    .await
            }
            _ => self.exchange_direct(query).await,
        }
    }

    async fn exchange_direct(&self, query: &Message) -> DnsResult<Message> {
        let attempt = async {
            let _permit = match &self.limit {
                Some(semaphore) => Some(
                    semaphore
                        .acquire()
                        .await
                        .map_err(|_| DnsError::busy(&self.tag))?,
                ),
                None => None,
            };

            match self.client_subnet {
                Some((addr, prefix, overwrite)) => {
                    let mut query = query.clone();
                    message::ensure_client_subnet(&mut query, addr, prefix, overwrite);
                    self.transport.exchange(&query).await
                }
                None => self.transport.exchange(query).await,
            }
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(DnsError::upstream_timeout(&self.tag, self.timeout)),
        }
    }
}

/// Resolve `host:port` once at startup
fn resolve_addr(tag: &str, addr: &str) -> DnsResult<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| DnsError::config(format!("upstream '{tag}': cannot resolve '{addr}': {e}")))?
        .next()
        .ok_or_else(|| {
            DnsError::config(format!("upstream '{tag}': no address found for '{addr}'"))
        })
}

/// Host portion of a `host:port` string, brackets stripped
fn host_part(addr: &str) -> &str {
    if let Some(stripped) = addr.strip_prefix('[') {
        stripped.split(']').next().unwrap_or(addr)
    } else {
        addr.rsplit_once(':').map_or(addr, |(host, _)| host)
    }
}
