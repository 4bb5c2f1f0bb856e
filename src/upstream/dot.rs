//! DNS-over-TLS upstream transport (RFC 7858)
//!
//! The same length-prefixed pipeline as plain TCP, wrapped in TLS.
//! SNI comes from the configured `server_name` (falling back to the
//! host part of the address at build time); the trust store is the
//! shared [`TlsSettings`](super::TlsSettings) one. The optional SOCKS5
//! proxy applies to the TCP dial under the TLS session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::pipeline::{ConnectionSlot, Pipeline};
use super::socks5;
use super::Transport;
use crate::error::{DnsError, DnsResult};

/// DoT DNS client for one upstream
pub struct DotTransport {
    tag: String,
    server: SocketAddr,
    server_name: ServerName<'static>,
    proxy: Option<SocketAddr>,
    idle_timeout: Duration,
    connector: TlsConnector,
    conn: ConnectionSlot,
}

impl std::fmt::Debug for DotTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DotTransport")
            .field("tag", &self.tag)
            .field("server", &self.server)
            .field("server_name", &self.server_name)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl DotTransport {
    /// Create a transport for `server` with the given SNI and TLS config
    #[must_use]
    pub fn new(
        tag: impl Into<String>,
        server: SocketAddr,
        server_name: ServerName<'static>,
        proxy: Option<SocketAddr>,
        idle_timeout: Duration,
        tls_config: ClientConfig,
    ) -> Self {
        Self {
            tag: tag.into(),
            server,
            server_name,
            proxy,
            idle_timeout,
            connector: TlsConnector::from(Arc::new(tls_config)),
            conn: ConnectionSlot::new(),
        }
    }

    async fn connection(&self) -> DnsResult<Arc<Pipeline>> {
        if let Some(conn) = self.conn.live() {
            return Ok(conn);
        }

        let tcp = socks5::dial(&self.tag, self.server, self.proxy).await?;
        tcp.set_nodelay(true).ok();

        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| DnsError::handshake(&self.tag, format!("TLS handshake failed: {e}")))?;
        debug!(upstream = %self.tag, server = %self.server, "dot connection established");

        let pipeline = Pipeline::start(
            Box::new(tls),
            self.idle_timeout,
            format!("{}({})", self.tag, self.server),
        );
        Ok(self.conn.adopt(pipeline))
    }
}

#[async_trait]
impl Transport for DotTransport {
    async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let conn = self.connection().await?;
        conn.exchange(query).await
    }
}
