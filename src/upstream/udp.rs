//! UDP upstream transport
//!
//! One unconnected socket per upstream, shared by every in-flight
//! exchange. A demultiplexer task owns the receive side and routes
//! replies by transaction id (and question, for safety) through the
//! shared [`PendingMap`]; datagrams from any address other than the
//! configured server are dropped on the floor.
//!
//! There is no retransmission at this layer; the caller's deadline
//! drives retries.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::demux::PendingMap;
use super::Transport;
use crate::error::{DnsError, DnsResult};
use crate::message;

/// Receive buffer size; large enough for EDNS0 replies
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// The lazily created socket and its demux task
#[derive(Debug)]
struct UdpChannel {
    socket: Arc<UdpSocket>,
    pending: Arc<PendingMap>,
    demux: JoinHandle<()>,
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

/// UDP DNS client for one upstream
#[derive(Debug)]
pub struct UdpTransport {
    tag: String,
    server: SocketAddr,
    channel: tokio::sync::OnceCell<UdpChannel>,
}

impl UdpTransport {
    /// Create a transport for `server`; the socket is bound on first use
    #[must_use]
    pub fn new(tag: impl Into<String>, server: SocketAddr) -> Self {
        Self {
            tag: tag.into(),
            server,
            channel: tokio::sync::OnceCell::new(),
        }
    }

    /// The configured server address
    #[must_use]
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    async fn channel(&self) -> DnsResult<&UdpChannel> {
        self.channel
            .get_or_try_init(|| async {
                let bind_addr: SocketAddr = if self.server.is_ipv4() {
                    "0.0.0.0:0".parse().expect("fixed address")
                } else {
                    "[::]:0".parse().expect("fixed address")
                };
                let socket = UdpSocket::bind(bind_addr)
                    .await
                    .map_err(|e| DnsError::io(&self.tag, "failed to bind UDP socket", e))?;
                let socket = Arc::new(socket);
                let pending = PendingMap::new();

                let demux = tokio::spawn(demux_loop(
                    Arc::clone(&socket),
                    Arc::clone(&pending),
                    self.server,
                    self.tag.clone(),
                ));

                Ok(UdpChannel {
                    socket,
                    pending,
                    demux,
                })
            })
            .await
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let channel = self.channel().await?;

        let mut wire = message::serialize(query)?;
        let (id, _guard, rx) = channel.pending.register(query);
        message::patch_id(&mut wire, id);
        trace!(upstream = %self.tag, id, "udp query sent");

        channel
            .socket
            .send_to(&wire, self.server)
            .await
            .map_err(|e| DnsError::io(&self.tag, format!("send to {} failed", self.server), e))?;

        let mut reply = rx
            .await
            .map_err(|_| DnsError::protocol(&self.tag, "demultiplexer gone"))?;
        reply.set_id(query.id());
        Ok(reply)
    }
}

/// Read datagrams forever, routing each to its waiter
async fn demux_loop(
    socket: Arc<UdpSocket>,
    pending: Arc<PendingMap>,
    server: SocketAddr,
    tag: String,
) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(upstream = %tag, error = %e, "udp receive failed");
                continue;
            }
        };

        if src != server {
            trace!(upstream = %tag, %src, "datagram from unexpected source dropped");
            continue;
        }

        match message::parse(&buf[..len]) {
            Ok(reply) => {
                pending.route(reply);
            }
            Err(e) => {
                debug!(upstream = %tag, error = %e, "unparseable datagram from upstream");
            }
        }
    }
}
