//! UDP listener
//!
//! Receives datagrams up to `max_udp_size`, spawns a short-lived task
//! per query, and writes the serialized reply back to the source
//! address. Malformed datagrams are dropped silently. Replies that do
//! not fit `max_udp_size` are cut back to the header with TC set so the
//! client retries over TCP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::handle_wire;
use crate::dispatcher::Dispatcher;
use crate::error::{DnsError, DnsResult};
use crate::message;

/// Listener counters
#[derive(Debug, Default)]
pub struct UdpServerStats {
    received: AtomicU64,
    answered: AtomicU64,
    dropped: AtomicU64,
}

impl UdpServerStats {
    /// Datagrams received
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Replies written
    #[must_use]
    pub fn answered(&self) -> u64 {
        self.answered.load(Ordering::Relaxed)
    }

    /// Queries dropped (unparseable or unanswerable)
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// UDP DNS listener
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    max_udp_size: usize,
    local_addr: SocketAddr,
    stats: Arc<UdpServerStats>,
}

impl UdpServer {
    /// Bind the listener
    ///
    /// # Errors
    ///
    /// Returns an `Io` error when the socket cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        max_udp_size: usize,
    ) -> DnsResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| DnsError::io("listener", format!("cannot bind udp {addr}"), e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| DnsError::io("listener", "cannot read local address", e))?;
        info!(addr = %local_addr, "udp server bound");

        Ok(Self {
            socket: Arc::new(socket),
            dispatcher,
            max_udp_size,
            local_addr,
            stats: Arc::new(UdpServerStats::default()),
        })
    }

    /// The bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Listener counters
    #[must_use]
    pub fn stats(&self) -> Arc<UdpServerStats> {
        Arc::clone(&self.stats)
    }

    /// Serve until the shutdown receiver fires
    ///
    /// In-flight handler tasks are aborted on shutdown, which cancels
    /// their dispatches.
    ///
    /// # Errors
    ///
    /// Returns an `Io` error on a fatal socket failure.
    pub async fn run_until_shutdown(&self, mut shutdown: oneshot::Receiver<()>) -> DnsResult<()> {
        let mut buf = vec![0u8; self.max_udp_size.max(512)];
        let mut tasks = JoinSet::new();

        loop {
            // reap finished handlers so the set stays small
            while tasks.try_join_next().is_some() {}

            tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %self.local_addr, "udp server shutting down");
                    tasks.abort_all();
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            debug!(error = %e, "udp receive failed");
                            continue;
                        }
                    };
                    self.stats.received.fetch_add(1, Ordering::Relaxed);

                    let wire = buf[..len].to_vec();
                    let socket = Arc::clone(&self.socket);
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let stats = Arc::clone(&self.stats);
                    let max_udp_size = self.max_udp_size;

                    tasks.spawn(async move {
                        match handle_wire(&dispatcher, &wire).await {
                            Some(mut reply) => {
                                message::truncate_for_udp(&mut reply, max_udp_size);
                                match socket.send_to(&reply, peer).await {
                                    Ok(_) => {
                                        stats.answered.fetch_add(1, Ordering::Relaxed);
                                    }
                                    Err(e) => {
                                        debug!(error = %e, %peer, "udp send failed");
                                        stats.dropped.fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                            }
                            None => {
                                stats.dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    });
                }
            }
        }
    }
}
