//! Shared stream pipeline for TCP and DoT transports
//!
//! One [`Pipeline`] wraps one long-lived connection. Queries from any
//! number of tasks are framed with a 2-byte length prefix, written under
//! a write lock, and matched to replies by a reader task that
//! demultiplexes on transaction id. Cancelling one waiter only drops its
//! pending entry; the connection stays healthy for the others.
//!
//! The reader applies the configured idle timeout to every frame read.
//! On idle expiry, EOF, or a read error it marks the pipeline closed and
//! fails the remaining waiters; the owning transport dials a fresh
//! connection on the next exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::demux::PendingMap;
use crate::error::{DnsError, DnsResult};
use crate::message;

/// Largest framed message accepted from a peer
const MAX_FRAME_SIZE: usize = 65_535;

/// Object-safe byte stream; plain TCP or TLS over TCP
pub(crate) trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// A dialed stream, type-erased so TCP and DoT share one pipeline
pub(crate) type BoxedStream = Box<dyn RawStream>;

/// One multiplexed connection to an upstream
pub(crate) struct Pipeline {
    peer: String,
    write: Arc<tokio::sync::Mutex<WriteHalf<BoxedStream>>>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Take ownership of `stream` and start its reader task
    pub(crate) fn start(
        stream: BoxedStream,
        idle_timeout: Duration,
        peer: String,
    ) -> Arc<Self> {
        let (read, write) = tokio::io::split(stream);
        let pending = PendingMap::new();
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(reader_loop(
            read,
            Arc::clone(&pending),
            Arc::clone(&closed),
            idle_timeout,
            peer.clone(),
        ));

        Arc::new(Self {
            peer,
            write: Arc::new(tokio::sync::Mutex::new(write)),
            pending,
            closed,
            reader,
        })
    }

    /// True once the reader has given up on the connection
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one query and await its demultiplexed reply
    ///
    /// The caller's deadline bounds the wait; this method itself only
    /// fails fast when the connection is already dead.
    pub(crate) async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        if self.is_closed() {
            return Err(DnsError::protocol(&self.peer, "connection closed"));
        }

        let mut wire = message::serialize(query)?;
        if wire.len() > MAX_FRAME_SIZE {
            return Err(DnsError::serialize(format!(
                "query too large for stream transport: {} bytes",
                wire.len()
            )));
        }

        let (id, _guard, rx) = self.pending.register(query);
        message::patch_id(&mut wire, id);

        let mut frame = Vec::with_capacity(2 + wire.len());
        frame.extend_from_slice(&(wire.len() as u16).to_be_bytes());
        frame.extend_from_slice(&wire);

        // the write runs detached so a waiter cancelled mid-exchange can
        // never leave half a frame on the shared connection
        let write = Arc::clone(&self.write);
        let peer = self.peer.clone();
        tokio::spawn(async move {
            let mut write = write.lock().await;
            if let Err(e) = write.write_all(&frame).await {
                debug!(peer, error = %e, "pipeline write failed");
                return;
            }
            if let Err(e) = write.flush().await {
                debug!(peer, error = %e, "pipeline flush failed");
            }
        });

        let mut reply = rx
            .await
            .map_err(|_| DnsError::protocol(&self.peer, "connection closed before reply"))?;
        reply.set_id(query.id());
        Ok(reply)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Read length-prefixed frames and route them until the connection dies
async fn reader_loop(
    mut read: ReadHalf<BoxedStream>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    idle_timeout: Duration,
    peer: String,
) {
    let mut len_buf = [0u8; 2];
    loop {
        match timeout(idle_timeout, read.read_exact(&mut len_buf)).await {
            Err(_) => {
                trace!(peer, "idle timeout, closing connection");
                break;
            }
            Ok(Err(e)) => {
                debug!(peer, error = %e, "connection read failed");
                break;
            }
            Ok(Ok(_)) => {}
        }

        let len = usize::from(u16::from_be_bytes(len_buf));
        if len == 0 {
            debug!(peer, "zero-length frame from peer");
            break;
        }

        let mut body = vec![0u8; len];
        match timeout(idle_timeout, read.read_exact(&mut body)).await {
            Err(_) | Ok(Err(_)) => {
                debug!(peer, "connection died mid-frame");
                break;
            }
            Ok(Ok(_)) => {}
        }

        match message::parse(&body) {
            Ok(reply) => {
                pending.route(reply);
            }
            Err(e) => {
                debug!(peer, error = %e, "unparseable frame from upstream");
            }
        }
    }

    closed.store(true, Ordering::Release);
    pending.fail_all();
}

/// Holder for the one shared connection of a transport
///
/// Transports dial outside the lock; when two dials race, the first one
/// adopted wins and the loser is dropped.
#[derive(Debug, Default)]
pub(crate) struct ConnectionSlot {
    slot: parking_lot::Mutex<Option<Arc<Pipeline>>>,
}

impl ConnectionSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The current connection, if it is still alive
    pub(crate) fn live(&self) -> Option<Arc<Pipeline>> {
        let slot = self.slot.lock();
        slot.as_ref().filter(|c| !c.is_closed()).cloned()
    }

    /// Install `conn` unless a live connection appeared in the meantime
    pub(crate) fn adopt(&self, conn: Arc<Pipeline>) -> Arc<Pipeline> {
        let mut slot = self.slot.lock();
        if let Some(existing) = slot.as_ref().filter(|c| !c.is_closed()) {
            return Arc::clone(existing);
        }
        *slot = Some(Arc::clone(&conn));
        conn
    }
}
