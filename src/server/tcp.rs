//! TCP listener
//!
//! Accepts connections and reads 2-byte length-prefixed frames until
//! the peer closes or the per-connection idle timeout elapses. Each
//! frame is dispatched concurrently; replies are written back
//! length-prefixed in completion order, which is fine because every
//! frame carries its own transaction id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info};

use super::handle_wire;
use crate::dispatcher::Dispatcher;
use crate::error::{DnsError, DnsResult};

/// How long a client connection may sit idle between frames
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest frame accepted from a client
const MAX_FRAME_SIZE: usize = 65_535;

/// TCP DNS listener
pub struct TcpServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    local_addr: SocketAddr,
}

impl TcpServer {
    /// Bind the listener
    ///
    /// # Errors
    ///
    /// Returns an `Io` error when the socket cannot be bound.
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> DnsResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DnsError::io("listener", format!("cannot bind tcp {addr}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DnsError::io("listener", "cannot read local address", e))?;
        info!(addr = %local_addr, "tcp server bound");

        Ok(Self {
            listener,
            dispatcher,
            local_addr,
        })
    }

    /// The bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the shutdown receiver fires
    ///
    /// Open connections and their in-flight dispatches are aborted on
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Returns an `Io` error on a fatal accept failure.
    pub async fn run_until_shutdown(&self, mut shutdown: oneshot::Receiver<()>) -> DnsResult<()> {
        let mut connections = JoinSet::new();

        loop {
            while connections.try_join_next().is_some() {}

            tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %self.local_addr, "tcp server shutting down");
                    connections.abort_all();
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            debug!(error = %e, "tcp accept failed");
                            continue;
                        }
                    };
                    let dispatcher = Arc::clone(&self.dispatcher);
                    connections.spawn(async move {
                        serve_connection(stream, dispatcher).await;
                        debug!(%peer, "tcp connection ended");
                    });
                }
            }
        }
    }
}

/// Read frames from one client until EOF, error, or idle timeout
async fn serve_connection(stream: TcpStream, dispatcher: Arc<Dispatcher>) {
    let (mut read, write) = stream.into_split();
    let write = Arc::new(tokio::sync::Mutex::new(write));
    let mut frames = JoinSet::new();

    loop {
        while frames.try_join_next().is_some() {}

        let mut len_buf = [0u8; 2];
        match timeout(CLIENT_IDLE_TIMEOUT, read.read_exact(&mut len_buf)).await {
            Err(_) => break,          // idle
            Ok(Err(_)) => break,      // EOF or reset
            Ok(Ok(_)) => {}
        }

        let len = usize::from(u16::from_be_bytes(len_buf));
        if len == 0 || len > MAX_FRAME_SIZE {
            break;
        }
        let mut wire = vec![0u8; len];
        if timeout(CLIENT_IDLE_TIMEOUT, read.read_exact(&mut wire))
            .await
            .map_or(true, |r| r.is_err())
        {
            break;
        }

        let dispatcher = Arc::clone(&dispatcher);
        let write = Arc::clone(&write);
        frames.spawn(async move {
            let Some(reply) = handle_wire(&dispatcher, &wire).await else {
                return;
            };
            let mut frame = Vec::with_capacity(2 + reply.len());
            frame.extend_from_slice(&(reply.len() as u16).to_be_bytes());
            frame.extend_from_slice(&reply);

            let mut write = write.lock().await;
            if let Err(e) = write.write_all(&frame).await {
                debug!(error = %e, "tcp reply write failed");
            }
        });
    }

    // let in-flight frames finish before the write half drops
    while frames.join_next().await.is_some() {}
    shutdown_write(&write).await;
}

async fn shutdown_write(write: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>) {
    let mut write = write.lock().await;
    let _ = write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::{Name, RData, RecordType};

    use super::*;
    use crate::message;
    use crate::server::test_support;

    async fn start_server() -> (SocketAddr, oneshot::Sender<()>) {
        let dispatcher = Arc::new(Dispatcher::new(
            vec![test_support::upstream(Ipv4Addr::new(9, 9, 9, 9))],
            0,
            0,
        ));
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), dispatcher)
            .await
            .unwrap();
        let addr = server.local_addr();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move { server.run_until_shutdown(rx).await });
        (addr, tx)
    }

    fn framed_query(domain: &str, id: u16) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        let wire = message::serialize(&msg).unwrap();
        let mut frame = (wire.len() as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(&wire);
        frame
    }

    async fn read_reply(stream: &mut TcpStream) -> Message {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut body = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
        stream.read_exact(&mut body).await.unwrap();
        message::parse(&body).unwrap()
    }

    #[tokio::test]
    async fn test_single_query() {
        let (addr, _shutdown) = start_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(&framed_query("example.com.", 0x1111)).await.unwrap();
        let reply = read_reply(&mut client).await;

        assert_eq!(reply.id(), 0x1111);
        assert_eq!(reply.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_pipelined_frames_any_order() {
        let (addr, _shutdown) = start_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // the "slow." name is delayed by the mock resolver, so the second
        // frame overtakes the first
        let mut both = framed_query("slow.example.", 0xAAAA);
        both.extend_from_slice(&framed_query("fast.example.", 0xBBBB));
        client.write_all(&both).await.unwrap();

        let first = read_reply(&mut client).await;
        let second = read_reply(&mut client).await;

        assert_eq!(first.id(), 0xBBBB);
        assert_eq!(second.id(), 0xAAAA);
        for reply in [&first, &second] {
            let RData::A(a) = reply.answers()[0].data().unwrap() else {
                panic!("expected A answer");
            };
            assert_eq!(a.0, Ipv4Addr::new(9, 9, 9, 9));
        }
    }

    #[tokio::test]
    async fn test_zero_length_frame_closes_connection() {
        let (addr, _shutdown) = start_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(&[0u8, 0u8]).await.unwrap();

        let mut buf = [0u8; 1];
        let read = client.read(&mut buf).await.unwrap();
        assert_eq!(read, 0);
    }
}
