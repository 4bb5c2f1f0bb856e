//! Plain TCP upstream transport
//!
//! One shared [`Pipeline`] per upstream carries every in-flight query;
//! a new connection is dialed on demand after the previous one went
//! idle or died. The optional SOCKS5 proxy applies to the dial only.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tracing::debug;

use super::pipeline::{ConnectionSlot, Pipeline};
use super::socks5;
use super::Transport;
use crate::error::DnsResult;

/// TCP DNS client for one upstream
#[derive(Debug)]
pub struct TcpTransport {
    tag: String,
    server: SocketAddr,
    proxy: Option<SocketAddr>,
    idle_timeout: Duration,
    conn: ConnectionSlot,
}

impl TcpTransport {
    /// Create a transport for `server`; connections are dialed lazily
    #[must_use]
    pub fn new(
        tag: impl Into<String>,
        server: SocketAddr,
        proxy: Option<SocketAddr>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            tag: tag.into(),
            server,
            proxy,
            idle_timeout,
            conn: ConnectionSlot::new(),
        }
    }

    async fn connection(&self) -> DnsResult<std::sync::Arc<Pipeline>> {
        if let Some(conn) = self.conn.live() {
            return Ok(conn);
        }

        let stream = socks5::dial(&self.tag, self.server, self.proxy).await?;
        stream.set_nodelay(true).ok();
        debug!(upstream = %self.tag, server = %self.server, "tcp connection dialed");

        let pipeline = Pipeline::start(
            Box::new(stream),
            self.idle_timeout,
            format!("{}({})", self.tag, self.server),
        );
        Ok(self.conn.adopt(pipeline))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let conn = self.connection().await?;
        conn.exchange(query).await
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::{Name, RecordType};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::message;

    fn query(domain: &str, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        msg
    }

    /// Accept connections and answer every framed query on each
    async fn mock_tcp_resolver(listener: TcpListener) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                loop {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let mut body = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
                    if stream.read_exact(&mut body).await.is_err() {
                        return;
                    }
                    let mut reply = message::parse(&body).unwrap();
                    reply.set_message_type(MessageType::Response);
                    let wire = message::serialize(&reply).unwrap();
                    let mut frame = (wire.len() as u16).to_be_bytes().to_vec();
                    frame.extend_from_slice(&wire);
                    if stream.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            });
        }
    }

    async fn spawn_resolver() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(mock_tcp_resolver(listener));
        addr
    }

    #[tokio::test]
    async fn test_exchange_over_tcp() {
        let server = spawn_resolver().await;
        let transport = TcpTransport::new("mock", server, None, Duration::from_secs(5));

        let reply = transport.exchange(&query("example.com.", 0xBBBB)).await.unwrap();
        assert_eq!(reply.id(), 0xBBBB);
    }

    #[tokio::test]
    async fn test_connection_reuse() {
        let server = spawn_resolver().await;
        let transport = Arc::new(TcpTransport::new(
            "mock",
            server,
            None,
            Duration::from_secs(5),
        ));

        transport.exchange(&query("a.example.", 1)).await.unwrap();
        let first = transport.conn.live().unwrap();

        transport.exchange(&query("b.example.", 2)).await.unwrap();
        let second = transport.conn.live().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_redial_after_idle_close() {
        let server = spawn_resolver().await;
        let transport = TcpTransport::new("mock", server, None, Duration::from_millis(30));

        transport.exchange(&query("a.example.", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(transport.conn.live().is_none());

        // a fresh connection is dialed transparently
        let reply = transport.exchange(&query("b.example.", 2)).await.unwrap();
        assert_eq!(reply.id(), 2);
    }

    #[tokio::test]
    async fn test_dial_failure() {
        // unroutable port on localhost
        let transport = TcpTransport::new(
            "dead",
            "127.0.0.1:1".parse().unwrap(),
            None,
            Duration::from_secs(1),
        );
        assert!(transport.exchange(&query("a.example.", 1)).await.is_err());
    }
}
