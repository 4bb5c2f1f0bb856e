//! SOCKS5 CONNECT dialing (RFC 1928)
//!
//! Stream transports optionally reach their upstream through a SOCKS5
//! proxy. Only the CONNECT command with no authentication is needed
//! here; the target is always a literal socket address, so the domain
//! address type never goes on the wire.

use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{DnsError, DnsResult};

/// SOCKS protocol version
const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required
const AUTH_METHOD_NONE: u8 = 0x00;

/// CONNECT command
const CMD_CONNECT: u8 = 0x01;

/// IPv4 address type
const ATYP_IPV4: u8 = 0x01;

/// Domain address type (appears in server replies)
const ATYP_DOMAIN: u8 = 0x03;

/// IPv6 address type
const ATYP_IPV6: u8 = 0x04;

/// Request succeeded
const REPLY_SUCCEEDED: u8 = 0x00;

/// Human-readable SOCKS5 reply code
const fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Open a TCP connection to `target`, via `proxy` when configured
///
/// # Errors
///
/// Returns a `Dial` error when the connection cannot be established and
/// a `Protocol` error when the proxy rejects the request.
pub(crate) async fn dial(
    tag: &str,
    target: SocketAddr,
    proxy: Option<SocketAddr>,
) -> DnsResult<TcpStream> {
    let Some(proxy) = proxy else {
        return TcpStream::connect(target)
            .await
            .map_err(|e| DnsError::dial(tag, format!("connect to {target} failed: {e}")));
    };

    let mut stream = TcpStream::connect(proxy)
        .await
        .map_err(|e| DnsError::dial(tag, format!("connect to proxy {proxy} failed: {e}")))?;

    handshake(tag, &mut stream).await?;
    connect(tag, &mut stream, target).await?;
    Ok(stream)
}

/// Method negotiation: offer no-auth only
async fn handshake(tag: &str, stream: &mut TcpStream) -> DnsResult<()> {
    stream
        .write_all(&[SOCKS5_VERSION, 1, AUTH_METHOD_NONE])
        .await
        .map_err(|e| DnsError::io(tag, "proxy greeting failed", e))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| DnsError::io(tag, "proxy method reply failed", e))?;

    if reply[0] != SOCKS5_VERSION || reply[1] != AUTH_METHOD_NONE {
        return Err(DnsError::protocol(
            tag,
            format!("proxy offered unsupported auth method {:#04x}", reply[1]),
        ));
    }
    Ok(())
}

/// Issue CONNECT for `target` and verify the reply
async fn connect(tag: &str, stream: &mut TcpStream, target: SocketAddr) -> DnsResult<()> {
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match target.ip() {
        IpAddr::V4(v4) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.octets());
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| DnsError::io(tag, "proxy CONNECT failed", e))?;

    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| DnsError::io(tag, "proxy CONNECT reply failed", e))?;

    if header[1] != REPLY_SUCCEEDED {
        return Err(DnsError::protocol(
            tag,
            format!("proxy refused CONNECT: {}", reply_message(header[1])),
        ));
    }

    // drain the bound address, which this client never uses
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| DnsError::io(tag, "proxy reply address failed", e))?;
            usize::from(len[0])
        }
        other => {
            return Err(DnsError::protocol(
                tag,
                format!("proxy reply has unknown address type {other:#04x}"),
            ))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(|e| DnsError::io(tag, "proxy reply address failed", e))?;

    Ok(())
}
