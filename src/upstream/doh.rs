//! DNS-over-HTTPS upstream transport (RFC 8484)
//!
//! POST only, `application/dns-message` both ways. The hyper client is
//! HTTP/2-only so concurrent queries multiplex over one TLS session;
//! hyper's own pool keeps that session warm. Cancelling an exchange
//! drops the request future, which resets the HTTP/2 stream without
//! touching the connection.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::Message;
use http::{header, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::ClientConfig;

use super::Transport;
use crate::error::{DnsError, DnsResult};
use crate::message::{self, QuestionKey};

/// Wire-format media type for requests and responses
const DOH_CONTENT_TYPE: &str = "application/dns-message";

/// Largest response body accepted
const MAX_RESPONSE_SIZE: usize = 65_535;

/// DoH DNS client for one upstream
pub struct DohTransport {
    tag: String,
    uri: Uri,
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl std::fmt::Debug for DohTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohTransport")
            .field("tag", &self.tag)
            .field("uri", &self.uri.to_string())
            .finish_non_exhaustive()
    }
}

impl DohTransport {
    /// Create a transport POSTing to `url`
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` for a non-HTTPS or unparseable URL.
    pub fn new(
        tag: impl Into<String>,
        url: &str,
        tls_config: ClientConfig,
    ) -> DnsResult<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| DnsError::config(format!("invalid DoH URL '{url}': {e}")))?;
        if uri.scheme_str() != Some("https") {
            return Err(DnsError::config(format!(
                "DoH URL must use https, got '{url}'"
            )));
        }

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_only()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .pool_idle_timeout(Duration::from_secs(30))
            .build(https);

        Ok(Self {
            tag: tag.into(),
            uri,
            client,
        })
    }

    /// The configured endpoint
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }
}

#[async_trait]
impl Transport for DohTransport {
    async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let mut wire = message::serialize(query)?;
        // RFC 8484 wants id 0 on the wire; restored below
        message::patch_id(&mut wire, 0);

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(header::CONTENT_TYPE, DOH_CONTENT_TYPE)
            .header(header::ACCEPT, DOH_CONTENT_TYPE)
            .header(header::CONTENT_LENGTH, wire.len())
            .body(Full::new(Bytes::from(wire)))
            .map_err(|e| DnsError::protocol(&self.tag, format!("cannot build request: {e}")))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| DnsError::network(&self.tag, format!("request failed: {e}")))?;

        let status = response.status();
        if status != http::StatusCode::OK {
            return Err(DnsError::protocol(
                &self.tag,
                format!("unexpected HTTP status {status}"),
            ));
        }

        if let Some(content_type) = response.headers().get(header::CONTENT_TYPE) {
            let value = content_type.to_str().unwrap_or("");
            if !value.starts_with(DOH_CONTENT_TYPE) {
                return Err(DnsError::protocol(
                    &self.tag,
                    format!("unexpected content type '{value}'"),
                ));
            }
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DnsError::network(&self.tag, format!("body read failed: {e}")))?
            .to_bytes();
        if body.len() > MAX_RESPONSE_SIZE {
            return Err(DnsError::protocol(
                &self.tag,
                format!("response too large: {} bytes", body.len()),
            ));
        }

        let mut reply = message::parse(&body)?;
        if QuestionKey::from_message(&reply) != QuestionKey::from_message(query) {
            return Err(DnsError::protocol(
                &self.tag,
                "reply question does not match query",
            ));
        }
        reply.set_id(query.id());
        Ok(reply)
    }
}
