//! Error types for the forwarder
//!
//! This module defines the error hierarchy for DNS dispatch, upstream
//! communication, message codec operations, and configuration loading.
//!
//! # Error Categories
//!
//! - **Parse/Serialize errors**: DNS wire encoding/decoding failures
//! - **Config errors**: invalid configuration or dangling set references
//! - **Upstream errors**: per-upstream exchange failures, sub-classified by
//!   [`UpstreamErrorKind`]
//! - **Dispatch errors**: race outcomes that are not a usable reply
//!   (all upstreams failed, deadline elapsed, caller cancelled)
//!
//! Upstream errors are recovered at the upstream-task boundary and never
//! surface to the client; dispatch errors become a SERVFAIL reply at the
//! server layer.
//!
//! # Example
//!
//! ```
//! use racedns::error::DnsError;
//! use std::time::Duration;
//!
//! let err = DnsError::dispatch_timeout(Duration::from_secs(5));
//! assert!(err.is_timeout());
//! ```

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate
pub type DnsResult<T> = Result<T, DnsError>;

/// Sub-classification of upstream exchange failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// TCP/UDP connect or SOCKS5 CONNECT failed
    Dial,
    /// TLS handshake failed
    Handshake,
    /// Read/write on an established transport failed
    Io,
    /// The peer violated the protocol (bad frame, bad HTTP status, mismatched reply)
    Protocol,
    /// The per-upstream concurrency cap rejected the exchange
    Busy,
    /// The per-upstream deadline elapsed
    Timeout,
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dial => "dial",
            Self::Handshake => "handshake",
            Self::Io => "io",
            Self::Protocol => "protocol",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Error type for all forwarder operations
#[derive(Debug, Error)]
pub enum DnsError {
    /// A wire message could not be decoded
    #[error("failed to parse DNS message: {reason}")]
    Parse {
        /// What went wrong during decoding
        reason: String,
    },

    /// A message could not be encoded for transmission
    #[error("failed to serialize DNS message: {reason}")]
    Serialize {
        /// What went wrong during encoding
        reason: String,
    },

    /// Invalid configuration, fatal at startup
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of the problem
        reason: String,
        /// The offending config field, if known
        field: Option<String>,
    },

    /// An exchange with one upstream failed
    ///
    /// Never surfaced to the client; one upstream failing does not kill
    /// the dispatch.
    #[error("upstream {upstream} {kind} error: {reason}")]
    Upstream {
        /// Tag or address of the upstream
        upstream: String,
        /// Failure sub-kind
        kind: UpstreamErrorKind,
        /// Description of the failure
        reason: String,
        /// Underlying I/O error, if any
        #[source]
        source: Option<io::Error>,
    },

    /// Every upstream failed, was filtered out, or timed out
    #[error("all upstreams failed or were filtered out")]
    AllUpstreamsFailed,

    /// The per-dispatch deadline elapsed before any upstream answered
    #[error("dispatch timed out after {timeout:?}")]
    DispatchTimeout {
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// The caller abandoned the dispatch
    #[error("dispatch cancelled")]
    Cancelled,
}

impl DnsError {
    /// Create a parse error
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::Serialize {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create an upstream dial error
    pub fn dial(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::upstream(upstream, UpstreamErrorKind::Dial, reason)
    }

    /// Create an upstream TLS handshake error
    pub fn handshake(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::upstream(upstream, UpstreamErrorKind::Handshake, reason)
    }

    /// Create an upstream I/O error wrapping the source
    pub fn io(upstream: impl Into<String>, reason: impl Into<String>, source: io::Error) -> Self {
        Self::Upstream {
            upstream: upstream.into(),
            kind: UpstreamErrorKind::Io,
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create an upstream I/O error with no `io::Error` source
    pub fn network(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::upstream(upstream, UpstreamErrorKind::Io, reason)
    }

    /// Create an upstream protocol error
    pub fn protocol(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::upstream(upstream, UpstreamErrorKind::Protocol, reason)
    }

    /// Create an upstream busy error
    pub fn busy(upstream: impl Into<String>) -> Self {
        Self::upstream(upstream, UpstreamErrorKind::Busy, "concurrency cap reached")
    }

    /// Create an upstream timeout error
    pub fn upstream_timeout(upstream: impl Into<String>, timeout: Duration) -> Self {
        Self::upstream(
            upstream,
            UpstreamErrorKind::Timeout,
            format!("no reply within {timeout:?}"),
        )
    }

    /// Create a dispatch timeout error
    pub fn dispatch_timeout(timeout: Duration) -> Self {
        Self::DispatchTimeout { timeout }
    }

    fn upstream(
        upstream: impl Into<String>,
        kind: UpstreamErrorKind,
        reason: impl Into<String>,
    ) -> Self {
        Self::Upstream {
            upstream: upstream.into(),
            kind,
            reason: reason.into(),
            source: None,
        }
    }

    /// The upstream failure sub-kind, if this is an upstream error
    #[must_use]
    pub fn upstream_kind(&self) -> Option<UpstreamErrorKind> {
        match self {
            Self::Upstream { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// True for per-upstream and per-dispatch timeouts
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::DispatchTimeout { .. }
                | Self::Upstream {
                    kind: UpstreamErrorKind::Timeout,
                    ..
                }
        )
    }

    /// True when the caller abandoned the dispatch
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True for outcomes the server layer answers with SERVFAIL
    #[must_use]
    pub fn is_servfail(&self) -> bool {
        matches!(
            self,
            Self::AllUpstreamsFailed | Self::DispatchTimeout { .. } | Self::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_kind_display() {
        assert_eq!(UpstreamErrorKind::Dial.to_string(), "dial");
        assert_eq!(UpstreamErrorKind::Handshake.to_string(), "handshake");
        assert_eq!(UpstreamErrorKind::Busy.to_string(), "busy");
    }

    #[test]
    fn test_io_error_keeps_source() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err = DnsError::io("8.8.8.8:53", "write failed", io_err);

        assert_eq!(err.upstream_kind(), Some(UpstreamErrorKind::Io));
        assert!(err.to_string().contains("8.8.8.8:53"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_timeout_predicate() {
        assert!(DnsError::dispatch_timeout(Duration::from_secs(5)).is_timeout());
        assert!(DnsError::upstream_timeout("dot", Duration::from_secs(3)).is_timeout());
        assert!(!DnsError::AllUpstreamsFailed.is_timeout());
    }

    #[test]
    fn test_servfail_predicate() {
        assert!(DnsError::AllUpstreamsFailed.is_servfail());
        assert!(DnsError::Cancelled.is_servfail());
        assert!(!DnsError::parse("bad header").is_servfail());
        assert!(!DnsError::busy("udp").is_servfail());
    }

    #[test]
    fn test_config_field_context() {
        let err = DnsError::config_field("unknown domain set 'cn'", "upstream.policies.domain");
        assert!(err.to_string().contains("unknown domain set"));
    }
}
