//! Configuration types and loading
//!
//! The configuration tree mirrors the on-disk JSON file:
//!
//! ```text
//! Config
//! ├── dispatcher: bind[], max_udp_size, min_ttl, timeout, cache.size
//! ├── upstream: { tag → UpstreamOptions }
//! │   ├── addr / protocol / socks5 / timeout
//! │   ├── tcp.idle_timeout, dot.{server_name,idle_timeout}, doh.url
//! │   ├── insecure_skip_verify / deduplicate / max_concurrent_queries
//! │   ├── edns0.{client_subnet,overwrite_ecs}
//! │   └── policies: deny_*, domain: "[!]set", ip: "[!]set", check_cname
//! ├── sets: { domain: {name → file}, ip: {name → file} }
//! └── ca.path[]
//! ```
//!
//! Every field has a default so a minimal file only names its upstreams
//! and bind addresses. [`Config::validate`] runs after parsing and turns
//! structural mistakes into startup errors; dangling `"[!]set-name"`
//! policy references are caught later when policies are resolved against
//! the loaded [`MatchSets`](crate::matchset::MatchSets).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DnsError, DnsResult};
use crate::matchset::Cidr;

/// Default per-dispatch and per-upstream deadline, seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener and dispatch settings
    #[serde(default)]
    pub dispatcher: DispatcherOptions,

    /// Upstream resolvers, keyed by tag
    #[serde(default)]
    pub upstream: BTreeMap<String, UpstreamOptions>,

    /// Named match-set files referenced by policies
    #[serde(default)]
    pub sets: SetsOptions,

    /// Extra trust anchors for DoT/DoH
    #[serde(default)]
    pub ca: CaOptions,
}

impl Config {
    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` when the file cannot be read or parsed
    /// or when validation fails.
    pub fn load(path: &Path) -> DnsResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DnsError::config(format!("cannot read {}: {e}", path.display())))?;

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| DnsError::config(format!("cannot parse {}: {e}", path.display())))?;

        config.validate()?;
        info!(
            path = %path.display(),
            upstreams = config.upstream.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Write a template configuration with two example upstreams
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` when the file cannot be written.
    pub fn generate(path: &Path) -> DnsResult<()> {
        let template = Self::template();
        let json = serde_json::to_string_pretty(&template)
            .map_err(|e| DnsError::config(format!("cannot encode template: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| DnsError::config(format!("cannot write {}: {e}", path.display())))?;
        Ok(())
    }

    /// A starting-point configuration: one trusted local upstream with a
    /// domain whitelist, one remote DoT upstream filtered by IP
    #[must_use]
    pub fn template() -> Self {
        let mut upstream = BTreeMap::new();
        upstream.insert(
            "local".to_string(),
            UpstreamOptions {
                addr: "223.5.5.5:53".to_string(),
                deduplicate: true,
                policies: PolicyOptions {
                    deny_unhandlable_types: true,
                    deny_error_rcode: true,
                    deny_empty_ip_reply: true,
                    ip: Some("local-ranges".to_string()),
                    ..PolicyOptions::default()
                },
                ..UpstreamOptions::default()
            },
        );
        upstream.insert(
            "remote".to_string(),
            UpstreamOptions {
                addr: "1.0.0.1:853".to_string(),
                protocol: Protocol::Dot,
                dot: DotOptions {
                    server_name: "cloudflare-dns.com".to_string(),
                    ..DotOptions::default()
                },
                ..UpstreamOptions::default()
            },
        );

        let mut sets = SetsOptions::default();
        sets.ip
            .insert("local-ranges".to_string(), PathBuf::from("local_ranges.txt"));

        Self {
            dispatcher: DispatcherOptions {
                bind: vec!["udp://:53".to_string(), "tcp://:53".to_string()],
                cache: CacheOptions { size: 1024 },
                ..DispatcherOptions::default()
            },
            upstream,
            sets,
            ca: CaOptions::default(),
        }
    }

    /// Validate the whole tree
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` naming the offending field.
    pub fn validate(&self) -> DnsResult<()> {
        if self.dispatcher.bind.is_empty() {
            return Err(DnsError::config_field(
                "at least one bind address is required",
                "dispatcher.bind",
            ));
        }
        self.dispatcher.bind_addrs()?;

        if self.dispatcher.max_udp_size < crate::message::DNS_HEADER_LEN {
            return Err(DnsError::config_field(
                "max_udp_size is smaller than a DNS header",
                "dispatcher.max_udp_size",
            ));
        }

        if self.upstream.is_empty() {
            return Err(DnsError::config_field(
                "at least one upstream is required",
                "upstream",
            ));
        }
        for (tag, upstream) in &self.upstream {
            upstream
                .validate()
                .map_err(|e| DnsError::config(format!("upstream '{tag}': {e}")))?;
        }

        Ok(())
    }
}

/// Listener and dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherOptions {
    /// Bind entries, `udp://host:port` or `tcp://host:port`; an empty
    /// host binds the wildcard address
    #[serde(default)]
    pub bind: Vec<String>,

    /// Largest reply sent over UDP before truncation
    #[serde(default = "default_max_udp_size")]
    pub max_udp_size: usize,

    /// Floor applied to reply TTLs, seconds
    #[serde(default)]
    pub min_ttl: u32,

    /// Per-dispatch deadline, seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Answer cache settings
    #[serde(default)]
    pub cache: CacheOptions,
}

fn default_max_udp_size() -> usize {
    1480
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            bind: Vec::new(),
            max_udp_size: default_max_udp_size(),
            min_ttl: 0,
            timeout: default_timeout(),
            cache: CacheOptions::default(),
        }
    }
}

impl DispatcherOptions {
    /// Parse every bind entry
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` for an unknown scheme or a bad address.
    pub fn bind_addrs(&self) -> DnsResult<Vec<BindAddr>> {
        self.bind.iter().map(|s| parse_bind(s)).collect()
    }
}

/// Answer cache settings
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Maximum number of cached replies; 0 disables the cache
    #[serde(default)]
    pub size: u64,
}

/// Transport used to reach an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain UDP (RFC 1035)
    #[default]
    Udp,
    /// Plain TCP with 2-byte length prefixes (RFC 1035)
    Tcp,
    /// DNS over TLS (RFC 7858)
    Dot,
    /// DNS over HTTPS, POST only (RFC 8484)
    Doh,
}

/// One upstream resolver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamOptions {
    /// `host:port` for udp/tcp/dot; ignored for doh
    #[serde(default)]
    pub addr: String,

    /// Transport variant
    #[serde(default)]
    pub protocol: Protocol,

    /// Optional SOCKS5 proxy (`host:port`) for tcp/dot dials
    #[serde(default)]
    pub socks5: Option<String>,

    /// Per-exchange deadline, seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Plain-TCP transport settings
    #[serde(default)]
    pub tcp: TcpOptions,

    /// DoT transport settings
    #[serde(default)]
    pub dot: DotOptions,

    /// DoH transport settings
    #[serde(default)]
    pub doh: DohOptions,

    /// Skip TLS certificate verification (tests and experts only)
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Collapse concurrent identical questions into one exchange
    #[serde(default)]
    pub deduplicate: bool,

    /// Cap on simultaneous exchanges; 0 means unlimited
    #[serde(default)]
    pub max_concurrent_queries: usize,

    /// EDNS client-subnet injection
    #[serde(default)]
    pub edns0: Edns0Options,

    /// Response acceptance policy
    #[serde(default)]
    pub policies: PolicyOptions,
}

impl UpstreamOptions {
    fn validate(&self) -> DnsResult<()> {
        match self.protocol {
            Protocol::Udp | Protocol::Tcp | Protocol::Dot => {
                if self.addr.is_empty() {
                    return Err(DnsError::config_field("addr is required", "addr"));
                }
            }
            Protocol::Doh => {
                if self.doh.url.is_empty() {
                    return Err(DnsError::config_field(
                        "doh.url is required for protocol doh",
                        "doh.url",
                    ));
                }
                if !self.doh.url.starts_with("https://") {
                    return Err(DnsError::config_field(
                        "doh.url must use https",
                        "doh.url",
                    ));
                }
            }
        }

        if let Some(subnet) = &self.edns0.client_subnet {
            subnet.parse::<Cidr>().map_err(|e| {
                DnsError::config_field(format!("bad client_subnet: {e}"), "edns0.client_subnet")
            })?;
        }

        if let Some(domain) = &self.policies.domain {
            let (_, name) = parse_set_ref(domain);
            if name.is_empty() {
                return Err(DnsError::config_field(
                    "empty domain set reference",
                    "policies.domain",
                ));
            }
        }
        if let Some(ip) = &self.policies.ip {
            let (_, name) = parse_set_ref(ip);
            if name.is_empty() {
                return Err(DnsError::config_field(
                    "empty ip set reference",
                    "policies.ip",
                ));
            }
        }

        Ok(())
    }

    /// Parsed EDNS client subnet, if configured
    ///
    /// # Errors
    ///
    /// Returns `DnsError::Config` when the subnet string is malformed
    /// (already rejected by [`Config::validate`] in normal startup).
    pub fn client_subnet(&self) -> DnsResult<Option<Cidr>> {
        self.edns0
            .client_subnet
            .as_deref()
            .map(str::parse)
            .transpose()
    }
}

/// Plain-TCP transport settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TcpOptions {
    /// Seconds a pooled connection may sit idle before it is closed
    #[serde(default = "default_tcp_idle")]
    pub idle_timeout: u64,
}

fn default_tcp_idle() -> u64 {
    10
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            idle_timeout: default_tcp_idle(),
        }
    }
}

/// DoT transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DotOptions {
    /// TLS server name; falls back to the host part of `addr`
    #[serde(default)]
    pub server_name: String,

    /// Seconds a pooled connection may sit idle before it is closed
    #[serde(default = "default_dot_idle")]
    pub idle_timeout: u64,
}

fn default_dot_idle() -> u64 {
    30
}

impl Default for DotOptions {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            idle_timeout: default_dot_idle(),
        }
    }
}

/// DoH transport settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DohOptions {
    /// Full HTTPS endpoint, e.g. `https://dns.example/dns-query`
    #[serde(default)]
    pub url: String,
}

/// EDNS client-subnet injection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Edns0Options {
    /// CIDR whose network and prefix are sent as the client subnet
    #[serde(default)]
    pub client_subnet: Option<String>,

    /// Replace an ECS option the client already supplied
    #[serde(default)]
    pub overwrite_ecs: bool,
}

/// Response policy switches; see [`crate::policy`] for semantics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOptions {
    /// Reject query types the upstream cannot meaningfully answer
    #[serde(default)]
    pub deny_unhandlable_types: bool,

    /// Domain set reference, `"name"` or `"!name"`
    #[serde(default)]
    pub domain: Option<String>,

    /// Reject replies whose RCODE is not NOERROR
    #[serde(default)]
    pub deny_error_rcode: bool,

    /// Apply the domain set to CNAME targets too
    #[serde(default)]
    pub check_cname: bool,

    /// Reject NOERROR replies carrying no A/AAAA records
    #[serde(default)]
    pub deny_empty_ip_reply: bool,

    /// IP set reference, `"name"` or `"!name"`
    #[serde(default)]
    pub ip: Option<String>,
}

/// Named match-set files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetsOptions {
    /// Domain set files, one FQDN per line
    #[serde(default)]
    pub domain: BTreeMap<String, PathBuf>,

    /// CIDR list files, one CIDR or bare address per line
    #[serde(default)]
    pub ip: BTreeMap<String, PathBuf>,
}

/// Extra trust anchors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaOptions {
    /// PEM bundles appended to the webpki root store
    #[serde(default)]
    pub path: Vec<PathBuf>,
}

/// Listener protocol of one bind entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindProtocol {
    /// Datagram listener
    Udp,
    /// Stream listener with 2-byte length prefixes
    Tcp,
}

/// One parsed bind entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindAddr {
    /// Listener protocol
    pub protocol: BindProtocol,
    /// Socket address to bind
    pub addr: SocketAddr,
}

/// Parse `scheme://host:port`; an empty host means the wildcard address
fn parse_bind(s: &str) -> DnsResult<BindAddr> {
    let (scheme, rest) = s
        .split_once("://")
        .ok_or_else(|| DnsError::config_field(format!("bind entry '{s}' has no scheme"), "dispatcher.bind"))?;

    let protocol = match scheme {
        "udp" | "udp4" | "udp6" => BindProtocol::Udp,
        "tcp" | "tcp4" | "tcp6" => BindProtocol::Tcp,
        other => {
            return Err(DnsError::config_field(
                format!("unknown bind scheme '{other}'"),
                "dispatcher.bind",
            ))
        }
    };

    let rest = if rest.starts_with(':') {
        format!("0.0.0.0{rest}")
    } else {
        rest.to_string()
    };
    let addr: SocketAddr = rest.parse().map_err(|e| {
        DnsError::config_field(format!("bad bind address '{s}': {e}"), "dispatcher.bind")
    })?;

    Ok(BindAddr { protocol, addr })
}

/// Split a `"[!]set-name"` policy reference into (negate, name)
#[must_use]
pub fn parse_set_ref(reference: &str) -> (bool, &str) {
    match reference.strip_prefix('!') {
        Some(name) => (true, name),
        None => (false, reference),
    }
}
