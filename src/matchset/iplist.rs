//! CIDR containment list
//!
//! A sorted list of CIDR prefixes in a canonical 128-bit form: IPv4
//! prefixes are mapped into `::ffff:0:0/96`, so `10.0.0.0/8` and
//! `::ffff:10.0.0.0/104` denote the same range and a lookup for
//! `::ffff:10.1.2.3` hits an IPv4 entry. Containment is tested by binary
//! search per distinct prefix length, so overlapping entries are allowed.
//!
//! # Example
//!
//! ```
//! use racedns::matchset::IpList;
//!
//! let mut list = IpList::new();
//! list.insert("10.0.0.0/8".parse().unwrap());
//! list.finalize();
//!
//! assert!(list.contains("10.1.2.3".parse().unwrap()));
//! assert!(!list.contains("11.0.0.1".parse().unwrap()));
//! ```

use std::net::IpAddr;
use std::str::FromStr;

use crate::error::DnsError;

/// Offset applied to IPv4 prefix lengths in the canonical 128-bit form
const V4_MAPPED_OFFSET: u8 = 96;

/// One CIDR entry: network address and prefix length
///
/// Parses from `addr/prefix`; a bare address is `/32` or `/128`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// The network address as written
    #[must_use]
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The prefix length as written (32-based for IPv4)
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Canonical (network bits, 128-based prefix length) form
    fn canonical(self) -> (u128, u8) {
        let (bits, prefix) = match self.addr {
            IpAddr::V4(v4) => (
                u128::from(v4.to_ipv6_mapped()),
                self.prefix + V4_MAPPED_OFFSET,
            ),
            IpAddr::V6(v6) => (u128::from(v6), self.prefix),
        };
        (bits & mask(prefix), prefix)
    }
}

impl FromStr for Cidr {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };

        let addr: IpAddr = addr_part
            .parse()
            .map_err(|e| DnsError::config(format!("invalid CIDR address '{s}': {e}")))?;
        let max_prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max_prefix)
                .ok_or_else(|| DnsError::config(format!("invalid CIDR prefix in '{s}'")))?,
            None => max_prefix,
        };

        Ok(Self { addr, prefix })
    }
}

/// Network mask for a 128-based prefix length
fn mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

/// Canonical 128-bit form of an address
fn to_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Sorted CIDR list with binary-search containment
#[derive(Debug, Default)]
pub struct IpList {
    /// (network bits, 128-based prefix length), sorted
    entries: Vec<(u128, u8)>,
    /// Distinct prefix lengths present in `entries`, ascending
    prefix_lens: Vec<u8>,
    finalized: bool,
}

impl IpList {
    /// Create an empty list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one CIDR entry
    ///
    /// Overlapping and duplicate entries are allowed.
    pub fn insert(&mut self, cidr: Cidr) {
        self.entries.push(cidr.canonical());
        self.finalized = false;
    }

    /// Sort and index the entries; must be called before [`contains`]
    ///
    /// [`contains`]: IpList::contains
    pub fn finalize(&mut self) {
        self.entries.sort_unstable();
        self.entries.dedup();
        self.prefix_lens = self.entries.iter().map(|&(_, len)| len).collect();
        self.prefix_lens.sort_unstable();
        self.prefix_lens.dedup();
        self.finalized = true;
    }

    /// Test whether `ip` falls inside any entry
    ///
    /// One binary search per distinct prefix length in the list; the
    /// shortest matching prefix wins, which is indistinguishable from
    /// first-hit for a membership test.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        debug_assert!(self.finalized || self.entries.is_empty());
        let bits = to_bits(ip);
        self.prefix_lens.iter().any(|&len| {
            self.entries
                .binary_search(&(bits & mask(len), len))
                .is_ok()
        })
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the list holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
