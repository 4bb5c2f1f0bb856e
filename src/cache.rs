//! Answer cache
//!
//! A bounded, TTL-keyed store of serialized replies. Entries are wire
//! bytes plus an absolute expiry; storing bytes rather than parsed
//! messages means a hit can never be mutated by a consumer, and the
//! transaction id of the live query is patched into a copy on the way
//! out.
//!
//! Eviction is delegated to moka: per-entry expiry drops entries at
//! their TTL deadline and `max_capacity` bounds memory with
//! approximately-LRU admission. Reads and writes are safe from any
//! task.
//!
//! Eligibility (exactly one question, no ECS, NOERROR) is the
//! dispatcher's business, not the cache's.

use std::time::{Duration, Instant};

use bytes::Bytes;
use moka::sync::Cache;
use moka::Expiry;
use tracing::trace;

use crate::message::QuestionKey;

/// One cached reply: wire bytes and an absolute deadline
#[derive(Debug, Clone)]
struct CacheEntry {
    wire: Bytes,
    expires_at: Instant,
}

/// Per-entry expiration driven by the entry's own deadline
struct EntryExpiry;

impl Expiry<QuestionKey, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &QuestionKey,
        value: &CacheEntry,
        _current_time: Instant,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(Instant::now()))
    }
}

/// Bounded TTL cache of serialized replies
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use racedns::cache::ResponseCache;
/// use racedns::message::QuestionKey;
///
/// let cache = ResponseCache::new(1024);
/// let key = QuestionKey::new("example.com.", 1, 1);
///
/// cache.insert(key.clone(), vec![0u8; 32], Duration::from_secs(60));
/// assert!(cache.get(&key).is_some());
/// ```
#[derive(Debug)]
pub struct ResponseCache {
    store: Cache<QuestionKey, CacheEntry>,
}

impl ResponseCache {
    /// Create a cache bounded to `capacity` entries
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        let store = Cache::builder()
            .max_capacity(capacity)
            .expire_after(EntryExpiry)
            .build();
        Self { store }
    }

    /// Store a serialized reply for `ttl`
    ///
    /// A zero TTL is not stored; it would be expired on arrival.
    pub fn insert(&self, key: QuestionKey, wire: Vec<u8>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        trace!(name = key.name(), qtype = key.qtype(), ttl = ?ttl, "cache insert");
        self.store.insert(
            key,
            CacheEntry {
                wire: Bytes::from(wire),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Fetch a copy of the cached reply bytes, if present and fresh
    ///
    /// An entry found at or past its deadline is evicted and reported as
    /// a miss; the deadline check does not rely on moka's expiry timing.
    #[must_use]
    pub fn get(&self, key: &QuestionKey) -> Option<Vec<u8>> {
        let entry = self.store.get(key)?;
        if Instant::now() >= entry.expires_at {
            self.store.invalidate(key);
            return None;
        }
        Some(entry.wire.to_vec())
    }

    /// Number of live entries (approximate while writes are in flight)
    #[must_use]
    pub fn len(&self) -> u64 {
        self.store.run_pending_tasks();
        self.store.entry_count()
    }

    /// True when the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
