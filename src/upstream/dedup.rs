//! In-flight deduplication
//!
//! With `deduplicate` enabled, concurrent exchanges for the same
//! normalized question collapse into a single outbound query. The first
//! caller becomes the leader and performs the real exchange; followers
//! subscribe to a broadcast slot and reuse its outcome with their own
//! transaction id.
//!
//! The registry entry is removed before the outcome is broadcast, so a
//! caller arriving after that point starts a fresh exchange. A leader
//! that is cancelled mid-flight drops the slot sender; its followers
//! observe a closed channel and fail, which the dispatcher treats like
//! any other upstream failure.

use std::future::Future;

use dashmap::DashMap;
use hickory_proto::op::Message;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{DnsError, DnsResult};
use crate::message::QuestionKey;

/// Outcome shared from the leader to its followers
type SharedOutcome = Result<Message, String>;

/// Per-upstream registry of in-flight questions
#[derive(Debug, Default)]
pub struct InflightRegistry {
    slots: DashMap<QuestionKey, broadcast::Sender<SharedOutcome>>,
}

/// Removes the slot when the leader finishes or is cancelled
struct SlotGuard<'a> {
    slots: &'a DashMap<QuestionKey, broadcast::Sender<SharedOutcome>>,
    key: QuestionKey,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots.remove(&self.key);
    }
}

impl InflightRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `exchange` once for all concurrent callers with the same key
    ///
    /// `id` is the caller's transaction id, rewritten onto a shared
    /// reply before it is returned.
    pub async fn exchange<F>(
        &self,
        upstream: &str,
        key: QuestionKey,
        id: u16,
        exchange: F,
    ) -> DnsResult<Message>
    where
        F: Future<Output = DnsResult<Message>>,
    {
        let slot = match self.slots.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(slot) => {
                let mut rx = slot.get().subscribe();
                drop(slot);
                trace!(upstream, "joined in-flight exchange");

                return match rx.recv().await {
                    Ok(Ok(mut reply)) => {
                        reply.set_id(id);
                        Ok(reply)
                    }
                    Ok(Err(reason)) => Err(DnsError::protocol(
                        upstream,
                        format!("shared exchange failed: {reason}"),
                    )),
                    Err(_) => Err(DnsError::protocol(upstream, "shared exchange abandoned")),
                };
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(1);
                entry.insert(tx.clone());
                tx
            }
        };

        let guard = SlotGuard {
            slots: &self.slots,
            key,
        };
        let result = exchange.await;

        // unregister first so late callers get a fresh exchange
        drop(guard);
        let shared = match &result {
            Ok(reply) => Ok(reply.clone()),
            Err(e) => Err(e.to_string()),
        };
        let _ = slot.send(shared);

        result
    }

    /// Number of distinct questions currently in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn key() -> QuestionKey {
        QuestionKey::new("dedup.test.", 1, 1)
    }

    fn reply(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg
    }

    #[tokio::test]
    async fn test_concurrent_callers_one_exchange() {
        let registry = Arc::new(InflightRegistry::new());
        let exchanges = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..100u16 {
            let registry = Arc::clone(&registry);
            let exchanges = Arc::clone(&exchanges);
            handles.push(tokio::spawn(async move {
                registry
                    .exchange("test", key(), i, async {
                        exchanges.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(reply(0x9999))
                    })
                    .await
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let got = handle.await.unwrap().unwrap();
            assert_eq!(got.id(), i as u16);
        }
        assert_eq!(exchanges.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_leader_failure_shared_with_followers() {
        let registry = Arc::new(InflightRegistry::new());

        let leader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .exchange("test", key(), 1, async {
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        Err(DnsError::dial("test", "connection refused"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = registry
            .exchange("test", key(), 2, async { unreachable!("follower must attach") })
            .await;

        assert!(leader.await.unwrap().is_err());
        let err = follower.unwrap_err();
        assert!(err.to_string().contains("shared exchange failed"));
    }

    #[tokio::test]
    async fn test_sequential_exchanges_run_separately() {
        let registry = InflightRegistry::new();
        let exchanges = AtomicUsize::new(0);

        for _ in 0..3 {
            registry
                .exchange("test", key(), 1, async {
                    exchanges.fetch_add(1, Ordering::SeqCst);
                    Ok(reply(1))
                })
                .await
                .unwrap();
        }
        assert_eq!(exchanges.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_leader_closes_slot() {
        let registry = Arc::new(InflightRegistry::new());

        let leader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .exchange("test", key(), 1, async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(reply(1))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .exchange("test", key(), 2, async { unreachable!("follower must attach") })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let err = follower.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("abandoned"));
        assert!(registry.is_empty());
    }
}
