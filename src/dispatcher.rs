//! Query dispatch: cache, fan-out, race, TTL rewrite
//!
//! [`Dispatcher::serve`] is state-free per call:
//!
//! 1. probe the cache when the query is eligible (exactly one question,
//!    no ECS option)
//! 2. on a miss, launch one task per upstream; each exchanges the query
//!    and pushes its reply through that upstream's policy filter
//! 3. the first accepted reply wins a one-slot channel; the losers'
//!    results are dropped and their tasks aborted
//! 4. the winner's TTLs are flattened to `max(min_answer_ttl, min_ttl)`
//!    and, when eligible and NOERROR, the reply is cached for that long
//!
//! "First accepted" is a pure race with no upstream preference. When
//! every task finishes without publishing, the dispatch fails with
//! `AllUpstreamsFailed`; the per-dispatch deadline turns into
//! `DispatchTimeout`. Both become SERVFAIL at the server layer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, ResponseCode};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::error::{DnsError, DnsResult};
use crate::message::{self, QuestionKey};
use crate::policy::PolicyDecision;
use crate::upstream::Upstream;

/// Racing dispatcher over a fixed set of upstreams
#[derive(Debug)]
pub struct Dispatcher {
    upstreams: Vec<Arc<Upstream>>,
    cache: Option<ResponseCache>,
    min_ttl: u32,
    timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher; `cache_size` 0 disables the cache
    #[must_use]
    pub fn new(upstreams: Vec<Arc<Upstream>>, cache_size: u64, min_ttl: u32) -> Self {
        Self {
            upstreams,
            cache: (cache_size > 0).then(|| ResponseCache::new(cache_size)),
            min_ttl,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the per-dispatch deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Answer one query within the per-dispatch deadline
    ///
    /// # Errors
    ///
    /// `AllUpstreamsFailed` when no upstream produced an accepted reply,
    /// `DispatchTimeout` when the deadline elapsed first. The server
    /// layer maps both to SERVFAIL.
    pub async fn serve(&self, query: &Message) -> DnsResult<Message> {
        match tokio::time::timeout(self.timeout, self.dispatch(query)).await {
            Ok(result) => result,
            Err(_) => Err(DnsError::dispatch_timeout(self.timeout)),
        }
    }

    async fn dispatch(&self, query: &Message) -> DnsResult<Message> {
        // cacheable: exactly one question and no client-subnet option
        let key = QuestionKey::from_message(query).filter(|_| !message::has_ecs(query));

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(mut wire) = cache.get(key) {
                message::patch_id(&mut wire, query.id());
                debug!(name = key.name(), "cache hit");
                return message::parse(&wire);
            }
        }

        let mut reply = self.race(query).await?;

        let ttl = message::min_answer_ttl(&reply).max(self.min_ttl);
        message::set_ttl(&mut reply, ttl);
        reply.set_id(query.id());

        if let (Some(cache), Some(key)) = (&self.cache, key) {
            if reply.response_code() == ResponseCode::NoError && ttl > 0 {
                if let Ok(wire) = message::serialize(&reply) {
                    cache.insert(key, wire, Duration::from_secs(u64::from(ttl)));
                }
            }
        }

        Ok(reply)
    }

    /// Fan out to every upstream and return the first accepted reply
    async fn race(&self, query: &Message) -> DnsResult<Message> {
        let (slot, mut winner) = mpsc::channel::<Message>(1);
        let mut tasks = JoinSet::new();

        for upstream in &self.upstreams {
            let upstream = Arc::clone(upstream);
            let query = query.clone();
            let slot = slot.clone();

            tasks.spawn(async move {
                let started = Instant::now();
                match upstream.exchange(&query).await {
                    Ok(reply) => match upstream.filter(&query, &reply) {
                        PolicyDecision::Accept => {
                            debug!(
                                upstream = upstream.tag(),
                                rtt_ms = started.elapsed().as_millis() as u64,
                                "reply accepted"
                            );
                            // losing the slot just means a sibling won
                            let _ = slot.try_send(reply);
                        }
                        PolicyDecision::Reject(reason) => {
                            debug!(
                                upstream = upstream.tag(),
                                rtt_ms = started.elapsed().as_millis() as u64,
                                reason,
                                "reply rejected"
                            );
                        }
                    },
                    Err(e) => {
                        warn!(
                            upstream = upstream.tag(),
                            rtt_ms = started.elapsed().as_millis() as u64,
                            error = %e,
                            "exchange failed"
                        );
                    }
                }
            });
        }

        // with every task's sender dropped, a recv of None means no
        // upstream published an accepted reply
        drop(slot);
        let outcome = winner.recv().await;

        // dropping the set aborts the losers promptly
        tasks.abort_all();
        outcome.ok_or(DnsError::AllUpstreamsFailed)
    }
}
