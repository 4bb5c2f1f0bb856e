//! Pending-query registry for multiplexed transports
//!
//! A [`PendingMap`] hands out transaction ids for in-flight exchanges
//! and routes inbound replies back to their waiters. The UDP socket and
//! the TCP/DoT pipelines each own one; their reader tasks call
//! [`PendingMap::route`] for every decoded reply.
//!
//! Ids are random and re-drawn while colliding with an outstanding
//! exchange. A reply is matched by id and, for safety, by question; a
//! reply whose question does not match the registered one is left
//! unrouted so the waiter's deadline stays in charge. A reply whose
//! waiter is already gone is discarded without error.

use std::sync::Arc;

use dashmap::DashMap;
use hickory_proto::op::Message;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::message::QuestionKey;

/// One waiter: the question it sent and its reply slot
#[derive(Debug)]
struct PendingSlot {
    question: Option<QuestionKey>,
    tx: oneshot::Sender<Message>,
}

/// In-flight exchanges keyed by transaction id
#[derive(Debug, Default)]
pub(crate) struct PendingMap {
    slots: DashMap<u16, PendingSlot>,
}

impl PendingMap {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter for `query` under a fresh id
    ///
    /// Returns the allocated id, a guard that unregisters the waiter
    /// when dropped, and the reply slot.
    pub(crate) fn register(
        self: &Arc<Self>,
        query: &Message,
    ) -> (u16, PendingGuard, oneshot::Receiver<Message>) {
        let question = QuestionKey::from_message(query);
        loop {
            let id = rand::random::<u16>();
            let (tx, rx) = oneshot::channel();
            match self.slots.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(PendingSlot {
                        question: question.clone(),
                        tx,
                    });
                    let guard = PendingGuard {
                        map: Arc::clone(self),
                        id,
                    };
                    return (id, guard, rx);
                }
            }
        }
    }

    /// Deliver `reply` to its waiter
    ///
    /// Returns false when no waiter matched; the reply is dropped.
    pub(crate) fn route(&self, reply: Message) -> bool {
        let id = reply.id();
        let reply_question = QuestionKey::from_message(&reply);

        let Some((_, slot)) = self.slots.remove_if(&id, |_, slot| {
            slot.question == reply_question
        }) else {
            if self.slots.contains_key(&id) {
                debug!(id, "reply question does not match outstanding query");
            } else {
                trace!(id, "late reply discarded");
            }
            return false;
        };

        // a send error only means the waiter gave up first
        slot.tx.send(reply).is_ok()
    }

    /// Drop every waiter, waking each with a closed-channel error
    pub(crate) fn fail_all(&self) {
        self.slots.clear();
    }

    /// Number of outstanding exchanges
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Removes its id from the map when dropped
#[derive(Debug)]
pub(crate) struct PendingGuard {
    map: Arc<PendingMap>,
    id: u16,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.map.slots.remove(&self.id);
    }
}
