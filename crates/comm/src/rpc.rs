//! Correlation-id matched replies.
//!
//! A requester registers a oneshot slot under the request's correlation id;
//! the endpoint's receive loop hands every reply envelope to
//! [`PendingReplies::resolve`], which completes the matching slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::message::Message;

/// Replies awaited by in-progress requests of one endpoint.
#[derive(Debug, Clone, Default)]
pub struct PendingReplies {
    slots: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Message>>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the reply to `correlation_id`.
    pub fn register(&self, correlation_id: Uuid) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(correlation_id, tx);
        rx
    }

    /// Route a reply to its waiting requester. Returns `false` when nobody
    /// waits for it any more (timed out or never asked).
    pub fn resolve(&self, reply: Message) -> bool {
        let cid = reply.correlation_id;
        match self.lock().remove(&cid) {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!(correlation_id = %cid, "received reply for unknown correlation_id");
                false
            }
        }
    }

    /// Stop waiting for `correlation_id`.
    pub fn cancel(&self, correlation_id: &Uuid) {
        self.lock().remove(correlation_id);
    }

    /// Fail every outstanding request; their receivers observe a closed channel.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Message>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use hive_core::Address;

    use super::*;

    #[tokio::test]
    async fn resolve_completes_matching_request() {
        let pending = PendingReplies::new();
        let request = Message::request("q", &Address::inproc("a"), &1u8).unwrap();
        let rx = pending.register(request.correlation_id);

        let other = Message::reply(Uuid::new_v4(), &Address::inproc("b"), &0u8).unwrap();
        assert!(!pending.resolve(other));

        let reply = Message::reply(request.correlation_id, &Address::inproc("b"), &2u8).unwrap();
        assert!(pending.resolve(reply));
        assert_eq!(rx.await.unwrap().decode::<u8>().unwrap(), 2);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn clear_fails_waiters() {
        let pending = PendingReplies::new();
        let rx = pending.register(Uuid::new_v4());
        pending.clear();
        assert!(rx.await.is_err());
    }
}
