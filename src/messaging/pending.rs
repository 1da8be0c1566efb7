// src/messaging/pending.rs
// Correlation table for request/response over publish/subscribe.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::rabbitmq::{RabbitMQError, Result};

type ResponseSlot = oneshot::Sender<Vec<u8>>;

/// Maps correlation ids to the one-shot slot of the caller waiting on them.
#[derive(Default)]
pub struct PendingRequests {
    slots: Mutex<HashMap<String, ResponseSlot>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, ResponseSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a fresh correlation id. The entry lives exactly as long as
    /// the returned handle.
    pub fn register(self: &Arc<Self>) -> PendingResponse {
        let correlation_id = Uuid::new_v4().to_string();
        let (slot, receiver) = oneshot::channel();
        self.slots().insert(correlation_id.clone(), slot);

        PendingResponse {
            correlation_id,
            receiver,
            table: Arc::clone(self),
        }
    }

    /// Hands `body` to the caller waiting on `correlation_id`. Returns false
    /// when nobody is waiting, in which case the body is dropped.
    pub fn fulfil(&self, correlation_id: &str, body: Vec<u8>) -> bool {
        let slot = self.slots().remove(correlation_id);
        match slot {
            Some(slot) => slot.send(body).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.slots().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, correlation_id: &str) {
        self.slots().remove(correlation_id);
    }
}

/// A registered request waiting for its reply. Dropping it removes the
/// table entry, whichever way the wait ended.
pub struct PendingResponse {
    correlation_id: String,
    receiver: oneshot::Receiver<Vec<u8>>,
    table: Arc<PendingRequests>,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Waits for the first of: the reply, `cancel` completing, or `timeout`
    /// elapsing.
    pub async fn wait<C>(mut self, timeout: Duration, cancel: C) -> Result<Vec<u8>>
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            reply = &mut self.receiver => reply.map_err(|_| RabbitMQError::ResponseChannelClosed),
            _ = cancel => Err(RabbitMQError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(RabbitMQError::TimeoutError(timeout)),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.remove(&self.correlation_id);
    }
}
