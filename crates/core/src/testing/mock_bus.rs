//! Mock message bus for testing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::bus::{Ack, BusError, BusMessage, MessageBus};

/// In-memory message bus.
///
/// Queued messages are handed out by `poll` in FIFO order; publications and
/// acknowledgements are recorded per category.
#[derive(Clone, Default)]
pub struct MockMessageBus {
    queues: Arc<RwLock<HashMap<String, VecDeque<BusMessage>>>>,
    published: Arc<RwLock<Vec<(String, serde_json::Value)>>>,
    acks: Arc<RwLock<Vec<(String, Ack)>>>,
    fail_publish: Arc<RwLock<bool>>,
    next_id: Arc<AtomicU64>,
}

impl MockMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message and return its id.
    pub async fn push(&self, category: &str, body: serde_json::Value) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.queues
            .write()
            .await
            .entry(category.to_string())
            .or_default()
            .push_back(BusMessage {
                id,
                category: category.to_string(),
                input_key: category.to_string(),
                body,
            });
        id
    }

    pub async fn set_fail_publish(&self, fail: bool) {
        *self.fail_publish.write().await = fail;
    }

    /// Bodies published to a category.
    pub async fn published(&self, category: &str) -> Vec<serde_json::Value> {
        self.published
            .read()
            .await
            .iter()
            .filter(|(c, _)| c == category)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub async fn acks(&self) -> Vec<(String, Ack)> {
        self.acks.read().await.clone()
    }

    pub async fn pending(&self, category: &str) -> usize {
        self.queues
            .read()
            .await
            .get(category)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for MockMessageBus {
    async fn publish(&self, category: &str, body: &serde_json::Value) -> Result<(), BusError> {
        if *self.fail_publish.read().await {
            return Err(BusError::Api("mock publish failure".to_string()));
        }
        self.published
            .write()
            .await
            .push((category.to_string(), body.clone()));
        Ok(())
    }

    async fn poll(&self, category: &str) -> Result<Option<BusMessage>, BusError> {
        Ok(self
            .queues
            .write()
            .await
            .get_mut(category)
            .and_then(VecDeque::pop_front))
    }

    async fn ack(&self, category: &str, ack: &Ack) -> Result<(), BusError> {
        self.acks
            .write()
            .await
            .push((category.to_string(), ack.clone()));
        Ok(())
    }
}
