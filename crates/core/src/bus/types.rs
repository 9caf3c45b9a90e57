use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// Transport failure or non-success status after retries.
    #[error("message bus API error: {0}")]
    Api(String),

    #[error("invalid message bus response: {0}")]
    InvalidResponse(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// A message fetched from a bus category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: u64,
    pub category: String,
    /// Topic or input key the message was received on.
    #[serde(default)]
    pub input_key: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckOutcome {
    Ok,
    Error,
    Warn,
}

/// Acknowledgement of a consumed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub message_id: u64,
    pub outcome: AckOutcome,
    #[serde(default)]
    pub error: Option<String>,
    /// Ask the bus to stop delivering to this consumer.
    #[serde(default)]
    pub stop: bool,
}

impl Ack {
    pub fn ok(message_id: u64) -> Self {
        Self {
            message_id,
            outcome: AckOutcome::Ok,
            error: None,
            stop: false,
        }
    }

    pub fn error(message_id: u64, error: impl Into<String>) -> Self {
        Self {
            message_id,
            outcome: AckOutcome::Error,
            error: Some(error.into()),
            stop: false,
        }
    }
}

/// Message bus used for upstream consumption, job publishing and error reports.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, category: &str, body: &serde_json::Value) -> Result<(), BusError>;

    /// Next message of the category, if any.
    async fn poll(&self, category: &str) -> Result<Option<BusMessage>, BusError>;

    async fn ack(&self, category: &str, ack: &Ack) -> Result<(), BusError>;
}
