//! Outbound delivery seams: the push gateway and the realtime broadcast
//! publisher. Implementations live in `matchday-delivery`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One push message addressed to a single device token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    pub token: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    /// The gateway reported the endpoint as permanently unregistered; the
    /// token should be pruned from the registry.
    EndpointGone,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub token: String,
    pub status: DeliveryStatus,
}

/// Thin client for the external push-delivery service.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Syntactic token check; invalid tokens are skipped before submission.
    fn is_valid_token(&self, token: &str) -> bool;

    /// Gateway-imposed maximum messages per request.
    fn max_batch(&self) -> usize;

    /// Submits one batch (at most `max_batch` messages) and reports a
    /// per-token outcome. An `Err` means the whole batch failed to submit.
    async fn send(&self, messages: Vec<PushMessage>) -> Result<Vec<PushOutcome>>;
}

/// Best-effort pub/sub broadcast. Callers log and swallow failures; a
/// publish must never fail the write that triggered it.
#[async_trait]
pub trait RealtimePublisher: Send + Sync {
    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<()>;
}
