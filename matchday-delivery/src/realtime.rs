use async_trait::async_trait;
use serde_json::Value;

use matchday_core::error::{Error, Result};
use matchday_core::gateway::RealtimePublisher;
use matchday_core::redis::{get_connection, RedisPool};

/// Cap per-channel stream growth; consumers that lag further than this are
/// expected to resync through the HTTP API.
const STREAM_MAX_LEN: usize = 1000;

/// Publishes realtime events onto per-channel Redis streams, where the
/// external broadcast gateway picks them up.
pub struct RedisRealtimePublisher {
    pool: RedisPool,
}

impl RedisRealtimePublisher {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RealtimePublisher for RedisRealtimePublisher {
    async fn publish(&self, channel: &str, event: &str, payload: &Value) -> Result<()> {
        let mut conn = get_connection(&self.pool)
            .await
            .map_err(|e| Error::Delivery(e.to_string()))?;

        let stream_key = format!("STREAM:{}", channel);
        redis::cmd("XADD")
            .arg(&stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAX_LEN)
            .arg("*")
            .arg("event")
            .arg(event)
            .arg("data")
            .arg(serde_json::to_string(payload)?)
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| Error::Delivery(format!("XADD to {} failed: {}", stream_key, e)))?;

        tracing::debug!("Published {} on {}", event, stream_key);
        Ok(())
    }
}
