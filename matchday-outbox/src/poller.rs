//! Drains queued realtime events and publishes them to the broadcast
//! surface. Events that fail to publish are retried on later polls up to
//! `MAX_RETRIES`; exhausted events stay in the table for operators.

use std::sync::Arc;
use std::time::Duration;

use matchday_core::error::Result;
use matchday_core::gateway::RealtimePublisher;
use matchday_core::store::OutboxStore;

const POLL_INTERVAL_MS: u64 = 200;
const BATCH_SIZE: i64 = 100;
const MAX_RETRIES: i32 = 3;

pub async fn run(
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn RealtimePublisher>,
) -> Result<()> {
    tracing::info!("Starting outbox poller");

    loop {
        match poll_once(store.as_ref(), publisher.as_ref()).await {
            Ok(_) => {
                tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!("Outbox poll failed: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn poll_once(
    store: &dyn OutboxStore,
    publisher: &dyn RealtimePublisher,
) -> Result<usize> {
    let events = store.pending(BATCH_SIZE, MAX_RETRIES).await?;
    if events.is_empty() {
        return Ok(0);
    }

    tracing::debug!("Draining {} outbox events", events.len());

    let mut published = 0;
    for event in events {
        match publisher
            .publish(&event.channel, &event.event_name, &event.payload)
            .await
        {
            Ok(_) => {
                store.mark_processed(event.id).await?;
                published += 1;
            }
            Err(e) => {
                store.mark_failed(event.id, &e.to_string()).await?;
                tracing::warn!("Failed to publish outbox event {}: {}", event.id, e);
            }
        }
    }

    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use matchday_core::error::Error;
    use matchday_core::store::memory::MemoryStore;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RealtimePublisher for RecordingPublisher {
        async fn publish(&self, channel: &str, event: &str, _payload: &Value) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((channel.to_string(), event.to_string()));
            Ok(())
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl RealtimePublisher for FailingPublisher {
        async fn publish(&self, _: &str, _: &str, _: &Value) -> Result<()> {
            Err(Error::Delivery("stream down".to_string()))
        }
    }

    #[tokio::test]
    async fn publishes_pending_events_and_marks_them_processed() {
        let store = MemoryStore::new();
        let publisher = RecordingPublisher::default();
        store
            .enqueue("conversation:1", "message:new", json!({"id": 1}))
            .await
            .unwrap();
        store
            .enqueue("user:2", "notification:new", json!({"id": 2}))
            .await
            .unwrap();

        let published = poll_once(&store, &publisher).await.unwrap();
        assert_eq!(published, 2);

        let recorded = publisher.events.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].0, "conversation:1");

        // Nothing left to drain.
        drop(recorded);
        assert_eq!(poll_once(&store, &publisher).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_publishes_are_retried_until_exhausted() {
        let store = MemoryStore::new();
        store
            .enqueue("conversation:1", "message:new", json!({"id": 1}))
            .await
            .unwrap();

        for _ in 0..MAX_RETRIES {
            assert_eq!(poll_once(&store, &FailingPublisher).await.unwrap(), 0);
        }

        // Retries exhausted: the event is no longer offered for publishing.
        let events = store.outbox_events();
        assert_eq!(events[0].retry_count, MAX_RETRIES);
        assert!(events[0].error_message.is_some());
        assert_eq!(poll_once(&store, &FailingPublisher).await.unwrap(), 0);

        // A healthy publisher gets nothing either; the event is parked.
        let publisher = RecordingPublisher::default();
        poll_once(&store, &publisher).await.unwrap();
        assert!(publisher.events.lock().unwrap().is_empty());
    }
}
