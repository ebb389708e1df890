use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use matchday_core::error::Result;
use matchday_core::gateway::{DeliveryStatus, PushGateway, PushMessage, RealtimePublisher};
use matchday_core::store::{DeviceRegistry, NotificationStore, UserDirectory};
use matchday_core::types::{
    EventId, Notification, NotificationId, NotificationPayload, UserId,
};

/// Concurrent push-gateway batches per dispatch.
const BATCH_CONCURRENCY: usize = 4;
/// Concurrent per-user deliveries in a multi-user fan-out.
const USER_FANOUT_CONCURRENCY: usize = 8;

/// Persists notifications and fans them out: push to every registered
/// device, prune endpoints the gateway reports gone, then echo the event on
/// the realtime channel.
///
/// The notification row is written first; push and realtime delivery are
/// best-effort and their failures never surface to the caller.
#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    devices: Arc<dyn DeviceRegistry>,
    directory: Arc<dyn UserDirectory>,
    push: Arc<dyn PushGateway>,
    realtime: Arc<dyn RealtimePublisher>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        devices: Arc<dyn DeviceRegistry>,
        directory: Arc<dyn UserDirectory>,
        push: Arc<dyn PushGateway>,
        realtime: Arc<dyn RealtimePublisher>,
    ) -> Self {
        Self {
            store,
            devices,
            directory,
            push,
            realtime,
        }
    }

    /// Persists and delivers one notification, returning its id.
    ///
    /// A user with no registered devices still gets the row; that is not an
    /// error, there is simply nothing to push.
    pub async fn send_to_user(
        &self,
        user_id: UserId,
        payload: &NotificationPayload,
    ) -> Result<NotificationId> {
        let notification = self.store.insert(user_id, payload).await?;

        let tokens = self.devices.tokens_for_user(user_id).await?;
        if tokens.is_empty() {
            tracing::debug!("No device tokens for user {}, skipping push", user_id);
        } else {
            self.push_fan_out(user_id, payload, &notification, tokens)
                .await;
        }

        let echo = json!({ "notification": notification });
        if let Err(e) = self
            .realtime
            .publish(&user_channel(user_id), "notification:new", &echo)
            .await
        {
            tracing::warn!(
                "Realtime echo failed for notification {}: {}",
                notification.id,
                e
            );
        }

        Ok(notification.id)
    }

    /// Delivers to each user independently; one user's failure does not
    /// abort the rest. Returns the ids of the notifications created.
    pub async fn send_to_users(
        &self,
        user_ids: &[UserId],
        payload: &NotificationPayload,
    ) -> Result<Vec<NotificationId>> {
        let results: Vec<(UserId, Result<NotificationId>)> =
            stream::iter(user_ids.iter().copied())
                .map(|uid| {
                    let dispatcher = self.clone();
                    let payload = payload.clone();
                    async move { (uid, dispatcher.send_to_user(uid, &payload).await) }
                })
                .buffer_unordered(USER_FANOUT_CONCURRENCY)
                .collect()
                .await;

        let mut ids = Vec::with_capacity(results.len());
        for (uid, result) in results {
            match result {
                Ok(id) => ids.push(id),
                Err(e) => tracing::error!("Failed to notify user {}: {}", uid, e),
            }
        }
        Ok(ids)
    }

    /// Notifies everyone currently participating in an event, with the event
    /// title merged into the payload data.
    pub async fn send_event_notification(
        &self,
        event_id: EventId,
        payload: &NotificationPayload,
    ) -> Result<Vec<NotificationId>> {
        let participants = self.directory.event_participants(event_id).await?;
        if participants.is_empty() {
            return Ok(Vec::new());
        }

        let mut payload = payload.clone();
        payload.event_id = Some(event_id);
        if let Some(title) = self.directory.event_title(event_id).await? {
            let mut data = data_object(payload.data.take());
            data.insert("eventTitle".to_string(), Value::String(title));
            payload.data = Some(Value::Object(data));
        }

        self.send_to_users(&participants, &payload).await
    }

    /// Pages through the whole user population in `batch_size` slices.
    /// Returns the number of notifications created. A crash mid-run can
    /// re-deliver the batch in flight; per-batch at-least-once is accepted.
    pub async fn send_to_all(&self, payload: &NotificationPayload, batch_size: i64) -> Result<u64> {
        let batch_size = batch_size.max(1);
        let mut offset = 0i64;
        let mut total = 0u64;

        loop {
            let batch = self.directory.user_ids_page(batch_size, offset).await?;
            if batch.is_empty() {
                break;
            }

            let delivered = self.send_to_users(&batch, payload).await?;
            total += delivered.len() as u64;
            offset += batch.len() as i64;

            if (batch.len() as i64) < batch_size {
                break;
            }
        }

        tracing::info!("Broadcast complete, {} notifications created", total);
        Ok(total)
    }

    pub async fn user_notifications(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>> {
        self.store.page_for_user(user_id, limit, offset).await
    }

    pub async fn unread_count(&self, user_id: UserId) -> Result<i64> {
        self.store.unread_count(user_id).await
    }

    /// Idempotent: re-marking an already-read notification is a no-op.
    pub async fn mark_read(&self, id: NotificationId, user_id: UserId) -> Result<()> {
        self.store.mark_read(id, user_id).await
    }

    pub async fn mark_all_read(&self, user_id: UserId) -> Result<u64> {
        self.store.mark_all_read(user_id).await
    }

    async fn push_fan_out(
        &self,
        user_id: UserId,
        payload: &NotificationPayload,
        notification: &Notification,
        tokens: Vec<matchday_core::types::DeviceToken>,
    ) {
        let valid: Vec<String> = tokens
            .into_iter()
            .filter_map(|t| {
                if self.push.is_valid_token(&t.token) {
                    Some(t.token)
                } else {
                    tracing::warn!(
                        "Skipping malformed device token for user {} ({})",
                        user_id,
                        t.platform.as_str()
                    );
                    None
                }
            })
            .collect();
        if valid.is_empty() {
            return;
        }

        let data = push_data(payload, notification.id);
        let messages: Vec<PushMessage> = valid
            .into_iter()
            .map(|token| PushMessage {
                token,
                title: payload.title.clone(),
                body: payload.body.clone(),
                data: data.clone(),
            })
            .collect();

        // Chunking is a delivery-channel concern; the gateway dictates the
        // batch size and batches go out concurrently.
        let max_batch = self.push.max_batch().max(1);
        let batches: Vec<Vec<PushMessage>> =
            messages.chunks(max_batch).map(|c| c.to_vec()).collect();

        let outcomes = stream::iter(batches)
            .map(|batch| {
                let push = self.push.clone();
                async move { push.send(batch).await }
            })
            .buffer_unordered(BATCH_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        for result in outcomes {
            let batch_outcomes = match result {
                Ok(o) => o,
                Err(e) => {
                    tracing::error!("Push batch submission failed: {}", e);
                    continue;
                }
            };
            for outcome in batch_outcomes {
                match outcome.status {
                    DeliveryStatus::Delivered => {}
                    DeliveryStatus::EndpointGone => {
                        // Self-healing registry: the gateway says this
                        // endpoint is permanently unregistered.
                        match self.devices.remove_token(&outcome.token).await {
                            Ok(true) => {
                                tracing::info!("Pruned dead device token for user {}", user_id)
                            }
                            Ok(false) => {}
                            Err(e) => {
                                tracing::warn!("Failed to prune device token: {}", e)
                            }
                        }
                    }
                    DeliveryStatus::Failed(reason) => {
                        tracing::warn!(
                            "Push delivery failed for a token of user {}: {}",
                            user_id,
                            reason
                        );
                    }
                }
            }
        }
    }
}

fn user_channel(user_id: UserId) -> String {
    format!("user:{}", user_id)
}

/// Data payload attached to every push message. Client apps parse this to
/// route notification taps, so the shape is a fixed contract: caller data
/// plus `type`, `redirectUrl` (empty when absent) and `notificationId`.
fn push_data(payload: &NotificationPayload, notification_id: NotificationId) -> Value {
    let mut data = data_object(payload.data.clone());
    data.insert(
        "type".to_string(),
        Value::String(payload.kind.as_str().to_string()),
    );
    data.insert(
        "redirectUrl".to_string(),
        Value::String(payload.redirect_url.clone().unwrap_or_default()),
    );
    data.insert("notificationId".to_string(), json!(notification_id));
    Value::Object(data)
}

fn data_object(data: Option<Value>) -> Map<String, Value> {
    match data {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use matchday_core::error::Error;
    use matchday_core::gateway::PushOutcome;
    use matchday_core::store::memory::MemoryStore;
    use matchday_core::types::{NotificationKind, Platform};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeGateway {
        batches: Mutex<Vec<Vec<PushMessage>>>,
        statuses: Mutex<HashMap<String, DeliveryStatus>>,
        max_batch: usize,
    }

    impl FakeGateway {
        fn new(max_batch: usize) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                statuses: Mutex::new(HashMap::new()),
                max_batch,
            })
        }

        fn script(&self, token: &str, status: DeliveryStatus) {
            self.statuses
                .lock()
                .unwrap()
                .insert(token.to_string(), status);
        }

        fn sent_batches(&self) -> Vec<Vec<PushMessage>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PushGateway for FakeGateway {
        fn is_valid_token(&self, token: &str) -> bool {
            token.starts_with("tok[")
        }

        fn max_batch(&self) -> usize {
            self.max_batch
        }

        async fn send(&self, messages: Vec<PushMessage>) -> Result<Vec<PushOutcome>> {
            self.batches.lock().unwrap().push(messages.clone());
            let statuses = self.statuses.lock().unwrap();
            Ok(messages
                .into_iter()
                .map(|m| PushOutcome {
                    status: statuses
                        .get(&m.token)
                        .cloned()
                        .unwrap_or(DeliveryStatus::Delivered),
                    token: m.token,
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<(String, String, Value)>>,
    }

    #[async_trait]
    impl RealtimePublisher for RecordingPublisher {
        async fn publish(&self, channel: &str, event: &str, payload: &Value) -> Result<()> {
            self.events.lock().unwrap().push((
                channel.to_string(),
                event.to_string(),
                payload.clone(),
            ));
            Ok(())
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl RealtimePublisher for FailingPublisher {
        async fn publish(&self, _: &str, _: &str, _: &Value) -> Result<()> {
            Err(Error::Delivery("broadcast service unavailable".to_string()))
        }
    }

    fn payload() -> NotificationPayload {
        NotificationPayload {
            title: "Friend request".to_string(),
            body: "Dana wants to connect".to_string(),
            kind: NotificationKind::FriendRequest,
            data: Some(json!({ "fromUserId": 42 })),
            redirect_url: None,
            event_id: None,
        }
    }

    fn dispatcher(
        store: &Arc<MemoryStore>,
        gateway: &Arc<FakeGateway>,
        publisher: Arc<dyn RealtimePublisher>,
    ) -> NotificationDispatcher {
        NotificationDispatcher::new(
            store.clone(),
            store.clone(),
            store.clone(),
            gateway.clone(),
            publisher,
        )
    }

    #[tokio::test]
    async fn user_without_devices_still_gets_a_notification_row() {
        let store = Arc::new(MemoryStore::new());
        let gateway = FakeGateway::new(100);
        let dispatcher = dispatcher(&store, &gateway, Arc::new(RecordingPublisher::default()));

        let id = dispatcher.send_to_user(7, &payload()).await.unwrap();

        assert!(id > 0);
        assert_eq!(store.notification_count(), 1);
        assert!(gateway.sent_batches().is_empty());
    }

    #[tokio::test]
    async fn malformed_tokens_are_skipped_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.register(7, "tok[aaa]", Platform::Ios).await.unwrap();
        store
            .register(7, "definitely not a token", Platform::Android)
            .await
            .unwrap();
        let gateway = FakeGateway::new(100);
        let dispatcher = dispatcher(&store, &gateway, Arc::new(RecordingPublisher::default()));

        dispatcher.send_to_user(7, &payload()).await.unwrap();

        let batches = gateway.sent_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].token, "tok[aaa]");
    }

    #[tokio::test]
    async fn endpoint_gone_prunes_only_that_token() {
        let store = Arc::new(MemoryStore::new());
        store.register(7, "tok[dead]", Platform::Ios).await.unwrap();
        store
            .register(7, "tok[alive]", Platform::Android)
            .await
            .unwrap();
        let gateway = FakeGateway::new(100);
        gateway.script("tok[dead]", DeliveryStatus::EndpointGone);
        gateway.script(
            "tok[alive]",
            DeliveryStatus::Failed("throttled".to_string()),
        );
        let dispatcher = dispatcher(&store, &gateway, Arc::new(RecordingPublisher::default()));

        dispatcher.send_to_user(7, &payload()).await.unwrap();

        let tokens = store.token_strings();
        assert!(!tokens.contains(&"tok[dead]".to_string()));
        assert!(tokens.contains(&"tok[alive]".to_string()));
    }

    #[tokio::test]
    async fn fan_out_chunks_to_gateway_batch_size() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store
                .register(7, &format!("tok[{}]", i), Platform::Generic)
                .await
                .unwrap();
        }
        let gateway = FakeGateway::new(2);
        let dispatcher = dispatcher(&store, &gateway, Arc::new(RecordingPublisher::default()));

        dispatcher.send_to_user(7, &payload()).await.unwrap();

        let mut sizes: Vec<usize> = gateway.sent_batches().iter().map(|b| b.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 2]);
    }

    #[tokio::test]
    async fn push_data_carries_the_routing_contract() {
        let store = Arc::new(MemoryStore::new());
        store.register(7, "tok[aaa]", Platform::Ios).await.unwrap();
        let gateway = FakeGateway::new(100);
        let dispatcher = dispatcher(&store, &gateway, Arc::new(RecordingPublisher::default()));

        let id = dispatcher.send_to_user(7, &payload()).await.unwrap();

        let batches = gateway.sent_batches();
        let data = &batches[0][0].data;
        assert_eq!(data["type"], json!("friend_request"));
        assert_eq!(data["redirectUrl"], json!(""));
        assert_eq!(data["notificationId"], json!(id));
        // Caller-supplied data survives alongside the contract fields.
        assert_eq!(data["fromUserId"], json!(42));
    }

    #[tokio::test]
    async fn realtime_echo_is_published_per_user() {
        let store = Arc::new(MemoryStore::new());
        let gateway = FakeGateway::new(100);
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = dispatcher(&store, &gateway, publisher.clone());

        dispatcher.send_to_user(9, &payload()).await.unwrap();

        let events = publisher.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "user:9");
        assert_eq!(events[0].1, "notification:new");
    }

    #[tokio::test]
    async fn realtime_failure_never_fails_the_dispatch() {
        let store = Arc::new(MemoryStore::new());
        let gateway = FakeGateway::new(100);
        let dispatcher = dispatcher(&store, &gateway, Arc::new(FailingPublisher));

        let id = dispatcher.send_to_user(9, &payload()).await;

        assert!(id.is_ok());
        assert_eq!(store.notification_count(), 1);
    }

    #[tokio::test]
    async fn send_to_users_creates_one_notification_per_user() {
        let store = Arc::new(MemoryStore::new());
        let gateway = FakeGateway::new(100);
        let dispatcher = dispatcher(&store, &gateway, Arc::new(RecordingPublisher::default()));

        let ids = dispatcher
            .send_to_users(&[1, 2, 3], &payload())
            .await
            .unwrap();

        assert_eq!(ids.len(), 3);
        assert_eq!(store.notification_count(), 3);
    }

    #[tokio::test]
    async fn event_notification_targets_participants_and_merges_title() {
        let store = Arc::new(MemoryStore::new());
        store.seed_event(88, "Sunday league final", &[4, 5]);
        let gateway = FakeGateway::new(100);
        let dispatcher = dispatcher(&store, &gateway, Arc::new(RecordingPublisher::default()));

        let ids = dispatcher
            .send_event_notification(88, &payload())
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let rows = dispatcher.user_notifications(4, 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_id, Some(88));
        assert_eq!(
            rows[0].data.as_ref().unwrap()["eventTitle"],
            json!("Sunday league final")
        );
    }

    #[tokio::test]
    async fn send_to_all_pages_through_every_user() {
        let store = Arc::new(MemoryStore::new());
        for i in 1..=5 {
            store.seed_user(i, &format!("user{}", i));
        }
        let gateway = FakeGateway::new(100);
        let dispatcher = dispatcher(&store, &gateway, Arc::new(RecordingPublisher::default()));

        let total = dispatcher.send_to_all(&payload(), 2).await.unwrap();

        assert_eq!(total, 5);
        assert_eq!(store.notification_count(), 5);
    }

    #[tokio::test]
    async fn mark_read_is_idempotent_and_unknown_ids_are_not_found() {
        let store = Arc::new(MemoryStore::new());
        let gateway = FakeGateway::new(100);
        let dispatcher = dispatcher(&store, &gateway, Arc::new(RecordingPublisher::default()));

        let id = dispatcher.send_to_user(3, &payload()).await.unwrap();
        assert_eq!(dispatcher.unread_count(3).await.unwrap(), 1);

        dispatcher.mark_read(id, 3).await.unwrap();
        dispatcher.mark_read(id, 3).await.unwrap();
        assert_eq!(dispatcher.unread_count(3).await.unwrap(), 0);

        let err = dispatcher.mark_read(9999, 3).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
