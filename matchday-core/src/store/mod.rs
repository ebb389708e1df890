//! Persistence seams consumed by the conversation and notification services.
//!
//! The production implementation is [`pg::PgStore`]; [`memory::MemoryStore`]
//! backs tests and local runs without Postgres.

pub mod memory;
pub mod pg;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    Conversation, ConversationId, ConversationWithParticipants, DeviceToken, EventId, Message,
    MessageId, MessageRead, Notification, NotificationId, NotificationPayload, OutboxEvent,
    Participant, Platform, UserId, UserSummary,
};

/// Durable repository of conversations, participants, messages and read
/// markers.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Returns the existing non-group conversation whose active participant
    /// set is exactly `members`, or creates one. Find-and-create run inside
    /// a single transaction so concurrent duplicate creation cannot produce
    /// two threads for the same pair.
    async fn find_or_create_direct(
        &self,
        members: [UserId; 2],
    ) -> Result<ConversationWithParticipants>;

    /// Creates a group conversation; `admin_id` becomes the sole initial
    /// admin and must be one of `member_ids`.
    async fn create_group(
        &self,
        name: Option<&str>,
        member_ids: &[UserId],
        admin_id: UserId,
    ) -> Result<ConversationWithParticipants>;

    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>>;

    /// All participant rows for a conversation, in join order.
    async fn participants(&self, conversation_id: ConversationId) -> Result<Vec<Participant>>;

    async fn is_active_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool>;

    /// Persists a message and bumps the conversation freshness timestamp in
    /// the same transaction.
    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        media_url: Option<&str>,
    ) -> Result<Message>;

    /// Messages newest-first with their read receipts.
    async fn messages_page(
        &self,
        conversation_id: ConversationId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<(Message, Vec<MessageRead>)>>;

    async fn messages_by_ids(&self, ids: &[MessageId]) -> Result<Vec<Message>>;

    /// Upserts a read marker per message for `user_id` (insert or refresh
    /// the timestamp) and flips each message's `is_read` flag, all as one
    /// atomic unit.
    async fn mark_messages_read(&self, ids: &[MessageId], user_id: UserId) -> Result<()>;

    /// Soft leave: stamps `left_at` on the active participant row.
    async fn mark_left(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()>;

    async fn set_admin(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_admin: bool,
    ) -> Result<()>;

    /// Hard delete of a conversation with its participants, messages and
    /// read markers.
    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()>;

    /// Unread messages across the user's active conversations, excluding the
    /// user's own messages. Computed, never cached.
    async fn unread_message_count(&self, user_id: UserId) -> Result<i64>;
}

/// Mapping from user to registered push endpoints. The token string is the
/// key: re-registering a token owned by another user reassigns it.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn register(&self, user_id: UserId, token: &str, platform: Platform)
        -> Result<DeviceToken>;

    async fn tokens_for_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>>;

    /// Returns true if the token existed.
    async fn remove_token(&self, token: &str) -> Result<bool>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, user_id: UserId, payload: &NotificationPayload) -> Result<Notification>;

    async fn page_for_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>>;

    async fn unread_count(&self, user_id: UserId) -> Result<i64>;

    /// Idempotent; `NotFound` only when no such notification exists for the
    /// user.
    async fn mark_read(&self, id: NotificationId, user_id: UserId) -> Result<()>;

    /// Returns the number of notifications newly marked read.
    async fn mark_all_read(&self, user_id: UserId) -> Result<u64>;
}

/// Queue of realtime events written by the services and drained by the
/// outbox poller.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn enqueue(
        &self,
        channel: &str,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<()>;

    async fn pending(&self, limit: i64, max_retries: i32) -> Result<Vec<OutboxEvent>>;

    async fn mark_processed(&self, id: i64) -> Result<()>;

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()>;
}

/// Read-only window onto the surrounding application's users and events.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Summaries for the given ids; unknown ids are omitted.
    async fn summaries(&self, ids: &[UserId]) -> Result<Vec<UserSummary>>;

    async fn event_participants(&self, event_id: EventId) -> Result<Vec<UserId>>;

    async fn event_title(&self, event_id: EventId) -> Result<Option<String>>;

    /// Stable id-ordered page over all users, for whole-population fan-out.
    async fn user_ids_page(&self, limit: i64, offset: i64) -> Result<Vec<UserId>>;
}
