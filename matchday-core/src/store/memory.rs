//! In-memory store backing tests and local runs without Postgres. Mirrors
//! the transactional semantics of [`super::pg::PgStore`]: every trait
//! method runs under one lock, so check-and-act sequences are atomic.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::store::{
    ConversationStore, DeviceRegistry, NotificationStore, OutboxStore, UserDirectory,
};
use crate::types::{
    Conversation, ConversationId, ConversationWithParticipants, DeviceToken, EventId, Message,
    MessageId, MessageRead, Notification, NotificationId, NotificationPayload, OutboxEvent,
    Participant, Platform, UserId, UserSummary,
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    conversations: Vec<Conversation>,
    participants: Vec<Participant>,
    messages: Vec<Message>,
    reads: Vec<MessageRead>,
    tokens: Vec<DeviceToken>,
    notifications: Vec<Notification>,
    outbox: Vec<OutboxEvent>,
    users: Vec<UserSummary>,
    events: HashMap<EventId, (String, Vec<UserId>)>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn participants_of(&self, conversation_id: ConversationId) -> Vec<Participant> {
        let mut rows: Vec<Participant> = self
            .participants
            .iter()
            .filter(|p| p.conversation_id == conversation_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| (p.joined_at, p.id));
        rows
    }

    fn with_participants(&self, conversation: Conversation) -> ConversationWithParticipants {
        let participants = self.participants_of(conversation.id);
        ConversationWithParticipants {
            conversation,
            participants,
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }

    pub fn seed_user(&self, id: UserId, display_name: &str) {
        let mut inner = self.lock();
        inner.users.retain(|u| u.id != id);
        inner.users.push(UserSummary {
            id,
            display_name: display_name.to_string(),
            avatar_url: None,
        });
    }

    pub fn seed_event(&self, id: EventId, title: &str, participant_ids: &[UserId]) {
        self.lock()
            .events
            .insert(id, (title.to_string(), participant_ids.to_vec()));
    }

    /// Read markers for a message, test inspection helper.
    pub fn reads_for_message(&self, message_id: MessageId) -> Vec<MessageRead> {
        self.lock()
            .reads
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn token_strings(&self) -> Vec<String> {
        self.lock().tokens.iter().map(|t| t.token.clone()).collect()
    }

    pub fn notification_count(&self) -> usize {
        self.lock().notifications.len()
    }

    pub fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.lock().outbox.clone()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn find_or_create_direct(
        &self,
        members: [UserId; 2],
    ) -> Result<ConversationWithParticipants> {
        let mut inner = self.lock();

        let existing = inner
            .conversations
            .iter()
            .filter(|c| !c.is_group)
            .find(|c| {
                let mut active: Vec<UserId> = inner
                    .participants
                    .iter()
                    .filter(|p| p.conversation_id == c.id && p.is_active())
                    .map(|p| p.user_id)
                    .collect();
                active.sort_unstable();
                let mut wanted = members.to_vec();
                wanted.sort_unstable();
                active == wanted
            })
            .cloned();

        if let Some(conversation) = existing {
            return Ok(inner.with_participants(conversation));
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: inner.next_id(),
            name: None,
            is_group: false,
            created_at: now,
            updated_at: now,
        };
        inner.conversations.push(conversation.clone());
        for uid in members {
            let id = inner.next_id();
            inner.participants.push(Participant {
                id,
                conversation_id: conversation.id,
                user_id: uid,
                joined_at: now,
                left_at: None,
                is_admin: false,
            });
        }

        Ok(inner.with_participants(conversation))
    }

    async fn create_group(
        &self,
        name: Option<&str>,
        member_ids: &[UserId],
        admin_id: UserId,
    ) -> Result<ConversationWithParticipants> {
        let mut inner = self.lock();
        let now = Utc::now();
        let conversation = Conversation {
            id: inner.next_id(),
            name: name.map(|n| n.to_string()),
            is_group: true,
            created_at: now,
            updated_at: now,
        };
        inner.conversations.push(conversation.clone());
        for uid in member_ids {
            let id = inner.next_id();
            inner.participants.push(Participant {
                id,
                conversation_id: conversation.id,
                user_id: *uid,
                joined_at: now,
                left_at: None,
                is_admin: *uid == admin_id,
            });
        }

        Ok(inner.with_participants(conversation))
    }

    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        Ok(self.lock().conversations.iter().find(|c| c.id == id).cloned())
    }

    async fn participants(&self, conversation_id: ConversationId) -> Result<Vec<Participant>> {
        Ok(self.lock().participants_of(conversation_id))
    }

    async fn is_active_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        Ok(self.lock().participants.iter().any(|p| {
            p.conversation_id == conversation_id && p.user_id == user_id && p.is_active()
        }))
    }

    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        media_url: Option<&str>,
    ) -> Result<Message> {
        let mut inner = self.lock();
        let now = Utc::now();
        let message = Message {
            id: inner.next_id(),
            conversation_id,
            sender_id,
            content: content.to_string(),
            media_url: media_url.map(|m| m.to_string()),
            is_read: false,
            created_at: now,
        };
        inner.messages.push(message.clone());
        if let Some(c) = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            c.updated_at = now;
        }
        Ok(message)
    }

    async fn messages_page(
        &self,
        conversation_id: ConversationId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<(Message, Vec<MessageRead>)>> {
        let inner = self.lock();
        let mut page: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        page.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        Ok(page
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|m| {
                let reads: Vec<MessageRead> = inner
                    .reads
                    .iter()
                    .filter(|r| r.message_id == m.id)
                    .cloned()
                    .collect();
                (m, reads)
            })
            .collect())
    }

    async fn messages_by_ids(&self, ids: &[MessageId]) -> Result<Vec<Message>> {
        let inner = self.lock();
        Ok(inner
            .messages
            .iter()
            .filter(|m| ids.contains(&m.id))
            .cloned()
            .collect())
    }

    async fn mark_messages_read(&self, ids: &[MessageId], user_id: UserId) -> Result<()> {
        let mut inner = self.lock();
        let now = Utc::now();
        for message_id in ids {
            let pos = inner
                .reads
                .iter()
                .position(|r| r.message_id == *message_id && r.user_id == user_id);
            match pos {
                Some(i) => inner.reads[i].read_at = now,
                None => {
                    let id = inner.next_id();
                    inner.reads.push(MessageRead {
                        id,
                        message_id: *message_id,
                        user_id,
                        read_at: now,
                    });
                }
            }
        }
        for message in inner.messages.iter_mut().filter(|m| ids.contains(&m.id)) {
            message.is_read = true;
        }
        Ok(())
    }

    async fn mark_left(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()> {
        let mut inner = self.lock();
        let now = Utc::now();
        if let Some(p) = inner.participants.iter_mut().find(|p| {
            p.conversation_id == conversation_id && p.user_id == user_id && p.is_active()
        }) {
            p.left_at = Some(now);
        }
        Ok(())
    }

    async fn set_admin(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_admin: bool,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(p) = inner
            .participants
            .iter_mut()
            .find(|p| p.conversation_id == conversation_id && p.user_id == user_id)
        {
            p.is_admin = is_admin;
        }
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let mut inner = self.lock();
        let message_ids: Vec<MessageId> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.id)
            .collect();
        inner.reads.retain(|r| !message_ids.contains(&r.message_id));
        inner.messages.retain(|m| m.conversation_id != conversation_id);
        inner
            .participants
            .retain(|p| p.conversation_id != conversation_id);
        inner.conversations.retain(|c| c.id != conversation_id);
        Ok(())
    }

    async fn unread_message_count(&self, user_id: UserId) -> Result<i64> {
        let inner = self.lock();
        let active: Vec<ConversationId> = inner
            .participants
            .iter()
            .filter(|p| p.user_id == user_id && p.is_active())
            .map(|p| p.conversation_id)
            .collect();
        let count = inner
            .messages
            .iter()
            .filter(|m| active.contains(&m.conversation_id))
            .filter(|m| m.sender_id != user_id)
            .filter(|m| {
                !inner
                    .reads
                    .iter()
                    .any(|r| r.message_id == m.id && r.user_id == user_id)
            })
            .count();
        Ok(count as i64)
    }
}

#[async_trait]
impl DeviceRegistry for MemoryStore {
    async fn register(
        &self,
        user_id: UserId,
        token: &str,
        platform: Platform,
    ) -> Result<DeviceToken> {
        let mut inner = self.lock();
        let now = Utc::now();
        if let Some(i) = inner.tokens.iter().position(|t| t.token == token) {
            inner.tokens[i].user_id = user_id;
            inner.tokens[i].platform = platform;
            inner.tokens[i].updated_at = now;
            return Ok(inner.tokens[i].clone());
        }
        let row = DeviceToken {
            id: inner.next_id(),
            user_id,
            token: token.to_string(),
            platform,
            created_at: now,
            updated_at: now,
        };
        inner.tokens.push(row.clone());
        Ok(row)
    }

    async fn tokens_for_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
        Ok(self
            .lock()
            .tokens
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn remove_token(&self, token: &str) -> Result<bool> {
        let mut inner = self.lock();
        let before = inner.tokens.len();
        inner.tokens.retain(|t| t.token != token);
        Ok(inner.tokens.len() < before)
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, user_id: UserId, payload: &NotificationPayload) -> Result<Notification> {
        let mut inner = self.lock();
        let row = Notification {
            id: inner.next_id(),
            user_id,
            kind: payload.kind,
            title: payload.title.clone(),
            body: payload.body.clone(),
            data: payload.data.clone(),
            redirect_url: payload.redirect_url.clone(),
            event_id: payload.event_id,
            is_read: false,
            created_at: Utc::now(),
        };
        inner.notifications.push(row.clone());
        Ok(row)
    }

    async fn page_for_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>> {
        let inner = self.lock();
        let mut rows: Vec<Notification> = inner
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn unread_count(&self, user_id: UserId) -> Result<i64> {
        Ok(self
            .lock()
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .count() as i64)
    }

    async fn mark_read(&self, id: NotificationId, user_id: UserId) -> Result<()> {
        let mut inner = self.lock();
        match inner
            .notifications
            .iter_mut()
            .find(|n| n.id == id && n.user_id == user_id)
        {
            Some(n) => {
                n.is_read = true;
                Ok(())
            }
            None => Err(Error::NotFound("notification")),
        }
    }

    async fn mark_all_read(&self, user_id: UserId) -> Result<u64> {
        let mut inner = self.lock();
        let mut updated = 0;
        for n in inner
            .notifications
            .iter_mut()
            .filter(|n| n.user_id == user_id && !n.is_read)
        {
            n.is_read = true;
            updated += 1;
        }
        Ok(updated)
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn enqueue(
        &self,
        channel: &str,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.lock();
        let event = OutboxEvent {
            id: inner.next_id(),
            channel: channel.to_string(),
            event_name: event_name.to_string(),
            payload,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            error_message: None,
        };
        inner.outbox.push(event);
        Ok(())
    }

    async fn pending(&self, limit: i64, max_retries: i32) -> Result<Vec<OutboxEvent>> {
        let inner = self.lock();
        let mut rows: Vec<OutboxEvent> = inner
            .outbox
            .iter()
            .filter(|e| e.processed_at.is_none() && e.retry_count < max_retries)
            .cloned()
            .collect();
        rows.sort_by_key(|e| (e.created_at, e.id));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn mark_processed(&self, id: i64) -> Result<()> {
        let mut inner = self.lock();
        if let Some(e) = inner.outbox.iter_mut().find(|e| e.id == id) {
            e.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(e) = inner.outbox.iter_mut().find(|e| e.id == id) {
            e.retry_count += 1;
            e.error_message = Some(error.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn summaries(&self, ids: &[UserId]) -> Result<Vec<UserSummary>> {
        Ok(self
            .lock()
            .users
            .iter()
            .filter(|u| ids.contains(&u.id))
            .cloned()
            .collect())
    }

    async fn event_participants(&self, event_id: EventId) -> Result<Vec<UserId>> {
        Ok(self
            .lock()
            .events
            .get(&event_id)
            .map(|(_, ids)| ids.clone())
            .unwrap_or_default())
    }

    async fn event_title(&self, event_id: EventId) -> Result<Option<String>> {
        Ok(self
            .lock()
            .events
            .get(&event_id)
            .map(|(title, _)| title.clone()))
    }

    async fn user_ids_page(&self, limit: i64, offset: i64) -> Result<Vec<UserId>> {
        let inner = self.lock();
        let mut ids: Vec<UserId> = inner.users.iter().map(|u| u.id).collect();
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}
