//! Diesel-backed store. Query style follows the rest of the workspace:
//! plain column expressions, transactions only where a check-and-act
//! sequence must be atomic.

use async_trait::async_trait;
use chrono::Utc;
use diesel::dsl::not;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::{DbConnection, DbPool};
use crate::error::{Error, Result};
use crate::schema::{
    conversation_participants, conversations, device_tokens, event_participants, events,
    message_reads, messages, notifications, outbox_events, users,
};
use crate::store::{
    ConversationStore, DeviceRegistry, NotificationStore, OutboxStore, UserDirectory,
};
use crate::types::{
    Conversation, ConversationId, ConversationWithParticipants, DeviceToken, EventId, Message,
    MessageId, MessageRead, Notification, NotificationId, NotificationPayload, OutboxEvent,
    Participant, Platform, UserId, UserSummary,
};

#[derive(Clone)]
pub struct PgStore {
    pool: Arc<DbPool>,
}

impl PgStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<DbConnection> {
        self.pool.get().await.map_err(|e| Error::Pool(e.to_string()))
    }
}

async fn load_participants(
    conn: &mut DbConnection,
    conversation_id: ConversationId,
) -> Result<Vec<Participant>> {
    let rows = conversation_participants::table
        .filter(conversation_participants::conversation_id.eq(conversation_id))
        .order((
            conversation_participants::joined_at.asc(),
            conversation_participants::id.asc(),
        ))
        .select(Participant::as_select())
        .load(conn)
        .await?;
    Ok(rows)
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn find_or_create_direct(
        &self,
        members: [UserId; 2],
    ) -> Result<ConversationWithParticipants> {
        let mut conn = self.conn().await?;
        let [a, b] = members;

        conn.transaction::<ConversationWithParticipants, Error, _>(|conn| {
            async move {
                let a_convs: Vec<ConversationId> = conversation_participants::table
                    .filter(conversation_participants::user_id.eq(a))
                    .filter(conversation_participants::left_at.is_null())
                    .select(conversation_participants::conversation_id)
                    .load(conn)
                    .await?;

                if !a_convs.is_empty() {
                    let shared: Vec<ConversationId> = conversation_participants::table
                        .filter(conversation_participants::user_id.eq(b))
                        .filter(conversation_participants::left_at.is_null())
                        .filter(conversation_participants::conversation_id.eq_any(&a_convs))
                        .select(conversation_participants::conversation_id)
                        .load(conn)
                        .await?;

                    // A direct conversation holds exactly two participants for
                    // its whole lifetime, so any shared non-group thread is
                    // the one we are looking for.
                    let existing: Option<Conversation> = conversations::table
                        .filter(conversations::id.eq_any(&shared))
                        .filter(conversations::is_group.eq(false))
                        .order(conversations::id.asc())
                        .select(Conversation::as_select())
                        .first(conn)
                        .await
                        .optional()?;

                    if let Some(conversation) = existing {
                        let participants = load_participants(conn, conversation.id).await?;
                        return Ok(ConversationWithParticipants {
                            conversation,
                            participants,
                        });
                    }
                }

                let now = Utc::now();
                let conversation: Conversation = diesel::insert_into(conversations::table)
                    .values((
                        conversations::name.eq(None::<String>),
                        conversations::is_group.eq(false),
                        conversations::created_at.eq(now),
                        conversations::updated_at.eq(now),
                    ))
                    .returning(Conversation::as_returning())
                    .get_result(conn)
                    .await?;

                let rows: Vec<_> = [a, b]
                    .iter()
                    .map(|uid| {
                        (
                            conversation_participants::conversation_id.eq(conversation.id),
                            conversation_participants::user_id.eq(*uid),
                            conversation_participants::joined_at.eq(now),
                            conversation_participants::is_admin.eq(false),
                        )
                    })
                    .collect();
                diesel::insert_into(conversation_participants::table)
                    .values(&rows)
                    .execute(conn)
                    .await?;

                let participants = load_participants(conn, conversation.id).await?;
                Ok(ConversationWithParticipants {
                    conversation,
                    participants,
                })
            }
            .scope_boxed()
        })
        .await
    }

    async fn create_group(
        &self,
        name: Option<&str>,
        member_ids: &[UserId],
        admin_id: UserId,
    ) -> Result<ConversationWithParticipants> {
        let mut conn = self.conn().await?;

        conn.transaction::<ConversationWithParticipants, Error, _>(|conn| {
            async move {
                let now = Utc::now();
                let conversation: Conversation = diesel::insert_into(conversations::table)
                    .values((
                        conversations::name.eq(name),
                        conversations::is_group.eq(true),
                        conversations::created_at.eq(now),
                        conversations::updated_at.eq(now),
                    ))
                    .returning(Conversation::as_returning())
                    .get_result(conn)
                    .await?;

                let rows: Vec<_> = member_ids
                    .iter()
                    .map(|uid| {
                        (
                            conversation_participants::conversation_id.eq(conversation.id),
                            conversation_participants::user_id.eq(*uid),
                            conversation_participants::joined_at.eq(now),
                            conversation_participants::is_admin.eq(*uid == admin_id),
                        )
                    })
                    .collect();
                diesel::insert_into(conversation_participants::table)
                    .values(&rows)
                    .execute(conn)
                    .await?;

                let participants = load_participants(conn, conversation.id).await?;
                Ok(ConversationWithParticipants {
                    conversation,
                    participants,
                })
            }
            .scope_boxed()
        })
        .await
    }

    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let mut conn = self.conn().await?;
        let conversation = conversations::table
            .filter(conversations::id.eq(id))
            .select(Conversation::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(conversation)
    }

    async fn participants(&self, conversation_id: ConversationId) -> Result<Vec<Participant>> {
        let mut conn = self.conn().await?;
        load_participants(&mut conn, conversation_id).await
    }

    async fn is_active_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let count: i64 = conversation_participants::table
            .filter(conversation_participants::conversation_id.eq(conversation_id))
            .filter(conversation_participants::user_id.eq(user_id))
            .filter(conversation_participants::left_at.is_null())
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(count > 0)
    }

    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        media_url: Option<&str>,
    ) -> Result<Message> {
        let mut conn = self.conn().await?;

        conn.transaction::<Message, Error, _>(|conn| {
            async move {
                let now = Utc::now();
                let message: Message = diesel::insert_into(messages::table)
                    .values((
                        messages::conversation_id.eq(conversation_id),
                        messages::sender_id.eq(sender_id),
                        messages::content.eq(content),
                        messages::media_url.eq(media_url),
                        messages::is_read.eq(false),
                        messages::created_at.eq(now),
                    ))
                    .returning(Message::as_returning())
                    .get_result(conn)
                    .await?;

                diesel::update(
                    conversations::table.filter(conversations::id.eq(conversation_id)),
                )
                .set(conversations::updated_at.eq(now))
                .execute(conn)
                .await?;

                Ok(message)
            }
            .scope_boxed()
        })
        .await
    }

    async fn messages_page(
        &self,
        conversation_id: ConversationId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<(Message, Vec<MessageRead>)>> {
        let mut conn = self.conn().await?;

        let page: Vec<Message> = messages::table
            .filter(messages::conversation_id.eq(conversation_id))
            .order((messages::created_at.desc(), messages::id.desc()))
            .limit(limit)
            .offset(offset)
            .select(Message::as_select())
            .load(&mut conn)
            .await?;

        if page.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<MessageId> = page.iter().map(|m| m.id).collect();
        let reads: Vec<MessageRead> = message_reads::table
            .filter(message_reads::message_id.eq_any(&ids))
            .order(message_reads::read_at.asc())
            .select(MessageRead::as_select())
            .load(&mut conn)
            .await?;

        let mut by_message: HashMap<MessageId, Vec<MessageRead>> = HashMap::new();
        for read in reads {
            by_message.entry(read.message_id).or_default().push(read);
        }

        Ok(page
            .into_iter()
            .map(|m| {
                let reads = by_message.remove(&m.id).unwrap_or_default();
                (m, reads)
            })
            .collect())
    }

    async fn messages_by_ids(&self, ids: &[MessageId]) -> Result<Vec<Message>> {
        let mut conn = self.conn().await?;
        let rows = messages::table
            .filter(messages::id.eq_any(ids))
            .order(messages::id.asc())
            .select(Message::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn mark_messages_read(&self, ids: &[MessageId], user_id: UserId) -> Result<()> {
        let mut conn = self.conn().await?;

        conn.transaction::<(), Error, _>(|conn| {
            async move {
                let now = Utc::now();
                for message_id in ids {
                    diesel::insert_into(message_reads::table)
                        .values((
                            message_reads::message_id.eq(*message_id),
                            message_reads::user_id.eq(user_id),
                            message_reads::read_at.eq(now),
                        ))
                        .on_conflict((message_reads::message_id, message_reads::user_id))
                        .do_update()
                        .set(message_reads::read_at.eq(now))
                        .execute(conn)
                        .await?;
                }

                diesel::update(messages::table.filter(messages::id.eq_any(ids)))
                    .set(messages::is_read.eq(true))
                    .execute(conn)
                    .await?;

                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn mark_left(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(
            conversation_participants::table
                .filter(conversation_participants::conversation_id.eq(conversation_id))
                .filter(conversation_participants::user_id.eq(user_id))
                .filter(conversation_participants::left_at.is_null()),
        )
        .set(conversation_participants::left_at.eq(Utc::now()))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn set_admin(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_admin: bool,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(
            conversation_participants::table
                .filter(conversation_participants::conversation_id.eq(conversation_id))
                .filter(conversation_participants::user_id.eq(user_id)),
        )
        .set(conversation_participants::is_admin.eq(is_admin))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let mut conn = self.conn().await?;

        conn.transaction::<(), Error, _>(|conn| {
            async move {
                let msg_ids = messages::table
                    .filter(messages::conversation_id.eq(conversation_id))
                    .select(messages::id);
                diesel::delete(
                    message_reads::table.filter(message_reads::message_id.eq_any(msg_ids)),
                )
                .execute(conn)
                .await?;

                diesel::delete(
                    messages::table.filter(messages::conversation_id.eq(conversation_id)),
                )
                .execute(conn)
                .await?;

                diesel::delete(
                    conversation_participants::table
                        .filter(conversation_participants::conversation_id.eq(conversation_id)),
                )
                .execute(conn)
                .await?;

                diesel::delete(conversations::table.filter(conversations::id.eq(conversation_id)))
                    .execute(conn)
                    .await?;

                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn unread_message_count(&self, user_id: UserId) -> Result<i64> {
        let mut conn = self.conn().await?;

        let active_conversations = conversation_participants::table
            .filter(conversation_participants::user_id.eq(user_id))
            .filter(conversation_participants::left_at.is_null())
            .select(conversation_participants::conversation_id);

        let read_messages = message_reads::table
            .filter(message_reads::user_id.eq(user_id))
            .select(message_reads::message_id);

        let count: i64 = messages::table
            .filter(messages::conversation_id.eq_any(active_conversations))
            .filter(messages::sender_id.ne(user_id))
            .filter(not(messages::id.eq_any(read_messages)))
            .count()
            .get_result(&mut conn)
            .await?;

        Ok(count)
    }
}

#[async_trait]
impl DeviceRegistry for PgStore {
    async fn register(
        &self,
        user_id: UserId,
        token: &str,
        platform: Platform,
    ) -> Result<DeviceToken> {
        let mut conn = self.conn().await?;
        let now = Utc::now();

        // Upsert by token: a token re-registered under a new user is
        // reassigned, last writer wins.
        let row: DeviceToken = diesel::insert_into(device_tokens::table)
            .values((
                device_tokens::user_id.eq(user_id),
                device_tokens::token.eq(token),
                device_tokens::platform.eq(platform),
                device_tokens::created_at.eq(now),
                device_tokens::updated_at.eq(now),
            ))
            .on_conflict(device_tokens::token)
            .do_update()
            .set((
                device_tokens::user_id.eq(user_id),
                device_tokens::platform.eq(platform),
                device_tokens::updated_at.eq(now),
            ))
            .returning(DeviceToken::as_returning())
            .get_result(&mut conn)
            .await?;

        Ok(row)
    }

    async fn tokens_for_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
        let mut conn = self.conn().await?;
        let rows = device_tokens::table
            .filter(device_tokens::user_id.eq(user_id))
            .order(device_tokens::id.asc())
            .select(DeviceToken::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn remove_token(&self, token: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(device_tokens::table.filter(device_tokens::token.eq(token)))
            .execute(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn insert(&self, user_id: UserId, payload: &NotificationPayload) -> Result<Notification> {
        let mut conn = self.conn().await?;
        let row: Notification = diesel::insert_into(notifications::table)
            .values((
                notifications::user_id.eq(user_id),
                notifications::kind.eq(payload.kind),
                notifications::title.eq(&payload.title),
                notifications::body.eq(&payload.body),
                notifications::data.eq(payload.data.clone()),
                notifications::redirect_url.eq(payload.redirect_url.as_deref()),
                notifications::event_id.eq(payload.event_id),
                notifications::is_read.eq(false),
                notifications::created_at.eq(Utc::now()),
            ))
            .returning(Notification::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(row)
    }

    async fn page_for_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Notification>> {
        let mut conn = self.conn().await?;
        let rows = notifications::table
            .filter(notifications::user_id.eq(user_id))
            .order(notifications::created_at.desc())
            .limit(limit)
            .offset(offset)
            .select(Notification::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn unread_count(&self, user_id: UserId) -> Result<i64> {
        let mut conn = self.conn().await?;
        let count: i64 = notifications::table
            .filter(notifications::user_id.eq(user_id))
            .filter(notifications::is_read.eq(false))
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(count)
    }

    async fn mark_read(&self, id: NotificationId, user_id: UserId) -> Result<()> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            notifications::table
                .filter(notifications::id.eq(id))
                .filter(notifications::user_id.eq(user_id)),
        )
        .set(notifications::is_read.eq(true))
        .execute(&mut conn)
        .await?;

        if updated == 0 {
            return Err(Error::NotFound("notification"));
        }
        Ok(())
    }

    async fn mark_all_read(&self, user_id: UserId) -> Result<u64> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            notifications::table
                .filter(notifications::user_id.eq(user_id))
                .filter(notifications::is_read.eq(false)),
        )
        .set(notifications::is_read.eq(true))
        .execute(&mut conn)
        .await?;
        Ok(updated as u64)
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn enqueue(
        &self,
        channel: &str,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(outbox_events::table)
            .values((
                outbox_events::channel.eq(channel),
                outbox_events::event_name.eq(event_name),
                outbox_events::payload.eq(payload),
                outbox_events::created_at.eq(Utc::now()),
                outbox_events::retry_count.eq(0),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn pending(&self, limit: i64, max_retries: i32) -> Result<Vec<OutboxEvent>> {
        let mut conn = self.conn().await?;
        let rows = outbox_events::table
            .filter(outbox_events::processed_at.is_null())
            .filter(outbox_events::retry_count.lt(max_retries))
            .order(outbox_events::created_at.asc())
            .limit(limit)
            .select(OutboxEvent::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn mark_processed(&self, id: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_events::table.filter(outbox_events::id.eq(id)))
            .set(outbox_events::processed_at.eq(Utc::now()))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_events::table.filter(outbox_events::id.eq(id)))
            .set((
                outbox_events::retry_count.eq(outbox_events::retry_count + 1),
                outbox_events::error_message.eq(Some(error)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn summaries(&self, ids: &[UserId]) -> Result<Vec<UserSummary>> {
        let mut conn = self.conn().await?;
        let rows = users::table
            .filter(users::id.eq_any(ids))
            .select(UserSummary::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn event_participants(&self, event_id: EventId) -> Result<Vec<UserId>> {
        let mut conn = self.conn().await?;
        let ids = event_participants::table
            .filter(event_participants::event_id.eq(event_id))
            .order(event_participants::user_id.asc())
            .select(event_participants::user_id)
            .load(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn event_title(&self, event_id: EventId) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let title = events::table
            .filter(events::id.eq(event_id))
            .select(events::title)
            .first(&mut conn)
            .await
            .optional()?;
        Ok(title)
    }

    async fn user_ids_page(&self, limit: i64, offset: i64) -> Result<Vec<UserId>> {
        let mut conn = self.conn().await?;
        let ids = users::table
            .order(users::id.asc())
            .limit(limit)
            .offset(offset)
            .select(users::id)
            .load(&mut conn)
            .await?;
        Ok(ids)
    }
}
