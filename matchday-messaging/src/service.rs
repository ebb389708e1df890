use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use matchday_core::error::{Error, Result};
use matchday_core::store::{ConversationStore, OutboxStore, UserDirectory};
use matchday_core::types::{
    ConversationId, ConversationKind, ConversationWithParticipants, MessageId, MessageView,
    UserId, UserSummary,
};

/// Orchestrates conversation lifecycle, message send/read workflows and the
/// realtime side effects they trigger.
///
/// Realtime events are enqueued on the outbox and published by the poller;
/// enqueue failures are logged and never fail the triggering write.
#[derive(Clone)]
pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
    directory: Arc<dyn UserDirectory>,
    outbox: Arc<dyn OutboxStore>,
}

impl ConversationService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        directory: Arc<dyn UserDirectory>,
        outbox: Arc<dyn OutboxStore>,
    ) -> Self {
        Self {
            store,
            directory,
            outbox,
        }
    }

    /// Creates a conversation for `initiator` and `member_ids`, adding the
    /// initiator to the member list if absent.
    ///
    /// A direct (non-group) request with an existing thread between the same
    /// two users returns that thread unchanged. For groups, the first listed
    /// member becomes the sole initial admin.
    pub async fn create_conversation(
        &self,
        initiator: UserId,
        member_ids: Vec<UserId>,
        name: Option<&str>,
        is_group: bool,
    ) -> Result<ConversationWithParticipants> {
        let mut members = member_ids;
        if !members.contains(&initiator) {
            members.push(initiator);
        }
        let mut seen = HashSet::new();
        members.retain(|id| seen.insert(*id));

        if !is_group {
            if members.len() != 2 {
                return Err(Error::InvalidInput(
                    "a direct conversation requires exactly two members".to_string(),
                ));
            }
            return self
                .store
                .find_or_create_direct([members[0], members[1]])
                .await;
        }

        if members.is_empty() {
            return Err(Error::EmptyInput);
        }
        let admin = members[0];
        self.store.create_group(name, &members, admin).await
    }

    /// Persists a message from an active participant, bumps the conversation
    /// freshness timestamp and queues a realtime broadcast.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        media_url: Option<&str>,
    ) -> Result<MessageView> {
        self.store
            .conversation(conversation_id)
            .await?
            .ok_or(Error::NotFound("conversation"))?;

        if !self
            .store
            .is_active_participant(conversation_id, sender_id)
            .await?
        {
            return Err(Error::NotAParticipant);
        }

        let message = self
            .store
            .insert_message(conversation_id, sender_id, content, media_url)
            .await?;
        let sender = self.summary(sender_id).await?;

        let payload = json!({
            "conversation_id": conversation_id,
            "message": message,
            "sender": sender,
        });
        if let Err(e) = self
            .outbox
            .enqueue(&conversation_channel(conversation_id), "message:new", payload)
            .await
        {
            tracing::warn!(
                "Failed to queue realtime event for message {}: {}",
                message.id,
                e
            );
        }

        Ok(MessageView {
            message,
            sender,
            reads: Vec::new(),
        })
    }

    /// Messages newest-first with sender summaries and read receipts.
    pub async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
        requester: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageView>> {
        self.store
            .conversation(conversation_id)
            .await?
            .ok_or(Error::NotFound("conversation"))?;

        if !self
            .store
            .is_active_participant(conversation_id, requester)
            .await?
        {
            return Err(Error::NotAParticipant);
        }

        let page = self
            .store
            .messages_page(conversation_id, limit, offset)
            .await?;

        let sender_ids: Vec<UserId> = {
            let mut ids: Vec<UserId> = page.iter().map(|(m, _)| m.sender_id).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        let summaries: HashMap<UserId, UserSummary> = self
            .directory
            .summaries(&sender_ids)
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();

        Ok(page
            .into_iter()
            .map(|(message, reads)| {
                let sender = summaries
                    .get(&message.sender_id)
                    .cloned()
                    .unwrap_or_else(|| placeholder_summary(message.sender_id));
                MessageView {
                    message,
                    sender,
                    reads,
                }
            })
            .collect())
    }

    /// Records read receipts for a batch of messages from one conversation.
    ///
    /// All upserts apply as one atomic unit; a second read of the same
    /// message refreshes the receipt timestamp instead of duplicating it.
    pub async fn mark_messages_read(
        &self,
        message_ids: &[MessageId],
        user_id: UserId,
    ) -> Result<()> {
        if message_ids.is_empty() {
            return Err(Error::EmptyInput);
        }

        let mut unique: Vec<MessageId> = message_ids.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let messages = self.store.messages_by_ids(&unique).await?;
        if messages.len() != unique.len() {
            return Err(Error::NotFound("message"));
        }

        let conversation_id = messages[0].conversation_id;
        if messages
            .iter()
            .any(|m| m.conversation_id != conversation_id)
        {
            return Err(Error::CrossConversation);
        }

        if !self
            .store
            .is_active_participant(conversation_id, user_id)
            .await?
        {
            return Err(Error::NotAParticipant);
        }

        self.store.mark_messages_read(&unique, user_id).await?;

        let payload = json!({
            "conversation_id": conversation_id,
            "user_id": user_id,
            "message_ids": unique,
        });
        if let Err(e) = self
            .outbox
            .enqueue(&conversation_channel(conversation_id), "message:read", payload)
            .await
        {
            tracing::warn!(
                "Failed to queue read event for conversation {}: {}",
                conversation_id,
                e
            );
        }

        Ok(())
    }

    /// Leaves a conversation. Direct threads are deleted outright; groups
    /// soft-leave, handing admin to the earliest-joined remaining active
    /// participant when the last admin walks out.
    pub async fn leave_conversation(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<()> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .await?
            .ok_or(Error::NotFound("conversation"))?;

        let participants = self.store.participants(conversation_id).await?;
        let me = participants
            .iter()
            .find(|p| p.user_id == user_id && p.is_active())
            .ok_or(Error::NotAParticipant)?;

        match conversation.kind() {
            ConversationKind::Direct => {
                // Leaving a 1:1 thread ends it for both sides.
                self.store.delete_conversation(conversation_id).await?;
            }
            ConversationKind::Group => {
                let was_admin = me.is_admin;
                self.store.mark_left(conversation_id, user_id).await?;

                if was_admin {
                    let remaining_admin = participants
                        .iter()
                        .any(|p| p.user_id != user_id && p.is_active() && p.is_admin);
                    if !remaining_admin {
                        // Participants are in join order; promote the first
                        // still-active member. A group emptied of active
                        // members is simply left without an admin.
                        if let Some(next) = participants
                            .iter()
                            .find(|p| p.user_id != user_id && p.is_active())
                        {
                            self.store
                                .set_admin(conversation_id, next.user_id, true)
                                .await?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Unread messages across the user's active conversations, excluding the
    /// user's own.
    pub async fn unread_messages_count(&self, user_id: UserId) -> Result<i64> {
        self.store.unread_message_count(user_id).await
    }

    async fn summary(&self, user_id: UserId) -> Result<UserSummary> {
        let mut summaries = self.directory.summaries(&[user_id]).await?;
        Ok(summaries
            .pop()
            .unwrap_or_else(|| placeholder_summary(user_id)))
    }
}

fn conversation_channel(conversation_id: ConversationId) -> String {
    format!("conversation:{}", conversation_id)
}

fn placeholder_summary(user_id: UserId) -> UserSummary {
    UserSummary {
        id: user_id,
        display_name: format!("user-{}", user_id),
        avatar_url: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchday_core::store::memory::MemoryStore;

    const ALICE: UserId = 1;
    const BOB: UserId = 2;
    const CARA: UserId = 3;

    fn service() -> (Arc<MemoryStore>, ConversationService) {
        let store = Arc::new(MemoryStore::new());
        store.seed_user(ALICE, "alice");
        store.seed_user(BOB, "bob");
        store.seed_user(CARA, "cara");
        let service = ConversationService::new(store.clone(), store.clone(), store.clone());
        (store, service)
    }

    #[tokio::test]
    async fn direct_conversation_is_deduplicated_across_member_order() {
        let (_store, service) = service();

        let first = service
            .create_conversation(ALICE, vec![ALICE, BOB], None, false)
            .await
            .unwrap();
        let second = service
            .create_conversation(BOB, vec![BOB, ALICE], None, false)
            .await
            .unwrap();

        assert_eq!(first.conversation.id, second.conversation.id);
        assert_eq!(second.participants.len(), 2);
    }

    #[tokio::test]
    async fn initiator_is_added_to_member_list_when_missing() {
        let (_store, service) = service();

        let conv = service
            .create_conversation(ALICE, vec![BOB], None, false)
            .await
            .unwrap();

        let ids: Vec<UserId> = conv.participants.iter().map(|p| p.user_id).collect();
        assert!(ids.contains(&ALICE));
        assert!(ids.contains(&BOB));
    }

    #[tokio::test]
    async fn direct_conversation_rejects_more_than_two_members() {
        let (_store, service) = service();

        let err = service
            .create_conversation(ALICE, vec![ALICE, BOB, CARA], None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn group_creation_marks_first_listed_member_admin() {
        let (_store, service) = service();

        let conv = service
            .create_conversation(BOB, vec![BOB, ALICE, CARA], Some("five-a-side"), true)
            .await
            .unwrap();

        let admins: Vec<UserId> = conv
            .participants
            .iter()
            .filter(|p| p.is_admin)
            .map(|p| p.user_id)
            .collect();
        assert_eq!(admins, vec![BOB]);
        assert_eq!(conv.conversation.name.as_deref(), Some("five-a-side"));
    }

    #[tokio::test]
    async fn send_message_from_non_participant_fails_and_persists_nothing() {
        let (store, service) = service();
        let conv = service
            .create_conversation(ALICE, vec![ALICE, BOB], None, false)
            .await
            .unwrap();

        let err = service
            .send_message(conv.conversation.id, CARA, "can I join?", None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotAParticipant));
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn send_message_queues_realtime_event() {
        let (store, service) = service();
        let conv = service
            .create_conversation(ALICE, vec![ALICE, BOB], None, false)
            .await
            .unwrap();

        let view = service
            .send_message(conv.conversation.id, ALICE, "kickoff at 7", None)
            .await
            .unwrap();

        assert_eq!(view.sender.display_name, "alice");
        let events = store.outbox_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, "message:new");
        assert_eq!(
            events[0].channel,
            format!("conversation:{}", conv.conversation.id)
        );
    }

    #[tokio::test]
    async fn messages_are_returned_newest_first_with_pagination() {
        let (_store, service) = service();
        let conv = service
            .create_conversation(ALICE, vec![ALICE, BOB], None, false)
            .await
            .unwrap();
        let id = conv.conversation.id;

        for text in ["one", "two", "three"] {
            service.send_message(id, ALICE, text, None).await.unwrap();
        }

        let page = service
            .conversation_messages(id, BOB, 2, 0)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].message.content, "three");
        assert_eq!(page[1].message.content, "two");

        let rest = service
            .conversation_messages(id, BOB, 2, 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].message.content, "one");
    }

    #[tokio::test]
    async fn conversation_messages_requires_membership() {
        let (_store, service) = service();
        let conv = service
            .create_conversation(ALICE, vec![ALICE, BOB], None, false)
            .await
            .unwrap();

        let err = service
            .conversation_messages(conv.conversation.id, CARA, 10, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAParticipant));
    }

    #[tokio::test]
    async fn mark_read_rejects_empty_batch() {
        let (_store, service) = service();
        let err = service.mark_messages_read(&[], ALICE).await.unwrap_err();
        assert!(matches!(err, Error::EmptyInput));
    }

    #[tokio::test]
    async fn mark_read_rejects_cross_conversation_batches_without_writing() {
        let (store, service) = service();
        let c1 = service
            .create_conversation(ALICE, vec![ALICE, BOB], None, false)
            .await
            .unwrap();
        let c2 = service
            .create_conversation(ALICE, vec![ALICE, CARA], None, false)
            .await
            .unwrap();

        let m1 = service
            .send_message(c1.conversation.id, BOB, "hey", None)
            .await
            .unwrap();
        let m2 = service
            .send_message(c2.conversation.id, CARA, "hi", None)
            .await
            .unwrap();

        let err = service
            .mark_messages_read(&[m1.message.id, m2.message.id], ALICE)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CrossConversation));
        assert!(store.reads_for_message(m1.message.id).is_empty());
        assert!(store.reads_for_message(m2.message.id).is_empty());
    }

    #[tokio::test]
    async fn marking_a_message_read_twice_keeps_one_refreshed_receipt() {
        let (store, service) = service();
        let conv = service
            .create_conversation(ALICE, vec![ALICE, BOB], None, false)
            .await
            .unwrap();
        let sent = service
            .send_message(conv.conversation.id, BOB, "score update", None)
            .await
            .unwrap();
        let id = sent.message.id;

        service.mark_messages_read(&[id], ALICE).await.unwrap();
        let first = store.reads_for_message(id);
        assert_eq!(first.len(), 1);

        service.mark_messages_read(&[id], ALICE).await.unwrap();
        let second = store.reads_for_message(id);
        assert_eq!(second.len(), 1);
        assert!(second[0].read_at >= first[0].read_at);
    }

    #[tokio::test]
    async fn mark_read_requires_membership() {
        let (_store, service) = service();
        let conv = service
            .create_conversation(ALICE, vec![ALICE, BOB], None, false)
            .await
            .unwrap();
        let sent = service
            .send_message(conv.conversation.id, ALICE, "private", None)
            .await
            .unwrap();

        let err = service
            .mark_messages_read(&[sent.message.id], CARA)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAParticipant));
    }

    #[tokio::test]
    async fn leaving_a_direct_thread_deletes_it_for_both_sides() {
        let (_store, service) = service();
        let conv = service
            .create_conversation(ALICE, vec![ALICE, BOB], None, false)
            .await
            .unwrap();
        let id = conv.conversation.id;
        service.send_message(id, ALICE, "bye", None).await.unwrap();

        service.leave_conversation(id, ALICE).await.unwrap();

        for user in [ALICE, BOB] {
            let err = service
                .conversation_messages(id, user, 10, 0)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn sole_admin_leaving_promotes_earliest_joined_active_member() {
        let (_store, service) = service();
        let conv = service
            .create_conversation(ALICE, vec![ALICE, BOB, CARA], None, true)
            .await
            .unwrap();
        let id = conv.conversation.id;

        service.leave_conversation(id, ALICE).await.unwrap();

        let participants = service.store.participants(id).await.unwrap();
        let admins: Vec<UserId> = participants
            .iter()
            .filter(|p| p.is_active() && p.is_admin)
            .map(|p| p.user_id)
            .collect();
        assert_eq!(admins, vec![BOB]);
    }

    #[tokio::test]
    async fn last_active_member_leaving_a_group_leaves_it_adminless() {
        let (_store, service) = service();
        let conv = service
            .create_conversation(ALICE, vec![ALICE, BOB], None, true)
            .await
            .unwrap();
        let id = conv.conversation.id;

        service.leave_conversation(id, BOB).await.unwrap();
        service.leave_conversation(id, ALICE).await.unwrap();

        let participants = service.store.participants(id).await.unwrap();
        assert!(participants.iter().all(|p| !p.is_active()));
        // History is retained; the group simply has no admin left.
        assert!(service.store.conversation(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unread_count_tracks_sends_and_reads() {
        let (_store, service) = service();
        let conv = service
            .create_conversation(ALICE, vec![ALICE, BOB], None, false)
            .await
            .unwrap();
        let id = conv.conversation.id;

        assert_eq!(service.unread_messages_count(ALICE).await.unwrap(), 0);

        let sent = service.send_message(id, BOB, "hello", None).await.unwrap();
        assert_eq!(service.unread_messages_count(ALICE).await.unwrap(), 1);
        // Own messages never count as unread.
        assert_eq!(service.unread_messages_count(BOB).await.unwrap(), 0);

        service
            .mark_messages_read(&[sent.message.id], ALICE)
            .await
            .unwrap();
        assert_eq!(service.unread_messages_count(ALICE).await.unwrap(), 0);
    }
}
