use chrono::{DateTime, Utc};
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::{Queryable, Selectable};
use serde::{Deserialize, Serialize};
use std::io::Write;

pub type UserId = i64;
pub type ConversationId = i64;
pub type MessageId = i64;
pub type NotificationId = i64;
pub type EventId = i64;

/// Push platform of a registered device endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Generic,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Generic => "generic",
        }
    }
}

impl ToSql<Text, Pg> for Platform {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for Platform {
    fn from_sql(value: PgValue<'_>) -> deserialize::Result<Self> {
        match value.as_bytes() {
            b"ios" => Ok(Platform::Ios),
            b"android" => Ok(Platform::Android),
            b"generic" => Ok(Platform::Generic),
            other => Err(format!(
                "unrecognized platform: {}",
                String::from_utf8_lossy(other)
            )
            .into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    FriendRequest,
    FriendAccepted,
    EventInvite,
    EventUpdate,
    Announcement,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Message => "message",
            NotificationKind::FriendRequest => "friend_request",
            NotificationKind::FriendAccepted => "friend_accepted",
            NotificationKind::EventInvite => "event_invite",
            NotificationKind::EventUpdate => "event_update",
            NotificationKind::Announcement => "announcement",
            NotificationKind::System => "system",
        }
    }
}

impl ToSql<Text, Pg> for NotificationKind {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for NotificationKind {
    fn from_sql(value: PgValue<'_>) -> deserialize::Result<Self> {
        match value.as_bytes() {
            b"message" => Ok(NotificationKind::Message),
            b"friend_request" => Ok(NotificationKind::FriendRequest),
            b"friend_accepted" => Ok(NotificationKind::FriendAccepted),
            b"event_invite" => Ok(NotificationKind::EventInvite),
            b"event_update" => Ok(NotificationKind::EventUpdate),
            b"announcement" => Ok(NotificationKind::Announcement),
            b"system" => Ok(NotificationKind::System),
            other => Err(format!(
                "unrecognized notification kind: {}",
                String::from_utf8_lossy(other)
            )
            .into()),
        }
    }
}

/// Direct threads are deleted on leave; groups soft-leave and keep history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = crate::schema::conversations)]
#[diesel(check_for_backend(Pg))]
pub struct Conversation {
    pub id: ConversationId,
    pub name: Option<String>,
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn kind(&self) -> ConversationKind {
        if self.is_group {
            ConversationKind::Group
        } else {
            ConversationKind::Direct
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = crate::schema::conversation_participants)]
#[diesel(check_for_backend(Pg))]
pub struct Participant {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub is_admin: bool,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = crate::schema::messages)]
#[diesel(check_for_backend(Pg))]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub media_url: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = crate::schema::message_reads)]
#[diesel(check_for_backend(Pg))]
pub struct MessageRead {
    pub id: i64,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = crate::schema::device_tokens)]
#[diesel(check_for_backend(Pg))]
pub struct DeviceToken {
    pub id: i64,
    pub user_id: UserId,
    pub token: String,
    pub platform: Platform,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = crate::schema::notifications)]
#[diesel(check_for_backend(Pg))]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: Option<serde_json::Value>,
    pub redirect_url: Option<String>,
    pub event_id: Option<EventId>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = crate::schema::outbox_events)]
#[diesel(check_for_backend(Pg))]
pub struct OutboxEvent {
    pub id: i64,
    pub channel: String,
    pub event_name: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(Pg))]
pub struct UserSummary {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationWithParticipants {
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
}

/// A message joined with its sender summary and read receipts, as returned
/// by the conversation read path.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub message: Message,
    pub sender: UserSummary,
    pub reads: Vec<MessageRead>,
}

/// Inbound payload for the notification dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub redirect_url: Option<String>,
    #[serde(default)]
    pub event_id: Option<EventId>,
}
