use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use matchday_core::error::Error;
use matchday_core::types::{ConversationId, MessageId, NotificationId, Platform, UserId};

use crate::auth::AuthenticatedUser;
use crate::server::ApiContext;

/// Maps the core error taxonomy onto HTTP statuses at one point.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotAParticipant => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::EmptyInput | Error::CrossConversation | Error::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Database(_) | Error::Pool(_) | Error::Serialization(_) | Error::Delivery(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if !self.0.is_client_error() {
            tracing::error!("Request failed: {}", self.0);
        }

        let body = Json(json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "matchday-api"
    }))
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl PageQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 100)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Deserialize)]
pub struct CreateConversationRequest {
    pub member_ids: Vec<UserId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
}

pub async fn create_conversation(
    Extension(ctx): Extension<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let conversation = ctx
        .conversations
        .create_conversation(user.user_id, req.member_ids, req.name.as_deref(), req.is_group)
        .await?;
    Ok(Json(json!(conversation)))
}

pub async fn get_conversation_messages(
    Extension(ctx): Extension<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<ConversationId>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let messages = ctx
        .conversations
        .conversation_messages(conversation_id, user.user_id, page.limit(), page.offset())
        .await?;
    Ok(Json(json!(messages)))
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub media_url: Option<String>,
}

pub async fn send_message(
    Extension(ctx): Extension<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<ConversationId>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let message = ctx
        .conversations
        .send_message(
            conversation_id,
            user.user_id,
            &req.content,
            req.media_url.as_deref(),
        )
        .await?;
    Ok(Json(json!(message)))
}

pub async fn leave_conversation(
    Extension(ctx): Extension<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<ConversationId>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.conversations
        .leave_conversation(conversation_id, user.user_id)
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
pub struct MarkMessagesReadRequest {
    pub message_ids: Vec<MessageId>,
}

pub async fn mark_messages_read(
    Extension(ctx): Extension<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<MarkMessagesReadRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.conversations
        .mark_messages_read(&req.message_ids, user.user_id)
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn unread_messages_count(
    Extension(ctx): Extension<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let count = ctx
        .conversations
        .unread_messages_count(user.user_id)
        .await?;
    Ok(Json(json!({ "unread": count })))
}

pub async fn get_notifications(
    Extension(ctx): Extension<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let notifications = ctx
        .notifications
        .user_notifications(user.user_id, page.limit(), page.offset())
        .await?;
    Ok(Json(json!(notifications)))
}

pub async fn unread_notifications_count(
    Extension(ctx): Extension<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let count = ctx.notifications.unread_count(user.user_id).await?;
    Ok(Json(json!({ "unread": count })))
}

pub async fn mark_notification_read(
    Extension(ctx): Extension<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<NotificationId>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.notifications.mark_read(id, user.user_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn mark_all_notifications_read(
    Extension(ctx): Extension<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let updated = ctx.notifications.mark_all_read(user.user_id).await?;
    Ok(Json(json!({ "status": "ok", "updated": updated })))
}

#[derive(Deserialize)]
pub struct RegisterDeviceRequest {
    pub token: String,
    pub platform: Platform,
}

pub async fn register_device_token(
    Extension(ctx): Extension<ApiContext>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<RegisterDeviceRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let device = ctx
        .devices
        .register(user.user_id, &req.token, req.platform)
        .await?;
    Ok(Json(json!(device)))
}

pub async fn remove_device_token(
    Extension(ctx): Extension<ApiContext>,
    Path(token): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let removed = ctx.devices.remove_token(&token).await?;
    if !removed {
        return Err(Error::NotFound("device token").into());
    }
    Ok(Json(json!({ "status": "ok" })))
}
