use anyhow::Result;
use axum::{
    extract::Extension,
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use matchday_core::store::DeviceRegistry;
use matchday_core::Config;
use matchday_messaging::ConversationService;
use matchday_notify::NotificationDispatcher;

use crate::auth;
use crate::handlers;

/// Everything the handlers need, injected as a request extension.
#[derive(Clone)]
pub struct ApiContext {
    pub config: Arc<Config>,
    pub conversations: ConversationService,
    pub notifications: NotificationDispatcher,
    pub devices: Arc<dyn DeviceRegistry>,
}

pub async fn run(ctx: ApiContext) -> Result<()> {
    let host: std::net::IpAddr = ctx.config.server.host.parse()?;
    let addr = SocketAddr::from((host, ctx.config.server.api_port));

    let cors_layer = if let Ok(origins) = env::var("CORS_ORIGINS") {
        let mut cors = CorsLayer::new();
        for origin in origins.split(',').map(str::trim) {
            if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                cors = cors.allow_origin(parsed);
            }
        }
        cors.allow_methods(Any).allow_headers(Any)
    } else {
        tracing::warn!("CORS_ORIGINS not set, using permissive CORS");
        CorsLayer::permissive()
    };

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/conversations", post(handlers::create_conversation))
        .route(
            "/api/v1/conversations/:id/messages",
            get(handlers::get_conversation_messages).post(handlers::send_message),
        )
        .route(
            "/api/v1/conversations/:id/leave",
            post(handlers::leave_conversation),
        )
        .route("/api/v1/messages/read", post(handlers::mark_messages_read))
        .route(
            "/api/v1/messages/unread-count",
            get(handlers::unread_messages_count),
        )
        .route("/api/v1/notifications", get(handlers::get_notifications))
        .route(
            "/api/v1/notifications/unread-count",
            get(handlers::unread_notifications_count),
        )
        .route(
            "/api/v1/notifications/:id/read",
            post(handlers::mark_notification_read),
        )
        .route(
            "/api/v1/notifications/read-all",
            post(handlers::mark_all_notifications_read),
        )
        .route(
            "/api/v1/device-tokens",
            post(handlers::register_device_token),
        )
        .route(
            "/api/v1/device-tokens/:token",
            delete(handlers::remove_device_token),
        )
        .layer(
            ServiceBuilder::new()
                .layer(Extension(ctx))
                .layer(middleware::from_fn(auth::auth_middleware))
                .layer(cors_layer),
        );

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
