use anyhow::Result;
use std::sync::Arc;

use matchday_api::ApiContext;
use matchday_core::store::pg::PgStore;
use matchday_core::{AppContext, Config};
use matchday_delivery::{HttpPushGateway, RedisRealtimePublisher};
use matchday_messaging::ConversationService;
use matchday_notify::NotificationDispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Matchday messaging server");

    let config = Config::from_env();
    let ctx = AppContext::new(config).await?;

    let store = Arc::new(PgStore::new(ctx.db_pool.clone()));
    let push = Arc::new(HttpPushGateway::new(&ctx.config.push)?);
    let realtime = Arc::new(RedisRealtimePublisher::new(ctx.redis.clone()));

    let conversations = ConversationService::new(store.clone(), store.clone(), store.clone());
    let notifications = NotificationDispatcher::new(
        store.clone(),
        store.clone(),
        store.clone(),
        push,
        realtime.clone(),
    );

    // Realtime events queue on the outbox; the poller drains them so their
    // latency and failures stay off the request path.
    let outbox_store = store.clone();
    let outbox_publisher = realtime.clone();
    tokio::spawn(async move {
        if let Err(e) = matchday_outbox::run(outbox_store, outbox_publisher).await {
            tracing::error!("Outbox poller error: {}", e);
        }
    });

    let api_ctx = ApiContext {
        config: ctx.config.clone(),
        conversations,
        notifications,
        devices: store,
    };

    matchday_api::run(api_ctx).await
}
