mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use futures_util::StreamExt;
use grader_common::{redis::EVENTS_CHANNEL, Config, GradingEvent, GradingStateStore, RedisCache};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub redis: ConnectionManager,
    pub grading: GradingStateStore,
    pub start_time: std::time::Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Grader API booting...");

    metrics::init_metrics();
    info!("Metrics registry initialized");

    let config = Config::from_env();

    let client = redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;
    let redis_conn = ConnectionManager::new(client.clone())
        .await
        .context("failed to connect to Redis")?;
    info!(redis_url = %config.redis_url, "Connected to Redis");

    let state = Arc::new(AppState {
        redis: redis_conn.clone(),
        grading: GradingStateStore::new(Arc::new(RedisCache::new(redis_conn))),
        start_time: std::time::Instant::now(),
    });

    tokio::spawn(event_subscriber(client));

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Background task: count the workers' per-criterion events
async fn event_subscriber(client: redis::Client) {
    let mut pubsub = match client.get_async_connection().await {
        Ok(conn) => conn.into_pubsub(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to create pubsub connection");
            return;
        }
    };

    if let Err(e) = pubsub.subscribe(EVENTS_CHANNEL).await {
        tracing::error!(channel = EVENTS_CHANNEL, error = %e, "Failed to subscribe to events channel");
        return;
    }

    info!(channel = EVENTS_CHANNEL, "Event subscriber started");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(_) => continue,
        };

        match serde_json::from_str::<GradingEvent>(&payload) {
            Ok(event) => {
                metrics::record_event(&event);
                tracing::debug!(?event, "Recorded grading event");
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed grading event"),
        }
    }
}
