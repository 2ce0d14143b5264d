use idempotency_engine::api::{create_router, AppState};
use idempotency_engine::config::Settings;
use idempotency_engine::idempotency::{
    EngineConfig, HttpKeyExtractor, IdempotencyEngine, IdempotencyStore, RedisIdempotencyStore,
};
use idempotency_engine::observability::{init_logging, init_metrics, HealthChecker, LogConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    // Initialize logging
    init_logging(&LogConfig::from_settings(&settings.application))?;
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    // Connect to Redis
    info!("Connecting to Redis at {}...", settings.redis.url);
    let client = redis::Client::open(settings.redis.url.as_str())?;
    let store: Arc<dyn IdempotencyStore> = Arc::new(RedisIdempotencyStore::new(
        client,
        settings.idempotency.key_prefix.clone(),
    ));
    match store.ping().await {
        Ok(()) => info!("Redis connection established"),
        // Keyed requests answer 503 until the store comes back.
        Err(e) => warn!(error = %e, "Redis unreachable at startup"),
    }

    let engine = Arc::new(IdempotencyEngine::new(
        store.clone(),
        EngineConfig::from_settings(&settings.idempotency),
    ));
    let extractor = HttpKeyExtractor::new(settings.idempotency.header_name.clone());

    let state = AppState::new(engine, extractor)
        .with_metrics(metrics_handle)
        .with_health_checker(Arc::new(HealthChecker::new(store)));
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.application.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
