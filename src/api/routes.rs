use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::idempotency::{with_idempotency, HttpKeyExtractor, IdempotencyEngine, IdempotencyState};
use crate::observability::{get_metrics, HealthChecker, LatencyTimer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub idempotency: IdempotencyState,
    /// Demo side effect: every executed write bumps it once.
    pub counter: Arc<AtomicU64>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub health_checker: Option<Arc<HealthChecker>>,
}

impl AppState {
    pub fn new(engine: Arc<IdempotencyEngine>, extractor: HttpKeyExtractor) -> Self {
        Self {
            idempotency: IdempotencyState::new(engine, extractor),
            counter: Arc::new(AtomicU64::new(0)),
            metrics_handle: None,
            health_checker: None,
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Adds health checker to the state.
    pub fn with_health_checker(mut self, checker: Arc<HealthChecker>) -> Self {
        self.health_checker = Some(checker);
        self
    }
}

/// Creates the demo router. Only `/api/idempotency` is coordinated.
pub fn create_router(state: AppState) -> Router {
    let coordinated = Router::new().route(
        "/api/idempotency",
        get(handlers::get_counter)
            .post(handlers::post_counter)
            .put(handlers::put_counter)
            .patch(handlers::patch_counter)
            .delete(handlers::delete_counter),
    );
    let coordinated = with_idempotency(coordinated, state.idempotency.clone());

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoint
        .route("/metrics", get(handlers::metrics_endpoint))
        .merge(coordinated)
        .layer(middleware::from_fn(track_metrics))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

async fn track_metrics(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let timer = LatencyTimer::new();

    let response = next.run(request).await;
    get_metrics().record_http_request(method.as_str(), &path, response.status().as_u16(), timer.elapsed_ms());
    response
}
