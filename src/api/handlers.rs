use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::atomic::Ordering;

use crate::observability::{AggregatedHealth, HealthStatus};

use super::routes::AppState;

fn bump(state: &AppState) -> u64 {
    state.counter.fetch_add(1, Ordering::SeqCst) + 1
}

/// Creates a resource. Answers 201 with the call count.
pub async fn post_counter(State(state): State<AppState>) -> (StatusCode, Json<u64>) {
    (StatusCode::CREATED, Json(bump(&state)))
}

pub async fn put_counter(State(state): State<AppState>) -> Json<u64> {
    Json(bump(&state))
}

pub async fn patch_counter(State(state): State<AppState>) -> Json<u64> {
    Json(bump(&state))
}

pub async fn delete_counter(State(state): State<AppState>) -> StatusCode {
    bump(&state);
    StatusCode::NO_CONTENT
}

/// Safe method: never coordinated, always executes.
pub async fn get_counter(State(state): State<AppState>) -> Json<u64> {
    Json(bump(&state))
}

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match &state.health_checker {
        Some(checker) => {
            let health = checker.check_all().await;
            let status = if health.status.is_unhealthy() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            (status, Json(health))
        }
        None => (
            StatusCode::OK,
            Json(AggregatedHealth {
                status: HealthStatus::Healthy,
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_seconds: 0,
                dependencies: Vec::new(),
            }),
        ),
    }
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    let ready = match &state.health_checker {
        Some(checker) => checker.is_ready().await,
        None => true,
    };

    if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check(State(state): State<AppState>) -> StatusCode {
    let alive = state
        .health_checker
        .as_ref()
        .map_or(true, |checker| checker.is_alive());

    if alive {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}
