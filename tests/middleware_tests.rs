mod common;

use axum::body::{Body, Bytes};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use common::{engine_with_policy, flaky_engine, memory_engine, CallCounter};
use http_body_util::BodyExt;
use idempotency_engine::api::{create_router, AppState};
use idempotency_engine::idempotency::{
    with_idempotency, CachePolicy, Decision, HttpKeyExtractor, IdempotencyEngine, IdempotencyKey,
    IdempotencyState, REPLAYED_HEADER,
};
use idempotency_engine::observability::HealthChecker;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower::ServiceExt;

fn request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Idempotency-Key", token);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn is_replay(response: &Response) -> bool {
    response.headers().get(REPLAYED_HEADER).is_some()
}

fn demo_app() -> (Router, AppState) {
    let (engine, store) = memory_engine();
    let state = AppState::new(engine, HttpKeyExtractor::default())
        .with_health_checker(Arc::new(HealthChecker::new(store)));
    (create_router(state.clone()), state)
}

fn guarded(router: Router, engine: Arc<IdempotencyEngine>) -> Router {
    with_idempotency(router, IdempotencyState::new(engine, HttpKeyExtractor::default()))
}

/// A router with one `POST /single` route answering with `status` and `body`.
fn single_route_app(status: StatusCode, body: &'static str, json_body: bool) -> (Router, CallCounter) {
    let (engine, _store) = memory_engine();
    let counter = CallCounter::default();
    let hits = counter.clone();

    let router = Router::new().route(
        "/single",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.hit();
                if json_body {
                    (status, Json(json!({ "message": body }))).into_response()
                } else {
                    (status, body).into_response()
                }
            }
        }),
    );
    let state = IdempotencyState::new(engine, HttpKeyExtractor::default());
    (with_idempotency(router, state), counter)
}

#[tokio::test]
async fn test_duplicate_post_replays_recorded_response() {
    let (app, state) = demo_app();

    let first = app.clone().oneshot(request("POST", "/api/idempotency", Some("t-1"))).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    assert!(!is_replay(&first));
    assert_eq!(body_text(first).await, "1");

    let second = app.clone().oneshot(request("POST", "/api/idempotency", Some("t-1"))).await.unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert!(is_replay(&second));
    assert_eq!(second.headers()[header::CONTENT_TYPE], "application/json");
    assert_eq!(body_text(second).await, "1");

    assert_eq!(state.counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_in_flight_duplicate_gets_conflict() {
    let (app, state) = demo_app();
    let engine = state.idempotency.engine.clone();

    let key = IdempotencyKey::scoped("POST", "/api/idempotency", "t-busy").unwrap();
    let claim = match engine.begin(Some(key)).await.unwrap() {
        Decision::ExecuteNow(claim) => claim,
        other => panic!("expected to win the claim, got {:?}", other),
    };

    let response = app.clone().oneshot(request("POST", "/api/idempotency", Some("t-busy"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_text(response).await, "");
    assert_eq!(state.counter.load(Ordering::SeqCst), 0);

    engine.release(claim).await.unwrap();
    let retried = app.oneshot(request("POST", "/api/idempotency", Some("t-busy"))).await.unwrap();
    assert_eq!(retried.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_requests_without_key_always_execute() {
    let (app, state) = demo_app();

    for expected in 1..=2 {
        let response = app.clone().oneshot(request("POST", "/api/idempotency", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_text(response).await, expected.to_string());
    }

    assert_eq!(state.counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_safe_methods_are_never_coordinated() {
    let (app, state) = demo_app();

    for _ in 0..2 {
        let response = app.clone().oneshot(request("GET", "/api/idempotency", Some("t-get"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!is_replay(&response));
    }

    assert_eq!(state.counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_same_token_on_different_methods_is_independent() {
    let (app, state) = demo_app();

    let put = app.clone().oneshot(request("PUT", "/api/idempotency", Some("t-shared"))).await.unwrap();
    let patch = app.clone().oneshot(request("PATCH", "/api/idempotency", Some("t-shared"))).await.unwrap();

    assert_eq!(put.status(), StatusCode::OK);
    assert_eq!(patch.status(), StatusCode::OK);
    assert!(!is_replay(&patch));
    assert_eq!(state.counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_empty_delete_response_is_not_recorded() {
    let (app, state) = demo_app();

    for _ in 0..2 {
        let response = app.clone().oneshot(request("DELETE", "/api/idempotency", Some("t-del"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!is_replay(&response));
    }

    assert_eq!(state.counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_server_error_is_not_recorded() {
    let (app, counter) = single_route_app(StatusCode::INTERNAL_SERVER_ERROR, "boom", true);

    for _ in 0..2 {
        let response = app.clone().oneshot(request("POST", "/single", Some("t-500"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["message"], "boom");
    }

    assert_eq!(counter.count(), 2);
}

#[tokio::test]
async fn test_plain_text_response_is_not_recorded() {
    let (app, counter) = single_route_app(StatusCode::OK, "ok", false);

    for _ in 0..2 {
        let response = app.clone().oneshot(request("POST", "/single", Some("t-text"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!is_replay(&response));
        assert_eq!(body_text(response).await, "ok");
    }

    assert_eq!(counter.count(), 2);
}

#[tokio::test]
async fn test_client_error_is_not_recorded() {
    let (app, counter) = single_route_app(StatusCode::UNPROCESSABLE_ENTITY, "invalid", true);

    for _ in 0..2 {
        let response = app.clone().oneshot(request("POST", "/single", Some("t-422"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    assert_eq!(counter.count(), 2);
}

#[tokio::test]
async fn test_store_outage_answers_service_unavailable() {
    let (engine, store) = flaky_engine();
    store.set_down(true);
    let state = AppState::new(engine, HttpKeyExtractor::default());
    let app = create_router(state.clone());

    let response = app.oneshot(request("POST", "/api/idempotency", Some("t-down"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "IDEMPOTENCY_UNAVAILABLE");
    assert_eq!(state.counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_custom_header_name() {
    let (engine, _store) = memory_engine();
    let state = AppState::new(engine, HttpKeyExtractor::new("X-Request-Token"));
    let app = create_router(state.clone());

    let build = || {
        Request::builder()
            .method("POST")
            .uri("/api/idempotency")
            .header("x-request-token", "t-custom")
            .body(Body::empty())
            .unwrap()
    };

    app.clone().oneshot(build()).await.unwrap();
    let second = app.oneshot(build()).await.unwrap();

    assert!(is_replay(&second));
    assert_eq!(state.counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_health_endpoints() {
    let (app, _state) = demo_app();

    let health = app.clone().oneshot(request("GET", "/health", None)).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(health).await).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["dependencies"][0]["name"], "idempotency_store");

    let ready = app.clone().oneshot(request("GET", "/ready", None)).await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    let live = app.clone().oneshot(request("GET", "/live", None)).await.unwrap();
    assert_eq!(live.status(), StatusCode::OK);

    let metrics = app.oneshot(request("GET", "/metrics", None)).await.unwrap();
    assert_eq!(metrics.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_readiness_fails_when_store_is_down() {
    let (engine, store) = flaky_engine();
    let state = AppState::new(engine, HttpKeyExtractor::default())
        .with_health_checker(Arc::new(HealthChecker::new(store.clone())));
    let app = create_router(state);

    store.set_down(true);
    let ready = app.clone().oneshot(request("GET", "/ready", None)).await.unwrap();
    assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

    let health = app.oneshot(request("GET", "/health", None)).await.unwrap();
    assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_replay_keeps_recorded_content_type() {
    let (engine, _store) = engine_with_policy(CachePolicy::new(vec!["text/plain".to_string()], 1024));
    let counter = CallCounter::default();
    let hits = counter.clone();
    let router = Router::new().route(
        "/greet",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.hit();
                (StatusCode::OK, "hello")
            }
        }),
    );
    let app = guarded(router, engine);

    let first = app.clone().oneshot(request("POST", "/greet", Some("t-greet"))).await.unwrap();
    let original_type = first.headers()[header::CONTENT_TYPE].clone();
    let second = app.oneshot(request("POST", "/greet", Some("t-greet"))).await.unwrap();

    assert!(is_replay(&second));
    assert_eq!(second.headers()[header::CONTENT_TYPE], original_type);
    assert_eq!(original_type, "text/plain; charset=utf-8");
    assert_eq!(body_text(second).await, "hello");
    assert_eq!(counter.count(), 1);
}

#[tokio::test]
async fn test_body_over_capture_limit_streams_through_unrecorded() {
    let (engine, store) = engine_with_policy(CachePolicy::new(vec!["application/json".to_string()], 8));
    let counter = CallCounter::default();
    let hits = counter.clone();
    let router = Router::new().route(
        "/big",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.hit();
                Json(json!({ "message": "longer than eight bytes" }))
            }
        }),
    );
    let app = guarded(router, engine);

    for _ in 0..2 {
        let response = app.clone().oneshot(request("POST", "/big", Some("t-big"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!is_replay(&response));
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["message"], "longer than eight bytes");
    }

    assert_eq!(counter.count(), 2);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_content_length_mismatch_is_not_recorded() {
    let (engine, store) = memory_engine();
    let counter = CallCounter::default();
    let hits = counter.clone();
    let router = Router::new().route(
        "/short",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.hit();
                (
                    [
                        (header::CONTENT_TYPE, "application/json"),
                        (header::CONTENT_LENGTH, "999"),
                    ],
                    "{}",
                )
            }
        }),
    );
    let app = guarded(router, engine);

    for _ in 0..2 {
        let response = app.clone().oneshot(request("POST", "/short", Some("t-short"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!is_replay(&response));
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(body_text(response).await, "{}");
    }

    assert_eq!(counter.count(), 2);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_non_utf8_body_is_not_recorded() {
    let (engine, store) = memory_engine();
    let counter = CallCounter::default();
    let hits = counter.clone();
    let router = Router::new().route(
        "/binary",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.hit();
                ([(header::CONTENT_TYPE, "application/json")], vec![0xff_u8, 0xfe, 0x7b])
            }
        }),
    );
    let app = guarded(router, engine);

    for _ in 0..2 {
        let response = app.clone().oneshot(request("POST", "/binary", Some("t-bin"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!is_replay(&response));
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], &[0xff, 0xfe, 0x7b]);
    }

    assert_eq!(counter.count(), 2);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_body_stream_error_releases_key() {
    let (engine, store) = memory_engine();
    let counter = CallCounter::default();
    let hits = counter.clone();
    let router = Router::new().route(
        "/broken",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.hit();
                let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                    Ok(Bytes::from_static(b"{\"partial\":")),
                    Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "upstream closed")),
                ];
                (
                    [(header::CONTENT_TYPE, "application/json")],
                    Body::from_stream(futures::stream::iter(chunks)),
                )
            }
        }),
    );
    let app = guarded(router, engine);

    for _ in 0..2 {
        let response = app.clone().oneshot(request("POST", "/broken", Some("t-broken"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(store.is_empty().await);
    }

    assert_eq!(counter.count(), 2);
}
