//! HTTP interceptor: runs the engine around an axum route.
//!
//! Keyed requests are claimed before the handler runs. A conflict answers
//! `409 Conflict` with no body, a replay answers with the recorded status and
//! body plus `idempotent-replayed: true`, and an unreachable store answers
//! `503 Service Unavailable`.
//!
//! At most `max_capture_bytes` of a response are held in memory. A longer
//! body is streamed through to the client and not recorded.

use crate::api::responses::{ApiResponse, ErrorResponse};
use crate::idempotency::engine::{
    CapturedOutcome, Claim, CoordinationError, Decision, IdempotencyEngine, ReplayedOutcome,
};
use crate::idempotency::key_generator::{HttpKeyExtractor, KeyExtractor};
use crate::observability::mask_sensitive;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use futures::{stream, StreamExt};
use std::sync::Arc;

/// Marks responses served from a recorded outcome.
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// State handed to [`idempotency_middleware`].
#[derive(Clone)]
pub struct IdempotencyState {
    pub engine: Arc<IdempotencyEngine>,
    pub extractor: Arc<HttpKeyExtractor>,
}

impl IdempotencyState {
    pub fn new(engine: Arc<IdempotencyEngine>, extractor: HttpKeyExtractor) -> Self {
        Self {
            engine,
            extractor: Arc::new(extractor),
        }
    }
}

/// Installs the interceptor on every route of `router`.
pub fn with_idempotency<S>(router: Router<S>, state: IdempotencyState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(state, idempotency_middleware))
}

pub async fn idempotency_middleware(
    State(state): State<IdempotencyState>,
    request: Request,
    next: Next,
) -> Response {
    let key = state.extractor.extract(&request);

    match state.engine.begin(key).await {
        Ok(Decision::Bypass) => next.run(request).await,
        Ok(Decision::ExecuteNow(claim)) => execute(&state.engine, claim, request, next).await,
        Ok(Decision::Replay(replayed)) => replay_response(replayed),
        Ok(Decision::Conflict(_)) => StatusCode::CONFLICT.into_response(),
        Err(e) => coordination_unavailable(&e),
    }
}

async fn execute(engine: &IdempotencyEngine, claim: Claim, request: Request, next: Next) -> Response {
    let response = next.run(request).await;

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let policy = engine.policy();
    let declared_len = content_length(response.headers());

    let worth_buffering = policy.is_cacheable(status, content_type.as_deref())
        && declared_len.map_or(true, |len| policy.fits(len));

    if !worth_buffering {
        let outcome = CapturedOutcome::uncaptured(status, content_type.as_deref());
        return match engine.finalize(claim, &outcome).await {
            Ok(_) => response,
            Err(e) => coordination_unavailable(&e),
        };
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match buffer_bounded(body, policy.max_capture_bytes()).await {
        Ok(Buffered::Complete(bytes)) => bytes,
        Ok(Buffered::Overflow(body)) => {
            let outcome = CapturedOutcome::uncaptured(status, content_type.as_deref());
            return match engine.finalize(claim, &outcome).await {
                Ok(_) => Response::from_parts(parts, body),
                Err(e) => coordination_unavailable(&e),
            };
        }
        Err(e) => {
            let key = mask_sensitive(claim.key().as_str(), 4);
            tracing::error!(key = %key, error = %e, "Idempotency: failed to read response body");
            if let Err(cleanup) = engine.release(claim).await {
                tracing::error!(key = %key, error = %cleanup, "Idempotency: failed to release key after fault");
            }
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let outcome = match (declared_len, std::str::from_utf8(&bytes)) {
        (Some(len), _) if len != bytes.len() => {
            CapturedOutcome::uncaptured(status, content_type.as_deref())
        }
        (_, Ok(text)) => CapturedOutcome::new(status, content_type.as_deref(), text),
        _ => CapturedOutcome::uncaptured(status, content_type.as_deref()),
    };

    // Length is recomputed from the buffered body.
    parts.headers.remove(header::CONTENT_LENGTH);
    let response = Response::from_parts(parts, Body::from(bytes));

    match engine.finalize(claim, &outcome).await {
        Ok(_) => response,
        Err(e) => coordination_unavailable(&e),
    }
}

enum Buffered {
    Complete(Bytes),
    /// Limit exceeded. Holds the whole body again, buffered prefix first.
    Overflow(Body),
}

/// Reads `body` until it ends or grows past `limit` bytes.
async fn buffer_bounded(body: Body, limit: usize) -> Result<Buffered, axum::Error> {
    let mut chunks = body.into_data_stream();
    let mut buffered = Vec::new();

    while let Some(chunk) = chunks.next().await {
        buffered.extend_from_slice(&chunk?);
        if buffered.len() > limit {
            let head = stream::once(async move { Ok::<_, axum::Error>(Bytes::from(buffered)) });
            return Ok(Buffered::Overflow(Body::from_stream(head.chain(chunks))));
        }
    }

    Ok(Buffered::Complete(Bytes::from(buffered)))
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn replay_response(replayed: ReplayedOutcome) -> Response {
    let Ok(status) = StatusCode::from_u16(replayed.status_code) else {
        tracing::error!(status_code = replayed.status_code, "Idempotency: recorded status is invalid");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let content_type = replayed
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));

    let mut response = (status, replayed.body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}

fn coordination_unavailable(error: &CoordinationError) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ApiResponse::<()>::error(ErrorResponse::new(
            "IDEMPOTENCY_UNAVAILABLE",
            error.to_string(),
        ))),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::key_generator::IdempotencyKey;
    use axum::body::to_bytes;

    #[test]
    fn test_content_length_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(content_length(&headers), Some(42));

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("nope"));
        assert_eq!(content_length(&headers), None);
    }

    #[test]
    fn test_replay_response_shape() {
        let response = replay_response(ReplayedOutcome {
            key: IdempotencyKey::new("k1").unwrap(),
            status_code: 201,
            body: "42".to_string(),
            content_type: None,
        });

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()[REPLAYED_HEADER], "true");
    }

    #[test]
    fn test_replay_uses_recorded_content_type() {
        let response = replay_response(ReplayedOutcome {
            key: IdempotencyKey::new("k1").unwrap(),
            status_code: 200,
            body: "hello".to_string(),
            content_type: Some("text/plain; charset=utf-8".to_string()),
        });

        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
    }

    #[tokio::test]
    async fn test_buffer_bounded_keeps_small_bodies() {
        match buffer_bounded(Body::from("{\"ok\":true}"), 64).await.unwrap() {
            Buffered::Complete(bytes) => assert_eq!(&bytes[..], b"{\"ok\":true}"),
            Buffered::Overflow(_) => panic!("body fits the limit"),
        }
    }

    #[tokio::test]
    async fn test_buffer_bounded_overflow_preserves_body() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"0123")),
            Ok(Bytes::from_static(b"4567")),
            Ok(Bytes::from_static(b"89")),
        ];
        let body = Body::from_stream(stream::iter(chunks));

        let Buffered::Overflow(rest) = buffer_bounded(body, 6).await.unwrap() else {
            panic!("body exceeds the limit");
        };
        let bytes = to_bytes(rest, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"0123456789");
    }

    #[test]
    fn test_coordination_unavailable_is_503() {
        let error = CoordinationError::MissingRegister {
            key: IdempotencyKey::new("k1").unwrap(),
        };
        let response = coordination_unavailable(&error);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
