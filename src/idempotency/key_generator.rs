use crate::error::{AppError, Result};
use http::{HeaderMap, Method, Request};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Header carrying the caller-supplied idempotency token.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Opaque identifier of one logical operation instance.
///
/// Never empty after trimming. Equal keys denote retries of the same call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "Idempotency key must not be blank".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Builds a key scoped to one operation so the same caller token cannot
    /// collide across endpoints.
    pub fn scoped(method: &str, path: &str, token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::Validation(
                "Idempotency token must not be blank".to_string(),
            ));
        }
        Ok(Self(format!("[{}] {} - {}", method, path, token)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-256 of the key, hex encoded. Used as the store-side identifier.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

/// Derives the idempotency key of an inbound request.
///
/// Returning `None` means the request is not coordinated at all.
pub trait KeyExtractor<R>: Send + Sync {
    fn extract(&self, request: &R) -> Option<IdempotencyKey>;
}

/// Reads the key from an HTTP header and scopes it by method and path.
#[derive(Debug, Clone)]
pub struct HttpKeyExtractor {
    header_name: String,
}

impl Default for HttpKeyExtractor {
    fn default() -> Self {
        Self::new(IDEMPOTENCY_HEADER)
    }
}

impl HttpKeyExtractor {
    pub fn new(header_name: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
        }
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// Safe methods are idempotent by definition and never coordinated.
    pub fn is_safe_method(method: &Method) -> bool {
        matches!(
            *method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
        )
    }

    pub fn extract_parts(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Option<IdempotencyKey> {
        if Self::is_safe_method(method) {
            return None;
        }

        // HeaderMap lookups are case-insensitive.
        let token = headers.get(self.header_name.as_str())?.to_str().ok()?;
        IdempotencyKey::scoped(method.as_str(), path, token).ok()
    }
}

impl<B> KeyExtractor<Request<B>> for HttpKeyExtractor {
    fn extract(&self, request: &Request<B>) -> Option<IdempotencyKey> {
        self.extract_parts(request.method(), request.uri().path(), request.headers())
    }
}

/// Adapts a closure reading a token off a command into a [`KeyExtractor`].
#[derive(Clone)]
pub struct FnKeyExtractor<F> {
    read: F,
}

impl<F> FnKeyExtractor<F> {
    pub fn new(read: F) -> Self {
        Self { read }
    }
}

impl<R, F> KeyExtractor<R> for FnKeyExtractor<F>
where
    F: Fn(&R) -> Option<String> + Send + Sync,
{
    fn extract(&self, request: &R) -> Option<IdempotencyKey> {
        (self.read)(request).and_then(|raw| IdempotencyKey::new(raw).ok())
    }
}
