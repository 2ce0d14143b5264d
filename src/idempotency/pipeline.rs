//! Command-pipeline interceptor for typed, in-process handlers.
//!
//! A successful result is serialized as JSON and recorded with status 200;
//! duplicates get the deserialized recorded value back instead of a second
//! invocation.
//!
//! Command keys are scoped by operation, `[COMMAND] {operation} - {token}`,
//! so two commands carrying the same token never share a register. The
//! operation defaults to the command's type name.

use crate::idempotency::engine::{
    CapturedOutcome, CoordinationError, Execution, IdempotencyEngine, IdempotencyError,
};
use crate::idempotency::key_generator::{IdempotencyKey, KeyExtractor};
use crate::idempotency::serializer::{decode_payload, encode_payload};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError<E> {
    #[error("conflict detected for key \"{0}\"")]
    Conflict(IdempotencyKey),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error("command handler failed")]
    Handler(E),
}

/// Method slot of command keys. Keeps them apart from HTTP keys.
const COMMAND_SCOPE: &str = "COMMAND";

/// Wraps command handlers for requests of type `R`.
pub struct IdempotentPipeline<R, X> {
    engine: Arc<IdempotencyEngine>,
    extractor: X,
    operation: String,
    _request: PhantomData<fn(&R)>,
}

impl<R, X> IdempotentPipeline<R, X>
where
    X: KeyExtractor<R>,
{
    pub fn new(engine: Arc<IdempotencyEngine>, extractor: X) -> Self {
        Self {
            engine,
            extractor,
            operation: std::any::type_name::<R>().to_string(),
            _request: PhantomData,
        }
    }

    /// Names the operation explicitly, for a command type served by more
    /// than one handler.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The key `request` is coordinated under, if it carries a token.
    pub fn key_for(&self, request: &R) -> Option<IdempotencyKey> {
        let token = self.extractor.extract(request)?;
        IdempotencyKey::scoped(COMMAND_SCOPE, &self.operation, token.as_str()).ok()
    }

    pub async fn handle<T, E, F, Fut>(&self, request: &R, next: F) -> Result<T, CommandError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self.key_for(request);
        let execution = self
            .engine
            .execute_with(key, next, capture_json)
            .await
            .map_err(|e| match e {
                IdempotencyError::Coordination(c) => CommandError::Coordination(c),
                IdempotencyError::Operation(e) => CommandError::Handler(e),
            })?;

        match execution {
            Execution::Bypassed(value) | Execution::Executed(value, _) => Ok(value),
            Execution::Conflict(key) => Err(CommandError::Conflict(key)),
            Execution::Replayed(replayed) => decode_payload(&replayed.body).map_err(|e| {
                CommandError::Coordination(CoordinationError::Corrupt {
                    key: replayed.key.clone(),
                    reason: e.to_string(),
                })
            }),
        }
    }
}

fn capture_json<T: Serialize>(value: &T) -> CapturedOutcome {
    match encode_payload(value) {
        Ok(body) => CapturedOutcome::json(200, body),
        Err(e) => {
            tracing::warn!(error = %e, "Idempotency: command result not serializable");
            CapturedOutcome::uncaptured(200, Some("application/json"))
        }
    }
}
