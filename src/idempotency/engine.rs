//! Claim / execute / finalize / replay protocol.
//!
//! The store's atomic create-if-absent decides the single winner for a key.
//! The winner runs the protected operation and either records its outcome
//! (extending the TTL to the retention window) or deletes the register so
//! the key is immediately reusable. Losers read the register and get either
//! a replay of the recorded outcome or a conflict while it is still pending.
//!
//! The engine holds no in-process locks and performs exactly one claim, one
//! execution and one finalize or cleanup per call. It never retries the store.

use crate::config::IdempotencySettings;
use crate::error::AppError;
use crate::idempotency::key_generator::IdempotencyKey;
use crate::idempotency::policy::CachePolicy;
use crate::idempotency::register::{Register, RegisterState};
use crate::idempotency::serializer::{JsonRegisterSerializer, RegisterSerializer};
use crate::idempotency::storage::IdempotencyStore;
use crate::observability::{get_metrics, mask_sensitive, LatencyTimer};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Metrics for idempotency handling.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub total_requests: AtomicU64,
    pub bypassed_requests: AtomicU64,
    pub new_requests: AtomicU64,
    pub conflicts: AtomicU64,
    pub replays: AtomicU64,
    pub completed_requests: AtomicU64,
    pub released_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub coordination_errors: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            bypassed_requests: self.bypassed_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            released_requests: self.released_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            coordination_errors: self.coordination_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub bypassed_requests: u64,
    pub new_requests: u64,
    pub conflicts: u64,
    pub replays: u64,
    pub completed_requests: u64,
    pub released_requests: u64,
    pub failed_requests: u64,
    pub coordination_errors: u64,
}

impl MetricsSnapshot {
    /// Share of keyed requests that were duplicates (conflict or replay).
    pub fn duplicate_rate(&self) -> f64 {
        let keyed = self.total_requests.saturating_sub(self.bypassed_requests);
        if keyed == 0 {
            0.0
        } else {
            (self.conflicts + self.replays) as f64 / keyed as f64
        }
    }
}

/// Coordination could not be carried out. Never a conflict, never a success.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(#[source] AppError),

    #[error("corrupt idempotency register for {key}: {reason}")]
    Corrupt { key: IdempotencyKey, reason: String },

    #[error("idempotency register for {key} vanished after a lost claim")]
    MissingRegister { key: IdempotencyKey },
}

/// Failure of [`IdempotencyEngine::execute`].
#[derive(Debug, Error)]
pub enum IdempotencyError<E> {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// The protected operation's own error, unchanged.
    #[error("protected operation failed")]
    Operation(E),
}

impl<E> IdempotencyError<E> {
    pub fn is_coordination(&self) -> bool {
        matches!(self, IdempotencyError::Coordination(_))
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            IdempotencyError::Operation(e) => Some(e),
            IdempotencyError::Coordination(_) => None,
        }
    }
}

/// Exclusive right to execute for one key, held by the claim's winner.
///
/// Consumed by [`IdempotencyEngine::finalize`] or [`IdempotencyEngine::release`].
/// Dropping it unfinalized leaves the pending register to expire.
#[derive(Debug)]
#[must_use = "a claim must be finalized or released"]
pub struct Claim {
    key: IdempotencyKey,
    store_key: String,
}

impl Claim {
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }
}

/// Outcome recorded by an earlier execution, returned without re-running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedOutcome {
    pub key: IdempotencyKey,
    pub status_code: u16,
    pub body: String,
    /// Media type of the original response, when it was recorded.
    pub content_type: Option<String>,
}

/// What the caller should do with this request.
#[derive(Debug)]
pub enum Decision {
    /// No key: run the handler without coordination.
    Bypass,
    /// This caller won the claim and must finalize or release it.
    ExecuteNow(Claim),
    Replay(ReplayedOutcome),
    /// Another execution holds the key. Try again later.
    Conflict(IdempotencyKey),
}

/// The protected operation's result as handed back for finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutcome {
    pub status_code: u16,
    pub content_type: Option<String>,
    /// `None` when the body could not be captured.
    pub body: Option<String>,
}

impl CapturedOutcome {
    pub fn new(status_code: u16, content_type: Option<&str>, body: impl Into<String>) -> Self {
        Self {
            status_code,
            content_type: content_type.map(str::to_string),
            body: Some(body.into()),
        }
    }

    pub fn json(status_code: u16, body: impl Into<String>) -> Self {
        Self::new(status_code, Some("application/json"), body)
    }

    pub fn uncaptured(status_code: u16, content_type: Option<&str>) -> Self {
        Self {
            status_code,
            content_type: content_type.map(str::to_string),
            body: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    /// Outcome stored for replay.
    Recorded,
    /// Outcome not cacheable; register deleted and key free again.
    Released,
}

/// Result of [`IdempotencyEngine::execute`].
#[derive(Debug)]
pub enum Execution<T> {
    Bypassed(T),
    Executed(T, Finalization),
    Replayed(ReplayedOutcome),
    Conflict(IdempotencyKey),
}

impl<T> Execution<T> {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Execution::Conflict(_))
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Execution::Replayed(_))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Claim hold time; bounds how long a crashed winner blocks the key.
    pub pending_ttl: Duration,
    /// Replay retention for completed outcomes.
    pub completed_ttl: Duration,
    pub policy: CachePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&IdempotencySettings::default())
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &IdempotencySettings) -> Self {
        Self {
            pending_ttl: settings.pending_ttl(),
            completed_ttl: settings.completed_ttl(),
            policy: CachePolicy::from_settings(settings),
        }
    }
}

/// Coordinates duplicate invocations through a shared [`IdempotencyStore`].
pub struct IdempotencyEngine {
    store: Arc<dyn IdempotencyStore>,
    serializer: Arc<dyn RegisterSerializer>,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
}

impl IdempotencyEngine {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: EngineConfig) -> Self {
        Self {
            store,
            serializer: Arc::new(JsonRegisterSerializer::new()),
            config,
            metrics: Arc::new(EngineMetrics::new()),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn RegisterSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.config.policy
    }

    pub fn store(&self) -> Arc<dyn IdempotencyStore> {
        Arc::clone(&self.store)
    }

    /// Claims the key or inspects whoever holds it.
    pub async fn begin(&self, key: Option<IdempotencyKey>) -> Result<Decision, CoordinationError> {
        EngineMetrics::bump(&self.metrics.total_requests);

        let Some(key) = key else {
            EngineMetrics::bump(&self.metrics.bypassed_requests);
            get_metrics().record_idempotency_decision("bypass");
            return Ok(Decision::Bypass);
        };

        let result = self.claim_or_inspect(key).await;
        match &result {
            Ok(Decision::ExecuteNow(_)) => {
                EngineMetrics::bump(&self.metrics.new_requests);
                get_metrics().record_idempotency_decision("execute");
            }
            Ok(Decision::Replay(_)) => {
                EngineMetrics::bump(&self.metrics.replays);
                get_metrics().record_idempotency_decision("replay");
            }
            Ok(Decision::Conflict(_)) => {
                EngineMetrics::bump(&self.metrics.conflicts);
                get_metrics().record_idempotency_decision("conflict");
            }
            Ok(Decision::Bypass) => {}
            Err(e) => {
                EngineMetrics::bump(&self.metrics.coordination_errors);
                get_metrics().record_idempotency_decision("coordination_error");
                tracing::error!(error = %e, "Idempotency: coordination failed");
            }
        }
        result
    }

    async fn claim_or_inspect(&self, key: IdempotencyKey) -> Result<Decision, CoordinationError> {
        let store_key = key.digest();
        let masked = mask_sensitive(key.as_str(), 4);
        tracing::debug!(key = %masked, "Idempotency: key detected");

        let pending = self
            .serializer
            .serialize(&Register::pending(key.clone()))
            .map_err(|e| CoordinationError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;

        let timer = LatencyTimer::new();
        let created = self
            .store
            .create_if_absent(&store_key, &pending, self.config.pending_ttl)
            .await;
        get_metrics().record_store_operation("claim", timer.elapsed_ms(), created.is_ok());

        if created.map_err(CoordinationError::Unavailable)? {
            tracing::info!(key = %masked, "Idempotency: first request, claim acquired");
            return Ok(Decision::ExecuteNow(Claim { key, store_key }));
        }

        let timer = LatencyTimer::new();
        let stored = self.store.read(&store_key).await;
        get_metrics().record_store_operation("read", timer.elapsed_ms(), stored.is_ok());

        let stored = match stored.map_err(CoordinationError::Unavailable)? {
            Some(stored) => stored,
            None => return Err(CoordinationError::MissingRegister { key }),
        };

        let register = self
            .serializer
            .deserialize(&stored)
            .map_err(|e| CoordinationError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;

        if register.key() != &key {
            return Err(CoordinationError::Corrupt {
                key,
                reason: "stored register belongs to a different key".to_string(),
            });
        }

        match (register.state(), register.outcome()) {
            (RegisterState::Completed, Some((status_code, body))) => {
                tracing::info!(key = %masked, status_code, "Idempotency: response from cache");
                Ok(Decision::Replay(ReplayedOutcome {
                    status_code,
                    body: body.to_string(),
                    content_type: register.content_type().map(str::to_string),
                    key,
                }))
            }
            (state, _) => {
                tracing::info!(key = %masked, ?state, "Idempotency: conflict detected");
                Ok(Decision::Conflict(key))
            }
        }
    }

    /// Records a cacheable outcome, or frees the key for anything else.
    pub async fn finalize(
        &self,
        claim: Claim,
        outcome: &CapturedOutcome,
    ) -> Result<Finalization, CoordinationError> {
        let policy = &self.config.policy;
        let eligible = policy.is_cacheable(outcome.status_code, outcome.content_type.as_deref());

        let completed = match &outcome.body {
            Some(body) if eligible && policy.fits(body.len()) => {
                Register::completed(claim.key.clone(), outcome.status_code, body.as_str())
                    .map(|register| register.with_content_type(outcome.content_type.clone()))
                    .and_then(|register| self.serializer.serialize(&register))
                    .map_err(|e| {
                        tracing::warn!(
                            key = %mask_sensitive(claim.key.as_str(), 4),
                            error = %e,
                            "Idempotency: outcome could not be encoded"
                        );
                    })
                    .ok()
            }
            _ => None,
        };

        let Some(value) = completed else {
            tracing::info!(
                key = %mask_sensitive(claim.key.as_str(), 4),
                status_code = outcome.status_code,
                "Idempotency: first request not cacheable, releasing key"
            );
            self.delete(&claim).await?;
            EngineMetrics::bump(&self.metrics.released_requests);
            get_metrics().record_idempotency_finalization("released");
            return Ok(Finalization::Released);
        };

        let timer = LatencyTimer::new();
        let written = self
            .store
            .overwrite(&claim.store_key, &value, self.config.completed_ttl)
            .await;
        get_metrics().record_store_operation("overwrite", timer.elapsed_ms(), written.is_ok());

        if let Err(e) = written {
            EngineMetrics::bump(&self.metrics.coordination_errors);
            tracing::error!(
                key = %mask_sensitive(claim.key.as_str(), 4),
                error = %e,
                "Idempotency: failed to record completed outcome"
            );
            return Err(CoordinationError::Unavailable(e));
        }

        tracing::info!(
            key = %mask_sensitive(claim.key.as_str(), 4),
            status_code = outcome.status_code,
            "Idempotency: first request completed"
        );
        EngineMetrics::bump(&self.metrics.completed_requests);
        get_metrics().record_idempotency_finalization("recorded");
        Ok(Finalization::Recorded)
    }

    /// Deletes the register after a fault so a retry starts fresh.
    pub async fn release(&self, claim: Claim) -> Result<(), CoordinationError> {
        tracing::warn!(
            key = %mask_sensitive(claim.key.as_str(), 4),
            "Idempotency: first request faulted, releasing key"
        );
        EngineMetrics::bump(&self.metrics.failed_requests);
        get_metrics().record_idempotency_finalization("faulted");
        self.delete(&claim).await
    }

    async fn delete(&self, claim: &Claim) -> Result<(), CoordinationError> {
        let timer = LatencyTimer::new();
        let deleted = self.store.delete(&claim.store_key).await;
        get_metrics().record_store_operation("delete", timer.elapsed_ms(), deleted.is_ok());

        deleted.map_err(|e| {
            EngineMetrics::bump(&self.metrics.coordination_errors);
            CoordinationError::Unavailable(e)
        })
    }

    /// Runs `operation` under coordination, capturing its result with `capture`.
    ///
    /// An `Err` from the operation releases the claim and is returned unchanged
    /// as [`IdempotencyError::Operation`], even if the cleanup itself fails.
    pub async fn execute_with<T, E, F, Fut, C>(
        &self,
        key: Option<IdempotencyKey>,
        operation: F,
        capture: C,
    ) -> Result<Execution<T>, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&T) -> CapturedOutcome,
    {
        let claim = match self.begin(key).await? {
            Decision::Bypass => {
                return operation()
                    .await
                    .map(Execution::Bypassed)
                    .map_err(IdempotencyError::Operation);
            }
            Decision::Replay(replayed) => return Ok(Execution::Replayed(replayed)),
            Decision::Conflict(key) => return Ok(Execution::Conflict(key)),
            Decision::ExecuteNow(claim) => claim,
        };

        match operation().await {
            Ok(value) => {
                let outcome = capture(&value);
                let finalization = self.finalize(claim, &outcome).await?;
                Ok(Execution::Executed(value, finalization))
            }
            Err(e) => {
                let key = claim.key().clone();
                if let Err(cleanup) = self.release(claim).await {
                    tracing::error!(
                        key = %mask_sensitive(key.as_str(), 4),
                        error = %cleanup,
                        "Idempotency: failed to release key after fault"
                    );
                }
                Err(IdempotencyError::Operation(e))
            }
        }
    }

    /// [`execute_with`](Self::execute_with) for operations that already
    /// produce a [`CapturedOutcome`].
    pub async fn execute<E, F, Fut>(
        &self,
        key: Option<IdempotencyKey>,
        operation: F,
    ) -> Result<Execution<CapturedOutcome>, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CapturedOutcome, E>>,
    {
        self.execute_with(key, operation, CapturedOutcome::clone).await
    }
}
