pub mod engine;
pub mod key_generator;
pub mod middleware;
pub mod pipeline;
pub mod policy;
pub mod register;
pub mod serializer;
pub mod storage;

pub use engine::{
    CapturedOutcome, Claim, CoordinationError, Decision, EngineConfig, EngineMetrics, Execution,
    Finalization, IdempotencyEngine, IdempotencyError, MetricsSnapshot, ReplayedOutcome,
};
pub use key_generator::{FnKeyExtractor, HttpKeyExtractor, IdempotencyKey, KeyExtractor, IDEMPOTENCY_HEADER};
pub use middleware::{idempotency_middleware, with_idempotency, IdempotencyState, REPLAYED_HEADER};
pub use pipeline::{CommandError, IdempotentPipeline};
pub use policy::CachePolicy;
pub use register::{Register, RegisterState, ERROR_STATUS_THRESHOLD};
pub use serializer::{JsonRegisterSerializer, RegisterSerializer, StoredValue};
pub use storage::{IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore};
