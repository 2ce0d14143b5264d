//! Storable encoding of [`Register`] values.
//!
//! Registers are written as a tagged, versioned JSON envelope:
//!
//! ```text
//! {"v":1,"key":"[POST] /orders - abc","state":"completed","status_code":201,
//!  "body":"42","content_type":"application/json","written_at":"..."}
//! ```
//!
//! Decoding is strict. Unknown fields, a foreign version, a truncated
//! document, or a payload that contradicts the state are all rejected so a
//! half-written value is never mistaken for a valid register.

use crate::error::{AppError, Result};
use crate::idempotency::key_generator::IdempotencyKey;
use crate::idempotency::register::{Register, RegisterState};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current envelope version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Serialized register exactly as it sits in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue(String);

impl StoredValue {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StoredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Converts registers to and from their stored form.
pub trait RegisterSerializer: Send + Sync {
    fn serialize(&self, register: &Register) -> Result<StoredValue>;

    fn deserialize(&self, value: &StoredValue) -> Result<Register>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoredEnvelope {
    v: u8,
    key: String,
    state: RegisterState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    /// Diagnostic only. Visible to anyone inspecting the store.
    written_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRegisterSerializer;

impl JsonRegisterSerializer {
    pub fn new() -> Self {
        Self
    }

    fn envelope(&self, value: &StoredValue) -> Result<StoredEnvelope> {
        let envelope: StoredEnvelope = serde_json::from_str(value.as_str())
            .map_err(|e| AppError::Serialization(format!("Malformed stored register: {}", e)))?;

        if envelope.v != ENVELOPE_VERSION {
            return Err(AppError::Serialization(format!(
                "Unsupported register version {}",
                envelope.v
            )));
        }

        Ok(envelope)
    }
}

impl RegisterSerializer for JsonRegisterSerializer {
    fn serialize(&self, register: &Register) -> Result<StoredValue> {
        let envelope = StoredEnvelope {
            v: ENVELOPE_VERSION,
            key: register.key().as_str().to_string(),
            state: register.state(),
            status_code: register.status_code(),
            body: register.body().map(str::to_string),
            content_type: register.content_type().map(str::to_string),
            written_at: Utc::now(),
        };

        serde_json::to_string(&envelope)
            .map(StoredValue)
            .map_err(|e| AppError::Serialization(format!("Failed to serialize register: {}", e)))
    }

    fn deserialize(&self, value: &StoredValue) -> Result<Register> {
        let envelope = self.envelope(value)?;
        let key = IdempotencyKey::new(envelope.key)
            .map_err(|e| AppError::Serialization(format!("Corrupt register key: {}", e)))?;
        tracing::trace!(state = ?envelope.state, written_at = %envelope.written_at, "Idempotency: register decoded");

        Register::from_parts(
            key,
            envelope.state,
            envelope.status_code,
            envelope.body,
            envelope.content_type,
        )
        .map_err(|e| AppError::Serialization(format!("Corrupt register payload: {}", e)))
    }
}

/// Serializes a typed command result into a replayable body.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<String> {
    serde_json::to_string(payload)
        .map_err(|e| AppError::Serialization(format!("Failed to serialize response: {}", e)))
}

/// Restores a typed command result from a replayed body.
pub fn decode_payload<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body)
        .map_err(|e| AppError::Serialization(format!("Failed to deserialize cached response: {}", e)))
}
