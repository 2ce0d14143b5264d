use crate::error::{AppError, Result};
use crate::idempotency::key_generator::IdempotencyKey;
use serde::{Deserialize, Serialize};

/// Status codes at or above this value are never recorded for replay.
pub const ERROR_STATUS_THRESHOLD: u16 = 400;

/// Execution state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterState {
    /// Claimed, outcome not yet recorded.
    Pending,
    Completed,
    Failed,
}

/// Persisted record of a key's execution state.
///
/// `status_code` and `body` are present together exactly when the state is
/// `Completed`. `content_type` is optional and only ever set on `Completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    key: IdempotencyKey,
    state: RegisterState,
    status_code: Option<u16>,
    body: Option<String>,
    content_type: Option<String>,
}

impl Register {
    /// The record written at claim time.
    pub fn pending(key: IdempotencyKey) -> Self {
        Self {
            key,
            state: RegisterState::Pending,
            status_code: None,
            body: None,
            content_type: None,
        }
    }

    pub fn failed(key: IdempotencyKey) -> Self {
        Self {
            key,
            state: RegisterState::Failed,
            status_code: None,
            body: None,
            content_type: None,
        }
    }

    /// A recorded outcome. Only success-range status codes are accepted.
    pub fn completed(key: IdempotencyKey, status_code: u16, body: impl Into<String>) -> Result<Self> {
        if !(100..ERROR_STATUS_THRESHOLD).contains(&status_code) {
            return Err(AppError::Validation(format!(
                "Status code {} cannot be recorded for replay",
                status_code
            )));
        }

        Ok(Self {
            key,
            state: RegisterState::Completed,
            status_code: Some(status_code),
            body: Some(body.into()),
            content_type: None,
        })
    }

    /// Attaches the recorded media type. Ignored unless the register is `Completed`.
    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        if self.state == RegisterState::Completed {
            self.content_type = content_type;
        }
        self
    }

    /// Rebuilds a register from its parts, enforcing the payload invariant.
    pub fn from_parts(
        key: IdempotencyKey,
        state: RegisterState,
        status_code: Option<u16>,
        body: Option<String>,
        content_type: Option<String>,
    ) -> Result<Self> {
        match (state, status_code, body, content_type) {
            (RegisterState::Completed, Some(status), Some(body), content_type) => {
                Ok(Self::completed(key, status, body)?.with_content_type(content_type))
            }
            (RegisterState::Pending, None, None, None) => Ok(Self::pending(key)),
            (RegisterState::Failed, None, None, None) => Ok(Self::failed(key)),
            (state, status, body, content_type) => Err(AppError::Validation(format!(
                "Register in state {:?} has inconsistent payload (status: {}, body: {}, content type: {})",
                state,
                status.is_some(),
                body.is_some(),
                content_type.is_some()
            ))),
        }
    }

    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    pub fn state(&self) -> RegisterState {
        self.state
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.state == RegisterState::Pending
    }

    pub fn is_completed(&self) -> bool {
        self.state == RegisterState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state == RegisterState::Failed
    }

    /// Recorded outcome, if any.
    pub fn outcome(&self) -> Option<(u16, &str)> {
        match (self.status_code, self.body.as_deref()) {
            (Some(status), Some(body)) => Some((status, body)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> IdempotencyKey {
        IdempotencyKey::new("k1").unwrap()
    }

    #[test]
    fn test_pending_has_no_payload() {
        let register = Register::pending(key());
        assert!(register.is_pending());
        assert_eq!(register.status_code(), None);
        assert_eq!(register.body(), None);
        assert!(register.outcome().is_none());
    }

    #[test]
    fn test_completed_carries_payload() {
        let register = Register::completed(key(), 201, "42").unwrap();
        assert!(register.is_completed());
        assert_eq!(register.outcome(), Some((201, "42")));
    }

    #[test]
    fn test_completed_rejects_error_and_invalid_status() {
        assert!(Register::completed(key(), 400, "{}").is_err());
        assert!(Register::completed(key(), 500, "{}").is_err());
        assert!(Register::completed(key(), 99, "{}").is_err());
        assert!(Register::completed(key(), 399, "{}").is_ok());
    }

    #[test]
    fn test_from_parts_enforces_invariant() {
        assert!(Register::from_parts(key(), RegisterState::Completed, Some(200), None, None).is_err());
        assert!(Register::from_parts(key(), RegisterState::Completed, None, Some("x".into()), None).is_err());
        assert!(Register::from_parts(key(), RegisterState::Pending, Some(200), Some("x".into()), None).is_err());
        assert!(Register::from_parts(key(), RegisterState::Failed, None, Some("x".into()), None).is_err());
        assert!(Register::from_parts(key(), RegisterState::Pending, None, None, Some("text/plain".into())).is_err());

        let failed = Register::from_parts(key(), RegisterState::Failed, None, None, None).unwrap();
        assert!(failed.is_failed());
    }

    #[test]
    fn test_content_type_only_sticks_to_completed() {
        let completed = Register::completed(key(), 200, "hi")
            .unwrap()
            .with_content_type(Some("text/plain".to_string()));
        assert_eq!(completed.content_type(), Some("text/plain"));

        let pending = Register::pending(key()).with_content_type(Some("text/plain".to_string()));
        assert_eq!(pending.content_type(), None);
    }
}
