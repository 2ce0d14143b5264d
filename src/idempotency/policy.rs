use crate::config::IdempotencySettings;
use crate::idempotency::register::ERROR_STATUS_THRESHOLD;

/// Decides which outcomes are recorded for replay.
///
/// An outcome is cacheable when its status is below the error threshold and
/// its media type (parameters stripped, compared case-insensitively) is in
/// the allow-list. Outcomes without a content type are never cacheable.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    cacheable_content_types: Vec<String>,
    max_capture_bytes: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(vec!["application/json".to_string()], 1024 * 1024)
    }
}

impl CachePolicy {
    pub fn new(cacheable_content_types: Vec<String>, max_capture_bytes: usize) -> Self {
        Self {
            cacheable_content_types: cacheable_content_types
                .into_iter()
                .map(|ct| ct.trim().to_ascii_lowercase())
                .filter(|ct| !ct.is_empty())
                .collect(),
            max_capture_bytes,
        }
    }

    pub fn from_settings(settings: &IdempotencySettings) -> Self {
        Self::new(
            settings.cacheable_content_types.clone(),
            settings.max_capture_bytes,
        )
    }

    pub fn max_capture_bytes(&self) -> usize {
        self.max_capture_bytes
    }

    pub fn is_cacheable_status(&self, status: u16) -> bool {
        (100..ERROR_STATUS_THRESHOLD).contains(&status)
    }

    pub fn is_cacheable_content_type(&self, content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return false;
        };

        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        self.cacheable_content_types.iter().any(|allowed| *allowed == media_type)
    }

    /// Status and content type both eligible. Body checks happen at capture.
    pub fn is_cacheable(&self, status: u16, content_type: Option<&str>) -> bool {
        self.is_cacheable_status(status) && self.is_cacheable_content_type(content_type)
    }

    pub fn fits(&self, body_len: usize) -> bool {
        body_len <= self.max_capture_bytes
    }
}
