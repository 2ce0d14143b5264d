use crate::error::{AppError, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub redis: RedisSettings,
    pub idempotency: IdempotencySettings,
    pub application: ApplicationSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Claim and retention windows plus capture rules for the idempotency engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    /// How long a claim blocks duplicates if its owner never finalizes.
    pub pending_ttl_secs: u64,
    /// How long a completed outcome stays replayable.
    pub completed_ttl_secs: u64,
    pub key_prefix: String,
    pub header_name: String,
    pub cacheable_content_types: Vec<String>,
    pub max_capture_bytes: usize,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            pending_ttl_secs: 60,
            completed_ttl_secs: 86400, // 24 hours
            key_prefix: "idem".to_string(),
            header_name: "Idempotency-Key".to_string(),
            cacheable_content_types: vec!["application/json".to_string()],
            max_capture_bytes: 1024 * 1024,
        }
    }
}

impl IdempotencySettings {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn completed_ttl(&self) -> Duration {
        Duration::from_secs(self.completed_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pending_ttl_secs == 0 || self.completed_ttl_secs == 0 {
            return Err(AppError::Validation(
                "idempotency TTLs must be greater than zero".to_string(),
            ));
        }
        if self.pending_ttl_secs >= self.completed_ttl_secs {
            return Err(AppError::Validation(
                "pending_ttl_secs must be shorter than completed_ttl_secs".to_string(),
            ));
        }
        if self.key_prefix.trim().is_empty() {
            return Err(AppError::Validation("key_prefix must not be empty".to_string()));
        }
        if self.header_name.trim().is_empty() {
            return Err(AppError::Validation("header_name must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub port: u16,
    pub log_level: String,
    pub log_format: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("idempotency.cacheable_content_types")
                    .try_parsing(true),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.idempotency.validate()?;
        Ok(settings)
    }
}
