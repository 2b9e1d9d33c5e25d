//! Pipeline configuration.
//!
//! Values are layered: [`PipelineConfig::default`], then an optional TOML
//! table, then environment variables. Command-line flags are applied last by
//! the binary. Nothing is read from the environment implicitly; the pipeline
//! only sees the value it is constructed with.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ConfigError;
use crate::pipeline::BufferPolicy;
use crate::verify::CompileFanout;

/// Hard ceiling for `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 4;

/// Hard ceiling for `max_target_count`.
pub const TARGET_COUNT_CEILING: usize = 500;

pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_MODEL: &str = "MATHSHEET_MODEL";
pub const ENV_FEEDBACK_MODEL: &str = "MATHSHEET_FEEDBACK_MODEL";
pub const ENV_API_BASE: &str = "MATHSHEET_API_BASE";
pub const ENV_MAX_RETRIES: &str = "MATHSHEET_MAX_RETRIES";
pub const ENV_MAX_CONCURRENT: &str = "MATHSHEET_MAX_CONCURRENT";
pub const ENV_MAX_TARGET_COUNT: &str = "MATHSHEET_MAX_TARGET_COUNT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Additional batch requests after the first one.
    pub max_retries: u32,
    /// Over-request factor for the first batch.
    pub first_buffer_factor: f64,
    /// Over-request factor for backfill batches.
    pub retry_buffer_factor: f64,
    /// Upper bound on one compile check, including queueing for the engine.
    pub verify_timeout_secs: u64,
    pub compile_fanout: CompileFanout,
    /// Simultaneous runs admitted by the concurrency gate.
    pub max_concurrent: usize,
    /// Largest target count one run accepts.
    pub max_target_count: usize,
    pub model: String,
    /// Model for feedback requests; falls back to `model`.
    pub feedback_model: Option<String>,
    pub api_base: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            first_buffer_factor: 1.5,
            retry_buffer_factor: 1.2,
            verify_timeout_secs: 90,
            compile_fanout: CompileFanout::Sequential,
            max_concurrent: 3,
            max_target_count: 50,
            model: "gpt-4o-2024-08-06".to_string(),
            feedback_model: None,
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            request_timeout_secs: 120,
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from `lookup`. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get(ENV_API_KEY) {
            self.api_key = Some(key.trim().to_string());
        }
        if let Some(model) = get(ENV_MODEL) {
            self.model = model.trim().to_string();
        }
        if let Some(model) = get(ENV_FEEDBACK_MODEL) {
            self.feedback_model = Some(model.trim().to_string());
        }
        if let Some(base) = get(ENV_API_BASE) {
            self.api_base = base.trim().trim_end_matches('/').to_string();
        }
        if let Some(raw) = get(ENV_MAX_RETRIES) {
            self.max_retries = parse_field("max_retries", &raw)?;
        }
        if let Some(raw) = get(ENV_MAX_CONCURRENT) {
            self.max_concurrent = parse_field("max_concurrent", &raw)?;
        }
        if let Some(raw) = get(ENV_MAX_TARGET_COUNT) {
            self.max_target_count = parse_field("max_target_count", &raw)?;
        }
        Ok(())
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&source)?
            }
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::Invalid {
                field: "max_retries",
                reason: format!("{} exceeds the limit of {}", self.max_retries, MAX_RETRIES_LIMIT),
            });
        }
        for (field, factor) in [
            ("first_buffer_factor", self.first_buffer_factor),
            ("retry_buffer_factor", self.retry_buffer_factor),
        ] {
            if !factor.is_finite() || factor < 1.0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} must be a finite number >= 1.0", factor),
                });
            }
        }
        if self.verify_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "verify_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent",
                reason: "at least one run must be admitted".to_string(),
            });
        }
        if self.max_target_count == 0 || self.max_target_count > TARGET_COUNT_CEILING {
            return Err(ConfigError::Invalid {
                field: "max_target_count",
                reason: format!(
                    "{} is outside 1..={}",
                    self.max_target_count, TARGET_COUNT_CEILING
                ),
            });
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "model",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn buffer_policy(&self) -> BufferPolicy {
        BufferPolicy::new(self.first_buffer_factor, self.retry_buffer_factor)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

fn parse_field<T>(field: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        reason: format!("'{}': {}", raw.trim(), e),
    })
}
