//! Pipeline configuration.
//!
//! [`MigrationConfig`] carries the tunables of the batch pipeline (pool
//! sizes, paging, retry, validation rules). [`RunConfig`] is the immutable
//! value describing what to migrate and how.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::annotation::{ContainerId, ProjectId};
use crate::rules::RuleConfig;
use crate::store::RetryPolicy;

use super::run::RunMode;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the batch pipeline.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    // Pools
    /// Concurrent batch downloads.
    pub download_workers: usize,
    /// Concurrent batch uploads.
    pub upload_workers: usize,

    // Paging
    /// Images requested per listing page.
    pub page_size: usize,
    /// Images per batch.
    pub batch_size: usize,

    /// Backoff for transient store errors.
    pub retry: RetryPolicy,

    // Validation
    pub rules: RuleConfig,
    /// Upload the valid part of a batch that has uncorrectable objects
    /// instead of failing the whole batch.
    pub allow_partial_batches: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            download_workers: 10,
            upload_workers: 4,
            page_size: 500,
            batch_size: 50,
            retry: RetryPolicy::default(),
            rules: RuleConfig::default(),
            allow_partial_batches: false,
        }
    }
}

impl MigrationConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `VALIDATOR_DOWNLOAD_WORKERS`: concurrent downloads (default: 10)
    /// - `VALIDATOR_UPLOAD_WORKERS`: concurrent uploads (default: 4)
    /// - `VALIDATOR_PAGE_SIZE`: images per listing page (default: 500)
    /// - `VALIDATOR_BATCH_SIZE`: images per batch (default: 50)
    /// - `VALIDATOR_RETRY_ATTEMPTS`: attempts per store call (default: 3)
    /// - `VALIDATOR_RETRY_BASE_MS`: first backoff delay (default: 500)
    /// - `VALIDATOR_RETRY_MAX_MS`: backoff cap (default: 8000)
    /// - `VALIDATOR_MIN_POLYGON_VERTICES`: polygon exterior minimum (default: 3)
    /// - `VALIDATOR_CORRECT_POLYLINES`: register the polyline corrector (default: false)
    /// - `VALIDATOR_ALLOW_PARTIAL_BATCHES`: upload valid parts of failing batches (default: false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("VALIDATOR_DOWNLOAD_WORKERS") {
            config.download_workers = parse_env_value(&val, "VALIDATOR_DOWNLOAD_WORKERS")?;
        }

        if let Ok(val) = std::env::var("VALIDATOR_UPLOAD_WORKERS") {
            config.upload_workers = parse_env_value(&val, "VALIDATOR_UPLOAD_WORKERS")?;
        }

        if let Ok(val) = std::env::var("VALIDATOR_PAGE_SIZE") {
            config.page_size = parse_env_value(&val, "VALIDATOR_PAGE_SIZE")?;
        }

        if let Ok(val) = std::env::var("VALIDATOR_BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "VALIDATOR_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("VALIDATOR_RETRY_ATTEMPTS") {
            config.retry.max_attempts = parse_env_value(&val, "VALIDATOR_RETRY_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("VALIDATOR_RETRY_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "VALIDATOR_RETRY_BASE_MS")?;
            config.retry.base_delay = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("VALIDATOR_RETRY_MAX_MS") {
            let ms: u64 = parse_env_value(&val, "VALIDATOR_RETRY_MAX_MS")?;
            config.retry.max_delay = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("VALIDATOR_MIN_POLYGON_VERTICES") {
            config.rules.min_polygon_vertices =
                parse_env_value(&val, "VALIDATOR_MIN_POLYGON_VERTICES")?;
        }

        if let Ok(val) = std::env::var("VALIDATOR_CORRECT_POLYLINES") {
            config.rules.correct_polylines = parse_env_bool(&val, "VALIDATOR_CORRECT_POLYLINES")?;
        }

        if let Ok(val) = std::env::var("VALIDATOR_ALLOW_PARTIAL_BATCHES") {
            config.allow_partial_batches =
                parse_env_bool(&val, "VALIDATOR_ALLOW_PARTIAL_BATCHES")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "download_workers must be greater than 0".to_string(),
            ));
        }

        if self.upload_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "upload_workers must be greater than 0".to_string(),
            ));
        }

        if self.page_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "page_size must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.batch_size > self.page_size {
            return Err(ConfigError::ValidationFailed(
                "batch_size cannot exceed page_size".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationFailed(
                "retry base delay cannot exceed max delay".to_string(),
            ));
        }

        if self.rules.min_polygon_vertices < 3 {
            return Err(ConfigError::ValidationFailed(
                "min_polygon_vertices must be at least 3".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the download pool size.
    pub fn with_download_workers(mut self, workers: usize) -> Self {
        self.download_workers = workers;
        self
    }

    /// Builder method to set the upload pool size.
    pub fn with_upload_workers(mut self, workers: usize) -> Self {
        self.upload_workers = workers;
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rules(mut self, rules: RuleConfig) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_partial_batches(mut self, allow: bool) -> Self {
        self.allow_partial_batches = allow;
        self
    }
}

/// What to migrate and how. Immutable for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Source project.
    pub project_id: ProjectId,
    /// Restricts the walk to this dataset and its nested datasets.
    pub dataset_id: Option<ContainerId>,
    pub mode: RunMode,
}

impl RunConfig {
    pub fn new(project_id: ProjectId, mode: RunMode) -> Self {
        Self {
            project_id,
            dataset_id: None,
            mode,
        }
    }

    pub fn with_dataset(mut self, dataset_id: ContainerId) -> Self {
        self.dataset_id = Some(dataset_id);
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MigrationConfig::default();
        assert_eq!(config.download_workers, 10);
        assert_eq!(config.upload_workers, 4);
        assert_eq!(config.page_size, 500);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.rules.min_polygon_vertices, 3);
        assert!(!config.rules.correct_polylines);
        assert!(!config.allow_partial_batches);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = MigrationConfig::new()
            .with_download_workers(2)
            .with_upload_workers(1)
            .with_page_size(10)
            .with_batch_size(5)
            .with_partial_batches(true)
            .with_rules(RuleConfig::default().with_polyline_correction(true));

        assert_eq!(config.download_workers, 2);
        assert_eq!(config.upload_workers, 1);
        assert_eq!(config.page_size, 10);
        assert_eq!(config.batch_size, 5);
        assert!(config.allow_partial_batches);
        assert!(config.rules.correct_polylines);
    }

    #[test]
    fn test_validation_zero_workers() {
        let result = MigrationConfig::default().with_download_workers(0).validate();
        assert!(result.unwrap_err().to_string().contains("download_workers"));

        let result = MigrationConfig::default().with_upload_workers(0).validate();
        assert!(result.unwrap_err().to_string().contains("upload_workers"));
    }

    #[test]
    fn test_validation_batch_larger_than_page() {
        let result = MigrationConfig::default()
            .with_page_size(10)
            .with_batch_size(20)
            .validate();
        assert!(result.unwrap_err().to_string().contains("batch_size"));
    }

    #[test]
    fn test_validation_polygon_threshold() {
        let config = MigrationConfig::default()
            .with_rules(RuleConfig::default().with_min_polygon_vertices(2));
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("min_polygon_vertices"));

        let config = MigrationConfig::default()
            .with_rules(RuleConfig::default().with_min_polygon_vertices(4));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("ON", "test").unwrap());
        assert!(!parse_env_bool("0", "test").unwrap());
        assert!(parse_env_bool("maybe", "test").is_err());
    }

    #[test]
    fn test_run_config() {
        let run = RunConfig::new(7, RunMode::Correct).with_dataset(9);
        assert_eq!(run.project_id, 7);
        assert_eq!(run.dataset_id, Some(9));
    }
}
