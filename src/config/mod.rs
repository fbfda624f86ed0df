//! Configuration module for Mizuchi Spool
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation. Validation is where the
//! rotation thresholds and pool bounds are checked, so a bad value fails at
//! startup rather than in the middle of a write.

use crate::rotation::RotationPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Largest part the multipart uploader will send, and the default boundary
/// above which a file is uploaded in parts.
pub const MAX_PART_SIZE: u64 = 50 * 1024 * 1024;

/// Length in bytes of an SSE-C customer key (AES-256).
pub const CUSTOMER_KEY_LEN: usize = 32;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}").unwrap();
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let full_match = cap.get(0).unwrap();
        let var_name = cap.get(1).unwrap().as_str();

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub s3: S3Config,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "s3.bucket cannot be empty".into(),
            ));
        }

        if self.s3.region.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "s3.region cannot be empty".into(),
            ));
        }

        if let Some(ref endpoint) = self.s3.endpoint {
            if !is_valid_http_url(endpoint) {
                return Err(ConfigError::ValidationError(
                    "Invalid s3.endpoint: must start with http:// or https://".into(),
                ));
            }
        }

        if self.s3.access_key.is_some() != self.s3.secret_key.is_some() {
            return Err(ConfigError::ValidationError(
                "s3.access_key and s3.secret_key must be set together".into(),
            ));
        }

        // Surfaces non-positive thresholds as a configuration error.
        RotationPolicy::from_config(&self.rotation)?;

        validate_pool("upload", self.upload.workers, self.upload.queue_size)?;
        validate_pool("recovery", self.recovery.workers, self.recovery.queue_size)?;

        if self.upload.multipart_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "upload.multipart_threshold must be positive".into(),
            ));
        }

        match self.upload.server_side_encryption_algorithm.as_deref() {
            None => {}
            Some("AES256") => match self.upload.customer_key {
                Some(ref key) if key.len() == CUSTOMER_KEY_LEN => {}
                Some(ref key) => {
                    return Err(ConfigError::ValidationError(format!(
                        "upload.customer_key must be {} bytes, got {}",
                        CUSTOMER_KEY_LEN,
                        key.len()
                    )))
                }
                None => {
                    return Err(ConfigError::ValidationError(
                        "upload.customer_key is required when server side encryption is enabled"
                            .into(),
                    ))
                }
            },
            Some(other) => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid server_side_encryption_algorithm '{}': must be 'AES256'",
                    other
                )))
            }
        }

        Ok(())
    }
}

fn validate_pool(section: &str, workers: usize, queue_size: usize) -> Result<(), ConfigError> {
    if workers > 0 && queue_size == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{}.queue_size must be at least 1 when {}.workers is non-zero",
            section, section
        )));
    }
    Ok(())
}

/// S3 backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
}

/// Content encoding of buffer files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    None,
    Gzip,
}

impl Encoding {
    /// Value for the `Content-Encoding` header, if any
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Encoding::None => None,
            Encoding::Gzip => Some("gzip"),
        }
    }
}

/// Local buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Directory holding buffer files until they are uploaded
    #[serde(default = "default_tmpdir")]
    pub tmpdir: PathBuf,
    /// Tags embedded in every generated file name
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub encoding: Encoding,
    /// Partition key used by the stdin reader when records are not keyed
    #[serde(default)]
    pub prefix: String,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            tmpdir: default_tmpdir(),
            tags: Vec::new(),
            encoding: Encoding::default(),
            prefix: String::new(),
        }
    }
}

fn default_tmpdir() -> PathBuf {
    std::env::temp_dir().join("mizuchi-spool")
}

/// Rotation strategy selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    Size,
    Time,
    #[default]
    SizeAndTime,
}

/// Rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default)]
    pub strategy: RotationStrategy,
    /// Size threshold in bytes
    #[serde(default = "default_size_file")]
    pub size_file: u64,
    /// Age threshold in seconds
    #[serde(default = "default_time_file")]
    pub time_file: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::default(),
            size_file: default_size_file(),
            time_file: default_time_file(),
        }
    }
}

fn default_size_file() -> u64 {
    5 * 1024 * 1024 // 5MB
}

fn default_time_file() -> u64 {
    15 * 60
}

/// Upload pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Number of upload workers. Zero runs every upload on the submitting task.
    #[serde(default = "default_upload_workers")]
    pub workers: usize,
    /// Uploads that may wait for a worker before submitters run them inline
    #[serde(default = "default_upload_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,
    #[serde(default)]
    pub server_side_encryption_algorithm: Option<String>,
    /// Raw 32-byte SSE-C key
    #[serde(default)]
    pub customer_key: Option<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: default_upload_workers(),
            queue_size: default_upload_queue_size(),
            multipart_threshold: default_multipart_threshold(),
            server_side_encryption_algorithm: None,
            customer_key: None,
        }
    }
}

fn processor_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_upload_workers() -> usize {
    processor_count().div_ceil(2)
}

fn default_upload_queue_size() -> usize {
    2 * processor_count().div_ceil(4)
}

fn default_multipart_threshold() -> u64 {
    MAX_PART_SIZE
}

/// Crash recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Re-upload files left in `buffer.tmpdir` by a previous run
    #[serde(default = "default_restore")]
    pub restore: bool,
    #[serde(default = "default_recovery_workers")]
    pub workers: usize,
    #[serde(default = "default_recovery_queue_size")]
    pub queue_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            restore: default_restore(),
            workers: default_recovery_workers(),
            queue_size: default_recovery_queue_size(),
        }
    }
}

fn default_restore() -> bool {
    true
}

fn default_recovery_workers() -> usize {
    2
}

fn default_recovery_queue_size() -> usize {
    1
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            s3: S3Config {
                bucket: "logs".into(),
                region: "us-east-1".into(),
                endpoint: None,
                access_key: None,
                secret_key: None,
            },
            buffer: BufferConfig::default(),
            rotation: RotationConfig::default(),
            upload: UploadConfig::default(),
            recovery: RecoveryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_default_rotation() {
        let rotation = RotationConfig::default();
        assert_eq!(rotation.strategy, RotationStrategy::SizeAndTime);
        assert_eq!(rotation.size_file, 5 * 1024 * 1024);
        assert_eq!(rotation.time_file, 900);
    }

    #[test]
    fn test_recovery_enabled_by_default() {
        assert!(RecoveryConfig::default().restore);

        let parsed: RecoveryConfig = serde_yaml::from_str("workers: 1").unwrap();
        assert!(parsed.restore);
    }

    #[test]
    fn test_zero_size_threshold_rejected() {
        let mut config = test_config();
        config.rotation.size_file = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_zero_queue_with_workers_rejected() {
        let mut config = test_config();
        config.upload.workers = 2;
        config.upload.queue_size = 0;
        assert!(config.validate().is_err());

        config.upload.workers = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_encryption_requires_key() {
        let mut config = test_config();
        config.upload.server_side_encryption_algorithm = Some("AES256".into());
        assert!(config.validate().is_err());

        config.upload.customer_key = Some("short".into());
        assert!(config.validate().is_err());

        config.upload.customer_key = Some("k".repeat(CUSTOMER_KEY_LEN));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_encryption_algorithm_rejected() {
        let mut config = test_config();
        config.upload.server_side_encryption_algorithm = Some("DES".into());
        config.upload.customer_key = Some("k".repeat(CUSTOMER_KEY_LEN));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let mut config = test_config();
        config.s3.endpoint = Some("localhost:9000".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_default_value() {
        assert_eq!(
            expand_env_vars("${MIZUCHI_SPOOL_SURELY_UNSET:-fallback}/x"),
            "fallback/x"
        );
        assert_eq!(
            expand_env_vars("${MIZUCHI_SPOOL_SURELY_UNSET}"),
            "${MIZUCHI_SPOOL_SURELY_UNSET}"
        );
    }
}
