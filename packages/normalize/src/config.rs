//! Pipeline configuration.
//!
//! Defaults are embedded from `config/pipeline.toml` at compile time. A
//! different file can replace them wholesale ([`PipelineConfig::load`]), and
//! the reverse-metric allow-list can be extended from a second file
//! ([`ReverseMetrics::load`]) without touching the rest.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Pipeline defaults, embedded at compile time.
const DEFAULT_CONFIG_TOML: &str = include_str!("../config/pipeline.toml");

/// Default minimum number of valid values a metric needs to be normalized.
pub const DEFAULT_MIN_VALID_SAMPLES: u64 = 10;

/// Default minimum number of distinct leaf metrics in a metric group.
pub const DEFAULT_MIN_GROUP_SIZE: usize = 2;

/// Default number of attempts for each output write.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 5000;

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("I/O error reading {path}: {source}")]
    Io {
        /// File that failed to read.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML or has the wrong shape.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A value is out of its allowed range.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// What is wrong.
        message: String,
    },
}

/// Settings for one normalization run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Metrics with fewer valid values get no statistics.
    pub min_valid_samples: u64,
    /// Metric groups with fewer distinct leaves fold into their sub-measure.
    pub min_group_size: usize,
    /// Output write retry policy.
    pub retry: RetryPolicy,
    /// Metrics where lower raw values are better.
    pub reverse: ReverseMetrics,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_valid_samples: DEFAULT_MIN_VALID_SAMPLES,
            min_group_size: DEFAULT_MIN_GROUP_SIZE,
            retry: RetryPolicy::default(),
            reverse: ReverseMetrics::default(),
        }
    }
}

impl PipelineConfig {
    /// Returns the configuration embedded in the binary.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the embedded TOML is invalid.
    pub fn embedded() -> Result<Self, ConfigError> {
        Self::from_toml(DEFAULT_CONFIG_TOML)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, is not valid
    /// TOML, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = read_file(path)?;
        let config = Self::from_toml(&contents)?;
        log::info!(
            "Loaded pipeline config from {} ({} reverse metrics)",
            path.display(),
            config.reverse.len()
        );
        Ok(config)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the TOML is invalid or fails validation.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::de::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every threshold is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_valid_samples < 2 {
            return Err(ConfigError::Invalid {
                message: format!(
                    "min_valid_samples must be at least 2 (got {})",
                    self.min_valid_samples
                ),
            });
        }
        if self.min_group_size < 2 {
            return Err(ConfigError::Invalid {
                message: format!(
                    "min_group_size must be at least 2 (got {})",
                    self.min_group_size
                ),
            });
        }
        if self.retry.max_attempts < 1 {
            return Err(ConfigError::Invalid {
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry. Doubles for each retry after that.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, for tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << shift))
    }
}

/// The set of metric paths where a lower raw value is better.
///
/// Matching is exact and case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverseMetrics {
    /// Metric paths.
    pub metrics: BTreeSet<String>,
}

impl ReverseMetrics {
    /// Loads a `metrics = [...]` list from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = read_file(path)?;
        Ok(toml::de::from_str(&contents)?)
    }

    /// Returns `true` if the metric is reverse-scored.
    #[must_use]
    pub fn contains(&self, metric_path: &str) -> bool {
        self.metrics.contains(metric_path)
    }

    /// Adds every metric in `other`, returning how many were new.
    pub fn extend(&mut self, other: Self) -> usize {
        let before = self.metrics.len();
        self.metrics.extend(other.metrics);
        self.metrics.len() - before
    }

    /// Number of reverse metrics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Returns `true` if no metric is reverse-scored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ReverseMetrics {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            metrics: iter.into_iter().map(Into::into).collect(),
        }
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}
