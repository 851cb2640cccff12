#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Statistics, normalization, and hierarchical aggregation of county
//! sustainability metrics.
//!
//! A run takes every county's raw value for every metric and produces:
//!
//! - per-metric descriptive statistics ([`stats`]),
//! - per-county Z-scores and percentile ranks ([`normalize`],
//!   [`percentile`]),
//! - rolled-up scores at the metric group, sub-measure, and top level
//!   ([`aggregate`]),
//! - the same percentiles and scores ranked within each state ([`scope`]).
//!
//! [`pipeline::run_pipeline`] drives the stages in order and writes through
//! a [`sink::ScoreSink`].

pub mod aggregate;
pub mod config;
pub mod normalize;
pub mod percentile;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod retry;
pub mod scope;
pub mod sink;
pub mod stats;
pub mod summary;
pub mod verify;

pub use config::{ConfigError, PipelineConfig, RetryPolicy, ReverseMetrics};
pub use pipeline::{PipelineOptions, PipelineStage, RunReport, run_pipeline};

/// Errors that abort a normalization run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The configuration is invalid.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Output tables could not be recreated, so nothing can be written.
    #[error("failed to reset output tables after {attempts} attempt(s): {message}")]
    Reset {
        /// Attempts made.
        attempts: u32,
        /// Error from the last attempt.
        message: String,
    },
}
