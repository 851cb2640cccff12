#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `DuckDB` warehouse for county sustainability data.
//!
//! A single `DuckDB` file holds the loaded counties and raw observations,
//! every pipeline output table, and a `_meta` table recording the last
//! load and run. [`sink::DuckDbSink`] lets the normalization pipeline
//! write straight into it, and [`views`] serves per-county score views
//! back out.

pub mod paths;
pub mod sink;
pub mod views;
pub mod warehouse;

/// Errors that can occur during warehouse operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored JSON value could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },

    /// A requested county is not in the warehouse.
    #[error("County not found: {county_id}")]
    CountyNotFound {
        /// The five-digit FIPS code that was looked up.
        county_id: String,
    },

    /// A requested sub-measure has no scores in the warehouse.
    #[error("Sub-measure not found: {name}")]
    SubMeasureNotFound {
        /// The name that was looked up.
        name: String,
    },
}
