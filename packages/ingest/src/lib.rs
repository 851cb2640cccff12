#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Metric path parsing, cell cleaning, and wide CSV loading.
//!
//! The source data arrives as one wide spreadsheet: a row per county and a
//! column per metric, with three header rows (metric path, unit, year).
//! This crate turns it into flat [`RawObservation`] records plus a
//! [`DataQualitySummary`] describing what was lost along the way.
//!
//! [`RawObservation`]: sustainability_models::RawObservation

pub mod clean;
pub mod display_names;
pub mod hierarchy;
pub mod wide_csv;

use serde::{Deserialize, Serialize};

use crate::clean::{CleanedValue, MissingReason};

/// Errors that can occur while loading source files.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// CSV parsing failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// I/O error (file read).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file ended before all header rows were read.
    #[error("expected {expected} header rows, found {found}")]
    MissingHeaderRows {
        /// Header rows the layout requires.
        expected: usize,
        /// Header rows present.
        found: usize,
    },
}

/// Counts describing how clean a loaded data set was.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQualitySummary {
    /// Metric cells examined.
    pub total_cells: u64,
    /// Cells that produced a number.
    pub valid_cells: u64,
    /// Cells that were empty.
    pub blank_cells: u64,
    /// Cells holding an explicit "no data" marker.
    pub sentinel_cells: u64,
    /// Cells holding text that could not be parsed as a number.
    pub unparseable_cells: u64,
    /// Metric columns skipped because their path could not be parsed.
    pub malformed_columns: Vec<String>,
    /// Metric columns skipped because an earlier column had the same name.
    #[serde(default)]
    pub duplicate_columns: Vec<String>,
    /// Data rows skipped for a missing or duplicate county code.
    pub skipped_rows: u64,
}

impl DataQualitySummary {
    /// Tallies one cleaned cell.
    pub fn record(&mut self, cell: CleanedValue) {
        self.total_cells += 1;
        match cell {
            CleanedValue::Value(_) => self.valid_cells += 1,
            CleanedValue::Missing(MissingReason::Blank) => self.blank_cells += 1,
            CleanedValue::Missing(MissingReason::Sentinel) => self.sentinel_cells += 1,
            CleanedValue::Missing(MissingReason::Unparseable) => self.unparseable_cells += 1,
        }
    }

    /// Cells with no value for any reason.
    #[must_use]
    pub const fn missing_cells(&self) -> u64 {
        self.blank_cells + self.sentinel_cells + self.unparseable_cells
    }

    /// Fraction of cells that produced a number, `0.0` when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn valid_ratio(&self) -> f64 {
        if self.total_cells == 0 {
            0.0
        } else {
            self.valid_cells as f64 / self.total_cells as f64
        }
    }

    /// Logs the summary at `info`, escalating corrupted cells to `warn`.
    pub fn log(&self) {
        log::info!(
            "Data quality: {} cells, {} valid ({:.1}%), {} blank, {} marked missing",
            self.total_cells,
            self.valid_cells,
            self.valid_ratio() * 100.0,
            self.blank_cells,
            self.sentinel_cells,
        );
        if self.unparseable_cells > 0 {
            log::warn!(
                "{} cell(s) held unparseable text and were treated as missing",
                self.unparseable_cells
            );
        }
        if !self.malformed_columns.is_empty() {
            log::warn!(
                "{} malformed metric column(s) skipped: {}",
                self.malformed_columns.len(),
                self.malformed_columns.join(", ")
            );
        }
        if !self.duplicate_columns.is_empty() {
            log::warn!(
                "{} duplicate metric column(s) skipped: {}",
                self.duplicate_columns.len(),
                self.duplicate_columns.join(", ")
            );
        }
        if self.skipped_rows > 0 {
            log::warn!("{} data row(s) skipped", self.skipped_rows);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::clean_value;

    #[test]
    fn record_separates_missing_reasons() {
        let mut summary = DataQualitySummary::default();
        for cell in ["1", "$2", "", "N/A", "garbage", "garbage too"] {
            summary.record(clean_value(Some(cell)));
        }
        assert_eq!(summary.total_cells, 6);
        assert_eq!(summary.valid_cells, 2);
        assert_eq!(summary.blank_cells, 1);
        assert_eq!(summary.sentinel_cells, 1);
        assert_eq!(summary.unparseable_cells, 2);
        assert_eq!(summary.missing_cells(), 4);
    }

    #[test]
    fn valid_ratio_of_empty_summary_is_zero() {
        assert!(DataQualitySummary::default().valid_ratio().abs() < f64::EPSILON);
    }
}
