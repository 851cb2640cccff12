//! Normalization summary over produced tables.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sustainability_models::{
    AggregatedScore, MeasureLevel, MetricStatistics, NormalizedObservation,
};

/// Metrics above this completeness ratio count as high quality.
pub const HIGH_QUALITY_COMPLETENESS: f64 = 0.8;

/// Row counts for one aggregation level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelSummary {
    /// Aggregation level.
    pub level: MeasureLevel,
    /// Rows at this level.
    pub rows: usize,
    /// Distinct measure names at this level.
    pub measures: usize,
    /// Mean completeness ratio, `None` without rows.
    pub avg_completeness: Option<f64>,
}

/// Overview of one run's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationSummary {
    /// Metrics with statistics.
    pub metrics: usize,
    /// Mean completeness ratio across metrics.
    pub avg_completeness: Option<f64>,
    /// Metrics flagged reverse.
    pub reverse_metrics: usize,
    /// Metrics above [`HIGH_QUALITY_COMPLETENESS`].
    pub high_quality_metrics: usize,
    /// Normalized rows.
    pub normalized_rows: usize,
    /// Normalized rows with a value.
    pub valid_rows: usize,
    /// Normalized rows without a value.
    pub missing_rows: usize,
    /// Per-level aggregate counts.
    pub levels: Vec<LevelSummary>,
}

impl NormalizationSummary {
    /// Summarizes the three main output tables.
    #[must_use]
    pub fn from_tables(
        statistics: &[MetricStatistics],
        normalized: &[NormalizedObservation],
        aggregated: &[AggregatedScore],
    ) -> Self {
        let missing_rows = normalized.iter().filter(|r| r.is_missing).count();

        let levels = MeasureLevel::all()
            .iter()
            .map(|level| {
                let rows: Vec<&AggregatedScore> = aggregated
                    .iter()
                    .filter(|r| r.measure_level == *level)
                    .collect();
                let measures: BTreeSet<&str> =
                    rows.iter().map(|r| r.measure_name.as_str()).collect();
                LevelSummary {
                    level: *level,
                    rows: rows.len(),
                    measures: measures.len(),
                    avg_completeness: mean(rows.iter().map(|r| r.completeness_ratio)),
                }
            })
            .collect();

        Self {
            metrics: statistics.len(),
            avg_completeness: mean(statistics.iter().map(|s| s.completeness_ratio)),
            reverse_metrics: statistics.iter().filter(|s| s.is_reverse).count(),
            high_quality_metrics: statistics
                .iter()
                .filter(|s| s.completeness_ratio > HIGH_QUALITY_COMPLETENESS)
                .count(),
            normalized_rows: normalized.len(),
            valid_rows: normalized.len() - missing_rows,
            missing_rows,
            levels,
        }
    }

    /// Logs the summary at `info`.
    pub fn log(&self) {
        log::info!(
            "{} metrics ({} reverse, {} above {:.0}% complete), average completeness {}",
            self.metrics,
            self.reverse_metrics,
            self.high_quality_metrics,
            HIGH_QUALITY_COMPLETENESS * 100.0,
            percent(self.avg_completeness),
        );
        log::info!(
            "{} normalized rows: {} valid, {} missing",
            self.normalized_rows,
            self.valid_rows,
            self.missing_rows
        );
        for level in &self.levels {
            log::info!(
                "  {}: {} rows across {} measures, average completeness {}",
                level.level,
                level.rows,
                level.measures,
                percent(level.avg_completeness),
            );
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn percent(ratio: Option<f64>) -> String {
    ratio.map_or_else(|| "n/a".to_string(), |r| format!("{:.1}%", r * 100.0))
}
