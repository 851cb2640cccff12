//! Post-run sanity checks over produced tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sustainability_models::{AggregatedScore, MetricStatistics, NormalizedObservation};

/// Metrics need more valid rows than this for the Z-score check.
pub const ZSCORE_CHECK_MIN_ROWS: usize = 20;

/// Allowed drift of the Z-score mean from 0 and standard deviation from 1.
pub const ZSCORE_TOLERANCE: f64 = 1e-6;

/// Z-score distribution of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZScoreCheck {
    /// Metric identifier.
    pub metric_path: String,
    /// Rows with a Z-score.
    pub valid_rows: usize,
    /// Mean Z-score.
    pub mean: f64,
    /// Sample standard deviation of Z-scores.
    pub std_dev: f64,
}

impl ZScoreCheck {
    /// Returns `true` if the distribution is centered with unit spread.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.mean.abs() < ZSCORE_TOLERANCE && (self.std_dev - 1.0).abs() < ZSCORE_TOLERANCE
    }
}

/// Results of every check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    /// One entry per metric large enough to check.
    pub zscore_checks: Vec<ZScoreCheck>,
    /// Normalized rows inspected.
    pub percentile_rows_checked: u64,
    /// Rows whose percentile is out of range or disagrees with `is_missing`.
    pub percentile_violations: Vec<String>,
    /// Metrics whose percentiles move against their direction.
    pub monotonicity_violations: Vec<String>,
    /// Aggregated rows with a completeness ratio outside `[0, 1]`.
    pub completeness_violations: Vec<String>,
}

impl VerificationReport {
    /// Returns `true` if every check passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.zscore_checks.iter().all(ZScoreCheck::passed)
            && self.percentile_violations.is_empty()
            && self.monotonicity_violations.is_empty()
            && self.completeness_violations.is_empty()
    }

    /// Logs each failed check.
    pub fn log(&self) {
        for check in self.zscore_checks.iter().filter(|c| !c.passed()) {
            log::warn!(
                "Z-scores of {} are off: mean {:.6}, std {:.6} over {} rows",
                check.metric_path,
                check.mean,
                check.std_dev,
                check.valid_rows
            );
        }
        for v in &self.percentile_violations {
            log::warn!("Percentile violation: {v}");
        }
        for metric in &self.monotonicity_violations {
            log::warn!("Percentile direction violated for {metric}");
        }
        for v in &self.completeness_violations {
            log::warn!("Completeness violation: {v}");
        }
        if self.passed() {
            log::info!(
                "Verification passed: {} Z-score checks, {} percentile rows",
                self.zscore_checks.len(),
                self.percentile_rows_checked
            );
        }
    }
}

/// Checks normalized and aggregated output for internal consistency.
#[must_use]
pub fn verify(
    statistics: &[MetricStatistics],
    normalized: &[NormalizedObservation],
    aggregated: &[AggregatedScore],
) -> VerificationReport {
    let reverse: BTreeMap<&str, bool> = statistics
        .iter()
        .map(|s| (s.metric_path.as_str(), s.is_reverse))
        .collect();

    let mut by_metric: BTreeMap<&str, Vec<&NormalizedObservation>> = BTreeMap::new();
    for row in normalized {
        by_metric.entry(row.metric_path.as_str()).or_default().push(row);
    }

    let mut report = VerificationReport::default();

    for (metric, rows) in &by_metric {
        if let Some(check) = zscore_check(metric, rows) {
            report.zscore_checks.push(check);
        }

        for row in rows {
            report.percentile_rows_checked += 1;
            let consistent = match row.percentile_rank {
                Some(p) => !row.is_missing && (0.0..=100.0).contains(&p),
                None => row.is_missing,
            };
            if !consistent {
                report.percentile_violations.push(format!(
                    "{metric} county {}: percentile {:?}, missing {}",
                    row.county_id, row.percentile_rank, row.is_missing
                ));
            }
        }

        let is_reverse = reverse.get(metric).copied().unwrap_or(false);
        if !is_monotonic(rows, is_reverse) {
            report.monotonicity_violations.push((*metric).to_string());
        }
    }

    for row in aggregated {
        if !(0.0..=1.0).contains(&row.completeness_ratio) {
            report.completeness_violations.push(format!(
                "{} county {}: {}",
                row.measure_name, row.county_id, row.completeness_ratio
            ));
        }
    }

    report
}

#[allow(clippy::cast_precision_loss)]
fn zscore_check(metric: &str, rows: &[&NormalizedObservation]) -> Option<ZScoreCheck> {
    let z: Vec<f64> = rows.iter().filter_map(|r| r.z_score).collect();
    if z.len() <= ZSCORE_CHECK_MIN_ROWS {
        return None;
    }
    let n = z.len() as f64;
    let mean = z.iter().sum::<f64>() / n;
    let var = z.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(ZScoreCheck {
        metric_path: metric.to_string(),
        valid_rows: z.len(),
        mean,
        std_dev: var.sqrt(),
    })
}

/// Percentiles must not fall as raw values rise (rise, for reverse metrics).
fn is_monotonic(rows: &[&NormalizedObservation], reverse: bool) -> bool {
    let mut pairs: Vec<(f64, f64)> = rows
        .iter()
        .filter_map(|r| r.raw_value.zip(r.percentile_rank))
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    pairs.windows(2).all(|w| {
        let ((raw_a, pa), (raw_b, pb)) = (w[0], w[1]);
        if raw_a >= raw_b {
            return true;
        }
        if reverse { pa >= pb } else { pa <= pb }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReverseMetrics;
    use crate::normalize::normalize_metric;
    use crate::stats::compute_statistics;
    use sustainability_models::{MeasureLevel, RawObservation};

    fn normalized_rows(reverse: bool) -> (MetricStatistics, Vec<NormalizedObservation>) {
        let obs: Vec<RawObservation> = (0..30)
            .map(|i| {
                let x = f64::from(i);
                let value = (i % 7 != 0).then_some((x * 1.7).cos() * 40.0 + x);
                RawObservation::new(format!("{:05}", i + 1), "Place_Water", value)
            })
            .collect();
        let refs: Vec<&RawObservation> = obs.iter().collect();
        let list: ReverseMetrics = if reverse {
            ["Place_Water"].into_iter().collect()
        } else {
            ReverseMetrics::default()
        };
        let stats = compute_statistics("Place_Water", &refs, 10, &list)
            .statistics()
            .cloned()
            .unwrap();
        let rows = normalize_metric(&stats, &refs);
        (stats, rows)
    }

    #[test]
    fn pipeline_output_passes() {
        for reverse in [false, true] {
            let (stats, rows) = normalized_rows(reverse);
            let report = verify(&[stats], &rows, &[]);
            assert_eq!(report.zscore_checks.len(), 1);
            assert!(report.passed(), "{report:?}");
            assert_eq!(report.percentile_rows_checked, 30);
        }
    }

    #[test]
    fn detects_wrong_direction() {
        let (mut stats, rows) = normalized_rows(false);
        stats.is_reverse = true;
        let report = verify(&[stats], &rows, &[]);
        assert_eq!(report.monotonicity_violations, ["Place_Water"]);
    }

    #[test]
    fn detects_percentile_on_missing_row() {
        let (stats, mut rows) = normalized_rows(false);
        let missing = rows.iter_mut().find(|r| r.is_missing).unwrap();
        missing.percentile_rank = Some(10.0);
        assert_eq!(verify(&[stats], &rows, &[]).percentile_violations.len(), 1);
    }

    #[test]
    fn detects_bad_completeness() {
        let row = AggregatedScore {
            county_id: "01001".to_string(),
            measure_name: "People".to_string(),
            measure_level: MeasureLevel::TopLevel,
            parent_measure: None,
            normalized_score: 0.0,
            percentile_rank: 50.0,
            component_count: 1,
            missing_components: 0,
            completeness_ratio: 1.5,
        };
        let report = verify(&[], &[], &[row]);
        assert_eq!(report.completeness_violations.len(), 1);
        assert!(!report.passed());
    }

    #[test]
    fn small_metrics_skip_zscore_check() {
        let rows: Vec<NormalizedObservation> = (0..20)
            .map(|i| NormalizedObservation {
                county_id: format!("{i:05}"),
                metric_path: "Place_Land".to_string(),
                raw_value: Some(f64::from(i)),
                z_score: Some(5.0),
                percentile_rank: Some(f64::from(i) * 5.0),
                is_missing: false,
            })
            .collect();
        let report = verify(&[], &rows, &[]);
        assert!(report.zscore_checks.is_empty());
        assert!(report.passed());
    }
}
