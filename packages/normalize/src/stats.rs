//! Per-metric descriptive statistics.

use serde::{Deserialize, Serialize};
use sustainability_models::{MetricStatistics, RawObservation};

use crate::config::ReverseMetrics;

/// Why a metric was left out of normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum MetricExclusion {
    /// Too few valid values to describe a distribution.
    InsufficientSample {
        /// Valid values found.
        valid: u64,
        /// Valid values required.
        required: u64,
    },
    /// Every valid value is the same, so no Z-score can be formed.
    ZeroVariance,
}

impl std::fmt::Display for MetricExclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientSample { valid, required } => {
                write!(f, "insufficient sample ({valid} valid, {required} required)")
            }
            Self::ZeroVariance => f.write_str("zero variance"),
        }
    }
}

/// Result of summarizing one metric.
#[derive(Debug, Clone, PartialEq)]
pub enum StatisticsOutcome {
    /// Statistics exist and the metric can be normalized.
    Qualified(MetricStatistics),
    /// Statistics exist, but the metric is constant.
    ZeroVariance(MetricStatistics),
    /// Below the minimum sample; no statistics are defined.
    InsufficientSample {
        /// Valid values found.
        valid: u64,
        /// Valid values required.
        required: u64,
    },
}

impl StatisticsOutcome {
    /// The statistics record, when one is defined.
    #[must_use]
    pub const fn statistics(&self) -> Option<&MetricStatistics> {
        match self {
            Self::Qualified(s) | Self::ZeroVariance(s) => Some(s),
            Self::InsufficientSample { .. } => None,
        }
    }

    /// The reason the metric is excluded from normalization, if it is.
    #[must_use]
    pub const fn exclusion(&self) -> Option<MetricExclusion> {
        match self {
            Self::Qualified(_) => None,
            Self::ZeroVariance(_) => Some(MetricExclusion::ZeroVariance),
            Self::InsufficientSample { valid, required } => {
                Some(MetricExclusion::InsufficientSample {
                    valid: *valid,
                    required: *required,
                })
            }
        }
    }
}

/// Returns `true` if a statistics record describes a metric that can be
/// Z-scored.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn is_normalizable(stats: &MetricStatistics) -> bool {
    stats.min != stats.max && stats.std_dev > 0.0 && stats.std_dev.is_finite()
}

/// Summarizes all observations of one metric.
///
/// `observations` should hold every county's record for `metric_path`,
/// missing ones included, so the completeness ratio is meaningful.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compute_statistics(
    metric_path: &str,
    observations: &[&RawObservation],
    min_valid_samples: u64,
    reverse: &ReverseMetrics,
) -> StatisticsOutcome {
    let mut values: Vec<f64> = observations.iter().filter_map(|o| o.value()).collect();
    let valid_count = values.len() as u64;

    // The sample standard deviation needs at least two values.
    let required = min_valid_samples.max(2);
    if valid_count < required {
        return StatisticsOutcome::InsufficientSample {
            valid: valid_count,
            required,
        };
    }

    values.sort_by(f64::total_cmp);
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let total_count = observations.len() as u64;

    let stats = MetricStatistics {
        metric_path: metric_path.to_string(),
        total_count,
        valid_count,
        mean,
        std_dev: variance.sqrt(),
        min: values[0],
        max: values[values.len() - 1],
        median: median_of_sorted(&values),
        is_reverse: reverse.contains(metric_path),
        completeness_ratio: valid_count as f64 / total_count as f64,
    };

    if is_normalizable(&stats) {
        StatisticsOutcome::Qualified(stats)
    } else {
        StatisticsOutcome::ZeroVariance(stats)
    }
}

/// Exact median of an ascending, non-empty slice.
fn median_of_sorted(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        f64::midpoint(sorted[mid - 1], sorted[mid])
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observations(values: &[Option<f64>]) -> Vec<RawObservation> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| RawObservation::new(format!("{:05}", i + 1), "People_Health", *v))
            .collect()
    }

    fn run(values: &[Option<f64>], min: u64, reverse: &ReverseMetrics) -> StatisticsOutcome {
        let obs = observations(values);
        let refs: Vec<&RawObservation> = obs.iter().collect();
        compute_statistics("People_Health", &refs, min, reverse)
    }

    #[test]
    fn computes_sample_statistics() {
        let values: Vec<Option<f64>> = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]
            .into_iter()
            .map(Some)
            .chain([None, None])
            .collect();
        let StatisticsOutcome::Qualified(stats) = run(&values, 8, &ReverseMetrics::default())
        else {
            panic!("expected qualified statistics");
        };
        assert_eq!(stats.total_count, 10);
        assert_eq!(stats.valid_count, 8);
        assert_eq!(stats.missing_count(), 2);
        assert!((stats.mean - 5.0).abs() < 1e-12);
        // Sum of squares 32 over n - 1 = 7.
        assert!((stats.std_dev - (32.0_f64 / 7.0).sqrt()).abs() < 1e-12);
        assert!((stats.min - 2.0).abs() < f64::EPSILON);
        assert!((stats.max - 9.0).abs() < f64::EPSILON);
        assert!((stats.median - 4.5).abs() < f64::EPSILON);
        assert!((stats.completeness_ratio - 0.8).abs() < 1e-12);
        assert!(!stats.is_reverse);
    }

    #[test]
    fn odd_count_median_is_middle_value() {
        let values: Vec<Option<f64>> = [9.0, 1.0, 5.0].into_iter().map(Some).collect();
        let outcome = run(&values, 2, &ReverseMetrics::default());
        assert!((outcome.statistics().unwrap().median - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn below_minimum_sample_has_no_statistics() {
        let values: Vec<Option<f64>> = (0..9).map(|i| Some(f64::from(i))).collect();
        let outcome = run(&values, 10, &ReverseMetrics::default());
        assert_eq!(
            outcome.exclusion(),
            Some(MetricExclusion::InsufficientSample {
                valid: 9,
                required: 10
            })
        );
        assert!(outcome.statistics().is_none());
    }

    #[test]
    fn missing_values_do_not_count_toward_minimum() {
        let values: Vec<Option<f64>> = (0..9)
            .map(|i| Some(f64::from(i)))
            .chain(std::iter::repeat_n(None, 20))
            .collect();
        assert!(matches!(
            run(&values, 10, &ReverseMetrics::default()),
            StatisticsOutcome::InsufficientSample { valid: 9, .. }
        ));
    }

    #[test]
    fn constant_metric_is_zero_variance_not_insufficient() {
        let values = vec![Some(3.0); 12];
        let outcome = run(&values, 10, &ReverseMetrics::default());
        assert_eq!(outcome.exclusion(), Some(MetricExclusion::ZeroVariance));
        let stats = outcome.statistics().unwrap();
        assert!(stats.std_dev.abs() < f64::EPSILON);
        assert!(!is_normalizable(stats));
    }

    #[test]
    fn reverse_flag_comes_from_allow_list() {
        let reverse: ReverseMetrics = ["People_Health"].into_iter().collect();
        let values: Vec<Option<f64>> = (0..10).map(|i| Some(f64::from(i))).collect();
        assert!(run(&values, 10, &reverse).statistics().unwrap().is_reverse);
    }

    #[test]
    fn exclusion_reasons_render_distinctly() {
        assert_eq!(MetricExclusion::ZeroVariance.to_string(), "zero variance");
        assert_eq!(
            MetricExclusion::InsufficientSample {
                valid: 3,
                required: 10
            }
            .to_string(),
            "insufficient sample (3 valid, 10 required)"
        );
    }
}
