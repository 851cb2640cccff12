//! Z-score and percentile normalization of one metric.

use sustainability_models::{MetricStatistics, NormalizedObservation, RawObservation};

use crate::percentile::PercentileRanker;

/// Normalizes every observation of one metric.
///
/// Produces one record per input observation, in input order. Missing
/// observations keep their record with no Z-score or percentile so they
/// still count toward completeness downstream. Percentiles are ranked
/// against the valid values in `observations` and inverted for reverse
/// metrics.
///
/// `stats` is expected to describe a normalizable metric; if its standard
/// deviation is not positive, no Z-scores are produced.
#[must_use]
pub fn normalize_metric(
    stats: &MetricStatistics,
    observations: &[&RawObservation],
) -> Vec<NormalizedObservation> {
    let ranker = PercentileRanker::new(observations.iter().filter_map(|o| o.value()));
    let z_scale = (stats.std_dev > 0.0).then_some(stats.std_dev);

    observations
        .iter()
        .map(|obs| {
            let value = obs.value();
            NormalizedObservation {
                county_id: obs.county_id.clone(),
                metric_path: stats.metric_path.clone(),
                raw_value: obs.raw_value,
                z_score: value.zip(z_scale).map(|(v, sd)| (v - stats.mean) / sd),
                percentile_rank: value.and_then(|v| ranker.rank_directed(v, stats.is_reverse)),
                is_missing: value.is_none(),
            }
        })
        .collect()
}
