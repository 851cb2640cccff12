//! State-scoped percentiles and aggregation.
//!
//! Mirrors the national pipeline with each county compared only against
//! counties in its own state. Z-scores stay national; only percentile
//! ranks are re-scoped, using the same ranking rule as the national
//! [`normalize_metric`](crate::normalize::normalize_metric). No minimum
//! sample applies inside a state: every nationally qualified metric is
//! ranked in every state where it has a valid value.
//!
//! The same functions serve both the precomputed tables written by a full
//! run (all states at once) and the on-demand fallback for a single state,
//! so the two paths cannot drift apart.

use std::collections::{BTreeMap, BTreeSet};

use sustainability_ingest::hierarchy::parse_metric_path;
use sustainability_models::county::state_code;
use sustainability_models::{
    County, MetricIdentity, MetricStatistics, RawObservation, StateAggregatedScore,
    StatePercentile,
};

use crate::aggregate::{LeafScore, aggregate};
use crate::percentile::PercentileRanker;

/// County to state code lookup.
#[derive(Debug, Clone, Default)]
pub struct StateIndex {
    by_county: BTreeMap<String, String>,
}

impl StateIndex {
    /// Builds the index from county identities.
    #[must_use]
    pub fn new(counties: &[County]) -> Self {
        Self {
            by_county: counties
                .iter()
                .map(|c| (c.county_id.clone(), c.state_code.clone()))
                .collect(),
        }
    }

    /// Distinct state codes of the indexed counties, in order.
    #[must_use]
    pub fn state_codes(&self) -> Vec<String> {
        let codes: BTreeSet<&str> = self.by_county.values().map(String::as_str).collect();
        codes.into_iter().map(str::to_string).collect()
    }

    /// State code of a county, falling back to its FIPS prefix when the
    /// county is not in the index.
    #[must_use]
    pub fn state_of<'a>(&'a self, county_id: &'a str) -> &'a str {
        self.by_county
            .get(county_id)
            .map_or_else(|| state_code(county_id), String::as_str)
    }
}

/// State-scoped rows for one or more states.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateScopeOutput {
    /// One row per (county, qualified metric).
    pub percentiles: Vec<StatePercentile>,
    /// Aggregated rows at every level, per state.
    pub scores: Vec<StateAggregatedScore>,
}

/// Ranks one metric's observations within each state.
///
/// Rows come out grouped by state code, in input order within a state.
#[must_use]
pub fn state_percentiles(
    stats: &MetricStatistics,
    observations: &[&RawObservation],
    states: &StateIndex,
) -> Vec<StatePercentile> {
    let mut by_state: BTreeMap<&str, Vec<&RawObservation>> = BTreeMap::new();
    for obs in observations {
        by_state
            .entry(states.state_of(&obs.county_id))
            .or_default()
            .push(obs);
    }

    let z_scale = (stats.std_dev > 0.0).then_some(stats.std_dev);
    let mut rows = Vec::with_capacity(observations.len());

    for (state, members) in by_state {
        let ranker = PercentileRanker::new(members.iter().filter_map(|o| o.value()));
        for obs in members {
            let value = obs.value();
            rows.push(StatePercentile {
                county_id: obs.county_id.clone(),
                state_code: state.to_string(),
                metric_path: stats.metric_path.clone(),
                raw_value: obs.raw_value,
                z_score: value.zip(z_scale).map(|(v, sd)| (v - stats.mean) / sd),
                state_percentile: value
                    .and_then(|v| ranker.rank_directed(v, stats.is_reverse)),
                is_missing: value.is_none(),
            });
        }
    }

    rows
}

/// Rolls state percentiles up through the hierarchy, separately per state.
///
/// Rows whose metric has no entry in `identities` are ignored.
#[must_use]
pub fn aggregate_state_scores(
    percentiles: &[StatePercentile],
    identities: &BTreeMap<String, MetricIdentity>,
    min_group_size: usize,
) -> Vec<StateAggregatedScore> {
    let mut by_state: BTreeMap<&str, Vec<LeafScore<'_>>> = BTreeMap::new();
    for row in percentiles {
        if let Some(identity) = identities.get(&row.metric_path) {
            by_state
                .entry(row.state_code.as_str())
                .or_default()
                .push(LeafScore::state(row, identity));
        }
    }

    by_state
        .into_iter()
        .flat_map(|(state, leaves)| {
            aggregate(&leaves, min_group_size)
                .into_rows()
                .into_iter()
                .map(move |score| StateAggregatedScore {
                    state_code: state.to_string(),
                    score,
                })
        })
        .collect()
}

/// Parses the identity of every metric in `statistics`, skipping paths
/// that do not parse.
#[must_use]
pub fn identities_for(statistics: &[MetricStatistics]) -> BTreeMap<String, MetricIdentity> {
    statistics
        .iter()
        .filter_map(|s| parse_metric_path(&s.metric_path).ok())
        .map(|id| (id.metric_path.clone(), id))
        .collect()
}

/// Computes state-scoped percentiles and scores from raw observations.
///
/// `qualified` must hold only normalizable metrics. With `only_state`
/// set, observations outside that state are ignored, which yields exactly
/// the rows a full computation would produce for that state.
#[must_use]
pub fn compute_state_scope(
    qualified: &[MetricStatistics],
    observations: &[RawObservation],
    counties: &[County],
    only_state: Option<&str>,
    min_group_size: usize,
) -> StateScopeOutput {
    let states = StateIndex::new(counties);
    let identities = identities_for(qualified);

    let mut by_metric: BTreeMap<&str, Vec<&RawObservation>> = BTreeMap::new();
    for obs in observations {
        if only_state.is_some_and(|s| states.state_of(&obs.county_id) != s) {
            continue;
        }
        by_metric.entry(obs.metric_path.as_str()).or_default().push(obs);
    }

    let mut percentiles = Vec::new();
    for stats in qualified {
        if !identities.contains_key(&stats.metric_path) {
            continue;
        }
        if let Some(rows) = by_metric.get(stats.metric_path.as_str()) {
            percentiles.extend(state_percentiles(stats, rows, &states));
        }
    }

    let scores = aggregate_state_scores(&percentiles, &identities, min_group_size);

    log::debug!(
        "State scope{}: {} percentile rows, {} score rows",
        only_state.map(|s| format!(" for {s}")).unwrap_or_default(),
        percentiles.len(),
        scores.len()
    );

    StateScopeOutput {
        percentiles,
        scores,
    }
}
