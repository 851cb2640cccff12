//! Hierarchical aggregation of normalized metrics.
//!
//! Scores roll up in three passes, each reading only the rows produced by
//! the pass before it plus the leaf scores:
//!
//! 1. **Metric group**: nested leaves sharing a metric group are averaged,
//!    provided the group has at least `min_group_size` distinct metrics.
//! 2. **Sub-measure**: leaves outside a qualifying group and the group rows
//!    from pass 1 are merged by [`weighted_merge_by_component_count`], so a
//!    group of five metrics outweighs a single leaf five to one.
//! 3. **Top level**: sub-measure rows are merged by [`equal_weight_merge`],
//!    giving each sub-measure the same say in its dimension no matter how
//!    many metrics back it.
//!
//! Missing components count toward `component_count` and
//! `missing_components` but never toward a score. When a county has no
//! valid component for a measure, no row is produced for it.

use std::collections::{BTreeMap, BTreeSet};

use sustainability_models::{
    AggregatedScore, Dimension, MeasureLevel, MetricIdentity, NormalizedObservation,
    StatePercentile,
};

/// One county's normalized result for one leaf metric, as the aggregator
/// sees it.
///
/// National and state-scoped runs both feed the aggregator through this
/// type; they differ only in where `percentile_rank` comes from.
#[derive(Debug, Clone, Copy)]
pub struct LeafScore<'a> {
    /// Five-digit county FIPS code.
    pub county_id: &'a str,
    /// Hierarchy position of the metric.
    pub identity: &'a MetricIdentity,
    /// Z-score, `None` when missing.
    pub z_score: Option<f64>,
    /// Percentile rank, `None` when missing.
    pub percentile_rank: Option<f64>,
}

impl<'a> LeafScore<'a> {
    /// Builds a leaf from a national normalized observation.
    #[must_use]
    pub fn national(row: &'a NormalizedObservation, identity: &'a MetricIdentity) -> Self {
        Self {
            county_id: row.county_id.as_str(),
            identity,
            z_score: row.z_score,
            percentile_rank: row.percentile_rank,
        }
    }

    /// Builds a leaf from a state-scoped percentile row.
    #[must_use]
    pub fn state(row: &'a StatePercentile, identity: &'a MetricIdentity) -> Self {
        Self {
            county_id: row.county_id.as_str(),
            identity,
            z_score: row.z_score,
            percentile_rank: row.state_percentile,
        }
    }

    /// The score pair, when both values are present.
    #[must_use]
    pub fn scores(&self) -> Option<ScorePair> {
        self.z_score
            .zip(self.percentile_rank)
            .map(|(normalized, percentile)| ScorePair {
                normalized,
                percentile,
            })
    }
}

/// A normalized score and percentile rank carried together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScorePair {
    /// Z-score or mean of Z-scores.
    pub normalized: f64,
    /// Percentile rank or mean of percentile ranks.
    pub percentile: f64,
}

/// Rows produced by all three passes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationOutput {
    /// Pass 1 rows.
    pub metric_groups: Vec<AggregatedScore>,
    /// Pass 2 rows.
    pub sub_measures: Vec<AggregatedScore>,
    /// Pass 3 rows.
    pub top_levels: Vec<AggregatedScore>,
}

impl AggregationOutput {
    /// Total number of rows across all levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metric_groups.len() + self.sub_measures.len() + self.top_levels.len()
    }

    /// Returns `true` if no level produced a row.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The rows of one level.
    #[must_use]
    pub fn level(&self, level: MeasureLevel) -> &[AggregatedScore] {
        match level {
            MeasureLevel::MetricGroup => &self.metric_groups,
            MeasureLevel::SubMeasure => &self.sub_measures,
            MeasureLevel::TopLevel => &self.top_levels,
        }
    }

    /// Consumes the output, yielding all rows in level order.
    #[must_use]
    pub fn into_rows(self) -> Vec<AggregatedScore> {
        let mut rows = self.metric_groups;
        rows.extend(self.sub_measures);
        rows.extend(self.top_levels);
        rows
    }
}

/// Runs all three passes in order.
#[must_use]
pub fn aggregate(leaves: &[LeafScore<'_>], min_group_size: usize) -> AggregationOutput {
    let metric_groups = aggregate_metric_groups(leaves, min_group_size);
    let sub_measures = aggregate_sub_measures(leaves, &metric_groups, min_group_size);
    let top_levels = aggregate_top_levels(leaves, &sub_measures);

    log::debug!(
        "Aggregated {} metric group, {} sub-measure, {} top-level rows",
        metric_groups.len(),
        sub_measures.len(),
        top_levels.len()
    );

    AggregationOutput {
        metric_groups,
        sub_measures,
        top_levels,
    }
}

/// `(county, top_level, sub_measure, metric_group)`.
type GroupKey<'a> = (&'a str, &'a str, &'a str, &'a str);

/// Leaves of every metric group that is large enough to stand on its own.
///
/// Only nested metrics are considered, and a group qualifies per county
/// once it holds `min_group_size` distinct metric paths. A metric path
/// repeated for the same county is kept once, first occurrence wins.
fn qualifying_groups<'l, 'a>(
    leaves: &'l [LeafScore<'a>],
    min_group_size: usize,
) -> BTreeMap<GroupKey<'a>, Vec<&'l LeafScore<'a>>> {
    let mut groups: BTreeMap<GroupKey<'a>, Vec<&'l LeafScore<'a>>> = BTreeMap::new();
    for leaf in leaves.iter().filter(|l| l.identity.is_nested()) {
        let id = leaf.identity;
        let members = groups
            .entry((
                leaf.county_id,
                id.top_level.as_str(),
                id.sub_measure.as_str(),
                id.metric_group.as_str(),
            ))
            .or_default();
        if members
            .iter()
            .all(|m| m.identity.metric_path != id.metric_path)
        {
            members.push(leaf);
        }
    }
    groups.retain(|_, members| members.len() >= min_group_size);
    groups
}

/// Pass 1: one row per (county, metric group) with a valid leaf.
#[must_use]
pub fn aggregate_metric_groups(
    leaves: &[LeafScore<'_>],
    min_group_size: usize,
) -> Vec<AggregatedScore> {
    qualifying_groups(leaves, min_group_size)
        .into_iter()
        .filter_map(|((county_id, _, _, _), members)| {
            let valid: Vec<ScorePair> = members.iter().filter_map(|l| l.scores()).collect();
            let merged = mean_of(&valid)?;
            let identity = members[0].identity;
            Some(score_row(
                county_id,
                identity.metric_group_name(),
                MeasureLevel::MetricGroup,
                Some(identity.sub_measure_name()),
                merged,
                count(members.len()),
                count(members.len() - valid.len()),
            ))
        })
        .collect()
}

/// Everything merged into one (county, sub-measure) row.
#[derive(Default)]
struct SubMeasureInputs<'r> {
    sub_measure_name: String,
    direct: Vec<Option<ScorePair>>,
    groups: Vec<&'r AggregatedScore>,
    /// Leaves of qualifying groups that produced no row.
    absent_group_leaves: u32,
}

/// Pass 2: one row per (county, sub-measure) with a valid component.
///
/// `metric_groups` must be the pass 1 output for the same `leaves`.
#[must_use]
pub fn aggregate_sub_measures(
    leaves: &[LeafScore<'_>],
    metric_groups: &[AggregatedScore],
    min_group_size: usize,
) -> Vec<AggregatedScore> {
    let groups = qualifying_groups(leaves, min_group_size);
    let grouped: BTreeSet<(&str, &str)> = groups
        .values()
        .flatten()
        .map(|l| (l.county_id, l.identity.metric_path.as_str()))
        .collect();
    let group_rows: BTreeMap<(&str, &str), &AggregatedScore> = metric_groups
        .iter()
        .map(|row| ((row.county_id.as_str(), row.measure_name.as_str()), row))
        .collect();

    let mut inputs: BTreeMap<(&str, &str, &str), SubMeasureInputs<'_>> = BTreeMap::new();
    let mut direct_seen: BTreeSet<(&str, &str)> = BTreeSet::new();

    for leaf in leaves {
        let id = leaf.identity;
        let key = (leaf.county_id, id.metric_path.as_str());
        if grouped.contains(&key) || !direct_seen.insert(key) {
            continue;
        }
        let entry = inputs
            .entry((leaf.county_id, id.top_level.as_str(), id.sub_measure.as_str()))
            .or_default();
        entry.sub_measure_name = id.sub_measure_name();
        entry.direct.push(leaf.scores());
    }

    for ((county_id, top, sub, _), members) in &groups {
        let identity = members[0].identity;
        let entry = inputs.entry((*county_id, *top, *sub)).or_default();
        entry.sub_measure_name = identity.sub_measure_name();
        let group_name = identity.metric_group_name();
        match group_rows.get(&(*county_id, group_name.as_str())) {
            Some(row) => entry.groups.push(row),
            None => entry.absent_group_leaves += count(members.len()),
        }
    }

    inputs
        .into_iter()
        .filter_map(|((county_id, top, _), input)| {
            let direct: Vec<ScorePair> = input.direct.iter().flatten().copied().collect();
            let merged = weighted_merge_by_component_count(&direct, &input.groups)?;

            let direct_missing = count(input.direct.len() - direct.len());
            let component_count = count(input.direct.len())
                + input.groups.iter().map(|g| g.component_count).sum::<u32>()
                + input.absent_group_leaves;
            let missing_components = direct_missing
                + input.groups.iter().map(|g| g.missing_components).sum::<u32>()
                + input.absent_group_leaves;

            Some(score_row(
                county_id,
                input.sub_measure_name,
                MeasureLevel::SubMeasure,
                Some(top.to_string()),
                merged,
                component_count,
                missing_components,
            ))
        })
        .collect()
}

/// Pass 3: one row per (county, dimension) with a sub-measure row.
///
/// A dimension's expected components are all sub-measures it has anywhere
/// in `leaves`; those without a row for the county count as missing.
/// Sub-measures whose top level names no known dimension get no row.
#[must_use]
pub fn aggregate_top_levels(
    leaves: &[LeafScore<'_>],
    sub_measures: &[AggregatedScore],
) -> Vec<AggregatedScore> {
    let mut catalog: BTreeMap<Dimension, BTreeSet<String>> = BTreeMap::new();
    let mut unknown: BTreeSet<&str> = BTreeSet::new();
    for leaf in leaves {
        let id = leaf.identity;
        match id.dimension() {
            Some(dimension) => {
                catalog
                    .entry(dimension)
                    .or_default()
                    .insert(id.sub_measure_name());
            }
            None => {
                unknown.insert(id.top_level.as_str());
            }
        }
    }
    for label in unknown {
        log::warn!("Top-level label {label:?} maps to no dimension; skipping its top-level rollup");
    }

    let mut by_county: BTreeMap<(&str, Dimension), Vec<&AggregatedScore>> = BTreeMap::new();
    for row in sub_measures {
        let Some(dimension) = row.parent_measure.as_deref().and_then(Dimension::from_label)
        else {
            continue;
        };
        by_county
            .entry((row.county_id.as_str(), dimension))
            .or_default()
            .push(row);
    }

    by_county
        .into_iter()
        .filter_map(|((county_id, dimension), rows)| {
            let merged = equal_weight_merge(&rows)?;
            let expected = catalog.get(&dimension).map_or(0, BTreeSet::len);
            let component_count = count(expected.max(rows.len()));
            Some(score_row(
                county_id,
                dimension.to_string(),
                MeasureLevel::TopLevel,
                None,
                merged,
                component_count,
                component_count - count(rows.len()),
            ))
        })
        .collect()
}

/// Merges direct leaves and metric group rows, weighting each group by its
/// `component_count` and each leaf by one.
///
/// Groups carry the mean of their valid leaves but are weighted by all of
/// their components, missing ones included. Returns `None` when there is
/// nothing to merge.
#[must_use]
pub fn weighted_merge_by_component_count(
    direct: &[ScorePair],
    groups: &[&AggregatedScore],
) -> Option<ScorePair> {
    let mut weight = 0.0;
    let mut normalized = 0.0;
    let mut percentile = 0.0;

    for leaf in direct {
        weight += 1.0;
        normalized += leaf.normalized;
        percentile += leaf.percentile;
    }
    for group in groups {
        let w = f64::from(group.component_count);
        weight += w;
        normalized += w * group.normalized_score;
        percentile += w * group.percentile_rank;
    }

    (weight > 0.0).then(|| ScorePair {
        normalized: normalized / weight,
        percentile: percentile / weight,
    })
}

/// Merges sub-measure rows with equal weight, ignoring how many components
/// back each one.
///
/// Returns `None` when `sub_measures` is empty.
#[must_use]
pub fn equal_weight_merge(sub_measures: &[&AggregatedScore]) -> Option<ScorePair> {
    let pairs: Vec<ScorePair> = sub_measures
        .iter()
        .map(|row| ScorePair {
            normalized: row.normalized_score,
            percentile: row.percentile_rank,
        })
        .collect();
    mean_of(&pairs)
}

#[allow(clippy::cast_precision_loss)]
fn mean_of(pairs: &[ScorePair]) -> Option<ScorePair> {
    if pairs.is_empty() {
        return None;
    }
    let n = pairs.len() as f64;
    Some(ScorePair {
        normalized: pairs.iter().map(|p| p.normalized).sum::<f64>() / n,
        percentile: pairs.iter().map(|p| p.percentile).sum::<f64>() / n,
    })
}

fn score_row(
    county_id: &str,
    measure_name: String,
    measure_level: MeasureLevel,
    parent_measure: Option<String>,
    scores: ScorePair,
    component_count: u32,
    missing_components: u32,
) -> AggregatedScore {
    AggregatedScore {
        county_id: county_id.to_string(),
        measure_name,
        measure_level,
        parent_measure,
        normalized_score: scores.normalized,
        percentile_rank: scores.percentile,
        component_count,
        missing_components,
        completeness_ratio: f64::from(component_count - missing_components)
            / f64::from(component_count),
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
