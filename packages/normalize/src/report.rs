//! Per-county score views.
//!
//! Builds the dimension and sub-measure breakdown a dashboard shows for one
//! county, and the leaf-metric drill-down beneath one sub-measure. A
//! measure with no aggregated row renders as "no data" (`score: None`),
//! never as a zero percentile.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sustainability_ingest::display_names::DisplayNames;
use sustainability_ingest::hierarchy::parse_metric_path;
use sustainability_models::{
    AggregatedScore, ComparisonScope, County, Dimension, MeasureLevel, MetricStatistics,
    NamingScheme, PerformanceBand, RawObservation,
};

/// A measure's score in one comparison scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreView {
    /// Percentile rank in `[0, 100]`.
    pub percentile_rank: f64,
    /// Mean Z-score.
    pub normalized_score: f64,
    /// Share of components with data.
    pub completeness_ratio: f64,
    /// Components, missing ones included.
    pub component_count: u32,
    /// Components without data.
    pub missing_components: u32,
    /// Performance band of the percentile.
    pub band: PerformanceBand,
    /// Band label qualified by the scope.
    pub label: String,
}

impl ScoreView {
    fn new(row: &AggregatedScore, scope: &ComparisonScope) -> Self {
        let band = PerformanceBand::from_percentile(row.percentile_rank);
        Self {
            percentile_rank: row.percentile_rank,
            normalized_score: row.normalized_score,
            completeness_ratio: row.completeness_ratio,
            component_count: row.component_count,
            missing_components: row.missing_components,
            band,
            label: band.label(scope),
        }
    }
}

/// One sub-measure of a dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureView {
    /// Internal measure name (e.g. `People_Health`).
    pub measure_name: String,
    /// User-facing name.
    pub display_name: String,
    /// `None` when the county has no data for this measure.
    pub score: Option<ScoreView>,
}

/// One dimension and its sub-measures.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionView {
    /// Stable dimension key.
    pub dimension: Dimension,
    /// User-facing name under the chosen naming scheme.
    pub display_name: String,
    /// `None` when the county has no data for this dimension.
    pub score: Option<ScoreView>,
    /// Sub-measures in name order.
    pub sub_measures: Vec<MeasureView>,
}

/// Everything shown for one county.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountyReport {
    /// The county.
    pub county: County,
    /// Comparison population.
    pub scope: ComparisonScope,
    /// One entry per dimension, in [`Dimension::all`] order.
    pub dimensions: Vec<DimensionView>,
}

impl CountyReport {
    /// Number of measures with data, across both levels.
    #[must_use]
    pub fn measures_with_data(&self) -> usize {
        self.dimensions
            .iter()
            .map(|d| {
                usize::from(d.score.is_some())
                    + d.sub_measures.iter().filter(|m| m.score.is_some()).count()
            })
            .sum()
    }
}

/// Dimension a measure name belongs to, from its first segment.
#[must_use]
pub fn measure_dimension(measure_name: &str) -> Option<Dimension> {
    measure_name.split('_').next().and_then(Dimension::from_label)
}

/// Builds a county's report from its aggregated rows in one scope.
///
/// `rows` should hold the county's top-level and sub-measure rows; other
/// counties and levels are ignored. `known_sub_measures` lists every
/// sub-measure in the data set so the ones this county lacks show up as
/// "no data".
#[must_use]
pub fn county_report(
    county: &County,
    scope: ComparisonScope,
    scheme: NamingScheme,
    rows: &[AggregatedScore],
    known_sub_measures: &[String],
    names: &DisplayNames,
) -> CountyReport {
    let own = rows.iter().filter(|r| r.county_id == county.county_id);

    let mut tops: BTreeMap<Dimension, &AggregatedScore> = BTreeMap::new();
    let mut subs: BTreeMap<&str, &AggregatedScore> = BTreeMap::new();
    for row in own {
        match row.measure_level {
            MeasureLevel::TopLevel => {
                if let Some(dimension) = measure_dimension(&row.measure_name) {
                    tops.insert(dimension, row);
                }
            }
            MeasureLevel::SubMeasure => {
                subs.insert(row.measure_name.as_str(), row);
            }
            MeasureLevel::MetricGroup => {}
        }
    }

    let sub_names: BTreeSet<&str> = known_sub_measures
        .iter()
        .map(String::as_str)
        .chain(subs.keys().copied())
        .collect();

    let dimensions = Dimension::all()
        .iter()
        .map(|dimension| {
            let sub_measures = sub_names
                .iter()
                .filter(|name| measure_dimension(name) == Some(*dimension))
                .map(|name| MeasureView {
                    measure_name: (*name).to_string(),
                    display_name: sub_measure_label(name, names),
                    score: subs.get(name).map(|row| ScoreView::new(row, &scope)),
                })
                .collect();
            DimensionView {
                dimension: *dimension,
                display_name: dimension.display_name(scheme).to_string(),
                score: tops.get(dimension).map(|row| ScoreView::new(row, &scope)),
                sub_measures,
            }
        })
        .collect();

    CountyReport {
        county: county.clone(),
        scope,
        dimensions,
    }
}

/// One leaf metric beneath a sub-measure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDetail {
    /// Metric identifier.
    pub metric_path: String,
    /// User-facing name.
    pub display_name: String,
    /// Cleaned source value.
    pub raw_value: f64,
    /// Percentile rank in the report's scope.
    pub percentile_rank: f64,
    /// Unit from the source header.
    pub unit: Option<String>,
    /// Data year from the source header.
    pub year: Option<String>,
    /// Whether lower raw values rank higher.
    pub is_reverse: bool,
    /// Performance band of the percentile.
    pub band: PerformanceBand,
    /// Band label qualified by the scope.
    pub label: String,
}

/// The leaf metrics of one county's sub-measure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubMeasureDetail {
    /// The county.
    pub county: County,
    /// Comparison population.
    pub scope: ComparisonScope,
    /// Internal sub-measure name (e.g. `People_Health`).
    pub measure_name: String,
    /// User-facing sub-measure name.
    pub display_name: String,
    /// Metrics with a value and a percentile, best percentile first.
    pub metrics: Vec<MetricDetail>,
}

/// Builds the drill-down beneath one of a county's sub-measures.
///
/// `observations` supplies raw values, units and years, and `percentiles`
/// maps metric path to the county's rank in `scope`. Metrics without a
/// valid value or a rank are left out, since they carry no score.
#[must_use]
pub fn sub_measure_detail(
    county: &County,
    scope: ComparisonScope,
    measure_name: &str,
    observations: &[RawObservation],
    percentiles: &BTreeMap<String, f64>,
    statistics: &[MetricStatistics],
    names: &DisplayNames,
) -> SubMeasureDetail {
    let reverse: BTreeMap<&str, bool> = statistics
        .iter()
        .map(|s| (s.metric_path.as_str(), s.is_reverse))
        .collect();

    let mut metrics: Vec<MetricDetail> = observations
        .iter()
        .filter(|obs| obs.county_id == county.county_id)
        .filter_map(|obs| {
            let identity = parse_metric_path(&obs.metric_path).ok()?;
            if identity.sub_measure_name() != measure_name {
                return None;
            }
            let raw_value = obs.value()?;
            let percentile_rank = *percentiles.get(&obs.metric_path)?;
            let band = PerformanceBand::from_percentile(percentile_rank);
            Some(MetricDetail {
                metric_path: obs.metric_path.clone(),
                display_name: names.metric_label(&identity),
                raw_value,
                percentile_rank,
                unit: obs.unit.clone(),
                year: obs.year.clone(),
                is_reverse: reverse
                    .get(obs.metric_path.as_str())
                    .copied()
                    .unwrap_or(false),
                band,
                label: band.label(&scope),
            })
        })
        .collect();

    metrics.sort_by(|a, b| {
        b.percentile_rank
            .total_cmp(&a.percentile_rank)
            .then_with(|| a.metric_path.cmp(&b.metric_path))
    });

    SubMeasureDetail {
        county: county.clone(),
        scope,
        measure_name: measure_name.to_string(),
        display_name: sub_measure_label(measure_name, names),
        metrics,
    }
}

/// Mapped display name, else the measure name without its dimension prefix.
fn sub_measure_label(measure_name: &str, names: &DisplayNames) -> String {
    let mapped = names.get(measure_name);
    if mapped != measure_name {
        return mapped.to_string();
    }
    measure_name
        .split_once('_')
        .map_or(measure_name, |(_, rest)| rest)
        .replace('_', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn county() -> County {
        County {
            county_id: "01001".to_string(),
            state_code: "01".to_string(),
            state: "AL".to_string(),
            county_name: "Autauga".to_string(),
        }
    }

    fn row(county: &str, name: &str, level: MeasureLevel, pct: f64) -> AggregatedScore {
        AggregatedScore {
            county_id: county.to_string(),
            measure_name: name.to_string(),
            measure_level: level,
            parent_measure: None,
            normalized_score: 0.1,
            percentile_rank: pct,
            component_count: 4,
            missing_components: 1,
            completeness_ratio: 0.75,
        }
    }

    fn report(scope: ComparisonScope) -> CountyReport {
        let rows = vec![
            row("01001", "People", MeasureLevel::TopLevel, 92.0),
            row("01001", "People_Health", MeasureLevel::SubMeasure, 92.0),
            row("01001", "People_Health_LengthOfLife", MeasureLevel::MetricGroup, 1.0),
            row("01003", "Place", MeasureLevel::TopLevel, 10.0),
        ];
        let known = vec!["People_Health".to_string(), "People_Wealth".to_string()];
        let names = DisplayNames::from_reader(
            "database_name,display_name\nPeople_Health,Health & Wellbeing\n".as_bytes(),
        )
        .unwrap();
        county_report(&county(), scope, NamingScheme::V2, &rows, &known, &names)
    }

    #[test]
    fn absent_measures_are_no_data_not_zero() {
        let report = report(ComparisonScope::National);
        let people = &report.dimensions[0];
        assert_eq!(people.dimension, Dimension::People);
        assert_eq!(people.display_name, "Society");
        assert!(people.score.is_some());
        assert_eq!(people.sub_measures.len(), 2);
        assert!(people.sub_measures[1].score.is_none());
        assert_eq!(people.sub_measures[1].display_name, "Wealth");

        // Another county's Place row must not leak in.
        assert!(report.dimensions[2].score.is_none());
        assert_eq!(report.measures_with_data(), 2);
    }

    #[test]
    fn labels_reflect_band_and_scope() {
        let national = report(ComparisonScope::National);
        let score = national.dimensions[0].score.as_ref().unwrap();
        assert_eq!(score.band, PerformanceBand::Excellent);
        assert_eq!(score.label, "Excellent (Top 10% nationally)");

        let state = report(ComparisonScope::State("01".to_string()));
        let score = state.dimensions[0].sub_measures[0].score.as_ref().unwrap();
        assert_eq!(score.label, "Excellent (Top 10% in state)");
        assert_eq!(state.dimensions[0].sub_measures[0].display_name, "Health & Wellbeing");
    }

    fn stats(path: &str, is_reverse: bool) -> MetricStatistics {
        MetricStatistics {
            metric_path: path.to_string(),
            total_count: 12,
            valid_count: 12,
            mean: 0.0,
            std_dev: 1.0,
            min: -2.0,
            max: 2.0,
            median: 0.0,
            is_reverse,
            completeness_ratio: 1.0,
        }
    }

    #[test]
    fn drill_down_lists_ranked_metrics_best_first() {
        const LIFE: &str = "PEOPLE_HEALTH_LengthOfLife_LifeExpectancy";
        const DEATH: &str = "PEOPLE_HEALTH_LengthOfLife_PrematureDeath";
        const UNINSURED: &str = "PEOPLE_HEALTH_Access_Uninsured";
        const UNRANKED: &str = "PEOPLE_HEALTH_Access_Dentists";
        const INCOME: &str = "PEOPLE_WEALTH_Income";

        let observations = vec![
            RawObservation::new("01001", LIFE, Some(76.1))
                .with_metadata(Some("years".to_string()), Some("2022".to_string())),
            RawObservation::new("01001", DEATH, Some(410.0)),
            RawObservation::new("01001", UNINSURED, None),
            RawObservation::new("01001", UNRANKED, Some(3.0)),
            RawObservation::new("01001", INCOME, Some(51_000.0)),
            RawObservation::new("01003", LIFE, Some(79.0)),
        ];
        let percentiles: BTreeMap<String, f64> = [(LIFE, 35.0), (DEATH, 80.0), (INCOME, 60.0)]
            .into_iter()
            .map(|(path, pct)| (path.to_string(), pct))
            .collect();
        let statistics = vec![stats(LIFE, false), stats(DEATH, true)];

        let detail = sub_measure_detail(
            &county(),
            ComparisonScope::National,
            "People_Health",
            &observations,
            &percentiles,
            &statistics,
            &DisplayNames::default(),
        );

        assert_eq!(detail.display_name, "Health");
        let paths: Vec<&str> = detail.metrics.iter().map(|m| m.metric_path.as_str()).collect();
        assert_eq!(paths, [DEATH, LIFE]);

        let death = &detail.metrics[0];
        assert!(death.is_reverse);
        assert_eq!(death.display_name, "Prematuredeath");
        assert_eq!(death.label, "Good (Top 25% nationally)");

        let life = &detail.metrics[1];
        assert!(!life.is_reverse);
        assert!((life.raw_value - 76.1).abs() < 1e-9);
        assert_eq!(life.unit.as_deref(), Some("years"));
        assert_eq!(life.year.as_deref(), Some("2022"));
        assert_eq!(life.band, PerformanceBand::BelowAverage);
    }

    #[test]
    fn dimension_comes_from_first_segment() {
        assert_eq!(measure_dimension("Environment_Water"), Some(Dimension::Place));
        assert_eq!(measure_dimension("Productivity"), Some(Dimension::Productivity));
        assert_eq!(measure_dimension("Governance_Trust"), None);
    }
}
