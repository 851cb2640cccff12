#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! County sustainability metric, statistic, and score types.
//!
//! These types flow through the normalization pipeline: raw observations
//! are summarized into per-metric statistics, converted into Z-scores and
//! percentile ranks, and rolled up through the metric hierarchy into
//! aggregated scores. State-scoped mirrors of the percentile and score
//! records support "compare within my state" views.

pub mod county;
pub mod dimension;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub use dimension::{Dimension, NamingScheme};

/// One county's value for one metric, as loaded from the source data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawObservation {
    /// Five-digit county FIPS code.
    pub county_id: String,
    /// Hierarchical metric identifier (e.g. `People_Health_LengthOfLife_LifeExpectancy`).
    pub metric_path: String,
    /// Cleaned numeric value, `None` when missing.
    pub raw_value: Option<f64>,
    /// `true` iff `raw_value` is `None`.
    pub is_missing: bool,
    /// Unit of measure from the source header.
    pub unit: Option<String>,
    /// Data vintage from the source header.
    pub year: Option<String>,
}

impl RawObservation {
    /// Creates an observation, deriving `is_missing` from `raw_value`.
    #[must_use]
    pub fn new(
        county_id: impl Into<String>,
        metric_path: impl Into<String>,
        raw_value: Option<f64>,
    ) -> Self {
        Self {
            county_id: county_id.into(),
            metric_path: metric_path.into(),
            raw_value,
            is_missing: raw_value.is_none(),
            unit: None,
            year: None,
        }
    }

    /// Sets the unit and year header metadata.
    #[must_use]
    pub fn with_metadata(mut self, unit: Option<String>, year: Option<String>) -> Self {
        self.unit = unit;
        self.year = year;
        self
    }

    /// Returns the value if this observation counts as present.
    ///
    /// A record flagged missing never yields a value, even if one was
    /// stored alongside the flag.
    #[must_use]
    pub const fn value(&self) -> Option<f64> {
        if self.is_missing {
            None
        } else {
            self.raw_value
        }
    }
}

/// The four-level position of a metric in the measurement hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricIdentity {
    /// The unparsed metric path.
    pub metric_path: String,
    /// Top-level category label, title-cased (e.g. `People`).
    pub top_level: String,
    /// Sub-measure label, title-cased (e.g. `Health`).
    pub sub_measure: String,
    /// Metric group, verbatim from the path. Equal to `sub_measure` for
    /// two-segment paths.
    pub metric_group: String,
    /// Leaf metric name.
    pub sub_metric_name: String,
}

impl MetricIdentity {
    /// Returns `true` when the metric sits inside a genuine metric group
    /// rather than directly under its sub-measure.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.metric_group != self.sub_measure
    }

    /// Measure name of the sub-measure (`{top_level}_{sub_measure}`).
    #[must_use]
    pub fn sub_measure_name(&self) -> String {
        format!("{}_{}", self.top_level, self.sub_measure)
    }

    /// Measure name of the metric group
    /// (`{top_level}_{sub_measure}_{metric_group}`).
    #[must_use]
    pub fn metric_group_name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.top_level, self.sub_measure, self.metric_group
        )
    }

    /// Returns the stable dimension for this metric's top level, if any.
    #[must_use]
    pub fn dimension(&self) -> Option<Dimension> {
        Dimension::from_label(&self.top_level)
    }
}

/// A county and the state it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct County {
    /// Five-digit county FIPS code.
    pub county_id: String,
    /// Two-digit state FIPS code.
    pub state_code: String,
    /// State name or abbreviation as given by the source.
    pub state: String,
    /// County name.
    pub county_name: String,
}

/// Descriptive statistics for one metric across all counties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricStatistics {
    /// Metric identifier.
    pub metric_path: String,
    /// Number of observations, missing or not.
    pub total_count: u64,
    /// Number of observations with a value.
    pub valid_count: u64,
    /// Mean of valid values.
    pub mean: f64,
    /// Sample standard deviation (n - 1 denominator) of valid values.
    pub std_dev: f64,
    /// Smallest valid value.
    pub min: f64,
    /// Largest valid value.
    pub max: f64,
    /// Exact median of valid values.
    pub median: f64,
    /// Whether a lower raw value is better for this metric.
    pub is_reverse: bool,
    /// `valid_count / total_count`.
    pub completeness_ratio: f64,
}

impl MetricStatistics {
    /// Number of observations without a value.
    #[must_use]
    pub const fn missing_count(&self) -> u64 {
        self.total_count - self.valid_count
    }
}

/// One county's normalized value for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedObservation {
    /// Five-digit county FIPS code.
    pub county_id: String,
    /// Metric identifier.
    pub metric_path: String,
    /// Raw value carried through for drill-down views.
    pub raw_value: Option<f64>,
    /// `(raw - mean) / std_dev`, `None` when missing.
    pub z_score: Option<f64>,
    /// Percentile rank in `[0, 100]`, inverted for reverse metrics.
    pub percentile_rank: Option<f64>,
    /// Propagated from the raw observation.
    pub is_missing: bool,
}

/// Level of the measurement hierarchy an aggregated score belongs to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MeasureLevel {
    /// Closely related leaf metrics beneath a sub-measure.
    MetricGroup,
    /// Second-level grouping beneath a dimension (e.g. Health).
    SubMeasure,
    /// One of the three dimensions.
    TopLevel,
}

impl MeasureLevel {
    /// Returns all levels in aggregation order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::MetricGroup, Self::SubMeasure, Self::TopLevel]
    }
}

/// A county's rolled-up score for one measure.
///
/// A record only exists when at least one component had data, so an
/// absent record means "no data", never a zero score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedScore {
    /// Five-digit county FIPS code.
    pub county_id: String,
    /// Measure name (e.g. `People_Health`).
    pub measure_name: String,
    /// Hierarchy level of this measure.
    pub measure_level: MeasureLevel,
    /// Name of the next measure up, `None` at the top level.
    pub parent_measure: Option<String>,
    /// Weighted mean of child Z-scores.
    pub normalized_score: f64,
    /// Weighted mean of child percentile ranks.
    pub percentile_rank: f64,
    /// Number of child components, missing ones included.
    pub component_count: u32,
    /// Number of child components without a value.
    pub missing_components: u32,
    /// `(component_count - missing_components) / component_count`.
    pub completeness_ratio: f64,
}

/// One county's percentile for one metric, ranked within its own state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePercentile {
    /// Five-digit county FIPS code.
    pub county_id: String,
    /// Two-digit state FIPS code of the comparison population.
    pub state_code: String,
    /// Metric identifier.
    pub metric_path: String,
    /// Raw value carried through for drill-down views.
    pub raw_value: Option<f64>,
    /// National Z-score (Z-scores are not re-scoped).
    pub z_score: Option<f64>,
    /// Percentile rank among the state's counties.
    pub state_percentile: Option<f64>,
    /// Propagated from the raw observation.
    pub is_missing: bool,
}

/// An [`AggregatedScore`] computed from state-scoped percentiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateAggregatedScore {
    /// Two-digit state FIPS code of the comparison population.
    pub state_code: String,
    /// The rolled-up score; its `percentile_rank` is the state percentile.
    #[serde(flatten)]
    pub score: AggregatedScore,
}

/// Which population a county is compared against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode", content = "stateCode")]
pub enum ComparisonScope {
    /// All counties in the data set.
    National,
    /// Counties sharing the given two-digit state FIPS code.
    State(String),
}

impl ComparisonScope {
    /// Phrase describing the comparison population.
    #[must_use]
    pub const fn context(&self) -> &'static str {
        match self {
            Self::National => "nationally",
            Self::State(_) => "in state",
        }
    }
}

/// Coarse performance band for a percentile rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceBand {
    /// 90th percentile and above.
    Excellent,
    /// 75th to 90th percentile.
    Good,
    /// 50th to 75th percentile.
    AboveAverage,
    /// 25th to 50th percentile.
    BelowAverage,
    /// Below the 25th percentile.
    NeedsImprovement,
}

impl PerformanceBand {
    /// Classifies a percentile rank.
    #[must_use]
    pub fn from_percentile(percentile: f64) -> Self {
        if percentile >= 90.0 {
            Self::Excellent
        } else if percentile >= 75.0 {
            Self::Good
        } else if percentile >= 50.0 {
            Self::AboveAverage
        } else if percentile >= 25.0 {
            Self::BelowAverage
        } else {
            Self::NeedsImprovement
        }
    }

    /// Human-readable label, qualified by the comparison population.
    #[must_use]
    pub fn label(self, scope: &ComparisonScope) -> String {
        let context = scope.context();
        match self {
            Self::Excellent => format!("Excellent (Top 10% {context})"),
            Self::Good => format!("Good (Top 25% {context})"),
            Self::AboveAverage => format!("Above Average {context}"),
            Self::BelowAverage => format!("Below Average {context}"),
            Self::NeedsImprovement => format!("Needs Improvement (Bottom 25% {context})"),
        }
    }
}
