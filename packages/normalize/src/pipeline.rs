//! Normalization run orchestration.
//!
//! A run moves through fixed stages, each consuming the complete output of
//! the one before: identify metrics, compute statistics, normalize, then
//! aggregate through the three hierarchy passes, and optionally repeat the
//! percentile and aggregation stages per state. Every write goes through
//! the retry policy; a batch that still fails is recorded in the
//! [`RunReport`] and left out of later stages, and the run carries on.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display as StrumDisplay};
use sustainability_ingest::hierarchy::parse_metric_path;
use sustainability_models::{
    County, MeasureLevel, MetricIdentity, MetricStatistics, NormalizedObservation, RawObservation,
    StateAggregatedScore,
};
use uuid::Uuid;

use crate::PipelineError;
use crate::aggregate::{LeafScore, aggregate};
use crate::config::{PipelineConfig, RetryPolicy};
use crate::normalize::normalize_metric;
use crate::progress::{ProgressCallback, null_progress};
use crate::retry::{RetryExhausted, with_retry};
use crate::scope::{StateIndex, aggregate_state_scores, state_percentiles};
use crate::sink::ScoreSink;
use crate::stats::{MetricExclusion, StatisticsOutcome, compute_statistics};

/// Stage of a run, used to label failed batches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PipelineStage {
    /// Recreating output tables.
    Reset,
    /// Writing metric statistics.
    Statistics,
    /// Writing one metric's normalized rows.
    Normalize,
    /// Writing one level of aggregated scores.
    Aggregate,
    /// Writing one metric's state percentiles.
    StatePercentiles,
    /// Writing one level of state-scoped scores.
    StateAggregate,
    /// Marking the state-scoped tables complete.
    StateComplete,
    /// Recording run metadata.
    RecordRun,
}

impl PipelineStage {
    /// Short present-tense description for progress displays.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Reset => "Resetting output tables",
            Self::Statistics => "Computing statistics",
            Self::Normalize => "Normalizing metrics",
            Self::Aggregate => "Aggregating scores",
            Self::StatePercentiles => "Ranking within states",
            Self::StateAggregate => "Aggregating state scores",
            Self::StateComplete => "Marking state scope complete",
            Self::RecordRun => "Recording run",
        }
    }
}

/// A write that failed every retry attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedBatch {
    /// Stage the write belonged to.
    pub stage: PipelineStage,
    /// Metric path or level name the batch covered.
    pub key: String,
    /// Attempts made.
    pub attempts: u32,
    /// Error from the last attempt.
    pub message: String,
}

/// A metric left out of normalization and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedMetric {
    /// Metric identifier.
    pub metric_path: String,
    /// Reason for the exclusion.
    pub reason: MetricExclusion,
}

/// Rows successfully written per output table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowCounts {
    /// Metric statistics rows.
    pub statistics: u64,
    /// Normalized observation rows.
    pub normalized: u64,
    /// Metric group score rows.
    pub metric_groups: u64,
    /// Sub-measure score rows.
    pub sub_measures: u64,
    /// Top-level score rows.
    pub top_levels: u64,
    /// State percentile rows.
    pub state_percentiles: u64,
    /// State-scoped score rows, all levels.
    pub state_scores: u64,
}

impl RowCounts {
    const fn add_level(&mut self, level: MeasureLevel, rows: u64) {
        match level {
            MeasureLevel::MetricGroup => self.metric_groups += rows,
            MeasureLevel::SubMeasure => self.sub_measures += rows,
            MeasureLevel::TopLevel => self.top_levels += rows,
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Unique id of this run.
    pub run_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Distinct metric paths in the input.
    pub metrics_seen: usize,
    /// Metrics that passed the statistics checks.
    pub metrics_qualified: usize,
    /// Metrics left out of normalization.
    pub exclusions: Vec<ExcludedMetric>,
    /// Metric paths that could not be placed in the hierarchy.
    pub malformed_paths: Vec<String>,
    /// Writes that failed after every retry.
    pub failed_batches: Vec<FailedBatch>,
    /// Rows written per table.
    pub rows: RowCounts,
}

impl RunReport {
    fn start() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            metrics_seen: 0,
            metrics_qualified: 0,
            exclusions: Vec::new(),
            malformed_paths: Vec::new(),
            failed_batches: Vec::new(),
            rows: RowCounts::default(),
        }
    }

    /// Returns `true` if every write succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_batches.is_empty()
    }

    /// Logs a summary at `info`, escalating failures to `error`.
    pub fn log(&self, elapsed: Duration) {
        log::info!(
            "Run {} finished in {:.1}s: {} metrics seen, {} normalized, {} excluded, {} malformed",
            self.run_id,
            elapsed.as_secs_f64(),
            self.metrics_seen,
            self.metrics_qualified,
            self.exclusions.len(),
            self.malformed_paths.len(),
        );
        log::info!(
            "  rows: {} statistics, {} normalized, {} metric group, {} sub-measure, {} top-level",
            self.rows.statistics,
            self.rows.normalized,
            self.rows.metric_groups,
            self.rows.sub_measures,
            self.rows.top_levels,
        );
        if self.rows.state_percentiles > 0 {
            log::info!(
                "  state rows: {} percentiles, {} scores",
                self.rows.state_percentiles,
                self.rows.state_scores,
            );
        }
        for failed in &self.failed_batches {
            log::error!(
                "  failed batch {} {} after {} attempt(s): {}",
                failed.stage,
                failed.key,
                failed.attempts,
                failed.message,
            );
        }
    }
}

/// Switches for optional stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Precompute state percentiles and state-scoped scores.
    pub include_state_scope: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            include_state_scope: true,
        }
    }
}

/// Runs the full normalization pipeline into `sink`.
///
/// Output tables are reset first, so re-running on the same input yields
/// the same tables. Write failures that outlast the retry policy are
/// recorded in the returned report rather than aborting the run.
///
/// # Errors
///
/// Returns [`PipelineError`] if `config` is invalid or the output tables
/// cannot be reset.
#[allow(clippy::too_many_lines)]
pub async fn run_pipeline<S: ScoreSink>(
    sink: &S,
    observations: &[RawObservation],
    counties: &[County],
    config: &PipelineConfig,
    options: PipelineOptions,
    progress: Option<Arc<dyn ProgressCallback>>,
) -> Result<RunReport, PipelineError> {
    config.validate()?;
    let start = Instant::now();
    let progress = progress.unwrap_or_else(null_progress);
    let mut report = RunReport::start();
    log::info!(
        "Starting normalization run {} over {} observations",
        report.run_id,
        observations.len()
    );

    progress.enter_stage(PipelineStage::Reset);
    with_retry("reset output tables", &config.retry, || sink.reset())
        .await
        .map_err(|e| PipelineError::Reset {
            attempts: e.attempts,
            message: e.error.to_string(),
        })?;

    // Identify metrics.
    let mut by_metric: BTreeMap<&str, Vec<&RawObservation>> = BTreeMap::new();
    for obs in observations {
        by_metric.entry(obs.metric_path.as_str()).or_default().push(obs);
    }
    report.metrics_seen = by_metric.len();

    let mut identities: BTreeMap<String, MetricIdentity> = BTreeMap::new();
    for path in by_metric.keys() {
        match parse_metric_path(path) {
            Ok(identity) => {
                identities.insert(identity.metric_path.clone(), identity);
            }
            Err(e) => {
                log::warn!("Excluding metric from hierarchy: {e}");
                report.malformed_paths.push((*path).to_string());
            }
        }
    }

    // Statistics.
    progress.enter_stage(PipelineStage::Statistics);
    let mut statistics = Vec::new();
    let mut qualified: Vec<MetricStatistics> = Vec::new();
    for (path, rows) in &by_metric {
        if !identities.contains_key(*path) {
            continue;
        }
        let outcome = compute_statistics(path, rows, config.min_valid_samples, &config.reverse);
        if let Some(reason) = outcome.exclusion() {
            log_exclusion(path, reason, outcome.statistics());
            report.exclusions.push(ExcludedMetric {
                metric_path: (*path).to_string(),
                reason,
            });
        }
        if let Some(stats) = outcome.statistics() {
            statistics.push(stats.clone());
        }
        if let StatisticsOutcome::Qualified(stats) = outcome {
            qualified.push(stats);
        }
    }
    report.metrics_qualified = qualified.len();
    log::info!(
        "{} of {} metrics qualified for normalization",
        qualified.len(),
        report.metrics_seen
    );

    if write_batch(
        &mut report.failed_batches,
        &config.retry,
        PipelineStage::Statistics,
        "metric_statistics",
        || sink.write_statistics(&statistics),
    )
    .await
    {
        report.rows.statistics = statistics.len() as u64;
    }

    // Normalize.
    let state_metrics = if options.include_state_scope {
        qualified.len()
    } else {
        0
    };
    progress.set_total((qualified.len() + state_metrics) as u64);
    progress.enter_stage(PipelineStage::Normalize);

    let mut normalized: Vec<(&MetricStatistics, Vec<NormalizedObservation>)> = Vec::new();
    for stats in &qualified {
        let Some(rows) = by_metric.get(stats.metric_path.as_str()) else {
            continue;
        };
        let rows = normalize_metric(stats, rows);
        if write_batch(
            &mut report.failed_batches,
            &config.retry,
            PipelineStage::Normalize,
            &stats.metric_path,
            || sink.write_normalized(&stats.metric_path, &rows),
        )
        .await
        {
            report.rows.normalized += rows.len() as u64;
            normalized.push((stats, rows));
        }
        progress.metric_done(&stats.metric_path);
    }

    // Aggregate.
    progress.enter_stage(PipelineStage::Aggregate);
    let leaves: Vec<LeafScore<'_>> = normalized
        .iter()
        .flat_map(|(_, rows)| rows)
        .filter_map(|row| {
            identities
                .get(&row.metric_path)
                .map(|id| LeafScore::national(row, id))
        })
        .collect();
    let output = aggregate(&leaves, config.min_group_size);

    for level in MeasureLevel::all() {
        let rows = output.level(*level);
        if write_batch(
            &mut report.failed_batches,
            &config.retry,
            PipelineStage::Aggregate,
            level.as_ref(),
            || sink.write_aggregated(*level, rows),
        )
        .await
        {
            report.rows.add_level(*level, rows.len() as u64);
        }
    }

    // State scope.
    if options.include_state_scope {
        progress.enter_stage(PipelineStage::StatePercentiles);
        let failures_before = report.failed_batches.len();
        let states = StateIndex::new(counties);
        let mut state_rows = Vec::new();

        for (stats, _) in &normalized {
            let Some(rows) = by_metric.get(stats.metric_path.as_str()) else {
                continue;
            };
            let rows = state_percentiles(stats, rows, &states);
            if write_batch(
                &mut report.failed_batches,
                &config.retry,
                PipelineStage::StatePercentiles,
                &stats.metric_path,
                || sink.write_state_percentiles(&stats.metric_path, &rows),
            )
            .await
            {
                report.rows.state_percentiles += rows.len() as u64;
                state_rows.extend(rows);
            }
            progress.metric_done(&stats.metric_path);
        }

        progress.enter_stage(PipelineStage::StateAggregate);

        let scores = aggregate_state_scores(&state_rows, &identities, config.min_group_size);
        for level in MeasureLevel::all() {
            let rows: Vec<StateAggregatedScore> = scores
                .iter()
                .filter(|s| s.score.measure_level == *level)
                .cloned()
                .collect();
            if write_batch(
                &mut report.failed_batches,
                &config.retry,
                PipelineStage::StateAggregate,
                level.as_ref(),
                || sink.write_state_scores(*level, &rows),
            )
            .await
            {
                report.rows.state_scores += rows.len() as u64;
            }
        }

        if report.failed_batches.len() == failures_before {
            let codes = states.state_codes();
            write_batch(
                &mut report.failed_batches,
                &config.retry,
                PipelineStage::StateComplete,
                "state_scope",
                || sink.mark_states_complete(&codes),
            )
            .await;
        } else {
            log::warn!(
                "State-scoped tables are incomplete; county views will rank states on demand"
            );
        }
    }

    let finished_at = Utc::now();
    let run_id = report.run_id.clone();
    write_batch(
        &mut report.failed_batches,
        &config.retry,
        PipelineStage::RecordRun,
        &run_id,
        || sink.record_run(&run_id, finished_at),
    )
    .await;
    report.finished_at = Some(finished_at);

    progress.finish(format!(
        "Normalized {} metrics into {} aggregated rows",
        report.metrics_qualified,
        output.len()
    ));
    report.log(start.elapsed());

    Ok(report)
}

/// Logs why a metric was excluded; each reason gets its own wording.
fn log_exclusion(path: &str, reason: MetricExclusion, stats: Option<&MetricStatistics>) {
    match reason {
        MetricExclusion::InsufficientSample { valid, required } => {
            log::info!(
                "Excluding {path}: insufficient sample, {valid} valid value(s) of {required} required"
            );
        }
        MetricExclusion::ZeroVariance => {
            let value = stats.map_or(f64::NAN, |s| s.min);
            log::warn!("Excluding {path}: zero variance, every valid value is {value}");
        }
    }
}

/// Writes one batch under the retry policy, recording it on exhaustion.
///
/// Returns `true` if the write succeeded.
async fn write_batch<E, F, Fut>(
    failures: &mut Vec<FailedBatch>,
    policy: &RetryPolicy,
    stage: PipelineStage,
    key: &str,
    operation: F,
) -> bool
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let label = format!("{stage} {key}");
    match with_retry(&label, policy, operation).await {
        Ok(()) => true,
        Err(RetryExhausted { attempts, error }) => {
            failures.push(FailedBatch {
                stage,
                key: key.to_string(),
                attempts,
                message: error.to_string(),
            });
            false
        }
    }
}
