//! Output store abstraction.
//!
//! The pipeline writes every output table through [`ScoreSink`]. Each
//! write replaces the rows it covers (a metric, or an aggregation level)
//! rather than appending, so a retried write never duplicates rows and a
//! full re-run after [`ScoreSink::reset`] reproduces the same tables.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sustainability_models::{
    AggregatedScore, MeasureLevel, MetricStatistics, NormalizedObservation,
    StateAggregatedScore, StatePercentile,
};

/// Destination for pipeline output tables.
#[async_trait]
pub trait ScoreSink: Send + Sync {
    /// Error returned by a failed write.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Drops and recreates every output table.
    async fn reset(&self) -> Result<(), Self::Error>;

    /// Replaces the metric statistics table.
    async fn write_statistics(&self, rows: &[MetricStatistics]) -> Result<(), Self::Error>;

    /// Replaces the normalized rows of one metric.
    async fn write_normalized(
        &self,
        metric_path: &str,
        rows: &[NormalizedObservation],
    ) -> Result<(), Self::Error>;

    /// Replaces the aggregated rows of one level.
    async fn write_aggregated(
        &self,
        level: MeasureLevel,
        rows: &[AggregatedScore],
    ) -> Result<(), Self::Error>;

    /// Replaces the state percentile rows of one metric.
    async fn write_state_percentiles(
        &self,
        metric_path: &str,
        rows: &[StatePercentile],
    ) -> Result<(), Self::Error>;

    /// Replaces the state-scoped aggregated rows of one level.
    async fn write_state_scores(
        &self,
        level: MeasureLevel,
        rows: &[StateAggregatedScore],
    ) -> Result<(), Self::Error>;

    /// Marks the state-scoped tables as complete for `state_codes`.
    ///
    /// Called only when every state-scoped write of the run succeeded.
    /// [`ScoreSink::reset`] clears the marks.
    async fn mark_states_complete(&self, state_codes: &[String]) -> Result<(), Self::Error>;

    /// Records the identity and completion time of a run.
    async fn record_run(&self, run_id: &str, finished_at: DateTime<Utc>)
    -> Result<(), Self::Error>;
}

/// Snapshot of everything written to a [`MemorySink`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTables {
    /// Metric statistics.
    pub statistics: Vec<MetricStatistics>,
    /// Normalized rows keyed by metric path.
    pub normalized: BTreeMap<String, Vec<NormalizedObservation>>,
    /// Aggregated rows keyed by level.
    pub aggregated: BTreeMap<MeasureLevel, Vec<AggregatedScore>>,
    /// State percentile rows keyed by metric path.
    pub state_percentiles: BTreeMap<String, Vec<StatePercentile>>,
    /// State-scoped aggregated rows keyed by level.
    pub state_scores: BTreeMap<MeasureLevel, Vec<StateAggregatedScore>>,
    /// States whose state-scoped tables are complete.
    pub complete_states: BTreeSet<String>,
    /// Last recorded run id.
    pub run_id: Option<String>,
}

impl MemoryTables {
    /// All normalized rows, ordered by metric path.
    #[must_use]
    pub fn normalized_rows(&self) -> Vec<&NormalizedObservation> {
        self.normalized.values().flatten().collect()
    }

    /// All aggregated rows, in level order.
    #[must_use]
    pub fn aggregated_rows(&self) -> Vec<&AggregatedScore> {
        self.aggregated.values().flatten().collect()
    }
}

/// A [`ScoreSink`] that keeps every table in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<MemoryTables>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current tables.
    #[must_use]
    pub fn snapshot(&self) -> MemoryTables {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ScoreSink for MemorySink {
    type Error = Infallible;

    async fn reset(&self) -> Result<(), Self::Error> {
        *self.lock() = MemoryTables::default();
        Ok(())
    }

    async fn write_statistics(&self, rows: &[MetricStatistics]) -> Result<(), Self::Error> {
        self.lock().statistics = rows.to_vec();
        Ok(())
    }

    async fn write_normalized(
        &self,
        metric_path: &str,
        rows: &[NormalizedObservation],
    ) -> Result<(), Self::Error> {
        self.lock()
            .normalized
            .insert(metric_path.to_string(), rows.to_vec());
        Ok(())
    }

    async fn write_aggregated(
        &self,
        level: MeasureLevel,
        rows: &[AggregatedScore],
    ) -> Result<(), Self::Error> {
        self.lock().aggregated.insert(level, rows.to_vec());
        Ok(())
    }

    async fn write_state_percentiles(
        &self,
        metric_path: &str,
        rows: &[StatePercentile],
    ) -> Result<(), Self::Error> {
        self.lock()
            .state_percentiles
            .insert(metric_path.to_string(), rows.to_vec());
        Ok(())
    }

    async fn write_state_scores(
        &self,
        level: MeasureLevel,
        rows: &[StateAggregatedScore],
    ) -> Result<(), Self::Error> {
        self.lock().state_scores.insert(level, rows.to_vec());
        Ok(())
    }

    async fn mark_states_complete(&self, state_codes: &[String]) -> Result<(), Self::Error> {
        self.lock()
            .complete_states
            .extend(state_codes.iter().cloned());
        Ok(())
    }

    async fn record_run(
        &self,
        run_id: &str,
        _finished_at: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        self.lock().run_id = Some(run_id.to_string());
        Ok(())
    }
}
