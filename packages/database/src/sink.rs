//! [`ScoreSink`] backed by the warehouse.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use sustainability_models::{
    AggregatedScore, MeasureLevel, MetricStatistics, NormalizedObservation,
    StateAggregatedScore, StatePercentile,
};
use sustainability_normalize::sink::ScoreSink;

use crate::DbError;
use crate::warehouse;

/// Writes pipeline output into warehouse tables.
///
/// `duckdb::Connection` is `Send` but not `Sync`, so it sits behind a
/// `Mutex`. Every write holds the lock for its whole delete-then-insert.
pub struct DuckDbSink {
    conn: Mutex<Connection>,
}

impl DuckDbSink {
    /// Wraps an open warehouse connection.
    #[must_use]
    pub const fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Locks the connection for direct queries.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the connection.
    #[must_use]
    pub fn into_inner(self) -> Connection {
        self.conn.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ScoreSink for DuckDbSink {
    type Error = DbError;

    async fn reset(&self) -> Result<(), Self::Error> {
        warehouse::reset_outputs(&self.connection())
    }

    async fn write_statistics(&self, rows: &[MetricStatistics]) -> Result<(), Self::Error> {
        let inserted = warehouse::replace_statistics(&self.connection(), rows)?;
        log::debug!("Wrote {inserted} metric statistics rows");
        Ok(())
    }

    async fn write_normalized(
        &self,
        metric_path: &str,
        rows: &[NormalizedObservation],
    ) -> Result<(), Self::Error> {
        warehouse::replace_normalized(&self.connection(), metric_path, rows)?;
        Ok(())
    }

    async fn write_aggregated(
        &self,
        level: MeasureLevel,
        rows: &[AggregatedScore],
    ) -> Result<(), Self::Error> {
        let inserted = warehouse::replace_aggregated(&self.connection(), level, rows)?;
        log::debug!("Wrote {inserted} {level} rows");
        Ok(())
    }

    async fn write_state_percentiles(
        &self,
        metric_path: &str,
        rows: &[StatePercentile],
    ) -> Result<(), Self::Error> {
        warehouse::replace_state_percentiles(&self.connection(), metric_path, rows)?;
        Ok(())
    }

    async fn write_state_scores(
        &self,
        level: MeasureLevel,
        rows: &[StateAggregatedScore],
    ) -> Result<(), Self::Error> {
        let inserted = warehouse::replace_state_scores(&self.connection(), level, rows)?;
        log::debug!("Wrote {inserted} state-scoped {level} rows");
        Ok(())
    }

    async fn mark_states_complete(&self, state_codes: &[String]) -> Result<(), Self::Error> {
        warehouse::mark_states_complete(
            &self.connection(),
            state_codes,
            &Utc::now().to_rfc3339(),
        )?;
        log::debug!("Marked state scope complete for {} state(s)", state_codes.len());
        Ok(())
    }

    async fn record_run(
        &self,
        run_id: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        let conn = self.connection();
        warehouse::set_meta(&conn, "last_run_id", run_id)?;
        warehouse::set_meta(&conn, "last_run_at", &finished_at.to_rfc3339())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sustainability_ingest::wide_csv::read_wide_csv_from;
    use sustainability_normalize::{PipelineConfig, PipelineOptions, run_pipeline};

    /// Twelve counties in two states with two nested metrics, one flat
    /// metric, and one metric too sparse to normalize.
    fn csv() -> String {
        let mut csv = String::from(
            "FIPS,State,County,PEOPLE_HEALTH_Life_Expectancy,PEOPLE_HEALTH_Life_Mortality,PLACE_WATER,PLACE_LAND_Sparse\n\
             -,-,-,years,rate,index,acres\n\
             -,-,-,2021,2021,2020,2019\n",
        );
        for i in 0..12u32 {
            let (state, fips) = if i < 6 { ("AL", 1001 + i * 2) } else { ("GA", 13001 + i * 2) };
            let x = f64::from(i);
            let sparse = if i < 3 { format!("{x}") } else { String::new() };
            csv.push_str(&format!(
                "{fips},{state},County {i},{:.1},{:.1},{:.2},{sparse}\n",
                70.0 + x,
                900.0 - 3.0 * x * x,
                (x * 0.7).sin(),
            ));
        }
        csv
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::embedded().unwrap();
        config.retry = sustainability_normalize::RetryPolicy::immediate(1);
        config
    }

    #[tokio::test]
    async fn pipeline_writes_into_warehouse() {
        let conn = warehouse::open_in_memory().unwrap();
        let table = read_wide_csv_from(csv().as_bytes()).unwrap();
        warehouse::load_wide_table(&conn, &table).unwrap();
        let observations = warehouse::read_observations(&conn, None).unwrap();
        let counties = warehouse::read_counties(&conn).unwrap();

        let sink = DuckDbSink::new(conn);
        let report = run_pipeline(
            &sink,
            &observations,
            &counties,
            &config(),
            PipelineOptions::default(),
            None,
        )
        .await
        .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.metrics_qualified, 3);

        let conn = sink.connection();
        assert_eq!(warehouse::read_statistics(&conn).unwrap().len(), 3);
        assert_eq!(warehouse::read_normalized(&conn).unwrap().len(), 36);
        assert_eq!(
            warehouse::get_record_count(&conn, "state_percentiles").unwrap(),
            report.rows.state_percentiles
        );
        assert!(warehouse::state_scores_complete(&conn, "01").unwrap());
        assert!(warehouse::state_scores_complete(&conn, "13").unwrap());
        assert_eq!(
            warehouse::get_meta(&conn, "last_run_id").unwrap().as_deref(),
            Some(report.run_id.as_str())
        );
    }

    #[tokio::test]
    async fn rerun_reproduces_tables() {
        let conn = warehouse::open_in_memory().unwrap();
        let table = read_wide_csv_from(csv().as_bytes()).unwrap();
        warehouse::load_wide_table(&conn, &table).unwrap();
        let observations = warehouse::read_observations(&conn, None).unwrap();
        let counties = warehouse::read_counties(&conn).unwrap();
        let sink = DuckDbSink::new(conn);

        let mut snapshots = Vec::new();
        for _ in 0..2 {
            run_pipeline(
                &sink,
                &observations,
                &counties,
                &config(),
                PipelineOptions::default(),
                None,
            )
            .await
            .unwrap();
            let conn = sink.connection();
            snapshots.push((
                warehouse::read_normalized(&conn).unwrap(),
                warehouse::read_aggregated(&conn, None).unwrap(),
            ));
        }
        assert_eq!(snapshots[0], snapshots[1]);
    }
}
