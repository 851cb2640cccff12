//! Per-county score views served from the warehouse.
//!
//! National scores always come from `aggregated_scores`. State-scoped
//! scores come from `state_aggregated_scores` when the last run marked the
//! county's state complete; otherwise that one state is recomputed from
//! the raw observations and stored statistics. Both paths rank with the
//! same code, so they agree row for row. Leaf-metric drill-downs follow
//! the same rule with `state_percentiles`.

use std::collections::BTreeMap;


use duckdb::Connection;
use sustainability_ingest::display_names::DisplayNames;
use sustainability_ingest::hierarchy::parse_metric_path;
use sustainability_models::{
    AggregatedScore, ComparisonScope, County, MetricStatistics, NamingScheme, RawObservation,
};
use sustainability_normalize::report::{
    CountyReport, SubMeasureDetail, county_report, sub_measure_detail,
};
use sustainability_normalize::scope::{StateIndex, compute_state_scope, state_percentiles};
use sustainability_normalize::stats::is_normalizable;

use crate::DbError;
use crate::warehouse;

/// Where a county's scores were read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreSource {
    /// National aggregated scores.
    National,
    /// Precomputed state-scoped scores.
    Precomputed,
    /// State-scoped scores computed for this request.
    OnDemand,
}

/// A county's aggregated rows in one comparison scope.
#[derive(Debug, Clone, PartialEq)]
pub struct CountyScores {
    /// The county.
    pub county: County,
    /// Comparison population.
    pub scope: ComparisonScope,
    /// How the rows were obtained.
    pub source: ScoreSource,
    /// Rows at every level, ordered by level then measure name.
    pub rows: Vec<AggregatedScore>,
}

/// Loads one county's aggregated rows, nationally or within its state.
///
/// # Errors
///
/// Returns [`DbError::CountyNotFound`] for an unknown FIPS code, or
/// [`DbError`] if a query fails.
pub fn county_scores(
    conn: &Connection,
    county_id: &str,
    within_state: bool,
    min_group_size: usize,
) -> Result<CountyScores, DbError> {
    let county = find_county(conn, county_id)?;

    let (scope, source, mut rows) = if within_state {
        let state = county.state_code.clone();
        if warehouse::state_scores_complete(conn, &state)? {
            let rows = warehouse::read_state_county_scores(conn, &state, county_id)?;
            (ComparisonScope::State(state), ScoreSource::Precomputed, rows)
        } else {
            log::info!(
                "State scores for {state} are missing or incomplete, computing on demand"
            );
            let rows = compute_county_in_state(conn, &county, min_group_size)?;
            (ComparisonScope::State(state), ScoreSource::OnDemand, rows)
        }
    } else {
        let rows = warehouse::read_county_scores(conn, county_id)?;
        (ComparisonScope::National, ScoreSource::National, rows)
    };

    rows.sort_by(|a, b| {
        a.measure_level
            .cmp(&b.measure_level)
            .then_with(|| a.measure_name.cmp(&b.measure_name))
    });

    Ok(CountyScores {
        county,
        scope,
        source,
        rows,
    })
}

fn find_county(conn: &Connection, county_id: &str) -> Result<County, DbError> {
    warehouse::get_county(conn, county_id)?.ok_or_else(|| DbError::CountyNotFound {
        county_id: county_id.to_string(),
    })
}

/// Ranks the county's state from raw observations and keeps the county's
/// rows.
fn compute_county_in_state(
    conn: &Connection,
    county: &County,
    min_group_size: usize,
) -> Result<Vec<AggregatedScore>, DbError> {
    let qualified: Vec<_> = warehouse::read_statistics(conn)?
        .into_iter()
        .filter(is_normalizable)
        .collect();
    let observations = warehouse::read_observations(conn, Some(county.state_code.as_str()))?;
    let counties = warehouse::read_counties(conn)?;

    let output = compute_state_scope(
        &qualified,
        &observations,
        &counties,
        Some(county.state_code.as_str()),
        min_group_size,
    );

    Ok(output
        .scores
        .into_iter()
        .filter(|s| s.score.county_id == county.county_id)
        .map(|s| s.score)
        .collect())
}

/// Builds the dashboard view of one county.
///
/// # Errors
///
/// Returns [`DbError`] if the county is unknown or a query fails.
pub fn county_view(
    conn: &Connection,
    county_id: &str,
    within_state: bool,
    scheme: NamingScheme,
    names: &DisplayNames,
    min_group_size: usize,
) -> Result<(CountyReport, ScoreSource), DbError> {
    let scores = county_scores(conn, county_id, within_state, min_group_size)?;
    let known = warehouse::known_sub_measures(conn)?;
    let report = county_report(
        &scores.county,
        scores.scope,
        scheme,
        &scores.rows,
        &known,
        names,
    );
    Ok((report, scores.source))
}

/// Resolves a sub-measure name case-insensitively against the scored
/// sub-measures.
fn resolve_sub_measure(conn: &Connection, name: &str) -> Result<String, DbError> {
    warehouse::known_sub_measures(conn)?
        .into_iter()
        .find(|known| known.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| DbError::SubMeasureNotFound {
            name: name.to_string(),
        })
}

/// Lists the leaf metrics behind one of a county's sub-measures with their
/// raw values and percentiles, nationally or within the county's state.
///
/// `sub_measure` is an internal sub-measure name such as `People_Health`,
/// matched without regard to case.
///
/// # Errors
///
/// Returns [`DbError::CountyNotFound`] or [`DbError::SubMeasureNotFound`]
/// for unknown names, or [`DbError`] if a query fails.
pub fn submetric_details(
    conn: &Connection,
    county_id: &str,
    sub_measure: &str,
    within_state: bool,
    names: &DisplayNames,
) -> Result<(SubMeasureDetail, ScoreSource), DbError> {
    let county = find_county(conn, county_id)?;
    let measure_name = resolve_sub_measure(conn, sub_measure)?;
    let statistics = warehouse::read_statistics(conn)?;
    let state = county.state_code.clone();
    let observations = warehouse::read_observations(conn, Some(state.as_str()))?;

    let (scope, source, percentiles) = if !within_state {
        let ranks: BTreeMap<String, f64> = warehouse::read_county_normalized(conn, county_id)?
            .into_iter()
            .filter_map(|row| row.percentile_rank.map(|p| (row.metric_path, p)))
            .collect();
        (ComparisonScope::National, ScoreSource::National, ranks)
    } else if warehouse::state_scores_complete(conn, &state)? {
        let ranks: BTreeMap<String, f64> = warehouse::read_state_percentiles(conn, &state)?
            .into_iter()
            .filter(|row| row.county_id == county.county_id)
            .filter_map(|row| row.state_percentile.map(|p| (row.metric_path, p)))
            .collect();
        (ComparisonScope::State(state), ScoreSource::Precomputed, ranks)
    } else {
        log::info!(
            "State percentiles for {state} are missing or incomplete, ranking {measure_name} on demand"
        );
        let ranks = rank_in_state(conn, &county, &measure_name, &statistics, &observations)?;
        (ComparisonScope::State(state), ScoreSource::OnDemand, ranks)
    };

    let detail = sub_measure_detail(
        &county,
        scope,
        &measure_name,
        &observations,
        &percentiles,
        &statistics,
        names,
    );
    Ok((detail, source))
}

/// Ranks the county within its state on every normalizable metric of one
/// sub-measure.
fn rank_in_state(
    conn: &Connection,
    county: &County,
    measure_name: &str,
    statistics: &[MetricStatistics],
    observations: &[RawObservation],
) -> Result<BTreeMap<String, f64>, DbError> {
    let states = StateIndex::new(&warehouse::read_counties(conn)?);
    let mut ranks = BTreeMap::new();

    for stats in statistics.iter().filter(|s| is_normalizable(s)) {
        let in_sub_measure = parse_metric_path(&stats.metric_path)
            .is_ok_and(|id| id.sub_measure_name() == measure_name);
        if !in_sub_measure {
            continue;
        }
        let rows: Vec<&RawObservation> = observations
            .iter()
            .filter(|o| o.metric_path == stats.metric_path)
            .collect();
        let own = state_percentiles(stats, &rows, &states)
            .into_iter()
            .find(|row| row.county_id == county.county_id)
            .and_then(|row| row.state_percentile);
        if let Some(percentile) = own {
            ranks.insert(stats.metric_path.clone(), percentile);
        }
    }

    Ok(ranks)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use sustainability_ingest::wide_csv::read_wide_csv_from;
    use sustainability_models::{
        MeasureLevel, NormalizedObservation, StateAggregatedScore, StatePercentile,
    };
    use sustainability_normalize::sink::ScoreSink;
    use sustainability_normalize::{PipelineConfig, PipelineOptions, RetryPolicy, run_pipeline};

    use super::*;
    use crate::sink::DuckDbSink;

    fn csv() -> String {
        let mut csv = String::from(
            "FIPS,State,County,PEOPLE_HEALTH_Life_Expectancy,PEOPLE_HEALTH_Life_Mortality,PEOPLE_WEALTH_Income,PLACE_WATER\n\
             -,-,-,years,rate,usd,index\n\
             -,-,-,2021,2021,2021,2020\n",
        );
        for i in 0..14u32 {
            let (state, fips) = if i < 7 { ("AL", 1001 + i * 2) } else { ("GA", 13001 + i * 2) };
            let x = f64::from(i);
            let mortality = if i % 4 == 1 { "N/A".to_string() } else { format!("{:.1}", 900.0 - 3.0 * x * x) };
            csv.push_str(&format!(
                "{fips},{state},County {i},{:.1},{mortality},\"${:.0}\",{:.3}\n",
                70.0 + (x * 1.3).cos() * 4.0,
                40_000.0 + 1_500.0 * x,
                (x * 0.7).sin(),
            ));
        }
        csv
    }

    fn loaded() -> (Connection, Vec<RawObservation>, Vec<County>) {
        let conn = warehouse::open_in_memory().unwrap();
        let table = read_wide_csv_from(csv().as_bytes()).unwrap();
        warehouse::load_wide_table(&conn, &table).unwrap();
        let observations = warehouse::read_observations(&conn, None).unwrap();
        let counties = warehouse::read_counties(&conn).unwrap();
        (conn, observations, counties)
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::embedded().unwrap();
        config.retry = RetryPolicy::immediate(1);
        config
    }

    async fn scored_warehouse(include_state_scope: bool) -> Connection {
        let (conn, observations, counties) = loaded();
        let sink = DuckDbSink::new(conn);
        run_pipeline(
            &sink,
            &observations,
            &counties,
            &config(),
            PipelineOptions { include_state_scope },
            None,
        )
        .await
        .unwrap();
        sink.into_inner()
    }

    /// Rejects state-scoped sub-measure writes and passes everything else
    /// through.
    struct RejectStateSubMeasures(DuckDbSink);

    #[async_trait]
    impl ScoreSink for RejectStateSubMeasures {
        type Error = DbError;

        async fn reset(&self) -> Result<(), DbError> {
            self.0.reset().await
        }

        async fn write_statistics(&self, rows: &[MetricStatistics]) -> Result<(), DbError> {
            self.0.write_statistics(rows).await
        }

        async fn write_normalized(
            &self,
            metric_path: &str,
            rows: &[NormalizedObservation],
        ) -> Result<(), DbError> {
            self.0.write_normalized(metric_path, rows).await
        }

        async fn write_aggregated(
            &self,
            level: MeasureLevel,
            rows: &[AggregatedScore],
        ) -> Result<(), DbError> {
            self.0.write_aggregated(level, rows).await
        }

        async fn write_state_percentiles(
            &self,
            metric_path: &str,
            rows: &[StatePercentile],
        ) -> Result<(), DbError> {
            self.0.write_state_percentiles(metric_path, rows).await
        }

        async fn write_state_scores(
            &self,
            level: MeasureLevel,
            rows: &[StateAggregatedScore],
        ) -> Result<(), DbError> {
            if level == MeasureLevel::SubMeasure {
                return Err(DbError::Conversion {
                    message: "rejected".to_string(),
                });
            }
            self.0.write_state_scores(level, rows).await
        }

        async fn mark_states_complete(&self, state_codes: &[String]) -> Result<(), DbError> {
            self.0.mark_states_complete(state_codes).await
        }

        async fn record_run(
            &self,
            run_id: &str,
            finished_at: DateTime<Utc>,
        ) -> Result<(), DbError> {
            self.0.record_run(run_id, finished_at).await
        }
    }

    fn assert_same_rows(a: &[AggregatedScore], b: &[AggregatedScore]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert_eq!(x.measure_name, y.measure_name);
            assert_eq!(x.measure_level, y.measure_level);
            assert_eq!(x.component_count, y.component_count);
            assert_eq!(x.missing_components, y.missing_components);
            assert!((x.percentile_rank - y.percentile_rank).abs() < 1e-9);
            assert!((x.normalized_score - y.normalized_score).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn on_demand_state_scores_match_precomputed() {
        let precomputed = scored_warehouse(true).await;
        let on_demand = scored_warehouse(false).await;

        for county in ["01001", "01005", "13027"] {
            let fast = county_scores(&precomputed, county, true, 2).unwrap();
            let slow = county_scores(&on_demand, county, true, 2).unwrap();
            assert_eq!(fast.source, ScoreSource::Precomputed);
            assert_eq!(slow.source, ScoreSource::OnDemand);
            assert_eq!(fast.scope, slow.scope);
            assert!(!fast.rows.is_empty());
            assert_same_rows(&fast.rows, &slow.rows);
        }
    }

    #[tokio::test]
    async fn national_scores_differ_from_state_scope() {
        let conn = scored_warehouse(true).await;
        let national = county_scores(&conn, "01001", false, 2).unwrap();
        assert_eq!(national.scope, ComparisonScope::National);
        assert_eq!(national.source, ScoreSource::National);
        assert!(
            national
                .rows
                .iter()
                .any(|r| r.measure_level == MeasureLevel::TopLevel && r.measure_name == "People")
        );

        let state = county_scores(&conn, "01001", true, 2).unwrap();
        assert_eq!(state.scope, ComparisonScope::State("01".to_string()));
        assert_eq!(national.rows.len(), state.rows.len());
    }

    #[tokio::test]
    async fn unknown_county_is_an_error() {
        let conn = scored_warehouse(false).await;
        assert!(matches!(
            county_scores(&conn, "99999", false, 2),
            Err(DbError::CountyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn county_view_covers_every_dimension() {
        let conn = scored_warehouse(true).await;
        let (report, source) = county_view(
            &conn,
            "13027",
            false,
            NamingScheme::V2,
            &DisplayNames::default(),
            2,
        )
        .unwrap();
        assert_eq!(source, ScoreSource::National);
        assert_eq!(report.dimensions.len(), 3);
        assert_eq!(report.dimensions[0].display_name, "Society");
        assert!(report.dimensions[1].score.is_none());
        assert_eq!(report.dimensions[0].sub_measures.len(), 2);
    }

    #[tokio::test]
    async fn partial_state_tables_fall_back_to_on_demand() {
        let (conn, observations, counties) = loaded();
        let sink = RejectStateSubMeasures(DuckDbSink::new(conn));
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
        assert_eq!(report.failed_batches.len(), 1);

        let partial = sink.0.into_inner();
        assert!(warehouse::get_record_count(&partial, "state_aggregated_scores").unwrap() > 0);
        assert!(!warehouse::state_scores_complete(&partial, "01").unwrap());

        let complete = scored_warehouse(true).await;
        let expected = county_scores(&complete, "01001", true, 2).unwrap();
        let served = county_scores(&partial, "01001", true, 2).unwrap();
        assert_eq!(served.source, ScoreSource::OnDemand);
        assert!(
            served
                .rows
                .iter()
                .any(|r| r.measure_level == MeasureLevel::SubMeasure)
        );
        assert_same_rows(&expected.rows, &served.rows);
    }

    #[tokio::test]
    async fn drill_down_agrees_across_state_sources() {
        let precomputed = scored_warehouse(true).await;
        let on_demand = scored_warehouse(false).await;
        let names = DisplayNames::default();

        let (fast, fast_source) =
            submetric_details(&precomputed, "01001", "people_health", true, &names).unwrap();
        let (slow, slow_source) =
            submetric_details(&on_demand, "01001", "People_Health", true, &names).unwrap();

        assert_eq!(fast_source, ScoreSource::Precomputed);
        assert_eq!(slow_source, ScoreSource::OnDemand);
        assert_eq!(fast.measure_name, "People_Health");
        assert_eq!(fast.scope, ComparisonScope::State("01".to_string()));
        assert_eq!(fast.metrics.len(), 2);
        assert_eq!(fast, slow);
    }

    #[tokio::test]
    async fn national_drill_down_uses_national_percentiles() {
        let conn = scored_warehouse(false).await;
        let (detail, source) =
            submetric_details(&conn, "13027", "People_Health", false, &DisplayNames::default())
                .unwrap();
        assert_eq!(source, ScoreSource::National);
        assert_eq!(detail.scope, ComparisonScope::National);

        // Mortality is missing for this county, so only one metric is ranked.
        assert_eq!(detail.metrics.len(), 1);
        let metric = &detail.metrics[0];
        assert_eq!(metric.metric_path, "PEOPLE_HEALTH_Life_Expectancy");
        assert_eq!(metric.unit.as_deref(), Some("years"));
        assert_eq!(metric.year.as_deref(), Some("2021"));

        let normalized = warehouse::read_county_normalized(&conn, "13027").unwrap();
        let row = normalized
            .iter()
            .find(|r| r.metric_path == metric.metric_path)
            .unwrap();
        assert_eq!(row.percentile_rank, Some(metric.percentile_rank));
        assert_eq!(row.raw_value, Some(metric.raw_value));
    }

    #[tokio::test]
    async fn drill_down_rejects_unknown_sub_measure() {
        let conn = scored_warehouse(false).await;
        assert!(matches!(
            submetric_details(&conn, "01001", "People_Nothing", false, &DisplayNames::default()),
            Err(DbError::SubMeasureNotFound { .. })
        ));
    }
}
