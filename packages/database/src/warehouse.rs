//! Warehouse schema, loads, and reads.
//!
//! The warehouse is one `DuckDB` file with two groups of tables:
//!
//! - inputs: `counties` and `raw_metrics`, replaced wholesale on each load,
//! - outputs: `metric_statistics`, `normalized_metrics`, `aggregated_scores`,
//!   `state_percentiles`, and `state_aggregated_scores`, dropped and
//!   recreated at the start of every pipeline run.
//!
//! A `_meta` table tracks when data was loaded, how clean it was, which run
//! produced the current outputs, and which states have complete
//! state-scoped tables.

use std::path::Path;

use duckdb::{Connection, Statement};
use sustainability_ingest::hierarchy::parse_metric_path;
use sustainability_ingest::DataQualitySummary;
use sustainability_ingest::wide_csv::WideTable;
use sustainability_models::{
    AggregatedScore, County, MeasureLevel, MetricStatistics, NormalizedObservation,
    RawObservation, StateAggregatedScore, StatePercentile,
};

use crate::DbError;

/// Number of rows per INSERT chunk (`DuckDB` handles large batches well).
const CHUNK_SIZE: usize = 5_000;

/// Counties need at least this many sub-measure scores to be listed.
pub const DEFAULT_MIN_SUB_MEASURES: usize = 8;

/// `_meta` key holding the serialized [`DataQualitySummary`] of the last
/// load.
pub const DATA_QUALITY_KEY: &str = "data_quality";

/// `_meta` key prefix marking a state's state-scoped tables complete.
const STATE_COMPLETE_PREFIX: &str = "state_scope_complete:";

/// Output tables, in the order they are dropped on reset.
pub const OUTPUT_TABLES: &[&str] = &[
    "metric_statistics",
    "normalized_metrics",
    "aggregated_scores",
    "state_percentiles",
    "state_aggregated_scores",
];

const INPUT_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS counties (
        county_id TEXT NOT NULL PRIMARY KEY,
        state_code TEXT NOT NULL,
        state TEXT NOT NULL,
        county_name TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS raw_metrics (
        county_id TEXT NOT NULL,
        metric_path TEXT NOT NULL,
        raw_value DOUBLE,
        is_missing BOOLEAN NOT NULL,
        unit TEXT,
        year TEXT,
        top_level TEXT,
        sub_measure TEXT,
        metric_group TEXT,
        sub_metric_name TEXT
    );

    CREATE TABLE IF NOT EXISTS _meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );";

const OUTPUT_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS metric_statistics (
        metric_path TEXT NOT NULL PRIMARY KEY,
        total_count BIGINT NOT NULL,
        valid_count BIGINT NOT NULL,
        mean DOUBLE NOT NULL,
        std_dev DOUBLE NOT NULL,
        min_value DOUBLE NOT NULL,
        max_value DOUBLE NOT NULL,
        median_value DOUBLE NOT NULL,
        is_reverse BOOLEAN NOT NULL,
        completeness_ratio DOUBLE NOT NULL
    );

    CREATE TABLE IF NOT EXISTS normalized_metrics (
        county_id TEXT NOT NULL,
        metric_path TEXT NOT NULL,
        raw_value DOUBLE,
        z_score DOUBLE,
        percentile_rank DOUBLE,
        is_missing BOOLEAN NOT NULL
    );

    CREATE TABLE IF NOT EXISTS aggregated_scores (
        county_id TEXT NOT NULL,
        measure_name TEXT NOT NULL,
        measure_level TEXT NOT NULL,
        parent_measure TEXT,
        normalized_score DOUBLE NOT NULL,
        percentile_rank DOUBLE NOT NULL,
        component_count INTEGER NOT NULL,
        missing_components INTEGER NOT NULL,
        completeness_ratio DOUBLE NOT NULL
    );

    CREATE TABLE IF NOT EXISTS state_percentiles (
        county_id TEXT NOT NULL,
        state_code TEXT NOT NULL,
        metric_path TEXT NOT NULL,
        raw_value DOUBLE,
        z_score DOUBLE,
        state_percentile DOUBLE,
        is_missing BOOLEAN NOT NULL
    );

    CREATE TABLE IF NOT EXISTS state_aggregated_scores (
        state_code TEXT NOT NULL,
        county_id TEXT NOT NULL,
        measure_name TEXT NOT NULL,
        measure_level TEXT NOT NULL,
        parent_measure TEXT,
        normalized_score DOUBLE NOT NULL,
        percentile_rank DOUBLE NOT NULL,
        component_count INTEGER NOT NULL,
        missing_components INTEGER NOT NULL,
        completeness_ratio DOUBLE NOT NULL
    );";

/// Aggregated score columns, shared by the national and state tables.
const SCORE_COLUMNS: &str = "county_id, measure_name, measure_level, parent_measure, \
     normalized_score, percentile_rank, component_count, missing_components, \
     completeness_ratio";

/// Opens (or creates) the warehouse and ensures the schema exists.
///
/// # Errors
///
/// Returns [`DbError`] if the connection or schema creation fails.
pub fn open(path: &Path) -> Result<Connection, DbError> {
    if let Some(parent) = path.parent() {
        crate::paths::ensure_dir(parent)?;
    }

    let conn = Connection::open(path)?;

    conn.execute_batch(
        "SET threads = 4;
         SET memory_limit = '512MB';",
    )?;

    create_schema(&conn)?;

    Ok(conn)
}

/// Opens the warehouse at the default path.
///
/// # Errors
///
/// Returns [`DbError`] if the connection or schema creation fails.
pub fn open_default() -> Result<Connection, DbError> {
    open(&crate::paths::warehouse_db_path())
}

/// Opens an empty in-memory warehouse.
///
/// # Errors
///
/// Returns [`DbError`] if the connection or schema creation fails.
pub fn open_in_memory() -> Result<Connection, DbError> {
    let conn = Connection::open_in_memory()?;
    create_schema(&conn)?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(INPUT_SCHEMA)?;
    conn.execute_batch(OUTPUT_SCHEMA)?;
    Ok(())
}

/// Drops and recreates every output table, clearing state completeness
/// marks with them.
///
/// # Errors
///
/// Returns [`DbError`] if a statement fails.
pub fn reset_outputs(conn: &Connection) -> Result<(), DbError> {
    let drops: String = OUTPUT_TABLES
        .iter()
        .map(|table| format!("DROP TABLE IF EXISTS {table};"))
        .collect();
    conn.execute_batch(&drops)?;
    conn.execute_batch(OUTPUT_SCHEMA)?;
    conn.execute(
        "DELETE FROM _meta WHERE starts_with(key, ?)",
        [STATE_COMPLETE_PREFIX],
    )?;
    log::debug!("Recreated {} output tables", OUTPUT_TABLES.len());
    Ok(())
}

/// Inserts `rows` in chunks of multi-row `VALUES` groups.
///
/// `bind` receives the index of the row's first parameter and must bind
/// exactly `columns` parameters. Returns the number of rows inserted.
fn insert_chunked<T>(
    conn: &Connection,
    insert: &str,
    columns: usize,
    rows: &[T],
    mut bind: impl FnMut(&mut Statement<'_>, usize, &T) -> duckdb::Result<()>,
) -> Result<u64, DbError> {
    if rows.is_empty() {
        return Ok(0);
    }

    let group = format!("({})", vec!["?"; columns].join(", "));
    let mut total_inserted = 0u64;

    for chunk in rows.chunks(CHUNK_SIZE) {
        let mut sql = format!("{insert} VALUES ");
        for i in 0..chunk.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&group);
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut param_idx = 1usize;
        for row in chunk {
            bind(&mut stmt, param_idx, row)?;
            param_idx += columns;
        }

        let inserted = stmt.raw_execute()?;
        total_inserted += u64::try_from(inserted).unwrap_or(0);
    }

    Ok(total_inserted)
}

fn count_to_sql(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn count_from_sql(value: i64, column: &str) -> Result<u32, DbError> {
    u32::try_from(value).map_err(|_| DbError::Conversion {
        message: format!("{column} out of range: {value}"),
    })
}

fn parse_level(value: &str) -> Result<MeasureLevel, DbError> {
    value.parse().map_err(|_| DbError::Conversion {
        message: format!("unknown measure level: {value:?}"),
    })
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Row counts from a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounts {
    /// Counties inserted.
    pub counties: u64,
    /// Raw observations inserted.
    pub observations: u64,
}

/// Replaces the warehouse inputs with a parsed wide table.
///
/// Output tables are reset too, since they no longer describe the data.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails.
pub fn load_wide_table(conn: &Connection, table: &WideTable) -> Result<LoadCounts, DbError> {
    conn.execute_batch("DELETE FROM raw_metrics; DELETE FROM counties;")?;
    reset_outputs(conn)?;

    let counts = LoadCounts {
        counties: insert_counties(conn, &table.counties)?,
        observations: insert_observations(conn, &table.observations)?,
    };

    set_meta(conn, "loaded_at", &chrono::Utc::now().to_rfc3339())?;
    set_meta(conn, "observation_count", &counts.observations.to_string())?;
    set_meta(conn, DATA_QUALITY_KEY, &serde_json::to_string(&table.quality)?)?;

    log::info!(
        "Loaded {} counties and {} observations",
        counts.counties,
        counts.observations
    );

    Ok(counts)
}

/// Returns the data-quality tallies recorded by the last load, if any.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails or the stored value does not
/// deserialize.
pub fn read_data_quality(conn: &Connection) -> Result<Option<DataQualitySummary>, DbError> {
    get_meta(conn, DATA_QUALITY_KEY)?
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(DbError::from)
}

/// Inserts counties, replacing any with the same FIPS code.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails.
pub fn insert_counties(conn: &Connection, counties: &[County]) -> Result<u64, DbError> {
    insert_chunked(
        conn,
        "INSERT OR REPLACE INTO counties (county_id, state_code, state, county_name)",
        4,
        counties,
        |stmt, idx, county| {
            stmt.raw_bind_parameter(idx, &county.county_id)?;
            stmt.raw_bind_parameter(idx + 1, &county.state_code)?;
            stmt.raw_bind_parameter(idx + 2, &county.state)?;
            stmt.raw_bind_parameter(idx + 3, &county.county_name)?;
            Ok(())
        },
    )
}

/// Inserts raw observations with their parsed hierarchy columns.
///
/// Hierarchy columns are `NULL` for paths that do not parse.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails.
pub fn insert_observations(
    conn: &Connection,
    observations: &[RawObservation],
) -> Result<u64, DbError> {
    insert_chunked(
        conn,
        "INSERT INTO raw_metrics (
            county_id, metric_path, raw_value, is_missing, unit, year,
            top_level, sub_measure, metric_group, sub_metric_name
        )",
        10,
        observations,
        |stmt, idx, obs| {
            let identity = parse_metric_path(&obs.metric_path).ok();
            stmt.raw_bind_parameter(idx, &obs.county_id)?;
            stmt.raw_bind_parameter(idx + 1, &obs.metric_path)?;
            stmt.raw_bind_parameter(idx + 2, obs.raw_value)?;
            stmt.raw_bind_parameter(idx + 3, obs.is_missing)?;
            stmt.raw_bind_parameter(idx + 4, obs.unit.as_deref())?;
            stmt.raw_bind_parameter(idx + 5, obs.year.as_deref())?;
            stmt.raw_bind_parameter(idx + 6, identity.as_ref().map(|i| i.top_level.as_str()))?;
            stmt.raw_bind_parameter(idx + 7, identity.as_ref().map(|i| i.sub_measure.as_str()))?;
            stmt.raw_bind_parameter(idx + 8, identity.as_ref().map(|i| i.metric_group.as_str()))?;
            stmt.raw_bind_parameter(
                idx + 9,
                identity.as_ref().map(|i| i.sub_metric_name.as_str()),
            )?;
            Ok(())
        },
    )
}

/// Returns every county, ordered by state then county name.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn read_counties(conn: &Connection) -> Result<Vec<County>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT county_id, state_code, state, county_name
         FROM counties
         ORDER BY state, county_name, county_id",
    )?;
    let mut rows = stmt.query([])?;

    let mut counties = Vec::new();
    while let Some(row) = rows.next()? {
        counties.push(County {
            county_id: row.get(0)?,
            state_code: row.get(1)?,
            state: row.get(2)?,
            county_name: row.get(3)?,
        });
    }
    Ok(counties)
}

/// Looks up one county by FIPS code.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn get_county(conn: &Connection, county_id: &str) -> Result<Option<County>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT county_id, state_code, state, county_name FROM counties WHERE county_id = ?",
    )?;
    let result = stmt.query_row([county_id], |row| {
        Ok(County {
            county_id: row.get(0)?,
            state_code: row.get(1)?,
            state: row.get(2)?,
            county_name: row.get(3)?,
        })
    });
    match result {
        Ok(county) => Ok(Some(county)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DbError::DuckDb(e)),
    }
}

/// Returns raw observations, optionally only those of one state's
/// counties.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn read_observations(
    conn: &Connection,
    state_code: Option<&str>,
) -> Result<Vec<RawObservation>, DbError> {
    let base = "SELECT county_id, metric_path, raw_value, is_missing, unit, year FROM raw_metrics";
    let sql = if state_code.is_some() {
        format!(
            "{base} WHERE county_id IN (SELECT county_id FROM counties WHERE state_code = ?)
             ORDER BY metric_path, county_id"
        )
    } else {
        format!("{base} ORDER BY metric_path, county_id")
    };

    let mut stmt = conn.prepare(&sql)?;
    if let Some(state) = state_code {
        stmt.raw_bind_parameter(1, state)?;
    }
    stmt.raw_execute()?;

    let mut observations = Vec::new();
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        observations.push(RawObservation {
            county_id: row.get(0)?,
            metric_path: row.get(1)?,
            raw_value: row.get(2)?,
            is_missing: row.get(3)?,
            unit: row.get(4)?,
            year: row.get(5)?,
        });
    }
    Ok(observations)
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Replaces the metric statistics table.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails.
pub fn replace_statistics(conn: &Connection, rows: &[MetricStatistics]) -> Result<u64, DbError> {
    conn.execute("DELETE FROM metric_statistics", [])?;
    insert_chunked(
        conn,
        "INSERT INTO metric_statistics (
            metric_path, total_count, valid_count, mean, std_dev, min_value,
            max_value, median_value, is_reverse, completeness_ratio
        )",
        10,
        rows,
        |stmt, idx, s| {
            stmt.raw_bind_parameter(idx, &s.metric_path)?;
            stmt.raw_bind_parameter(idx + 1, count_to_sql(s.total_count))?;
            stmt.raw_bind_parameter(idx + 2, count_to_sql(s.valid_count))?;
            stmt.raw_bind_parameter(idx + 3, s.mean)?;
            stmt.raw_bind_parameter(idx + 4, s.std_dev)?;
            stmt.raw_bind_parameter(idx + 5, s.min)?;
            stmt.raw_bind_parameter(idx + 6, s.max)?;
            stmt.raw_bind_parameter(idx + 7, s.median)?;
            stmt.raw_bind_parameter(idx + 8, s.is_reverse)?;
            stmt.raw_bind_parameter(idx + 9, s.completeness_ratio)?;
            Ok(())
        },
    )
}

/// Replaces the normalized rows of one metric.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails.
pub fn replace_normalized(
    conn: &Connection,
    metric_path: &str,
    rows: &[NormalizedObservation],
) -> Result<u64, DbError> {
    conn.execute(
        "DELETE FROM normalized_metrics WHERE metric_path = ?",
        [metric_path],
    )?;
    insert_chunked(
        conn,
        "INSERT INTO normalized_metrics (
            county_id, metric_path, raw_value, z_score, percentile_rank, is_missing
        )",
        6,
        rows,
        |stmt, idx, r| {
            stmt.raw_bind_parameter(idx, &r.county_id)?;
            stmt.raw_bind_parameter(idx + 1, &r.metric_path)?;
            stmt.raw_bind_parameter(idx + 2, r.raw_value)?;
            stmt.raw_bind_parameter(idx + 3, r.z_score)?;
            stmt.raw_bind_parameter(idx + 4, r.percentile_rank)?;
            stmt.raw_bind_parameter(idx + 5, r.is_missing)?;
            Ok(())
        },
    )
}

fn bind_score(stmt: &mut Statement<'_>, idx: usize, s: &AggregatedScore) -> duckdb::Result<()> {
    stmt.raw_bind_parameter(idx, &s.county_id)?;
    stmt.raw_bind_parameter(idx + 1, &s.measure_name)?;
    stmt.raw_bind_parameter(idx + 2, s.measure_level.as_ref())?;
    stmt.raw_bind_parameter(idx + 3, s.parent_measure.as_deref())?;
    stmt.raw_bind_parameter(idx + 4, s.normalized_score)?;
    stmt.raw_bind_parameter(idx + 5, s.percentile_rank)?;
    stmt.raw_bind_parameter(idx + 6, i64::from(s.component_count))?;
    stmt.raw_bind_parameter(idx + 7, i64::from(s.missing_components))?;
    stmt.raw_bind_parameter(idx + 8, s.completeness_ratio)?;
    Ok(())
}

/// Replaces the aggregated rows of one level.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails.
pub fn replace_aggregated(
    conn: &Connection,
    level: MeasureLevel,
    rows: &[AggregatedScore],
) -> Result<u64, DbError> {
    conn.execute(
        "DELETE FROM aggregated_scores WHERE measure_level = ?",
        [level.as_ref()],
    )?;
    insert_chunked(
        conn,
        &format!("INSERT INTO aggregated_scores ({SCORE_COLUMNS})"),
        9,
        rows,
        bind_score,
    )
}

/// Replaces the state percentile rows of one metric.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails.
pub fn replace_state_percentiles(
    conn: &Connection,
    metric_path: &str,
    rows: &[StatePercentile],
) -> Result<u64, DbError> {
    conn.execute(
        "DELETE FROM state_percentiles WHERE metric_path = ?",
        [metric_path],
    )?;
    insert_chunked(
        conn,
        "INSERT INTO state_percentiles (
            county_id, state_code, metric_path, raw_value, z_score,
            state_percentile, is_missing
        )",
        7,
        rows,
        |stmt, idx, r| {
            stmt.raw_bind_parameter(idx, &r.county_id)?;
            stmt.raw_bind_parameter(idx + 1, &r.state_code)?;
            stmt.raw_bind_parameter(idx + 2, &r.metric_path)?;
            stmt.raw_bind_parameter(idx + 3, r.raw_value)?;
            stmt.raw_bind_parameter(idx + 4, r.z_score)?;
            stmt.raw_bind_parameter(idx + 5, r.state_percentile)?;
            stmt.raw_bind_parameter(idx + 6, r.is_missing)?;
            Ok(())
        },
    )
}

/// Replaces the state-scoped aggregated rows of one level.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails.
pub fn replace_state_scores(
    conn: &Connection,
    level: MeasureLevel,
    rows: &[StateAggregatedScore],
) -> Result<u64, DbError> {
    conn.execute(
        "DELETE FROM state_aggregated_scores WHERE measure_level = ?",
        [level.as_ref()],
    )?;
    insert_chunked(
        conn,
        &format!("INSERT INTO state_aggregated_scores (state_code, {SCORE_COLUMNS})"),
        10,
        rows,
        |stmt, idx, r| {
            stmt.raw_bind_parameter(idx, &r.state_code)?;
            bind_score(stmt, idx + 1, &r.score)
        },
    )
}

/// Returns every metric statistics row, ordered by metric path.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn read_statistics(conn: &Connection) -> Result<Vec<MetricStatistics>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT metric_path, total_count, valid_count, mean, std_dev, min_value,
                max_value, median_value, is_reverse, completeness_ratio
         FROM metric_statistics
         ORDER BY metric_path",
    )?;
    let mut rows = stmt.query([])?;

    let mut statistics = Vec::new();
    while let Some(row) = rows.next()? {
        let total: i64 = row.get(1)?;
        let valid: i64 = row.get(2)?;
        #[allow(clippy::cast_sign_loss)]
        statistics.push(MetricStatistics {
            metric_path: row.get(0)?,
            total_count: total.max(0) as u64,
            valid_count: valid.max(0) as u64,
            mean: row.get(3)?,
            std_dev: row.get(4)?,
            min: row.get(5)?,
            max: row.get(6)?,
            median: row.get(7)?,
            is_reverse: row.get(8)?,
            completeness_ratio: row.get(9)?,
        });
    }
    Ok(statistics)
}

/// Returns every normalized row, ordered by metric then county.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn read_normalized(conn: &Connection) -> Result<Vec<NormalizedObservation>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT county_id, metric_path, raw_value, z_score, percentile_rank, is_missing
         FROM normalized_metrics
         ORDER BY metric_path, county_id",
    )?;
    let mut rows = stmt.query([])?;

    let mut normalized = Vec::new();
    while let Some(row) = rows.next()? {
        normalized.push(NormalizedObservation {
            county_id: row.get(0)?,
            metric_path: row.get(1)?,
            raw_value: row.get(2)?,
            z_score: row.get(3)?,
            percentile_rank: row.get(4)?,
            is_missing: row.get(5)?,
        });
    }
    Ok(normalized)
}

/// Collects an executed statement's rows as aggregated scores, reading
/// [`SCORE_COLUMNS`] from column `offset` onward.
fn read_scores(stmt: &mut Statement<'_>, offset: usize) -> Result<Vec<AggregatedScore>, DbError> {
    let mut scores = Vec::new();
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let level: String = row.get(offset + 2)?;
        let components: i64 = row.get(offset + 6)?;
        let missing: i64 = row.get(offset + 7)?;
        scores.push(AggregatedScore {
            county_id: row.get(offset)?,
            measure_name: row.get(offset + 1)?,
            measure_level: parse_level(&level)?,
            parent_measure: row.get(offset + 3)?,
            normalized_score: row.get(offset + 4)?,
            percentile_rank: row.get(offset + 5)?,
            component_count: count_from_sql(components, "component_count")?,
            missing_components: count_from_sql(missing, "missing_components")?,
            completeness_ratio: row.get(offset + 8)?,
        });
    }
    Ok(scores)
}

/// Returns aggregated rows, optionally of one level only.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails or a row holds an unknown level.
pub fn read_aggregated(
    conn: &Connection,
    level: Option<MeasureLevel>,
) -> Result<Vec<AggregatedScore>, DbError> {
    let filter = if level.is_some() {
        "WHERE measure_level = ?"
    } else {
        ""
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {SCORE_COLUMNS} FROM aggregated_scores {filter}
         ORDER BY measure_level, measure_name, county_id"
    ))?;
    if let Some(level) = level {
        stmt.raw_bind_parameter(1, level.as_ref())?;
    }
    stmt.raw_execute()?;
    read_scores(&mut stmt, 0)
}

/// Returns one county's national aggregated rows at every level.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails or a row holds an unknown level.
pub fn read_county_scores(
    conn: &Connection,
    county_id: &str,
) -> Result<Vec<AggregatedScore>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SCORE_COLUMNS} FROM aggregated_scores
         WHERE county_id = ?
         ORDER BY measure_level, measure_name"
    ))?;
    stmt.raw_bind_parameter(1, county_id)?;
    stmt.raw_execute()?;
    read_scores(&mut stmt, 0)
}

/// Returns one county's precomputed state-scoped rows at every level.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails or a row holds an unknown level.
pub fn read_state_county_scores(
    conn: &Connection,
    state_code: &str,
    county_id: &str,
) -> Result<Vec<AggregatedScore>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SCORE_COLUMNS} FROM state_aggregated_scores
         WHERE state_code = ? AND county_id = ?
         ORDER BY measure_level, measure_name"
    ))?;
    stmt.raw_bind_parameter(1, state_code)?;
    stmt.raw_bind_parameter(2, county_id)?;
    stmt.raw_execute()?;
    read_scores(&mut stmt, 0)
}

/// Returns one county's national normalized rows, ordered by metric.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn read_county_normalized(
    conn: &Connection,
    county_id: &str,
) -> Result<Vec<NormalizedObservation>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT county_id, metric_path, raw_value, z_score, percentile_rank, is_missing
         FROM normalized_metrics
         WHERE county_id = ?
         ORDER BY metric_path",
    )?;
    let mut rows = stmt.query([county_id])?;

    let mut normalized = Vec::new();
    while let Some(row) = rows.next()? {
        normalized.push(NormalizedObservation {
            county_id: row.get(0)?,
            metric_path: row.get(1)?,
            raw_value: row.get(2)?,
            z_score: row.get(3)?,
            percentile_rank: row.get(4)?,
            is_missing: row.get(5)?,
        });
    }
    Ok(normalized)
}

/// Returns one state's percentile rows, ordered by metric then county.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn read_state_percentiles(
    conn: &Connection,
    state_code: &str,
) -> Result<Vec<StatePercentile>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT county_id, state_code, metric_path, raw_value, z_score,
                state_percentile, is_missing
         FROM state_percentiles
         WHERE state_code = ?
         ORDER BY metric_path, county_id",
    )?;
    let mut rows = stmt.query([state_code])?;

    let mut percentiles = Vec::new();
    while let Some(row) = rows.next()? {
        percentiles.push(StatePercentile {
            county_id: row.get(0)?,
            state_code: row.get(1)?,
            metric_path: row.get(2)?,
            raw_value: row.get(3)?,
            z_score: row.get(4)?,
            state_percentile: row.get(5)?,
            is_missing: row.get(6)?,
        });
    }
    Ok(percentiles)
}

/// Marks the state-scoped tables complete for each state.
///
/// # Errors
///
/// Returns [`DbError`] if an upsert fails.
pub fn mark_states_complete(
    conn: &Connection,
    state_codes: &[String],
    marked_at: &str,
) -> Result<(), DbError> {
    for code in state_codes {
        set_meta(conn, &format!("{STATE_COMPLETE_PREFIX}{code}"), marked_at)?;
    }
    Ok(())
}

/// Returns `true` if the last run wrote every state-scoped table for a
/// state.
///
/// Rows alone are not enough: a run whose state batches partly failed
/// leaves rows behind without marking the state.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn state_scores_complete(conn: &Connection, state_code: &str) -> Result<bool, DbError> {
    Ok(get_meta(conn, &format!("{STATE_COMPLETE_PREFIX}{state_code}"))?.is_some())
}

/// Distinct sub-measure names with at least one aggregated row.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn known_sub_measures(conn: &Connection) -> Result<Vec<String>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT measure_name FROM aggregated_scores
         WHERE measure_level = ?
         ORDER BY measure_name",
    )?;
    let mut rows = stmt.query([MeasureLevel::SubMeasure.as_ref()])?;

    let mut names = Vec::new();
    while let Some(row) = rows.next()? {
        names.push(row.get(0)?);
    }
    Ok(names)
}

/// A county and how many sub-measures it has scores for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountyListing {
    /// The county.
    pub county: County,
    /// Sub-measure rows in the national aggregated scores.
    pub sub_measures: usize,
}

/// Counties with at least `min_sub_measures` sub-measure scores, ordered
/// by state then county name.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn list_counties(
    conn: &Connection,
    min_sub_measures: usize,
) -> Result<Vec<CountyListing>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT c.county_id, c.state_code, c.state, c.county_name, COUNT(a.measure_name)
         FROM counties c
         JOIN aggregated_scores a
           ON a.county_id = c.county_id AND a.measure_level = ?
         GROUP BY c.county_id, c.state_code, c.state, c.county_name
         HAVING COUNT(a.measure_name) >= ?
         ORDER BY c.state, c.county_name, c.county_id",
    )?;
    stmt.raw_bind_parameter(1, MeasureLevel::SubMeasure.as_ref())?;
    stmt.raw_bind_parameter(2, count_to_sql(u64::try_from(min_sub_measures).unwrap_or(u64::MAX)))?;
    stmt.raw_execute()?;

    let mut listings = Vec::new();
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let count: i64 = row.get(4)?;
        listings.push(CountyListing {
            county: County {
                county_id: row.get(0)?,
                state_code: row.get(1)?,
                state: row.get(2)?,
                county_name: row.get(3)?,
            },
            sub_measures: usize::try_from(count).unwrap_or(0),
        });
    }
    Ok(listings)
}

/// Returns the number of rows in a warehouse table.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn get_record_count(conn: &Connection, table: &str) -> Result<u64, DbError> {
    let mut stmt = conn.prepare(&format!("SELECT COUNT(*) FROM {table}"))?;
    let count: i64 = stmt.query_row([], |row| row.get(0))?;
    #[allow(clippy::cast_sign_loss)]
    Ok(count as u64)
}

/// Gets a metadata value from the `_meta` table.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>, DbError> {
    let mut stmt = conn.prepare("SELECT value FROM _meta WHERE key = ?")?;
    let result = stmt.query_row([key], |row| row.get(0));
    match result {
        Ok(v) => Ok(Some(v)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DbError::DuckDb(e)),
    }
}

/// Sets a metadata value in the `_meta` table.
///
/// # Errors
///
/// Returns [`DbError`] if the upsert fails.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO _meta (key, value) VALUES (?, ?)
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        duckdb::params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sustainability_ingest::wide_csv::read_wide_csv_from;

    const CSV: &str = "\
FIPS,State,County,PEOPLE_HEALTH_LengthOfLife_LifeExpectancy,PLACE_WATER_Quality,Bad
-,-,-,years,index,x
-,-,-,2021,2020,x
1001,AL,Autauga,76.1,$1,5
1003,AL,Baldwin,N/A,(2),6
";

    fn loaded() -> Connection {
        let conn = open_in_memory().unwrap();
        let table = read_wide_csv_from(CSV.as_bytes()).unwrap();
        load_wide_table(&conn, &table).unwrap();
        conn
    }

    fn score(county: &str, name: &str, level: MeasureLevel) -> AggregatedScore {
        AggregatedScore {
            county_id: county.to_string(),
            measure_name: name.to_string(),
            measure_level: level,
            parent_measure: (level != MeasureLevel::TopLevel).then(|| "People".to_string()),
            normalized_score: -0.25,
            percentile_rank: 40.0,
            component_count: 3,
            missing_components: 1,
            completeness_ratio: 2.0 / 3.0,
        }
    }

    #[test]
    fn load_replaces_inputs() {
        let conn = loaded();
        assert_eq!(get_record_count(&conn, "counties").unwrap(), 2);
        assert_eq!(get_record_count(&conn, "raw_metrics").unwrap(), 4);

        let table = read_wide_csv_from(CSV.as_bytes()).unwrap();
        load_wide_table(&conn, &table).unwrap();
        assert_eq!(get_record_count(&conn, "raw_metrics").unwrap(), 4);
        assert!(get_meta(&conn, "loaded_at").unwrap().is_some());
    }

    #[test]
    fn observations_round_trip_with_missing_values() {
        let conn = loaded();
        let obs = read_observations(&conn, None).unwrap();
        let baldwin = obs
            .iter()
            .find(|o| o.county_id == "01003" && o.metric_path.starts_with("PEOPLE"))
            .unwrap();
        assert!(baldwin.is_missing);
        assert_eq!(baldwin.raw_value, None);
        assert_eq!(baldwin.unit.as_deref(), Some("years"));

        let water = obs
            .iter()
            .find(|o| o.county_id == "01003" && o.metric_path == "PLACE_WATER_Quality")
            .unwrap();
        assert_eq!(water.raw_value, Some(-2.0));

        let top: Option<String> = conn
            .query_row(
                "SELECT top_level FROM raw_metrics WHERE metric_path = 'PLACE_WATER_Quality' LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(top.as_deref(), Some("Place"));
    }

    #[test]
    fn observations_filter_by_state() {
        let conn = loaded();
        insert_counties(
            &conn,
            &[County {
                county_id: "06037".to_string(),
                state_code: "06".to_string(),
                state: "CA".to_string(),
                county_name: "Los Angeles".to_string(),
            }],
        )
        .unwrap();
        insert_observations(&conn, &[RawObservation::new("06037", "PLACE_WATER_Quality", Some(3.0))])
            .unwrap();

        assert_eq!(read_observations(&conn, Some("06")).unwrap().len(), 1);
        assert_eq!(read_observations(&conn, Some("01")).unwrap().len(), 4);
    }

    #[test]
    fn replacing_a_level_keeps_other_levels() {
        let conn = open_in_memory().unwrap();
        replace_aggregated(
            &conn,
            MeasureLevel::SubMeasure,
            &[score("01001", "People_Health", MeasureLevel::SubMeasure)],
        )
        .unwrap();
        replace_aggregated(
            &conn,
            MeasureLevel::TopLevel,
            &[score("01001", "People", MeasureLevel::TopLevel)],
        )
        .unwrap();
        replace_aggregated(
            &conn,
            MeasureLevel::SubMeasure,
            &[score("01003", "People_Health", MeasureLevel::SubMeasure)],
        )
        .unwrap();

        let rows = read_aggregated(&conn, None).unwrap();
        assert_eq!(rows.len(), 2);
        let sub = read_aggregated(&conn, Some(MeasureLevel::SubMeasure)).unwrap();
        assert_eq!(sub[0].county_id, "01003");
        assert_eq!(sub[0], score("01003", "People_Health", MeasureLevel::SubMeasure));
    }

    #[test]
    fn state_rows_without_a_mark_are_incomplete() {
        let conn = open_in_memory().unwrap();
        replace_state_scores(
            &conn,
            MeasureLevel::TopLevel,
            &[StateAggregatedScore {
                state_code: "01".to_string(),
                score: score("01001", "People", MeasureLevel::TopLevel),
            }],
        )
        .unwrap();
        assert_eq!(read_state_county_scores(&conn, "01", "01001").unwrap().len(), 1);
        assert!(!state_scores_complete(&conn, "01").unwrap());

        mark_states_complete(&conn, &["01".to_string()], "2026-01-01T00:00:00Z").unwrap();
        assert!(state_scores_complete(&conn, "01").unwrap());
        assert!(!state_scores_complete(&conn, "06").unwrap());

        reset_outputs(&conn).unwrap();
        assert!(!state_scores_complete(&conn, "01").unwrap());
    }

    #[test]
    fn state_percentiles_filter_by_state() {
        let conn = open_in_memory().unwrap();
        let row = |county: &str, state: &str| StatePercentile {
            county_id: county.to_string(),
            state_code: state.to_string(),
            metric_path: "PLACE_WATER_Quality".to_string(),
            raw_value: Some(1.0),
            z_score: Some(0.1),
            state_percentile: Some(50.0),
            is_missing: false,
        };
        replace_state_percentiles(
            &conn,
            "PLACE_WATER_Quality",
            &[row("01001", "01"), row("06037", "06"), row("01003", "01")],
        )
        .unwrap();

        let rows = read_state_percentiles(&conn, "01").unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.county_id.as_str()).collect();
        assert_eq!(ids, ["01001", "01003"]);
    }

    #[test]
    fn load_records_data_quality() {
        let conn = loaded();
        let quality = read_data_quality(&conn).unwrap().unwrap();
        assert_eq!(quality.total_cells, 4);
        assert_eq!(quality.valid_cells, 3);
        assert_eq!(quality.sentinel_cells, 1);
        assert_eq!(quality.unparseable_cells, 0);
        assert_eq!(quality.malformed_columns, ["Bad"]);
        assert_eq!(read_data_quality(&open_in_memory().unwrap()).unwrap(), None);
    }

    #[test]
    fn lists_counties_with_enough_sub_measures() {
        let conn = loaded();
        let subs: Vec<AggregatedScore> = ["People_Health", "People_Wealth", "Place_Water"]
            .iter()
            .map(|name| score("01001", name, MeasureLevel::SubMeasure))
            .chain(std::iter::once(score(
                "01003",
                "People_Health",
                MeasureLevel::SubMeasure,
            )))
            .collect();
        replace_aggregated(&conn, MeasureLevel::SubMeasure, &subs).unwrap();

        let listed = list_counties(&conn, 2).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].county.county_name, "Autauga");
        assert_eq!(listed[0].sub_measures, 3);
        assert_eq!(list_counties(&conn, 1).unwrap().len(), 2);
        assert_eq!(
            known_sub_measures(&conn).unwrap(),
            ["People_Health", "People_Wealth", "Place_Water"]
        );
    }

    #[test]
    fn reset_drops_outputs_only() {
        let conn = loaded();
        replace_statistics(
            &conn,
            &[MetricStatistics {
                metric_path: "PLACE_WATER_Quality".to_string(),
                total_count: 2,
                valid_count: 2,
                mean: -0.5,
                std_dev: 2.1,
                min: -2.0,
                max: 1.0,
                median: -0.5,
                is_reverse: false,
                completeness_ratio: 1.0,
            }],
        )
        .unwrap();
        assert_eq!(read_statistics(&conn).unwrap()[0].valid_count, 2);

        reset_outputs(&conn).unwrap();
        assert!(read_statistics(&conn).unwrap().is_empty());
        assert_eq!(get_record_count(&conn, "raw_metrics").unwrap(), 4);
    }

    #[test]
    fn missing_meta_is_none() {
        let conn = open_in_memory().unwrap();
        assert_eq!(get_meta(&conn, "last_run_id").unwrap(), None);
        set_meta(&conn, "last_run_id", "a").unwrap();
        set_meta(&conn, "last_run_id", "b").unwrap();
        assert_eq!(get_meta(&conn, "last_run_id").unwrap().as_deref(), Some("b"));
    }
}
