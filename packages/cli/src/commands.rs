//! Implementations shared by the subcommands and the interactive menu.

use std::path::{Path, PathBuf};
use std::time::Instant;

use sustainability_cli_utils::{IndicatifProgress, MultiProgress};
use sustainability_database::sink::DuckDbSink;
use sustainability_database::views::{ScoreSource, county_view, submetric_details};
use sustainability_database::warehouse;
use sustainability_ingest::display_names::DisplayNames;
use sustainability_ingest::wide_csv::read_wide_csv;
use sustainability_models::NamingScheme;
use sustainability_normalize::report::{CountyReport, ScoreView, SubMeasureDetail};
use sustainability_normalize::summary::NormalizationSummary;
use sustainability_normalize::verify::verify;
use sustainability_normalize::{PipelineConfig, PipelineOptions, ReverseMetrics, run_pipeline};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Options for a normalization run.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    /// TOML file replacing the embedded configuration.
    pub config: Option<PathBuf>,
    /// TOML file whose `metrics` extend the reverse-metric list.
    pub reverse_metrics: Option<PathBuf>,
    /// Skip the state-scoped tables.
    pub skip_state: bool,
}

/// Options for a single-county view.
#[derive(Debug, Clone)]
pub struct CountyArgs {
    /// Five-digit FIPS code (leading zero optional).
    pub fips: String,
    /// Compare within the county's state instead of nationally.
    pub within_state: bool,
    /// Dimension naming scheme.
    pub scheme: NamingScheme,
    /// Print JSON instead of a table.
    pub json: bool,
    /// CSV of `database_name,display_name` pairs.
    pub display_names: Option<PathBuf>,
    /// TOML file replacing the embedded configuration.
    pub config: Option<PathBuf>,
    /// Sub-measure whose metrics to list instead of the overview.
    pub detail: Option<String>,
}

/// Loads the pipeline configuration, applying any reverse-metric
/// extension.
///
/// # Errors
///
/// Returns an error if either file cannot be read or is invalid.
pub fn resolve_config(
    config: Option<&Path>,
    reverse_metrics: Option<&Path>,
) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::embedded()?,
    };
    if let Some(path) = reverse_metrics {
        let added = config.reverse.extend(ReverseMetrics::load(path)?);
        log::info!(
            "Added {added} reverse metric(s) from {}, {} total",
            path.display(),
            config.reverse.len()
        );
    }
    Ok(config)
}

/// Reads a wide CSV and replaces the warehouse inputs with it.
///
/// # Errors
///
/// Returns an error if the CSV cannot be read or the load fails.
pub fn load(csv: &Path) -> CliResult {
    let start = Instant::now();
    let table = read_wide_csv(csv)?;
    table.quality.log();

    let conn = warehouse::open_default()?;
    let counts = warehouse::load_wide_table(&conn, &table)?;

    let quality = &table.quality;
    println!(
        "Loaded {} counties, {} observations across {} metrics in {:.1}s",
        counts.counties,
        counts.observations,
        table.metric_paths().len(),
        start.elapsed().as_secs_f64()
    );
    println!(
        "  cells: {} valid ({:.1}%), {} blank, {} marked missing, {} unparseable",
        quality.valid_cells,
        quality.valid_ratio() * 100.0,
        quality.blank_cells,
        quality.sentinel_cells,
        quality.unparseable_cells
    );
    if !quality.malformed_columns.is_empty() {
        println!(
            "  skipped {} malformed column(s): {}",
            quality.malformed_columns.len(),
            quality.malformed_columns.join(", ")
        );
    }
    if !quality.duplicate_columns.is_empty() {
        println!(
            "  skipped {} duplicate column(s): {}",
            quality.duplicate_columns.len(),
            quality.duplicate_columns.join(", ")
        );
    }
    if quality.skipped_rows > 0 {
        println!("  skipped {} row(s) without a usable FIPS code", quality.skipped_rows);
    }
    Ok(())
}

/// Runs the normalization pipeline over the loaded data.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the warehouse cannot
/// be read, or the output tables cannot be reset.
pub async fn run(multi: &MultiProgress, args: &RunArgs) -> CliResult {
    let config = resolve_config(args.config.as_deref(), args.reverse_metrics.as_deref())?;

    let conn = warehouse::open_default()?;
    let observations = warehouse::read_observations(&conn, None)?;
    if observations.is_empty() {
        log::warn!("No observations in the warehouse; run `load` first");
        return Ok(());
    }
    let counties = warehouse::read_counties(&conn)?;

    let sink = DuckDbSink::new(conn);
    let progress = IndicatifProgress::metrics_bar(multi, "Screening metrics");
    let report = run_pipeline(
        &sink,
        &observations,
        &counties,
        &config,
        PipelineOptions {
            include_state_scope: !args.skip_state,
        },
        Some(progress),
    )
    .await?;

    println!("Run {}", report.run_id);
    println!(
        "  metrics: {} seen, {} qualified, {} excluded, {} malformed",
        report.metrics_seen,
        report.metrics_qualified,
        report.exclusions.len(),
        report.malformed_paths.len()
    );
    for excluded in &report.exclusions {
        println!("    {}: {}", excluded.metric_path, excluded.reason);
    }
    println!(
        "  rows: {} statistics, {} normalized, {} metric groups, {} sub-measures, {} top levels",
        report.rows.statistics,
        report.rows.normalized,
        report.rows.metric_groups,
        report.rows.sub_measures,
        report.rows.top_levels
    );
    if !args.skip_state {
        println!(
            "  state scope: {} percentiles, {} scores",
            report.rows.state_percentiles, report.rows.state_scores
        );
    }
    for failed in &report.failed_batches {
        println!(
            "  FAILED {} {} after {} attempt(s): {}",
            failed.stage, failed.key, failed.attempts, failed.message
        );
    }
    if !report.is_complete() {
        log::error!(
            "{} batch(es) failed; output tables are incomplete",
            report.failed_batches.len()
        );
    }
    Ok(())
}

fn percent(ratio: Option<f64>) -> String {
    ratio.map_or_else(|| "n/a".to_string(), |r| format!("{:.1}%", r * 100.0))
}

/// Prints a summary of the current output tables.
///
/// # Errors
///
/// Returns an error if the warehouse cannot be read.
pub fn summary() -> CliResult {
    let conn = warehouse::open_default()?;
    let summary = NormalizationSummary::from_tables(
        &warehouse::read_statistics(&conn)?,
        &warehouse::read_normalized(&conn)?,
        &warehouse::read_aggregated(&conn, None)?,
    );
    summary.log();

    if let Some(quality) = warehouse::read_data_quality(&conn)? {
        println!(
            "Loaded cells: {} ({} valid, {} blank, {} marked missing, {} unparseable)",
            quality.total_cells,
            quality.valid_cells,
            quality.blank_cells,
            quality.sentinel_cells,
            quality.unparseable_cells
        );
        if !quality.malformed_columns.is_empty() || !quality.duplicate_columns.is_empty() {
            println!(
                "Skipped columns: {} malformed, {} duplicate",
                quality.malformed_columns.len(),
                quality.duplicate_columns.len()
            );
        }
    }
    if let Some(run_id) = warehouse::get_meta(&conn, "last_run_id")? {
        let at = warehouse::get_meta(&conn, "last_run_at")?.unwrap_or_default();
        println!("Last run {run_id} at {at}");
    }
    println!(
        "Metrics: {} ({} reverse, {} high quality), average completeness {}",
        summary.metrics,
        summary.reverse_metrics,
        summary.high_quality_metrics,
        percent(summary.avg_completeness)
    );
    println!(
        "Normalized rows: {} ({} valid, {} missing)",
        summary.normalized_rows, summary.valid_rows, summary.missing_rows
    );
    println!("{:<14} {:>10} {:>10} {:>14}", "LEVEL", "ROWS", "MEASURES", "COMPLETENESS");
    for level in &summary.levels {
        println!(
            "{:<14} {:>10} {:>10} {:>14}",
            level.level.as_ref(),
            level.rows,
            level.measures,
            percent(level.avg_completeness)
        );
    }
    Ok(())
}

/// Checks the output tables for internal consistency.
///
/// Returns `true` if every check passed.
///
/// # Errors
///
/// Returns an error if the warehouse cannot be read.
pub fn verify_outputs() -> Result<bool, Box<dyn std::error::Error>> {
    let conn = warehouse::open_default()?;
    let report = verify(
        &warehouse::read_statistics(&conn)?,
        &warehouse::read_normalized(&conn)?,
        &warehouse::read_aggregated(&conn, None)?,
    );
    report.log();

    let failed_zscores = report.zscore_checks.iter().filter(|c| !c.passed()).count();
    println!(
        "Z-score checks: {} of {} passed",
        report.zscore_checks.len() - failed_zscores,
        report.zscore_checks.len()
    );
    println!(
        "Percentile rows: {} checked, {} violation(s)",
        report.percentile_rows_checked,
        report.percentile_violations.len()
    );
    println!(
        "Direction violations: {}",
        report.monotonicity_violations.len()
    );
    println!(
        "Completeness violations: {}",
        report.completeness_violations.len()
    );
    println!("{}", if report.passed() { "PASSED" } else { "FAILED" });
    Ok(report.passed())
}

/// Lists counties with enough sub-measure scores to display.
///
/// # Errors
///
/// Returns an error if the warehouse cannot be read.
pub fn counties(min_sub_measures: usize) -> CliResult {
    let conn = warehouse::open_default()?;
    let listings = warehouse::list_counties(&conn, min_sub_measures)?;

    println!("{:<7} {:<6} {:<32} SUB-MEASURES", "FIPS", "STATE", "COUNTY");
    println!("{}", "-".repeat(60));
    for listing in &listings {
        println!(
            "{:<7} {:<6} {:<32} {}",
            listing.county.county_id,
            listing.county.state,
            listing.county.county_name,
            listing.sub_measures
        );
    }
    println!("{} counties with at least {min_sub_measures} sub-measures", listings.len());
    Ok(())
}

/// Shows one county's scores.
///
/// # Errors
///
/// Returns an error if the county is unknown or the warehouse cannot be
/// read.
pub fn county(args: &CountyArgs) -> CliResult {
    let config = resolve_config(args.config.as_deref(), None)?;
    let names = match &args.display_names {
        Some(path) => DisplayNames::load(path)?,
        None => DisplayNames::default(),
    };
    let fips = sustainability_models::county::pad_fips(&args.fips)
        .ok_or_else(|| format!("invalid FIPS code: {:?}", args.fips))?;

    let conn = warehouse::open_default()?;
    if let Some(sub_measure) = &args.detail {
        let (detail, source) =
            submetric_details(&conn, &fips, sub_measure, args.within_state, &names)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&detail)?);
        } else {
            print_detail(&detail, source);
        }
        return Ok(());
    }

    let (report, source) = county_view(
        &conn,
        &fips,
        args.within_state,
        args.scheme,
        &names,
        config.min_group_size,
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_county(&report, source);
    }
    Ok(())
}

fn score_cell(score: Option<&ScoreView>) -> String {
    score.map_or_else(
        || "no data".to_string(),
        |s| {
            format!(
                "{:>5.1}  {} ({}/{} components)",
                s.percentile_rank,
                s.label,
                s.component_count - s.missing_components,
                s.component_count
            )
        },
    )
}

fn print_county(report: &CountyReport, source: ScoreSource) {
    let county = &report.county;
    println!(
        "{} County, {} ({}), compared {}",
        county.county_name,
        county.state,
        county.county_id,
        report.scope.context()
    );
    if source == ScoreSource::OnDemand {
        println!("(state scores computed on demand; run without --skip-state to precompute)");
    }
    for dimension in &report.dimensions {
        println!();
        println!(
            "{:<28} {}",
            dimension.display_name,
            score_cell(dimension.score.as_ref())
        );
        for measure in &dimension.sub_measures {
            println!(
                "  {:<26} {}",
                measure.display_name,
                score_cell(measure.score.as_ref())
            );
        }
    }
}

fn print_detail(detail: &SubMeasureDetail, source: ScoreSource) {
    let county = &detail.county;
    println!(
        "{} County, {} ({}): {} metrics, compared {}",
        county.county_name,
        county.state,
        county.county_id,
        detail.display_name,
        detail.scope.context()
    );
    if source == ScoreSource::OnDemand {
        println!("(state percentiles computed on demand)");
    }
    if detail.metrics.is_empty() {
        println!("no data");
        return;
    }
    println!(
        "{:<32} {:>14} {:<10} {:<6} {:>6}  LABEL",
        "METRIC", "VALUE", "UNIT", "YEAR", "PCT"
    );
    for metric in &detail.metrics {
        println!(
            "{:<32} {:>14.2} {:<10} {:<6} {:>6.1}  {}{}",
            metric.display_name,
            metric.raw_value,
            metric.unit.as_deref().unwrap_or("-"),
            metric.year.as_deref().unwrap_or("-"),
            metric.percentile_rank,
            metric.label,
            if metric.is_reverse { " (lower is better)" } else { "" }
        );
    }
}
