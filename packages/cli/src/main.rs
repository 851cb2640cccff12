#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Command-line entry point for the county sustainability toolchain.
//!
//! `load` puts a wide CSV into the `DuckDB` warehouse, `run` normalizes and
//! aggregates it, and the remaining subcommands inspect the results. With
//! no subcommand an interactive menu offers the same actions.
//!
//! Uses `indicatif-log-bridge` (via [`sustainability_cli_utils::init_logger`])
//! to route `log` output through `indicatif::MultiProgress` so that log
//! lines and progress bars never fight for the terminal.

mod commands;
mod interactive;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sustainability_database::warehouse::DEFAULT_MIN_SUB_MEASURES;
use sustainability_models::NamingScheme;

use crate::commands::{CountyArgs, RunArgs};

#[derive(Parser)]
#[command(
    name = "sustainability",
    about = "County sustainability metric normalization and scoring"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a wide metrics CSV into the warehouse, replacing earlier data
    Load {
        /// Path to the CSV (three header rows: metric, unit, year)
        #[arg(long)]
        csv: PathBuf,
    },
    /// Compute statistics, normalized values, and aggregated scores
    Run {
        /// Pipeline configuration TOML (defaults to the embedded one)
        #[arg(long)]
        config: Option<PathBuf>,
        /// TOML file with `metrics = [...]` to add to the reverse-metric list
        #[arg(long)]
        reverse_metrics: Option<PathBuf>,
        /// Skip precomputing state-scoped percentiles and scores
        #[arg(long)]
        skip_state: bool,
    },
    /// Summarize the current output tables
    Summary,
    /// Check the output tables for internal consistency
    Verify,
    /// List counties with enough data to display
    Counties {
        /// Minimum number of sub-measure scores
        #[arg(long, default_value_t = DEFAULT_MIN_SUB_MEASURES)]
        min_sub_measures: usize,
    },
    /// Show one county's dimension and sub-measure scores
    County {
        /// County FIPS code (e.g. "01001" or "1001")
        fips: String,
        /// Compare against counties in the same state instead of nationally
        #[arg(long)]
        state: bool,
        /// Dimension naming scheme: v1 (People/Productivity/Place) or
        /// v2 (Society/Economy/Environment)
        #[arg(long, default_value = "v2")]
        scheme: NamingScheme,
        /// Print the view as JSON
        #[arg(long)]
        json: bool,
        /// CSV mapping `database_name` to `display_name`
        #[arg(long)]
        display_names: Option<PathBuf>,
        /// Pipeline configuration TOML (for on-demand state scores)
        #[arg(long)]
        config: Option<PathBuf>,
        /// List the metrics behind one sub-measure (e.g. "People_Health")
        #[arg(long)]
        detail: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = sustainability_cli_utils::init_logger();
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        return interactive::run(&multi).await;
    };

    match command {
        Commands::Load { csv } => commands::load(&csv)?,
        Commands::Run {
            config,
            reverse_metrics,
            skip_state,
        } => {
            let args = RunArgs {
                config,
                reverse_metrics,
                skip_state,
            };
            commands::run(&multi, &args).await?;
        }
        Commands::Summary => commands::summary()?,
        Commands::Verify => {
            if !commands::verify_outputs()? {
                std::process::exit(1);
            }
        }
        Commands::Counties { min_sub_measures } => commands::counties(min_sub_measures)?,
        Commands::County {
            fips,
            state,
            scheme,
            json,
            display_names,
            config,
            detail,
        } => {
            let args = CountyArgs {
                fips,
                within_state: state,
                scheme,
                json,
                display_names,
                config,
                detail,
            };
            commands::county(&args)?;
        }
    }

    Ok(())
}
