#![allow(clippy::module_name_repetitions)]

//! Menu-driven interface using `dialoguer`, for running the toolchain
//! without memorizing subcommands and flags.

use std::path::PathBuf;

use dialoguer::{Confirm, Input, Select};
use sustainability_cli_utils::MultiProgress;
use sustainability_database::warehouse::DEFAULT_MIN_SUB_MEASURES;
use sustainability_models::NamingScheme;

use crate::commands::{self, CountyArgs, RunArgs};

/// Top-level actions available in the interactive menu.
enum Action {
    Load,
    Run,
    Summary,
    Verify,
    Counties,
    County,
}

impl Action {
    const ALL: &[Self] = &[
        Self::Load,
        Self::Run,
        Self::Summary,
        Self::Verify,
        Self::Counties,
        Self::County,
    ];

    #[must_use]
    const fn label(&self) -> &'static str {
        match self {
            Self::Load => "Load metrics CSV",
            Self::Run => "Run normalization pipeline",
            Self::Summary => "Summarize outputs",
            Self::Verify => "Verify outputs",
            Self::Counties => "List counties",
            Self::County => "Show county scores",
        }
    }
}

/// Prompts for an action and its parameters, then runs it.
///
/// # Errors
///
/// Returns an error if a prompt fails or the selected action fails.
pub async fn run(multi: &MultiProgress) -> Result<(), Box<dyn std::error::Error>> {
    println!("County Sustainability Toolchain");
    println!();

    let labels: Vec<&str> = Action::ALL.iter().map(Action::label).collect();

    let idx = Select::new()
        .with_prompt("What would you like to do?")
        .items(&labels)
        .default(0)
        .interact()?;

    match Action::ALL[idx] {
        Action::Load => {
            let csv: String = Input::new()
                .with_prompt("Path to metrics CSV")
                .interact_text()?;
            commands::load(&PathBuf::from(csv.trim()))?;
        }
        Action::Run => {
            let args = RunArgs {
                config: prompt_optional_path("Pipeline config TOML (empty for built-in)")?,
                reverse_metrics: prompt_optional_path(
                    "Extra reverse metrics TOML (empty for none)",
                )?,
                skip_state: !Confirm::new()
                    .with_prompt("Precompute state-scoped scores?")
                    .default(true)
                    .interact()?,
            };
            commands::run(multi, &args).await?;
        }
        Action::Summary => commands::summary()?,
        Action::Verify => {
            commands::verify_outputs()?;
        }
        Action::Counties => {
            // Typed input re-prompts until the text parses.
            let min = Input::<usize>::new()
                .with_prompt("Minimum sub-measures")
                .default(DEFAULT_MIN_SUB_MEASURES)
                .interact_text()?;
            commands::counties(min)?;
        }
        Action::County => county()?,
    }

    Ok(())
}

fn county() -> Result<(), Box<dyn std::error::Error>> {
    let fips: String = Input::new()
        .with_prompt("County FIPS code")
        .interact_text()?;

    let scopes = ["Nationally", "Within its state"];
    let scope = Select::new()
        .with_prompt("Compare")
        .items(&scopes)
        .default(0)
        .interact()?;

    let schemes = [
        "Society / Economy / Environment",
        "People / Productivity / Place",
    ];
    let scheme = Select::new()
        .with_prompt("Dimension names")
        .items(&schemes)
        .default(0)
        .interact()?;

    let args = CountyArgs {
        fips,
        within_state: scope == 1,
        scheme: if scheme == 0 {
            NamingScheme::V2
        } else {
            NamingScheme::V1
        },
        json: false,
        display_names: prompt_optional_path("Display names CSV (empty for none)")?,
        config: None,
        detail: prompt_optional_text("Sub-measure to drill into, e.g. People_Health (empty for none)")?,
    };
    commands::county(&args)
}

fn prompt_optional_text(prompt: &str) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let input: String = Input::new()
        .with_prompt(prompt)
        .allow_empty(true)
        .interact_text()?;

    let trimmed = input.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

fn prompt_optional_path(prompt: &str) -> Result<Option<PathBuf>, Box<dyn std::error::Error>> {
    Ok(prompt_optional_text(prompt)?.map(PathBuf::from))
}
