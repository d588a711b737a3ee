//! CLI command handling
//!
//! Turns parsed commands into runs and prints their results.

use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::commands::Commands;
use crate::common::config::{Config, MachinePolicy};
use crate::common::{Error, Result};
use crate::corrupt::SessionCorruptor;
use crate::machine::{Backend, MachineFactory};
use crate::scenario::{RunSettings, Scenario, ScenarioRunner, TagFilter};

/// Dispatch a CLI command, returning the process exit code
pub async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            paths,
            config,
            tags,
            exclude_tags,
            runtime,
            parallel,
            do_not_dispose,
            pooled,
            json,
            log_file: _,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(parallel) = parallel {
                if parallel == 0 {
                    return Err(Error::Config("--parallel must be at least 1".to_string()));
                }
                config.run.parallelism = parallel;
            }
            if do_not_dispose {
                config.run.dispose = false;
            }
            if pooled {
                config.run.machine_policy = MachinePolicy::Pooled;
            }

            let runner = build_runner(config, runtime, TagFilter::new(tags, exclude_tags));
            let scenarios = Scenario::load_paths(&paths)?;
            let summary = runner.run(scenarios).await?;

            if json {
                println!("{}", summary.to_json()?);
            } else {
                summary.print();
            }
            Ok(summary.exit_code())
        }

        Commands::List {
            paths,
            config,
            tags,
            exclude_tags,
        } => {
            let config = Config::load(config.as_deref())?;
            let runner = build_runner(config, None, TagFilter::new(tags, exclude_tags));
            let plan = runner.plan(Scenario::load_paths(&paths)?)?;

            println!("\n{}", "Variants:".cyan());
            for variant in &plan.variants {
                println!("  {}", variant.label());
            }
            if !plan.skipped.is_empty() {
                println!("\n{}", "Skipped:".cyan());
                for skipped in &plan.skipped {
                    println!(
                        "  {} [{}] {}",
                        skipped.scenario.name,
                        skipped.mode,
                        skipped.reason.dimmed()
                    );
                }
            }
            println!();
            Ok(0)
        }

        Commands::CorruptSession { root } => corrupt_sessions(&root),
    }
}

fn build_runner(config: Config, runtime: Option<Backend>, filter: TagFilter) -> ScenarioRunner {
    let backend = runtime.unwrap_or(config.runtime.backend);
    tracing::debug!(%backend, "Selected runtime");
    let settings = RunSettings::from_config(&config, filter);
    ScenarioRunner::new(
        Arc::new(MachineFactory::new(backend).with_timeouts(config.timeouts.clone())),
        config.machines,
        settings,
    )
}

fn corrupt_sessions(root: &Path) -> Result<i32> {
    let corrupted: Vec<PathBuf> = SessionCorruptor::new(root).corrupt_all()?;
    if corrupted.is_empty() {
        println!("No session found under {}", root.display());
        return Ok(1);
    }
    for path in &corrupted {
        println!("  {} {}", "✓".green(), path.display());
    }
    Ok(0)
}
