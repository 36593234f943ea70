//! Run lifecycle commands: start, advance, abort, resume and jump.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;

use waypoint::config::Config;
use waypoint::engine::WorkflowEngine;
use waypoint::engine::state::RunLock;

use super::super::Cli;
use super::phase::{print_failure, print_outcome, print_next_step};

pub(crate) fn load_config(cli: &Cli, project_dir: &Path) -> Result<Config> {
    Config::load(project_dir.to_path_buf(), cli.workflow.clone())
}

/// Load a run for mutation, holding its single-writer lock.
pub(crate) fn open_run(
    cli: &Cli,
    project_dir: &Path,
    run: Option<&str>,
) -> Result<(WorkflowEngine, RunLock)> {
    let config = load_config(cli, project_dir)?;
    let run_id = config.resolve_run(run)?;
    let lock = config.state_store().lock(&run_id)?;
    let engine = WorkflowEngine::load(&config, &run_id)?;
    Ok((engine, lock))
}

fn read_intake(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read intake file: {}", path.display()))?;
    let value = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse intake file: {}", path.display()))?,
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("Failed to parse intake file: {}", path.display()))?,
        _ => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse intake file: {}", path.display()))?,
    };
    Ok(value)
}

pub fn cmd_start(cli: &Cli, project_dir: &Path, intake: Option<&Path>) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let intake = match intake {
        Some(path) => read_intake(path)?,
        None => Value::Object(Default::default()),
    };

    let engine = WorkflowEngine::start(&config, intake)?;
    let state = engine.state();
    println!(
        "{} run {}",
        console::style("Started").green().bold(),
        state.run_id
    );
    println!(
        "Phases: {}",
        engine.plan().names().join(" -> ")
    );
    print_next_step(state);
    Ok(())
}

pub async fn cmd_advance(cli: &Cli, project_dir: &Path, run: Option<&str>, all: bool) -> Result<()> {
    let (mut engine, _lock) = open_run(cli, project_dir, run)?;

    let outcomes = if all {
        engine.run_until_blocked().await?
    } else {
        vec![engine.advance().await?]
    };

    for outcome in &outcomes {
        print_outcome(outcome);
    }
    if outcomes.last().is_some_and(|o| !o.success)
        && let Some(failure) = engine.failure()
    {
        print_failure(&failure);
    }
    print_next_step(engine.state());
    Ok(())
}

/// Abort does not take the run lock: an in-flight `advance` notices the
/// abort when it finishes its phase.
pub fn cmd_abort(cli: &Cli, project_dir: &Path, run: Option<&str>) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let run_id = config.resolve_run(run)?;
    let mut engine = WorkflowEngine::load(&config, &run_id)?;
    engine.abort()?;
    println!(
        "{} run {}",
        console::style("Aborted").yellow().bold(),
        run_id
    );
    println!("Resume with `waypoint resume`.");
    Ok(())
}

pub fn cmd_resume(cli: &Cli, project_dir: &Path, run: Option<&str>) -> Result<()> {
    let (mut engine, _lock) = open_run(cli, project_dir, run)?;
    let status = engine.resume()?;
    println!(
        "{} run {} ({})",
        console::style("Resumed").green().bold(),
        engine.run_id(),
        status
    );
    print_next_step(engine.state());
    Ok(())
}

pub fn cmd_jump(cli: &Cli, project_dir: &Path, run: Option<&str>, phase: &str) -> Result<()> {
    let (mut engine, _lock) = open_run(cli, project_dir, run)?;
    engine.jump(phase)?;
    println!(
        "{} to phase '{}'",
        console::style("Jumped").yellow().bold(),
        phase
    );
    print_next_step(engine.state());
    Ok(())
}
