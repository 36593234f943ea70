//! Run status and listing commands, plus the shared outcome printers.

use anyhow::{Context, Result};
use std::path::Path;

use waypoint::checkpoint::ValidationStatus;
use waypoint::engine::PhaseOutcome;
use waypoint::engine::state::{PhaseFailure, RunState, RunStatus};

use super::super::Cli;
use super::run::load_config;

fn status_label(status: RunStatus) -> console::StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        RunStatus::Completed => console::style(label).green(),
        RunStatus::Running => console::style(label).cyan(),
        RunStatus::AwaitingConsensus => console::style(label).magenta(),
        RunStatus::NeedsRevision => console::style(label).red(),
        RunStatus::Aborted => console::style(label).yellow(),
        RunStatus::Idle => console::style(label).dim(),
    }
}

pub(crate) fn print_outcome(outcome: &PhaseOutcome) {
    let verdict = if outcome.awaiting_consensus {
        console::style("awaiting consensus").magenta().bold()
    } else if outcome.success {
        console::style("passed").green().bold()
    } else {
        console::style("failed").red().bold()
    };
    println!("Phase '{}' {}", outcome.phase_name, verdict);

    for agent in &outcome.agent_outcomes {
        let mark = if agent.success {
            console::style("ok").green()
        } else {
            console::style("error").red()
        };
        let mut line = format!(
            "  {:<16} {:<6} {:>6.1}s",
            agent.agent_name,
            mark,
            agent.duration.as_secs_f64()
        );
        if agent.attempts > 1 {
            line.push_str(&format!("  ({} attempts)", agent.attempts));
        }
        if agent.awaiting_external {
            line.push_str("  (external)");
        }
        println!("{}", line);
        if let Some(error) = &agent.error {
            println!("    {}", console::style(error).dim());
        }
    }

    if let Some(validation) = &outcome.validation {
        let status = match validation.status {
            ValidationStatus::Pass => console::style(validation.status.to_string()).green(),
            ValidationStatus::Partial => console::style(validation.status.to_string()).yellow(),
            ValidationStatus::Fail => console::style(validation.status.to_string()).red(),
        };
        println!("  Checkpoint: {}", status);
        for missing in &validation.missing {
            println!("    missing: {}", missing);
        }
        if let Some(report) = &validation.report_path {
            println!("    report:  {}", report.display());
        }
    }
}

pub(crate) fn print_failure(failure: &PhaseFailure) {
    println!();
    println!("{} in phase '{}'", console::style("Needs revision").red().bold(), failure.phase);
    if let Some(reason) = &failure.rejection {
        println!("  Rejected: {}", reason);
    }
    for error in &failure.agent_errors {
        println!("  Agent error: {}", error);
    }
    if let Some(status) = failure.validation_status {
        println!("  Checkpoint: {}", status);
    }
    if let Some(report) = &failure.report_path {
        println!("  Report: {}", report.display());
    }
}

pub(crate) fn print_next_step(state: &RunState) {
    println!();
    match state.status {
        RunStatus::Running => {
            if let Some(phase) = &state.current_phase {
                println!("Next: `waypoint advance` runs phase '{}'", phase);
            }
        }
        RunStatus::NeedsRevision => {
            if let Some(phase) = &state.current_phase {
                println!("Fix the issues, then `waypoint advance` retries phase '{}'", phase);
            }
        }
        RunStatus::AwaitingConsensus => {
            println!(
                "Phase '{}' awaits a decision: `waypoint review`, `waypoint approve` or `waypoint reject <reason>`",
                state.consensus_phase.as_deref().unwrap_or("?")
            );
        }
        RunStatus::Aborted => println!("Run is aborted. `waypoint resume` continues it."),
        RunStatus::Completed => println!("{}", console::style("Run completed.").green().bold()),
        RunStatus::Idle => {}
    }
}

pub fn cmd_status(cli: &Cli, project_dir: &Path, run: Option<&str>, json: bool) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let run_id = config.resolve_run(run)?;
    let state = config.state_store().load(&run_id)?;

    if json {
        let content =
            serde_json::to_string_pretty(&state).context("Failed to serialize run state")?;
        println!("{}", content);
        return Ok(());
    }

    let plan = config.workflow.plan();
    println!();
    println!("Run {}", state.run_id);
    println!("Status:  {}", status_label(state.status));
    println!(
        "Phase:   {}",
        state.current_phase.as_deref().unwrap_or("-")
    );
    println!("Created: {}", state.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Updated: {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();

    println!("{:<20} {:<10} {:<8} Artifacts", "Phase", "State", "Attempts");
    println!("{:<20} {:<10} {:<8} ---------", "-----", "-----", "--------");
    for phase in plan.phases() {
        let marker = if state.is_completed(&phase.name) {
            "done"
        } else if state.consensus_phase.as_deref() == Some(phase.name.as_str()) {
            "gated"
        } else if state.current_phase.as_deref() == Some(phase.name.as_str()) {
            "current"
        } else {
            "pending"
        };
        let artifacts = state
            .phase_artifacts
            .get(&phase.name)
            .map(|a| a.join(", "))
            .unwrap_or_default();
        println!(
            "{:<20} {:<10} {:<8} {}",
            phase.name,
            marker,
            state.attempts(&phase.name),
            console::style(artifacts).dim()
        );
    }

    if state.status == RunStatus::NeedsRevision
        && let Some(failure) = state.last_failure()
    {
        print_failure(&failure);
    }

    if !state.errors.is_empty() {
        println!();
        println!("Errors ({}):", state.errors.len());
        for error in state.errors.iter().rev().take(5) {
            println!("  {}", console::style(error).dim());
        }
    }
    print_next_step(&state);
    Ok(())
}

pub fn cmd_list(cli: &Cli, project_dir: &Path) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let runs = config.state_store().list()?;
    let current = config.current_run()?;

    if runs.is_empty() {
        println!();
        println!("No runs found. Start one with `waypoint start`.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "  {:<26} {:<20} {:<16} Updated",
        "Run", "Status", "Phase"
    );
    for state in &runs {
        let marker = if current.as_deref() == Some(state.run_id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<26} {:<20} {:<16} {}",
            marker,
            state.run_id,
            state.status.as_str(),
            state.current_phase.as_deref().unwrap_or("-"),
            state.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    println!("{} runs", runs.len());
    Ok(())
}
