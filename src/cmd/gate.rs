//! Consensus commands: approve, reject and interactive review.

use anyhow::Result;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use std::path::Path;

use waypoint::consensus::{ConsensusDecision, ConsensusRequest};

use super::super::Cli;
use super::phase::print_next_step;
use super::run::open_run;

fn print_decision(decision: &ConsensusDecision) {
    let verdict = if decision.approved {
        console::style("Approved").green().bold()
    } else {
        console::style("Rejected").red().bold()
    };
    match &decision.reason {
        Some(reason) => println!("{} phase '{}': {}", verdict, decision.phase_name, reason),
        None => println!("{} phase '{}'", verdict, decision.phase_name),
    }
}

fn print_request(request: &ConsensusRequest) {
    println!();
    println!(
        "{} {}",
        console::style("Consensus requested for phase").bold(),
        console::style(&request.phase_name).cyan().bold()
    );
    println!("{}", request.summary);
    println!();
    for agent in &request.agents {
        let mark = if agent.success {
            console::style("ok").green()
        } else {
            console::style("error").red()
        };
        println!("  {:<16} {}", agent.agent, mark);
        if let Some(error) = &agent.error {
            println!("    {}", console::style(error).dim());
        }
    }
    if !request.artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for artifact in &request.artifacts {
            println!("  {}", artifact);
        }
    }
    if let Some(report) = &request.report_path {
        println!("Checkpoint report: {}", report.display());
    }
    println!();
}

pub fn cmd_approve(cli: &Cli, project_dir: &Path, run: Option<&str>) -> Result<()> {
    let (mut engine, _lock) = open_run(cli, project_dir, run)?;
    let decision = engine.approve()?;
    print_decision(&decision);
    print_next_step(engine.state());
    Ok(())
}

pub fn cmd_reject(cli: &Cli, project_dir: &Path, run: Option<&str>, reason: &str) -> Result<()> {
    let (mut engine, _lock) = open_run(cli, project_dir, run)?;
    let decision = engine.reject(reason)?;
    print_decision(&decision);
    print_next_step(engine.state());
    Ok(())
}

pub fn cmd_review(cli: &Cli, project_dir: &Path, run: Option<&str>) -> Result<()> {
    let (mut engine, _lock) = open_run(cli, project_dir, run)?;

    let Some(phase) = engine.state().consensus_phase.clone() else {
        println!(
            "Run {} is {}; nothing awaits consensus.",
            engine.run_id(),
            engine.state().status
        );
        return Ok(());
    };

    match engine.consensus_store().latest_request(&phase)? {
        Some(request) => print_request(&request),
        None => println!("No consensus request recorded for phase '{}'.", phase),
    }

    let options = &["Approve", "Reject", "Decide later"];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Decision for phase '{}'", phase))
        .items(options)
        .default(0)
        .interact()?;

    let decision = match selection {
        0 => engine.approve()?,
        1 => {
            let reason: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("Reason")
                .interact_text()?;
            engine.reject(&reason)?
        }
        _ => {
            println!("No decision recorded.");
            return Ok(());
        }
    };

    print_decision(&decision);
    print_next_step(engine.state());
    Ok(())
}
