use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(version, about = "Checkpoint-driven workflow engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Console log format: text or json
    #[arg(long, default_value = "text", global = true)]
    pub log_format: String,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Workflow file. Defaults to .waypoint/workflow.toml
    #[arg(long, global = true)]
    pub workflow: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .waypoint/ with a sample workflow
    Init,
    /// Start a new run at the first enabled phase
    Start {
        /// Project intake metadata (JSON, YAML or TOML)
        #[arg(long)]
        intake: Option<PathBuf>,
    },
    /// Execute the current phase
    Advance {
        #[arg(long)]
        run: Option<String>,
        /// Keep advancing until the run completes or blocks
        #[arg(long)]
        all: bool,
    },
    /// Approve the phase awaiting consensus
    Approve {
        #[arg(long)]
        run: Option<String>,
    },
    /// Reject the phase awaiting consensus
    Reject {
        reason: String,
        #[arg(long)]
        run: Option<String>,
    },
    /// Show the consensus request and decide interactively
    Review {
        #[arg(long)]
        run: Option<String>,
    },
    /// Suspend a run
    Abort {
        #[arg(long)]
        run: Option<String>,
    },
    /// Resume an aborted run
    Resume {
        #[arg(long)]
        run: Option<String>,
    },
    /// Make a phase current, bypassing the normal order
    Jump {
        phase: String,
        #[arg(long)]
        run: Option<String>,
    },
    /// Show the state of a run
    Status {
        #[arg(long)]
        run: Option<String>,
        /// Print the persisted state record
        #[arg(long)]
        json: bool,
    },
    /// List all runs, most recent first
    List,
    /// Check artifact patterns against the project directory
    Validate {
        #[arg(required = true)]
        patterns: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_format: waypoint::logging::LogFormat = cli.log_format.parse()?;
    let log_dir = project_dir.join(waypoint::config::WAYPOINT_DIR).join("logs");
    let _log_guard = waypoint::logging::init_logging(cli.verbose, log_format, Some(&log_dir));

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Start { intake } => cmd::cmd_start(&cli, &project_dir, intake.as_deref())?,
        Commands::Advance { run, all } => {
            cmd::cmd_advance(&cli, &project_dir, run.as_deref(), *all).await?
        }
        Commands::Approve { run } => cmd::cmd_approve(&cli, &project_dir, run.as_deref())?,
        Commands::Reject { reason, run } => {
            cmd::cmd_reject(&cli, &project_dir, run.as_deref(), reason)?
        }
        Commands::Review { run } => cmd::cmd_review(&cli, &project_dir, run.as_deref())?,
        Commands::Abort { run } => cmd::cmd_abort(&cli, &project_dir, run.as_deref())?,
        Commands::Resume { run } => cmd::cmd_resume(&cli, &project_dir, run.as_deref())?,
        Commands::Jump { phase, run } => {
            cmd::cmd_jump(&cli, &project_dir, run.as_deref(), phase)?
        }
        Commands::Status { run, json } => {
            cmd::cmd_status(&cli, &project_dir, run.as_deref(), *json)?
        }
        Commands::List => cmd::cmd_list(&cli, &project_dir)?,
        Commands::Validate { patterns } => cmd::cmd_validate(&project_dir, patterns)?,
    }

    Ok(())
}
