mod agent;
mod commands;
mod config;
mod coordinator;
mod engine;
mod error;
mod events;
mod git;
mod knowledge;
mod learnings;
mod state;
mod subprocess;
mod tracker;
mod verify;
mod worktree;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::doctor::DoctorArgs;
use commands::resume::ResumeArgs;
use commands::run::RunArgs;
use commands::status::StatusArgs;

#[derive(Debug, Parser)]
#[command(
    name = "berth",
    version,
    about = "Autonomous development-task orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute the tracker's open beads through the execute-verify-commit loop
    Run(RunArgs),
    /// Resume the most recent interrupted run from its checkpoint
    Resume(ResumeArgs),
    /// Show the latest run's checkpoint state
    Status(StatusArgs),
    /// Validate project config and collaborator tools
    Doctor(DoctorArgs),
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Resume(_) => "resume",
            Self::Status(_) => "status",
            Self::Doctor(_) => "doctor",
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Run(args) => args.execute(),
        Commands::Resume(args) => args.execute(),
        Commands::Status(args) => args.execute(),
        Commands::Doctor(args) => args.execute(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
