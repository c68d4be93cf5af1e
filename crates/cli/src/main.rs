//! Steward CLI: the main entry point.
//!
//! Commands:
//! - `run`      — Run a task file through the loop
//! - `classify` — Show the HITL tier for a set of risk attributes
//! - `budget`   — Show the context budget allocation
//! - `status`   — Show configuration and registered tools
//! - `doctor`   — Diagnose configuration and knowledge files
//! - `onboard`  — Initialize config and knowledge directory

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use steward_core::{DataSensitivity, Impact, Reversibility};

mod commands;

#[derive(Parser)]
#[command(
    name = "steward",
    about = "Steward — autonomous task loop with verification and human oversight",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task (JSON or TOML file) and print the response.
    ///
    /// Exits 0 on SUCCESS, 1 on FAILED, 3 on ESCALATED and 4 on MAX_ITERATIONS.
    Run {
        /// Path to the task file
        task: PathBuf,

        /// Approve every tier 3/4 request without asking
        #[arg(long, conflicts_with = "deny_all")]
        auto_approve: bool,

        /// Deny every tier 3/4 request without asking
        #[arg(long)]
        deny_all: bool,

        /// Append iteration records to this JSON-lines file
        #[arg(long)]
        trace: Option<PathBuf>,

        /// Override agent.max_iterations
        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// Classify risk attributes into a HITL tier
    Classify {
        #[arg(long, default_value = "low")]
        impact: Impact,

        #[arg(long, default_value = "full")]
        reversibility: Reversibility,

        #[arg(long, default_value = "public")]
        sensitivity: DataSensitivity,
    },

    /// Show the context budget allocation
    Budget,

    /// Show system status
    Status,

    /// Diagnose system health
    Doctor,

    /// Initialize configuration and knowledge directory
    Onboard,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    // Logs go to stderr so `run` output stays parseable
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Run {
            task,
            auto_approve,
            deny_all,
            trace,
            max_iterations,
        } => {
            let status = commands::run::run(commands::run::RunOptions {
                task,
                auto_approve,
                deny_all,
                trace,
                max_iterations,
            })
            .await?;
            return Ok(ExitCode::from(commands::run::exit_code(status)));
        }
        Commands::Classify {
            impact,
            reversibility,
            sensitivity,
        } => commands::classify::run(impact, reversibility, sensitivity)?,
        Commands::Budget => commands::budget::run()?,
        Commands::Status => commands::status::run().await?,
        Commands::Doctor => commands::doctor::run().await?,
        Commands::Onboard => commands::onboard::run()?,
    }

    Ok(ExitCode::SUCCESS)
}
