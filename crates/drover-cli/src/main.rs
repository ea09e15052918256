//! drover - container-backed agent job runner.
//!
//! Launches AI agent sessions in containers, tracks them as background
//! jobs in a shared on-disk store, and reconciles their statuses
//! against the container runtime on every query.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod exit_codes;

/// drover - container-backed agent job runner
#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(version, about, long_about = None)]
struct Cli {
    /// State directory (overrides DROVER_HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the agent image if needed and launch a job
    Run(commands::run::RunArgs),

    /// Show job status (one job or all)
    Status(commands::status::StatusArgs),

    /// Print or stream job logs
    Logs(commands::logs::LogsArgs),

    /// Terminate a job
    Kill(commands::kill::KillArgs),

    /// Remove terminal jobs and their artifacts
    Cleanup(commands::cleanup::CleanupArgs),
}

fn main() {
    let cli = Cli::parse();

    // DROVER_LOG takes precedence over --log-level when set.
    let filter = EnvFilter::try_from_env("DROVER_LOG")
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let context = match commands::load_context(cli.home.as_deref()) {
        Ok(context) => context,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(i32::from(exit_codes::GENERIC_ERROR));
        },
    };

    let exit_code = match cli.command {
        Commands::Run(args) => commands::run::run(&context, &args),
        Commands::Status(args) => commands::status::run(&context, &args),
        Commands::Logs(args) => commands::logs::run(&context, &args),
        Commands::Kill(args) => commands::kill::run(&context, &args),
        Commands::Cleanup(args) => commands::cleanup::run(&context, &args),
    };
    std::process::exit(i32::from(exit_code));
}
