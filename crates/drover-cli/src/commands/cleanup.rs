//! Cleanup command for terminal jobs and their artifacts.
//!
//! Takes either one job id or `--all`. Non-terminal jobs are never
//! removed: a targeted cleanup of a live job is a conflict, and a bulk
//! cleanup skips live jobs and reports how many it left behind.

use clap::Args;
use drover_core::jobs::manager::JobFilter;

use super::{CommandContext, output_error, output_manager_error, print_json};
use crate::exit_codes;

/// Arguments for `drover cleanup`.
#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Job id to remove.
    #[arg(conflicts_with = "all")]
    pub job_id: Option<String>,

    /// Remove every terminal job.
    #[arg(long)]
    pub all: bool,

    /// Machine-readable JSON output.
    #[arg(long)]
    pub json: bool,
}

/// Execute the cleanup command.
pub fn run(context: &CommandContext, args: &CleanupArgs) -> u8 {
    let filter = if args.all {
        JobFilter::All
    } else if let Some(job_id) = &args.job_id {
        JobFilter::Id(job_id.clone())
    } else {
        return output_error(
            args.json,
            exit_codes::VALIDATION_ERROR,
            "cleanup needs a job id or --all",
        );
    };

    let manager = match context.open_manager() {
        Ok(manager) => manager,
        Err(e) => return output_manager_error(args.json, &e),
    };
    let report = match manager.cleanup(&filter) {
        Ok(report) => report,
        Err(e) => return output_manager_error(args.json, &e),
    };

    for release_error in &report.release_errors {
        tracing::warn!(err = %release_error, "artifact release failed during cleanup");
    }

    if args.json {
        print_json(&report);
    } else {
        if report.removed.is_empty() {
            println!("No jobs removed");
        } else {
            println!(
                "Removed {} job(s): {}",
                report.removed.len(),
                report.removed.join(", ")
            );
        }
        if report.skipped_non_terminal > 0 {
            println!(
                "Skipped {} non-terminal job(s)",
                report.skipped_non_terminal
            );
        }
    }
    exit_codes::SUCCESS
}
