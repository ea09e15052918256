//! Job termination command.
//!
//! The record becomes `killed` even if the container stop fails; a
//! second kill of the same job reports a conflict.

use clap::Args;
use serde::Serialize;

use super::{CommandContext, output_manager_error, print_json};
use crate::exit_codes;

/// Arguments for `drover kill`.
#[derive(Debug, Args)]
pub struct KillArgs {
    /// Job id.
    pub job_id: String,

    /// Machine-readable JSON output.
    #[arg(long)]
    pub json: bool,
}

/// Response for `drover kill`.
#[derive(Debug, Clone, Serialize)]
pub struct KillResponse {
    /// Killed job id.
    pub job_id: String,
    /// Status after the kill.
    pub status: String,
}

/// Execute the kill command.
pub fn run(context: &CommandContext, args: &KillArgs) -> u8 {
    let manager = match context.open_manager() {
        Ok(manager) => manager,
        Err(e) => return output_manager_error(args.json, &e),
    };
    match manager.kill(&args.job_id) {
        Ok(record) => {
            if args.json {
                print_json(&KillResponse {
                    job_id: record.id,
                    status: record.status.to_string(),
                });
            } else {
                println!("Job {} killed", record.id);
            }
            exit_codes::SUCCESS
        },
        Err(e) => output_manager_error(args.json, &e),
    }
}
