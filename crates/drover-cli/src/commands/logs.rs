//! Log access command: print or stream a job's output.
//!
//! Terminal jobs read from the captured log file under the state root;
//! live jobs ask the container runtime. `--follow` streams through the
//! runtime with inherited stdio until the container exits.

use clap::Args;
use drover_core::jobs::record::JobRecord;
use drover_core::runtime::launcher::ContainerLauncher;

use super::{CommandContext, output_error, output_manager_error};
use crate::exit_codes;

/// Arguments for `drover logs`.
#[derive(Debug, Args)]
pub struct LogsArgs {
    /// Job id.
    pub job_id: String,

    /// Show only the last N lines.
    #[arg(short = 'n', long, value_name = "LINES")]
    pub tail: Option<u32>,

    /// Stream new output until the container exits.
    #[arg(short, long)]
    pub follow: bool,
}

/// Execute the logs command.
pub fn run(context: &CommandContext, args: &LogsArgs) -> u8 {
    let manager = match context.open_manager() {
        Ok(manager) => manager,
        Err(e) => return output_manager_error(false, &e),
    };
    let record = match manager.get(&args.job_id) {
        Ok(record) => record,
        Err(e) => return output_manager_error(false, &e),
    };

    if record.status.is_terminal() {
        return print_captured_logs(&record, args.tail);
    }

    let Some(container_ref) = &record.container_ref else {
        eprintln!("Job {} has not started; no logs yet", record.id);
        return exit_codes::SUCCESS;
    };

    if args.follow {
        return match manager.launcher().follow_logs(container_ref) {
            Ok(0) => exit_codes::SUCCESS,
            Ok(status) => {
                tracing::debug!(status, "log stream ended with nonzero status");
                exit_codes::GENERIC_ERROR
            },
            Err(e) => output_error(false, exit_codes::GENERIC_ERROR, &e.to_string()),
        };
    }

    match manager.launcher().logs(container_ref, args.tail) {
        Ok(output) => {
            print!("{output}");
            exit_codes::SUCCESS
        },
        Err(e) => output_error(false, exit_codes::GENERIC_ERROR, &e.to_string()),
    }
}

/// Print the log file captured when the job finished.
fn print_captured_logs(record: &JobRecord, tail: Option<u32>) -> u8 {
    let Some(log_path) = &record.log_path else {
        return output_error(
            false,
            exit_codes::GENERIC_ERROR,
            &format!("no logs captured for job {}", record.id),
        );
    };
    match std::fs::read_to_string(log_path) {
        Ok(content) => {
            match tail {
                Some(n) => print!("{}", tail_lines(&content, n)),
                None => print!("{content}"),
            }
            exit_codes::SUCCESS
        },
        Err(e) => output_error(
            false,
            exit_codes::GENERIC_ERROR,
            &format!("cannot read log file {}: {e}", log_path.display()),
        ),
    }
}

fn tail_lines(content: &str, tail: u32) -> String {
    let total = content.lines().count();
    let skip = total.saturating_sub(tail as usize);
    let mut out = String::new();
    for line in content.lines().skip(skip) {
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_the_last_lines() {
        let content = "one\ntwo\nthree\nfour\n";
        assert_eq!(tail_lines(content, 2), "three\nfour\n");
        assert_eq!(tail_lines(content, 10), content);
        assert_eq!(tail_lines(content, 0), "");
    }

    #[test]
    fn tail_handles_missing_trailing_newline() {
        assert_eq!(tail_lines("one\ntwo", 1), "two\n");
    }
}
