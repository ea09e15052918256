//! Status reporting command.
//!
//! Every invocation runs a reconciliation pass first, so the statuses
//! printed reflect what the container runtime says right now rather
//! than what the last command happened to record.

use chrono::{DateTime, Utc};
use clap::{Args, ValueEnum};
use drover_core::jobs::manager::JobFilter;
use drover_core::jobs::record::{JobRecord, JobStatus};
use serde::Serialize;

use super::{CommandContext, output_manager_error, print_json, reconcile_pass};
use crate::exit_codes;

/// Arguments for `drover status`.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Job id to show; all jobs when omitted.
    pub job_id: Option<String>,

    /// Keep only jobs with this status.
    #[arg(long, value_enum, conflicts_with = "job_id")]
    pub status: Option<StatusFilter>,

    /// Machine-readable JSON output.
    #[arg(long)]
    pub json: bool,
}

/// Status filter for the list form.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusFilter {
    /// Recorded but not yet launch-confirmed.
    Pending,
    /// Launch-confirmed and not yet terminal.
    Running,
    /// Exited with status zero.
    Completed,
    /// Exited nonzero, vanished, or was force-failed.
    Failed,
    /// Terminated by an operator.
    Killed,
}

impl From<StatusFilter> for JobStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => Self::Pending,
            StatusFilter::Running => Self::Running,
            StatusFilter::Completed => Self::Completed,
            StatusFilter::Failed => Self::Failed,
            StatusFilter::Killed => Self::Killed,
        }
    }
}

/// Response for the list form.
#[derive(Debug, Clone, Serialize)]
pub struct StatusListResponse {
    /// Matching jobs, oldest first.
    pub jobs: Vec<JobRecord>,
    /// Number of matching jobs.
    pub total: usize,
}

/// Execute the status command.
pub fn run(context: &CommandContext, args: &StatusArgs) -> u8 {
    let manager = match context.open_manager() {
        Ok(manager) => manager,
        Err(e) => return output_manager_error(args.json, &e),
    };
    if let Err(code) = reconcile_pass(context, &manager, args.json) {
        return code;
    }

    if let Some(job_id) = &args.job_id {
        let record = match manager.get(job_id) {
            Ok(record) => record,
            Err(e) => return output_manager_error(args.json, &e),
        };
        if args.json {
            print_json(&record);
        } else {
            print_record_detail(&record);
        }
        return exit_codes::SUCCESS;
    }

    let filter = args
        .status
        .map_or(JobFilter::All, |s| JobFilter::Status(s.into()));
    let jobs = match manager.list(&filter) {
        Ok(jobs) => jobs,
        Err(e) => return output_manager_error(args.json, &e),
    };
    if args.json {
        print_json(&StatusListResponse {
            total: jobs.len(),
            jobs,
        });
    } else {
        print_record_table(&jobs);
    }
    exit_codes::SUCCESS
}

fn print_record_detail(record: &JobRecord) {
    println!("Job {}", record.id);
    println!("  Status:     {}", record.status);
    println!("  Created:    {}", record.created_at);
    println!("  Updated:    {}", record.updated_at);
    if let Some(started_at) = &record.started_at {
        println!("  Started:    {started_at}");
    }
    if let Some(container_ref) = &record.container_ref {
        println!("  Container:  {container_ref}");
    }
    if let Some(code) = record.exit_code {
        println!("  Exit Code:  {code}");
    }
    if let Some(reason) = &record.failure_reason {
        println!("  Reason:     {reason}");
    }
    if let Some(log_path) = &record.log_path {
        println!("  Log:        {}", log_path.display());
    }
    if let Some(summary) = &record.result_summary {
        println!(
            "  Summary:    {}",
            serde_json::to_string(summary).unwrap_or_else(|_| "{}".to_string())
        );
    }
}

fn print_record_table(jobs: &[JobRecord]) {
    if jobs.is_empty() {
        println!("No jobs");
        return;
    }
    let now = Utc::now();
    println!("{:<10} {:<10} {:<6} Container", "Job ID", "Status", "Age");
    println!("{}", "-".repeat(56));
    for job in jobs {
        println!(
            "{:<10} {:<10} {:<6} {}",
            job.id,
            job.status.to_string(),
            format_age(&job.created_at, now),
            job.container_ref.as_deref().unwrap_or("-"),
        );
    }
}

/// Coarse age of an RFC 3339 timestamp relative to `now`.
fn format_age(timestamp: &str, now: DateTime<Utc>) -> String {
    let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) else {
        return "-".to_string();
    };
    let secs = (now - parsed.with_timezone(&Utc)).num_seconds();
    if secs < 0 {
        return "-".to_string();
    }
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86_400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(timestamp: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(timestamp)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn ages_render_coarsely() {
        let now = at("2026-08-25T12:00:00Z");
        assert_eq!(format_age("2026-08-25T11:59:30Z", now), "30s");
        assert_eq!(format_age("2026-08-25T11:12:00Z", now), "48m");
        assert_eq!(format_age("2026-08-25T03:00:00Z", now), "9h");
        assert_eq!(format_age("2026-08-20T12:00:00Z", now), "5d");
    }

    #[test]
    fn unparseable_or_future_timestamps_render_as_dashes() {
        let now = at("2026-08-25T12:00:00Z");
        assert_eq!(format_age("not-a-timestamp", now), "-");
        assert_eq!(format_age("2026-08-25T13:00:00Z", now), "-");
    }
}
