//! Stateless reconciliation of running jobs against live containers.
//!
//! There is no resident monitor process. Any drover invocation may run a
//! reconciliation pass: snapshot the running jobs, ask the runtime about
//! each container, and finalize the ones that stopped. All knowledge
//! lives in the store, so passes are idempotent and any number of
//! processes can reconcile concurrently without coordination beyond the
//! store lock.
//!
//! Finalization re-checks the record under the lock and only commits if
//! the job is still `running`. A kill that landed mid-pass wins; the
//! monitor's observation is discarded.
//!
//! Monitor trouble is absorbed, never thrown: a container that cannot be
//! queried (after bounded retries) or that outlives its session bound is
//! finalized as `failed` with the reason on the record. Only store
//! failures abort a pass.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::{LimitsConfig, StatePaths, create_dir_private};
use crate::jobs::record::{JobRecord, JobStatus, now_rfc3339, truncate_reason};
use crate::jobs::store::{JobStore, JobStoreError};
use crate::runtime::launcher::{ContainerLauncher, ContainerQuery, LauncherError};

/// Default container query attempts per job per pass.
pub const DEFAULT_QUERY_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff between query attempts.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Default session bound for a running job.
pub const DEFAULT_MAX_SESSION: Duration = Duration::from_secs(600);

/// Maximum size of a result summary file the monitor will ingest.
pub const MAX_RESULT_SUMMARY_SIZE: u64 = 64 * 1024;

/// Errors that abort a reconciliation pass.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MonitorError {
    /// The store failed; the pass cannot make progress.
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Tunables for one reconciliation pass.
#[derive(Debug, Clone)]
pub struct MonitorPolicy {
    /// Container query attempts before a job is failed with a monitor
    /// reason.
    pub query_attempts: u32,

    /// Base delay between attempts; doubles each retry.
    pub backoff_base: Duration,

    /// Session bound applied to jobs that carry no per-job override.
    pub max_session: Duration,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            query_attempts: DEFAULT_QUERY_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            max_session: DEFAULT_MAX_SESSION,
        }
    }
}

impl MonitorPolicy {
    /// Build a policy from configured limits.
    #[must_use]
    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self {
            query_attempts: limits.monitor_query_attempts,
            backoff_base: limits.monitor_backoff_base(),
            max_session: limits.max_session(),
        }
    }
}

/// One decision made during a pass.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ReconcileAction {
    /// Container exited zero; job finalized as completed.
    Completed {
        /// Affected job.
        job_id: String,
    },

    /// Container exited nonzero (or without a code); job finalized as
    /// failed.
    Failed {
        /// Affected job.
        job_id: String,
        /// Exit code, when the runtime reported one.
        exit_code: Option<i64>,
    },

    /// Container outlived its session bound; stopped and finalized as
    /// failed.
    SessionTimedOut {
        /// Affected job.
        job_id: String,
        /// Observed session length in seconds.
        running_secs: u64,
    },

    /// The container could not be observed; job finalized as failed
    /// with the reason on the record.
    ProbeFailed {
        /// Affected job.
        job_id: String,
        /// Why observation failed.
        reason: String,
    },

    /// The record left `running` while the pass was looking at it; the
    /// monitor's observation was discarded.
    Superseded {
        /// Affected job.
        job_id: String,
    },

    /// Container is alive and within bounds; nothing written.
    StillRunning {
        /// Affected job.
        job_id: String,
    },
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileReport {
    /// Running jobs examined.
    pub inspected: usize,
    /// Jobs finalized as completed.
    pub completed: usize,
    /// Jobs finalized as failed, for any reason.
    pub failed: usize,
    /// Jobs left running.
    pub still_running: usize,
    /// Observations discarded because the record changed mid-pass.
    pub superseded: usize,
    /// Per-job decisions, in inspection order.
    pub actions: Vec<ReconcileAction>,
}

/// Run one reconciliation pass over every running job.
///
/// # Errors
///
/// Returns [`MonitorError::Store`] when the jobs document cannot be read
/// or written. Per-job container trouble never surfaces here; it is
/// written onto the affected record instead.
pub fn reconcile_jobs<L: ContainerLauncher>(
    store: &JobStore,
    launcher: &L,
    paths: &StatePaths,
    policy: &MonitorPolicy,
) -> Result<ReconcileReport, MonitorError> {
    let running: Vec<JobRecord> = store
        .list()?
        .into_iter()
        .filter(|r| r.status == JobStatus::Running)
        .collect();

    let mut report = ReconcileReport::default();
    for job in running {
        report.inspected += 1;
        let action = reconcile_one(store, launcher, paths, policy, &job)?;
        match &action {
            ReconcileAction::Completed { .. } => report.completed += 1,
            ReconcileAction::Failed { .. }
            | ReconcileAction::SessionTimedOut { .. }
            | ReconcileAction::ProbeFailed { .. } => report.failed += 1,
            ReconcileAction::StillRunning { .. } => report.still_running += 1,
            ReconcileAction::Superseded { .. } => report.superseded += 1,
        }
        report.actions.push(action);
    }

    if report.inspected > 0 {
        tracing::debug!(
            inspected = report.inspected,
            completed = report.completed,
            failed = report.failed,
            still_running = report.still_running,
            "reconciliation pass finished"
        );
    }
    Ok(report)
}

fn reconcile_one<L: ContainerLauncher>(
    store: &JobStore,
    launcher: &L,
    paths: &StatePaths,
    policy: &MonitorPolicy,
    job: &JobRecord,
) -> Result<ReconcileAction, MonitorError> {
    let job_id = job.id.clone();

    let Some(container_ref) = job.container_ref.clone() else {
        let reason = "running record has no container reference".to_string();
        let state = FinalState {
            status: JobStatus::Failed,
            exit_code: None,
            result_summary: None,
            failure_reason: Some(reason.clone()),
        };
        return Ok(match commit_terminal(store, &job_id, state)? {
            CommitOutcome::Committed => ReconcileAction::ProbeFailed { job_id, reason },
            _ => ReconcileAction::Superseded { job_id },
        });
    };

    match query_with_retry(launcher, &container_ref, policy) {
        QueryOutcome::Alive => {
            let limit = job
                .max_session_secs
                .map(Duration::from_secs)
                .unwrap_or(policy.max_session);
            match session_elapsed(job) {
                Some(elapsed) if elapsed > limit => {
                    if let Err(e) = launcher.stop(&container_ref) {
                        tracing::warn!(
                            job_id = %job_id,
                            container_ref = %container_ref,
                            err = %e,
                            "failed to stop over-session container"
                        );
                    }
                    capture_final_logs(launcher, &container_ref, job);
                    let reason = format!(
                        "session exceeded {}s limit after {}s",
                        limit.as_secs(),
                        elapsed.as_secs()
                    );
                    let state = FinalState {
                        status: JobStatus::Failed,
                        exit_code: None,
                        result_summary: read_result_summary(paths, &job_id),
                        failure_reason: Some(reason),
                    };
                    Ok(match commit_terminal(store, &job_id, state)? {
                        CommitOutcome::Committed => ReconcileAction::SessionTimedOut {
                            job_id,
                            running_secs: elapsed.as_secs(),
                        },
                        _ => ReconcileAction::Superseded { job_id },
                    })
                },
                _ => Ok(ReconcileAction::StillRunning { job_id }),
            }
        },
        QueryOutcome::Exited { exit_code } => {
            capture_final_logs(launcher, &container_ref, job);
            let summary = read_result_summary(paths, &job_id);
            let completed = exit_code == Some(0);
            let failure_reason = match exit_code {
                Some(0) => None,
                Some(code) => Some(format!("container exited with status {code}")),
                None => Some("container stopped without reporting an exit code".to_string()),
            };
            let state = FinalState {
                status: if completed {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                },
                exit_code,
                result_summary: summary,
                failure_reason,
            };
            Ok(match commit_terminal(store, &job_id, state)? {
                CommitOutcome::Committed if completed => ReconcileAction::Completed { job_id },
                CommitOutcome::Committed => ReconcileAction::Failed { job_id, exit_code },
                _ => ReconcileAction::Superseded { job_id },
            })
        },
        QueryOutcome::Gone => {
            let reason = format!("container {container_ref} no longer exists");
            let state = FinalState {
                status: JobStatus::Failed,
                exit_code: None,
                result_summary: read_result_summary(paths, &job_id),
                failure_reason: Some(reason.clone()),
            };
            Ok(match commit_terminal(store, &job_id, state)? {
                CommitOutcome::Committed => ReconcileAction::ProbeFailed { job_id, reason },
                _ => ReconcileAction::Superseded { job_id },
            })
        },
        QueryOutcome::Errored { reason } => {
            let state = FinalState {
                status: JobStatus::Failed,
                exit_code: None,
                result_summary: None,
                failure_reason: Some(reason.clone()),
            };
            Ok(match commit_terminal(store, &job_id, state)? {
                CommitOutcome::Committed => ReconcileAction::ProbeFailed { job_id, reason },
                _ => ReconcileAction::Superseded { job_id },
            })
        },
    }
}

// ─────────────────────────────────────────────────────────────────────
// Container observation
// ─────────────────────────────────────────────────────────────────────

enum QueryOutcome {
    Alive,
    Exited { exit_code: Option<i64> },
    Gone,
    Errored { reason: String },
}

/// Query with bounded exponential backoff. A definitive answer (alive,
/// exited, or gone) ends the attempts; only transient errors retry.
fn query_with_retry<L: ContainerLauncher>(
    launcher: &L,
    container_ref: &str,
    policy: &MonitorPolicy,
) -> QueryOutcome {
    let attempts = policy.query_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 0..attempts {
        if attempt > 0 {
            let backoff = policy.backoff_base * 2u32.saturating_pow(attempt - 1);
            std::thread::sleep(backoff);
        }
        match launcher.query(container_ref) {
            Ok(ContainerQuery { alive: true, .. }) => return QueryOutcome::Alive,
            Ok(ContainerQuery {
                alive: false,
                exit_code,
            }) => return QueryOutcome::Exited { exit_code },
            Err(LauncherError::NotFound { .. }) => return QueryOutcome::Gone,
            Err(e) => {
                tracing::warn!(
                    container_ref,
                    attempt,
                    err = %e,
                    "container query attempt failed"
                );
                last_error = e.to_string();
            },
        }
    }
    QueryOutcome::Errored {
        reason: format!("container query failed after {attempts} attempts: {last_error}"),
    }
}

fn session_elapsed(job: &JobRecord) -> Option<Duration> {
    let started = job.started_at.as_deref().unwrap_or(&job.created_at);
    match chrono::DateTime::parse_from_rfc3339(started) {
        // A start time in the future (clock skew) reads as no elapsed
        // time rather than an instant timeout.
        Ok(dt) => chrono::Utc::now()
            .signed_duration_since(dt.with_timezone(&chrono::Utc))
            .to_std()
            .ok(),
        Err(e) => {
            tracing::warn!(
                job_id = %job.id,
                started_at = started,
                err = %e,
                "unparseable start time; skipping session bound"
            );
            None
        },
    }
}

fn capture_final_logs<L: ContainerLauncher>(launcher: &L, container_ref: &str, job: &JobRecord) {
    let Some(log_path) = &job.log_path else {
        return;
    };
    let contents = match launcher.logs(container_ref, None) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(
                job_id = %job.id,
                container_ref,
                err = %e,
                "could not capture final container logs"
            );
            return;
        },
    };
    if let Some(parent) = log_path.parent() {
        if let Err(e) = create_dir_private(parent) {
            tracing::warn!(path = %parent.display(), err = %e, "could not create log dir");
            return;
        }
    }
    if let Err(e) = std::fs::write(log_path, contents) {
        tracing::warn!(
            job_id = %job.id,
            path = %log_path.display(),
            err = %e,
            "could not write captured logs"
        );
    }
}

/// Read the collaborator-written summary for a job, if present, sane,
/// and within size bounds. Anything else is logged and ignored; a bad
/// summary never blocks finalization.
fn read_result_summary(paths: &StatePaths, job_id: &str) -> Option<serde_json::Value> {
    let path = paths.job_result_summary_file(job_id);
    let metadata = std::fs::symlink_metadata(&path).ok()?;
    if !metadata.is_file() {
        tracing::warn!(path = %path.display(), "result summary is not a regular file; ignoring");
        return None;
    }
    if metadata.len() > MAX_RESULT_SUMMARY_SIZE {
        tracing::warn!(
            path = %path.display(),
            size = metadata.len(),
            max = MAX_RESULT_SUMMARY_SIZE,
            "result summary exceeds size cap; ignoring"
        );
        return None;
    }
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path = %path.display(), err = %e, "could not read result summary");
            return None;
        },
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), err = %e, "result summary is not valid JSON");
            None
        },
    }
}

// ─────────────────────────────────────────────────────────────────────
// Finalization
// ─────────────────────────────────────────────────────────────────────

struct FinalState {
    status: JobStatus,
    exit_code: Option<i64>,
    result_summary: Option<serde_json::Value>,
    failure_reason: Option<String>,
}

enum CommitOutcome {
    Committed,
    Superseded,
}

/// Write a terminal state, but only if the record is still `running`.
/// This is the terminal-stickiness gate: a concurrent kill (or any other
/// terminal transition) wins over the monitor's observation.
fn commit_terminal(
    store: &JobStore,
    job_id: &str,
    state: FinalState,
) -> Result<CommitOutcome, MonitorError> {
    let outcome = store.mutate(|document| {
        let Some(rec) = document.jobs.get_mut(job_id) else {
            return Ok::<CommitOutcome, JobStoreError>(CommitOutcome::Superseded);
        };
        if rec.status != JobStatus::Running {
            tracing::debug!(
                job_id,
                status = %rec.status,
                "record left running mid-pass; discarding observation"
            );
            return Ok(CommitOutcome::Superseded);
        }
        rec.status = state.status;
        rec.exit_code = state.exit_code;
        if state.result_summary.is_some() {
            rec.result_summary = state.result_summary;
        }
        if let Some(reason) = state.failure_reason {
            rec.failure_reason = Some(truncate_reason(&reason));
        }
        rec.updated_at = now_rfc3339();
        Ok(CommitOutcome::Committed)
    })?;
    Ok(outcome)
}
