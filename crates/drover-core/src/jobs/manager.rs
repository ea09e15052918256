//! Job lifecycle operations.
//!
//! The manager is the only writer of job records outside the monitor. It
//! composes the store (durability), the launcher (containers), and the
//! state paths (logs and result artifacts) into the five operations the
//! CLI exposes: create, get, list, kill, cleanup.
//!
//! Every decision that races with another process is made inside a store
//! mutation, where the lock is held: id uniqueness at creation, the
//! pending check before marking a job running, the terminal check before
//! killing, and the still-terminal check before deleting.

use std::io;
use std::path::Path;

use thiserror::Error;

use crate::config::{StatePaths, create_dir_private};
use crate::jobs::record::{
    JobRecord, JobStatus, generate_job_id, now_rfc3339, truncate_reason, validate_job_id,
};
use crate::jobs::store::{JobStore, JobStoreError};
use crate::runtime::launcher::{BindMount, ContainerLauncher, LaunchSpec};

// ─────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────

/// Prefix for manager-assigned container names.
pub const CONTAINER_NAME_PREFIX: &str = "drover-agent-";

/// Container-side path where the per-job results directory is mounted.
pub const RESULT_MOUNT_TARGET: &str = "/drover/out";

/// Environment variable telling the agent its job id.
pub const ENV_JOB_ID: &str = "DROVER_JOB_ID";

/// Environment variable telling the agent where to write results.
pub const ENV_RESULT_DIR: &str = "DROVER_RESULT_DIR";

/// Attempts at drawing an unused job id before giving up.
pub const MAX_ID_GENERATION_ATTEMPTS: usize = 16;

// ─────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────

/// Errors from job lifecycle operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobManagerError {
    /// Caller input is malformed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// No job with the given id exists.
    #[error("job {job_id} not found")]
    NotFound {
        /// Requested id.
        job_id: String,
    },

    /// The job's current status forbids the operation.
    #[error("job {job_id} is already {status}")]
    Conflict {
        /// Affected job.
        job_id: String,
        /// Status blocking the operation.
        status: JobStatus,
    },

    /// Id generation kept colliding with live jobs.
    #[error("could not allocate a unique job id after {attempts} attempts")]
    IdExhausted {
        /// Attempts made under the store lock.
        attempts: usize,
    },

    /// The container failed to launch. The job record is already marked
    /// failed when this is returned.
    #[error("job {job_id} failed to launch: {reason}")]
    Launch {
        /// Affected job.
        job_id: String,
        /// Truncated launcher failure.
        reason: String,
    },

    /// Filesystem operation outside the store failed.
    #[error("I/O failure during {context}: {source}")]
    Io {
        /// What the manager was doing.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The store itself failed.
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl JobManagerError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Requests and reports
// ─────────────────────────────────────────────────────────────────────

/// Input to [`JobManager::create`].
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    /// Opaque configuration recorded verbatim on the job record.
    pub config: serde_json::Value,

    /// How to start the container. The manager adds its own name, result
    /// mount, and job-identity environment on top.
    pub launch: LaunchSpec,

    /// Per-job session bound in seconds; the configured default applies
    /// when unset.
    pub max_session_secs: Option<u64>,
}

/// Which jobs an operation addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFilter {
    /// Every tracked job.
    All,
    /// One job by id.
    Id(String),
    /// Jobs currently in a status.
    Status(JobStatus),
}

/// What one cleanup pass did.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CleanupReport {
    /// Ids whose records were deleted.
    pub removed: Vec<String>,

    /// Jobs left alone because they are not terminal.
    pub skipped_non_terminal: usize,

    /// Resource-release failures, one message per failure. Record
    /// deletion proceeds regardless.
    pub release_errors: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────

/// Job lifecycle operations over one state root.
#[derive(Debug)]
pub struct JobManager<L> {
    store: JobStore,
    launcher: L,
    paths: StatePaths,
}

impl<L: ContainerLauncher> JobManager<L> {
    /// Assemble a manager from its collaborators. All three must point
    /// at the same state root.
    #[must_use]
    pub fn new(store: JobStore, launcher: L, paths: StatePaths) -> Self {
        Self {
            store,
            launcher,
            paths,
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// The underlying launcher.
    #[must_use]
    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// The state-root layout.
    #[must_use]
    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Create a job: persist a pending record, then launch its
    /// container and confirm it as running.
    ///
    /// The pending record is durable before the launcher is asked for
    /// anything, so a crash mid-create leaves a visible record instead
    /// of an untracked container. A launch failure is absorbed into the
    /// record (`failed`, with a reason) and then reported.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Validation`] for an empty image,
    /// [`JobManagerError::Launch`] when the container cannot start, and
    /// store errors.
    pub fn create(&self, request: CreateJobRequest) -> Result<JobRecord, JobManagerError> {
        if request.launch.image.trim().is_empty() {
            return Err(JobManagerError::Validation(
                "launch image must not be empty".to_string(),
            ));
        }

        let config = request.config;
        let max_session_secs = request.max_session_secs;
        let paths = &self.paths;
        let record = self.store.mutate(|document| {
            for _ in 0..MAX_ID_GENERATION_ATTEMPTS {
                let id = generate_job_id();
                if document.jobs.contains_key(&id) {
                    continue;
                }
                let mut record = JobRecord::new(id.clone(), config.clone(), now_rfc3339());
                record.log_path = Some(paths.job_log_file(&id));
                record.max_session_secs = max_session_secs;
                document.jobs.insert(id, record.clone());
                return Ok(record);
            }
            Err(JobManagerError::IdExhausted {
                attempts: MAX_ID_GENERATION_ATTEMPTS,
            })
        })?;

        let result_dir = self.paths.job_result_dir(&record.id);
        if let Err(e) = create_dir_private(&result_dir) {
            let reason = format!("create result dir {}: {e}", result_dir.display());
            self.fail_job(&record.id, &reason)?;
            return Err(JobManagerError::io(
                format!("create result dir {}", result_dir.display()),
                e,
            ));
        }

        let mut launch = request.launch;
        if launch.name.is_none() {
            launch.name = Some(format!("{CONTAINER_NAME_PREFIX}{}", record.id));
        }
        launch.mounts.push(BindMount {
            host: result_dir,
            container: RESULT_MOUNT_TARGET.to_string(),
            read_only: false,
        });
        launch.env.push((ENV_JOB_ID.to_string(), record.id.clone()));
        launch
            .env
            .push((ENV_RESULT_DIR.to_string(), RESULT_MOUNT_TARGET.to_string()));

        match self.launcher.start(&launch) {
            Ok(container_ref) => {
                let job_id = record.id.clone();
                let updated = self.store.mutate(|document| {
                    let Some(rec) = document.jobs.get_mut(&job_id) else {
                        return Err(JobManagerError::NotFound { job_id: job_id.clone() });
                    };
                    if rec.status == JobStatus::Pending {
                        let now = now_rfc3339();
                        rec.status = JobStatus::Running;
                        rec.container_ref = Some(container_ref.clone());
                        rec.started_at = Some(now.clone());
                        rec.updated_at = now;
                    }
                    Ok(rec.clone())
                })?;

                // A kill that landed between insert and confirmation
                // wins; reap the container we just started.
                if updated.status == JobStatus::Killed {
                    if let Err(e) = self.launcher.stop(&container_ref) {
                        tracing::warn!(
                            job_id = %updated.id,
                            container_ref = %container_ref,
                            err = %e,
                            "failed to stop container for killed job"
                        );
                    }
                }
                Ok(updated)
            },
            Err(e) => {
                let reason = truncate_reason(&format!("launch failed: {e}"));
                self.fail_job(&record.id, &reason)?;
                Err(JobManagerError::Launch {
                    job_id: record.id,
                    reason,
                })
            },
        }
    }

    /// Fetch one job.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Validation`] for a malformed id and
    /// [`JobManagerError::NotFound`] for an unknown one.
    pub fn get(&self, job_id: &str) -> Result<JobRecord, JobManagerError> {
        validate_job_id(job_id).map_err(|e| JobManagerError::Validation(e.to_string()))?;
        self.store
            .get(job_id)?
            .ok_or_else(|| JobManagerError::NotFound {
                job_id: job_id.to_string(),
            })
    }

    /// List jobs matching a filter, oldest first.
    ///
    /// # Errors
    ///
    /// An id filter behaves like [`JobManager::get`]; other filters
    /// return an empty list rather than an error when nothing matches.
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, JobManagerError> {
        match filter {
            JobFilter::All => Ok(self.store.list()?),
            JobFilter::Id(id) => Ok(vec![self.get(id)?]),
            JobFilter::Status(status) => {
                let mut records = self.store.list()?;
                records.retain(|r| r.status == *status);
                Ok(records)
            },
        }
    }

    /// Kill a job: best-effort container stop, then mark the record
    /// killed.
    ///
    /// The record becomes `killed` even when the container stop fails;
    /// the monitor's terminal-stickiness check guarantees a concurrent
    /// completion can never overwrite it.
    ///
    /// # Errors
    ///
    /// Returns [`JobManagerError::Conflict`] when the job is already
    /// terminal and [`JobManagerError::NotFound`] for an unknown id.
    pub fn kill(&self, job_id: &str) -> Result<JobRecord, JobManagerError> {
        let current = self.get(job_id)?;
        if current.is_terminal() {
            return Err(JobManagerError::Conflict {
                job_id: job_id.to_string(),
                status: current.status,
            });
        }

        if let Some(container_ref) = &current.container_ref {
            if let Err(e) = self.launcher.stop(container_ref) {
                tracing::warn!(
                    job_id,
                    container_ref = %container_ref,
                    err = %e,
                    "container stop failed; marking job killed anyway"
                );
            }
        }

        self.store.mutate(|document| {
            let Some(rec) = document.jobs.get_mut(job_id) else {
                return Err(JobManagerError::NotFound {
                    job_id: job_id.to_string(),
                });
            };
            // Re-check under the lock: the monitor may have finalized
            // the job since we looked.
            if rec.is_terminal() {
                return Err(JobManagerError::Conflict {
                    job_id: job_id.to_string(),
                    status: rec.status,
                });
            }
            rec.status = JobStatus::Killed;
            rec.updated_at = now_rfc3339();
            Ok(rec.clone())
        })
    }

    /// Delete terminal jobs and release their resources.
    ///
    /// Containers, log files, and result directories are released
    /// best-effort; failures land in the report, never abort the pass.
    /// Record deletion happens in one store mutation, re-checking that
    /// each id is still present and still terminal.
    ///
    /// # Errors
    ///
    /// With an id filter: [`JobManagerError::NotFound`] for an unknown
    /// id, [`JobManagerError::Conflict`] for a non-terminal job. Other
    /// filters only fail on store errors.
    pub fn cleanup(&self, filter: &JobFilter) -> Result<CleanupReport, JobManagerError> {
        let candidates = self.list(filter)?;

        if let JobFilter::Id(id) = filter {
            if let Some(record) = candidates.first() {
                if !record.is_terminal() {
                    return Err(JobManagerError::Conflict {
                        job_id: id.clone(),
                        status: record.status,
                    });
                }
            }
        }

        let mut release_errors = Vec::new();
        let mut skipped_non_terminal = 0usize;
        let mut targets = Vec::new();

        for record in &candidates {
            if !record.is_terminal() {
                skipped_non_terminal += 1;
                continue;
            }
            if let Some(container_ref) = &record.container_ref {
                if let Err(e) = self.launcher.remove(container_ref) {
                    tracing::warn!(
                        job_id = %record.id,
                        container_ref = %container_ref,
                        err = %e,
                        "container removal failed"
                    );
                    release_errors.push(format!("{}: remove container {container_ref}: {e}", record.id));
                }
            }
            if let Some(log_path) = &record.log_path {
                if let Err(e) = remove_file_if_present(log_path) {
                    release_errors.push(format!("{}: remove log {}: {e}", record.id, log_path.display()));
                }
            }
            let result_dir = self.paths.job_result_dir(&record.id);
            if let Err(e) = remove_dir_if_present(&result_dir) {
                release_errors.push(format!("{}: remove results {}: {e}", record.id, result_dir.display()));
            }
            targets.push(record.id.clone());
        }

        let removed = if targets.is_empty() {
            Vec::new()
        } else {
            self.store.mutate(|document| {
                let mut removed = Vec::new();
                for id in &targets {
                    if document.jobs.get(id).is_some_and(JobRecord::is_terminal) {
                        document.jobs.remove(id);
                        removed.push(id.clone());
                    }
                }
                Ok::<Vec<String>, JobManagerError>(removed)
            })?
        };

        Ok(CleanupReport {
            removed,
            skipped_non_terminal,
            release_errors,
        })
    }

    fn fail_job(&self, job_id: &str, reason: &str) -> Result<(), JobManagerError> {
        self.store.mutate(|document| {
            if let Some(rec) = document.jobs.get_mut(job_id) {
                if !rec.is_terminal() {
                    rec.status = JobStatus::Failed;
                    rec.failure_reason = Some(truncate_reason(reason));
                    rec.updated_at = now_rfc3339();
                }
            }
            Ok::<(), JobManagerError>(())
        })
    }
}

fn remove_file_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
