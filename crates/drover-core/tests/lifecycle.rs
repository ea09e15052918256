//! End-to-end lifecycle tests over a simulated container runtime.
//!
//! These tests drive the real store, manager, and monitor against an
//! in-memory runtime, covering:
//!
//! - Run-to-completion: create, agent writes results, exit, reconcile,
//!   cleanup
//! - Operator kill, including kill of a never-launched pending record
//! - Launch failure absorbed into the record
//! - Two handles over one state root observing each other's writes
//!
//! # Test Architecture
//!
//! ```text
//! JobManager ──> JobStore (jobs.json + jobs.lock in a tempdir)
//!     │
//!     └──> SimulatedRuntime (containers as in-memory entries)
//!               ▲
//!               │ finish(container, exit_code, logs)
//!          test scripts the container's fate
//!     ┌──────────────────────────────┐
//!     │ reconcile_jobs() observes it │
//!     └──────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use drover_core::config::StatePaths;
use drover_core::jobs::manager::{CreateJobRequest, JobFilter, JobManager, JobManagerError};
use drover_core::jobs::monitor::{MonitorPolicy, ReconcileAction, ReconcileReport, reconcile_jobs};
use drover_core::jobs::record::{JobRecord, JobStatus, now_rfc3339};
use drover_core::jobs::store::{JobStore, JobStoreError};
use drover_core::runtime::launcher::{
    BuildRequest, ContainerLauncher, ContainerQuery, LaunchSpec, LauncherError,
};
use serde_json::json;

// ============================================================================
// Simulated runtime
// ============================================================================

#[derive(Debug, Clone)]
struct SimContainer {
    alive: bool,
    exit_code: Option<i64>,
    logs: String,
}

/// In-memory stand-in for the container runtime. Containers are entries
/// whose fate the test scripts explicitly.
#[derive(Default)]
struct SimulatedRuntime {
    containers: Mutex<HashMap<String, SimContainer>>,
    fail_next_start: Mutex<bool>,
}

impl SimulatedRuntime {
    /// Script a container exiting with the given code and output.
    fn finish(&self, container_ref: &str, exit_code: i64, logs: &str) {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(container_ref)
            .expect("finishing unknown container");
        container.alive = false;
        container.exit_code = Some(exit_code);
        container.logs = logs.to_string();
    }

    fn is_alive(&self, container_ref: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(container_ref)
            .is_some_and(|c| c.alive)
    }

    fn exists(&self, container_ref: &str) -> bool {
        self.containers.lock().unwrap().contains_key(container_ref)
    }
}

impl ContainerLauncher for SimulatedRuntime {
    fn start(&self, spec: &LaunchSpec) -> Result<String, LauncherError> {
        if std::mem::take(&mut *self.fail_next_start.lock().unwrap()) {
            return Err(LauncherError::CommandFailed {
                context: format!("start container from {}", spec.image),
                status: Some(125),
                stderr: "simulated runtime refused".to_string(),
            });
        }
        let container_ref = spec
            .name
            .clone()
            .expect("manager always assigns a container name");
        self.containers.lock().unwrap().insert(
            container_ref.clone(),
            SimContainer {
                alive: true,
                exit_code: None,
                logs: String::new(),
            },
        );
        Ok(container_ref)
    }

    fn query(&self, container_ref: &str) -> Result<ContainerQuery, LauncherError> {
        let containers = self.containers.lock().unwrap();
        let Some(container) = containers.get(container_ref) else {
            return Err(LauncherError::NotFound {
                container_ref: container_ref.to_string(),
            });
        };
        Ok(ContainerQuery {
            alive: container.alive,
            exit_code: if container.alive {
                None
            } else {
                container.exit_code
            },
        })
    }

    fn logs(&self, container_ref: &str, _tail: Option<u32>) -> Result<String, LauncherError> {
        let containers = self.containers.lock().unwrap();
        containers
            .get(container_ref)
            .map(|c| c.logs.clone())
            .ok_or_else(|| LauncherError::NotFound {
                container_ref: container_ref.to_string(),
            })
    }

    fn stop(&self, container_ref: &str) -> Result<(), LauncherError> {
        let mut containers = self.containers.lock().unwrap();
        let Some(container) = containers.get_mut(container_ref) else {
            return Err(LauncherError::NotFound {
                container_ref: container_ref.to_string(),
            });
        };
        if container.alive {
            container.alive = false;
            container.exit_code = Some(137);
        }
        Ok(())
    }

    fn remove(&self, container_ref: &str) -> Result<(), LauncherError> {
        self.containers.lock().unwrap().remove(container_ref);
        Ok(())
    }

    fn image_exists(&self, _tag: &str) -> Result<bool, LauncherError> {
        Ok(true)
    }

    fn build_image(&self, _request: &BuildRequest) -> Result<(), LauncherError> {
        Ok(())
    }
}

// ============================================================================
// Test helpers
// ============================================================================

fn manager_at(dir: &Path) -> JobManager<SimulatedRuntime> {
    let paths = StatePaths::new(dir);
    paths.ensure_layout().expect("layout");
    let store = JobStore::open(dir).expect("store opens");
    JobManager::new(store, SimulatedRuntime::default(), paths)
}

fn request(task: &str) -> CreateJobRequest {
    CreateJobRequest {
        config: json!({"task": task, "base_image": "ubuntu:24.04"}),
        launch: LaunchSpec::new("claude-agent-0123456789"),
        max_session_secs: None,
    }
}

fn reconcile(manager: &JobManager<SimulatedRuntime>) -> ReconcileReport {
    reconcile_jobs(
        manager.store(),
        manager.launcher(),
        manager.paths(),
        &MonitorPolicy::default(),
    )
    .expect("reconciliation pass")
}

// ============================================================================
// Run to completion
// ============================================================================

#[test]
fn job_runs_to_completion_and_cleans_up() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = manager_at(tmp.path());

    // Create: record confirmed running, container alive.
    let record = manager.create(request("refactor the parser")).expect("creates");
    let container_ref = record.container_ref.clone().expect("container assigned");
    assert_eq!(record.status, JobStatus::Running);
    assert!(manager.launcher().is_alive(&container_ref));

    // While running, a pass leaves everything alone.
    let report = reconcile(&manager);
    assert_eq!(report.still_running, 1);
    assert_eq!(manager.get(&record.id).expect("get").status, JobStatus::Running);

    // The agent writes its summary into the mounted results directory,
    // then the container exits cleanly.
    std::fs::write(
        manager.paths().job_result_summary_file(&record.id),
        br#"{"verdict": "done", "cost_usd": 1.05}"#,
    )
    .expect("agent summary");
    manager
        .launcher()
        .finish(&container_ref, 0, "task finished\n");

    let report = reconcile(&manager);
    assert_eq!(report.completed, 1);
    assert_eq!(
        report.actions,
        vec![ReconcileAction::Completed {
            job_id: record.id.clone()
        }]
    );

    let finished = manager.get(&record.id).expect("get");
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.exit_code, Some(0));
    assert_eq!(
        finished.result_summary,
        Some(json!({"verdict": "done", "cost_usd": 1.05}))
    );
    let log = std::fs::read_to_string(manager.paths().job_log_file(&record.id))
        .expect("captured log");
    assert_eq!(log, "task finished\n");

    // Cleanup releases the container, the log, and the record.
    let cleanup = manager.cleanup(&JobFilter::All).expect("cleanup");
    assert_eq!(cleanup.removed, vec![record.id.clone()]);
    assert!(cleanup.release_errors.is_empty());
    assert!(!manager.launcher().exists(&container_ref));
    assert!(!manager.paths().job_log_file(&record.id).exists());
    assert!(!manager.paths().job_result_dir(&record.id).exists());
    assert!(matches!(
        manager.get(&record.id).expect_err("record gone"),
        JobManagerError::NotFound { .. }
    ));
}

#[test]
fn nonzero_exit_lands_as_failed_with_summary() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = manager_at(tmp.path());

    let record = manager.create(request("doomed run")).expect("creates");
    let container_ref = record.container_ref.clone().expect("container assigned");

    // Agents can leave a summary even when they fail.
    std::fs::write(
        manager.paths().job_result_summary_file(&record.id),
        br#"{"verdict": "gave_up"}"#,
    )
    .expect("agent summary");
    manager.launcher().finish(&container_ref, 3, "boom\n");

    let report = reconcile(&manager);
    assert_eq!(report.failed, 1);

    let failed = manager.get(&record.id).expect("get");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.exit_code, Some(3));
    assert_eq!(failed.result_summary, Some(json!({"verdict": "gave_up"})));
    assert!(
        failed
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("status 3"))
    );
}

// ============================================================================
// Kill
// ============================================================================

#[test]
fn killed_job_stays_killed_through_later_passes() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = manager_at(tmp.path());

    let record = manager.create(request("long run")).expect("creates");
    let container_ref = record.container_ref.clone().expect("container assigned");

    let killed = manager.kill(&record.id).expect("kills");
    assert_eq!(killed.status, JobStatus::Killed);
    assert!(!manager.launcher().is_alive(&container_ref), "container stopped");

    // The stopped container now looks exited; passes must not resurrect
    // or reclassify the killed record.
    for _ in 0..3 {
        let report = reconcile(&manager);
        assert_eq!(report.inspected, 0, "killed jobs are not reconciled");
    }
    let after = manager.get(&record.id).expect("get");
    assert_eq!(after.status, JobStatus::Killed);
    assert!(after.exit_code.is_none());

    let cleanup = manager.cleanup(&JobFilter::Id(record.id.clone())).expect("cleanup");
    assert_eq!(cleanup.removed, vec![record.id.clone()]);

    // Cleanup of everything again finds nothing to do.
    let cleanup = manager.cleanup(&JobFilter::All).expect("idempotent cleanup");
    assert!(cleanup.removed.is_empty());
    assert_eq!(cleanup.skipped_non_terminal, 0);
}

#[test]
fn pending_record_can_be_killed_without_a_container() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = manager_at(tmp.path());

    // A record whose creating process died before launch confirmation.
    manager
        .store()
        .mutate(|document| {
            let record = JobRecord::new("dead00ab", json!({"task": "orphan"}), now_rfc3339());
            document.jobs.insert("dead00ab".to_string(), record);
            Ok::<(), JobStoreError>(())
        })
        .expect("seed pending");

    let report = reconcile(&manager);
    assert_eq!(report.inspected, 0, "pending jobs are not reconciled");

    let killed = manager.kill("dead00ab").expect("kill pending");
    assert_eq!(killed.status, JobStatus::Killed);
    assert!(killed.container_ref.is_none());
}

// ============================================================================
// Launch failure
// ============================================================================

#[test]
fn launch_failure_is_absorbed_and_cleanable() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = manager_at(tmp.path());
    *manager.launcher().fail_next_start.lock().unwrap() = true;

    let err = manager.create(request("never starts")).expect_err("launch fails");
    let JobManagerError::Launch { job_id, .. } = err else {
        panic!("expected Launch, got {err:?}");
    };

    let record = manager.get(&job_id).expect("record persisted");
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.container_ref.is_none());
    assert!(
        record
            .failure_reason
            .as_deref()
            .is_some_and(|r| r.contains("simulated runtime refused"))
    );

    let cleanup = manager.cleanup(&JobFilter::Id(job_id.clone())).expect("cleanup");
    assert_eq!(cleanup.removed, vec![job_id]);
}

// ============================================================================
// Two handles over one state root
// ============================================================================

#[test]
fn separate_handles_observe_each_other() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let first = manager_at(tmp.path());
    let second = manager_at(tmp.path());

    let a = first.create(request("task a")).expect("creates");
    let b = second.create(request("task b")).expect("creates");
    assert_ne!(a.id, b.id);

    // Each handle sees both jobs.
    assert_eq!(first.list(&JobFilter::All).expect("list").len(), 2);
    assert_eq!(second.list(&JobFilter::All).expect("list").len(), 2);

    // A kill through one handle is honored by the other's pass. The
    // second handle's runtime does not know job A's container at all, so
    // its monitor would fail it; the kill must already be terminal.
    first.kill(&a.id).expect("kill through first handle");
    let report = reconcile_jobs(
        second.store(),
        second.launcher(),
        second.paths(),
        &MonitorPolicy::default(),
    )
    .expect("second handle reconciles");
    assert_eq!(report.inspected, 1, "only job B is still running");

    let a_after = second.get(&a.id).expect("get");
    assert_eq!(a_after.status, JobStatus::Killed);
    let b_after = second.get(&b.id).expect("get");
    assert_eq!(b_after.status, JobStatus::Running);
}
