//! Job tracking module.
//!
//! Everything drover knows about a job lives here: the record and
//! document types, the lock-protected store they persist through, the
//! lifecycle operations layered on top, and the reconciliation monitor
//! that keeps records honest about their containers.
//!
//! # Components
//!
//! - **Records**: job statuses, the versioned jobs document, id and
//!   structural validation
//! - **Store**: exclusive-lock, read-validate-mutate-rename persistence
//! - **Manager**: create, get, list, kill, cleanup
//! - **Monitor**: stateless reconciliation of running jobs against live
//!   containers

pub mod manager;
pub mod monitor;
pub mod record;
pub mod store;

// Re-export manager types
pub use manager::{
    CONTAINER_NAME_PREFIX, CleanupReport, CreateJobRequest, ENV_JOB_ID, ENV_RESULT_DIR, JobFilter,
    JobManager, JobManagerError, MAX_ID_GENERATION_ATTEMPTS, RESULT_MOUNT_TARGET,
};
// Re-export monitor types
pub use monitor::{
    DEFAULT_BACKOFF_BASE, DEFAULT_MAX_SESSION, DEFAULT_QUERY_ATTEMPTS, MAX_RESULT_SUMMARY_SIZE,
    MonitorError, MonitorPolicy, ReconcileAction, ReconcileReport, reconcile_jobs,
};
// Re-export record types
pub use record::{
    JOB_ID_LENGTH, JOBS_DOC_SCHEMA_ID, JobRecord, JobStatus, JobsDocumentV1, MAX_JOB_ID_LENGTH,
    MAX_JOBS_DOC_SIZE, MAX_TRACKED_JOBS, RecordError, deserialize_jobs_document, generate_job_id,
    now_rfc3339, validate_job_id,
};
// Re-export store types
pub use store::{
    DEFAULT_STORE_LOCK_TIMEOUT, JobStore, JobStoreError, STORE_LOCK_POLL_INTERVAL,
    STORE_LOCK_POLL_JITTER_MS,
};
