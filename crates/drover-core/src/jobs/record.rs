//! Job records and the versioned jobs document.
//!
//! The entire tracked-job state of one drover installation is a single
//! JSON document: a schema identifier plus a map of job id to record. The
//! document is the unit of persistence; [`crate::jobs::store`] owns how it
//! reaches disk.
//!
//! Records only ever move forward through the status lifecycle:
//!
//! ```text
//! pending ──> running ──> completed
//!    │           │──────> failed
//!    └───────────┴──────> killed
//! ```
//!
//! Terminal statuses are sticky. No transition leaves `completed`,
//! `failed`, or `killed`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────

/// Schema identifier for the jobs document.
pub const JOBS_DOC_SCHEMA_ID: &str = "drover.jobs.v1";

/// Maximum serialized size of the jobs document (1 MiB).
///
/// Anything larger is rejected before parsing so a corrupt or hostile
/// document cannot exhaust memory.
pub const MAX_JOBS_DOC_SIZE: usize = 1024 * 1024;

/// Maximum number of tracked jobs in one document.
pub const MAX_TRACKED_JOBS: usize = 4096;

/// Length of generated job ids.
pub const JOB_ID_LENGTH: usize = 8;

/// Maximum accepted length for a job id, generated or caller-supplied.
pub const MAX_JOB_ID_LENGTH: usize = 64;

/// Maximum stored length for a failure reason. Longer reasons are
/// truncated, never rejected.
pub const MAX_FAILURE_REASON_LENGTH: usize = 512;

// ─────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────

/// Validation failures for job records and the jobs document.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordError {
    /// Job id is empty, too long, or contains invalid characters.
    #[error("invalid job id {0:?}: expected 1-{MAX_JOB_ID_LENGTH} chars of [a-z0-9_-]")]
    InvalidJobId(String),

    /// Document is larger than [`MAX_JOBS_DOC_SIZE`].
    #[error("jobs document too large: {actual} bytes exceeds {max}-byte cap")]
    Oversized {
        /// Observed size in bytes.
        actual: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// Document bytes are not valid JSON for the expected shape.
    #[error("cannot parse jobs document: {0}")]
    Parse(String),

    /// Document schema identifier does not match [`JOBS_DOC_SCHEMA_ID`].
    #[error("jobs document schema mismatch: expected {expected:?}, found {found:?}")]
    SchemaMismatch {
        /// Schema identifier this build understands.
        expected: String,
        /// Schema identifier found in the document.
        found: String,
    },

    /// A map key disagrees with the record's own id field.
    #[error("jobs document key {key:?} does not match record id {id:?}")]
    IdMismatch {
        /// Key under which the record is stored.
        key: String,
        /// Id embedded in the record.
        id: String,
    },

    /// Document tracks more jobs than [`MAX_TRACKED_JOBS`].
    #[error("jobs document tracks {count} jobs, exceeding cap of {max}")]
    TooManyJobs {
        /// Number of tracked jobs.
        count: usize,
        /// Maximum allowed.
        max: usize,
    },
}

// ─────────────────────────────────────────────────────────────────────
// Status lifecycle
// ─────────────────────────────────────────────────────────────────────

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Record exists; container launch not yet confirmed.
    Pending,
    /// Container launch confirmed; job is executing.
    Running,
    /// Container exited with status zero.
    Completed,
    /// Container exited nonzero, launch failed, or the monitor gave up.
    Failed,
    /// Operator requested termination.
    Killed,
}

impl JobStatus {
    /// Whether this status is terminal. Terminal statuses never change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }

    /// Canonical lowercase name, matching the serialized form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "killed" => Ok(Self::Killed),
            other => Err(RecordError::Parse(format!("unknown job status {other:?}"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────

/// One tracked job.
///
/// Timestamps are RFC 3339 UTC strings with second precision. `config` is
/// an opaque JSON blob recorded verbatim at creation; the core never
/// interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRecord {
    /// Unique job identifier.
    pub id: String,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Creation time.
    pub created_at: String,

    /// Time of the last mutation to this record.
    pub updated_at: String,

    /// Time the container launch was confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// Container runtime handle, set once launch is confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,

    /// Caller-supplied job configuration, recorded verbatim.
    pub config: serde_json::Value,

    /// Where captured container logs land.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,

    /// Container exit code, set at completion or failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,

    /// Collaborator-produced summary harvested at finalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<serde_json::Value>,

    /// Why the job failed, for `failed` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Per-job session bound in seconds, overriding the configured
    /// default when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_session_secs: Option<u64>,
}

impl JobRecord {
    /// Create a fresh pending record.
    #[must_use]
    pub fn new(id: impl Into<String>, config: serde_json::Value, now: impl Into<String>) -> Self {
        let now = now.into();
        Self {
            id: id.into(),
            status: JobStatus::Pending,
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            container_ref: None,
            config,
            log_path: None,
            exit_code: None,
            result_summary: None,
            failure_reason: None,
            max_session_secs: None,
        }
    }

    /// Whether this record is in a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// The versioned jobs document: every tracked job of one installation.
///
/// `BTreeMap` keeps serialization order deterministic, so repeated writes
/// of the same state produce identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobsDocumentV1 {
    /// Schema identifier; must equal [`JOBS_DOC_SCHEMA_ID`].
    pub schema: String,

    /// Tracked jobs, keyed by job id.
    pub jobs: BTreeMap<String, JobRecord>,
}

impl JobsDocumentV1 {
    /// An empty document with the current schema. This is the logical
    /// content of a missing jobs file.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            schema: JOBS_DOC_SCHEMA_ID.to_string(),
            jobs: BTreeMap::new(),
        }
    }

    /// Validate structural invariants beyond what serde enforces.
    ///
    /// Checks the schema identifier, the job-count cap, id charsets, and
    /// key/record id agreement.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate_structure(&self) -> Result<(), RecordError> {
        if self.schema != JOBS_DOC_SCHEMA_ID {
            return Err(RecordError::SchemaMismatch {
                expected: JOBS_DOC_SCHEMA_ID.to_string(),
                found: self.schema.clone(),
            });
        }
        if self.jobs.len() > MAX_TRACKED_JOBS {
            return Err(RecordError::TooManyJobs {
                count: self.jobs.len(),
                max: MAX_TRACKED_JOBS,
            });
        }
        for (key, record) in &self.jobs {
            validate_job_id(key)?;
            if *key != record.id {
                return Err(RecordError::IdMismatch {
                    key: key.clone(),
                    id: record.id.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Default for JobsDocumentV1 {
    fn default() -> Self {
        Self::empty()
    }
}

/// Parse and validate a jobs document from raw bytes.
///
/// Applies the size cap before parsing and structural validation after,
/// so callers get a document that is safe to operate on.
///
/// # Errors
///
/// Returns [`RecordError::Oversized`] past the size cap,
/// [`RecordError::Parse`] for malformed JSON or unknown fields, and the
/// structural errors from [`JobsDocumentV1::validate_structure`].
pub fn deserialize_jobs_document(data: &[u8]) -> Result<JobsDocumentV1, RecordError> {
    if data.len() > MAX_JOBS_DOC_SIZE {
        return Err(RecordError::Oversized {
            actual: data.len(),
            max: MAX_JOBS_DOC_SIZE,
        });
    }
    let document: JobsDocumentV1 =
        serde_json::from_slice(data).map_err(|e| RecordError::Parse(e.to_string()))?;
    document.validate_structure()?;
    Ok(document)
}

// ─────────────────────────────────────────────────────────────────────
// Job ids
// ─────────────────────────────────────────────────────────────────────

/// Validate a job id: 1 to [`MAX_JOB_ID_LENGTH`] characters, lowercase
/// alphanumeric plus `-` and `_`.
///
/// # Errors
///
/// Returns [`RecordError::InvalidJobId`] on any violation.
pub fn validate_job_id(id: &str) -> Result<(), RecordError> {
    if id.is_empty() || id.len() > MAX_JOB_ID_LENGTH {
        return Err(RecordError::InvalidJobId(id.to_string()));
    }
    let valid = id
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if !valid {
        return Err(RecordError::InvalidJobId(id.to_string()));
    }
    Ok(())
}

/// Generate a fresh job id: the first [`JOB_ID_LENGTH`] characters of a
/// random UUID in simple form. Uniqueness against live ids is the
/// caller's responsibility, checked under the store lock.
#[must_use]
pub fn generate_job_id() -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    full[..JOB_ID_LENGTH].to_string()
}

/// Current time as an RFC 3339 UTC string with second precision.
#[must_use]
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Truncate a failure reason to [`MAX_FAILURE_REASON_LENGTH`] on a char
/// boundary.
#[must_use]
pub fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_FAILURE_REASON_LENGTH {
        return reason.to_string();
    }
    let mut end = MAX_FAILURE_REASON_LENGTH;
    while end > 0 && !reason.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &reason[..end])
}
