//! Durable, lock-protected persistence for the jobs document.
//!
//! One advisory lock file guards the whole document. Every read and every
//! mutation takes that lock exclusively, so concurrent drover processes
//! serialize cleanly: lock, read, mutate in memory, write to a temp file,
//! rename into place, release. Readers that lose the race simply observe
//! the previous complete document; no process ever sees a torn write.
//!
//! Lock acquisition polls with jitter and a hard deadline. A process that
//! cannot get the lock in time fails with [`JobStoreError::LockTimeout`]
//! instead of blocking forever.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;

use crate::config::{JOBS_FILE_NAME, JOBS_LOCK_FILE_NAME, create_dir_private};
use crate::jobs::record::{
    JobRecord, JobsDocumentV1, MAX_JOBS_DOC_SIZE, RecordError, deserialize_jobs_document,
};

// ─────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────

/// Base interval between store lock attempts.
pub const STORE_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum random jitter added to each poll interval, in milliseconds.
/// Jitter keeps contending processes from retrying in lockstep.
pub const STORE_LOCK_POLL_JITTER_MS: u64 = 50;

/// Default deadline for store lock acquisition.
pub const DEFAULT_STORE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Read chunk size for the bounded document read.
const READ_CHUNK_SIZE: usize = 8192;

// ─────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────

/// Errors from jobs store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobStoreError {
    /// Filesystem operation failed.
    #[error("I/O failure during {context}: {source}")]
    Io {
        /// What the store was doing.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The store lock could not be acquired before the deadline.
    #[error("timed out waiting for jobs store lock after {elapsed_secs}s (limit {timeout_secs}s)")]
    LockTimeout {
        /// Seconds spent waiting.
        elapsed_secs: u64,
        /// Configured deadline in seconds.
        timeout_secs: u64,
    },

    /// The lock syscall itself failed for a reason other than contention.
    #[error("failed to acquire jobs store lock: {source}")]
    LockFailed {
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The state directory is not an absolute path.
    #[error("jobs store state directory must be an absolute path: {0}")]
    StateDirNotAbsolute(String),

    /// The on-disk document failed size, parse, or structural validation.
    #[error(transparent)]
    Integrity(#[from] RecordError),
}

impl JobStoreError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Lock guard
// ─────────────────────────────────────────────────────────────────────

/// Holds the exclusive store lock. Dropping the guard closes the file,
/// which releases the advisory lock.
struct StoreLockGuard {
    _lock_file: std::fs::File,
}

impl std::fmt::Debug for StoreLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLockGuard").finish_non_exhaustive()
    }
}

fn try_acquire_store_lock(lock_path: &Path) -> Result<Option<StoreLockGuard>, JobStoreError> {
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|e| JobStoreError::io(format!("open lock file {}", lock_path.display()), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = std::fs::set_permissions(lock_path, perms) {
            tracing::warn!(
                path = %lock_path.display(),
                err = %e,
                "failed to restrict lock file permissions"
            );
        }
    }

    match lock_file.try_lock_exclusive() {
        Ok(()) => Ok(Some(StoreLockGuard {
            _lock_file: lock_file,
        })),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(JobStoreError::LockFailed { source: e }),
    }
}

fn acquire_store_lock(lock_path: &Path, timeout: Duration) -> Result<StoreLockGuard, JobStoreError> {
    let start = Instant::now();
    let deadline = start + timeout;
    loop {
        if let Some(guard) = try_acquire_store_lock(lock_path)? {
            return Ok(guard);
        }
        if Instant::now() >= deadline {
            return Err(JobStoreError::LockTimeout {
                elapsed_secs: start.elapsed().as_secs(),
                timeout_secs: timeout.as_secs(),
            });
        }
        let jitter = rand::random::<u64>() % (STORE_LOCK_POLL_JITTER_MS + 1);
        std::thread::sleep(STORE_LOCK_POLL_INTERVAL + Duration::from_millis(jitter));
    }
}

// ─────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────

/// Handle to the on-disk jobs document.
///
/// Handles are cheap and carry no cached state; every operation goes
/// through the lock and reads the document fresh. Concurrent processes
/// each construct their own handle over the same state directory.
#[derive(Debug, Clone)]
pub struct JobStore {
    state_dir: PathBuf,
    jobs_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl JobStore {
    /// Open (and create if needed) the store under a state directory.
    ///
    /// # Errors
    ///
    /// Returns [`JobStoreError::StateDirNotAbsolute`] for relative paths
    /// and an I/O error when the directory cannot be created.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self, JobStoreError> {
        let state_dir = state_dir.into();
        if !state_dir.is_absolute() {
            return Err(JobStoreError::StateDirNotAbsolute(
                state_dir.display().to_string(),
            ));
        }
        create_dir_private(&state_dir)
            .map_err(|e| JobStoreError::io(format!("create state dir {}", state_dir.display()), e))?;
        let jobs_path = state_dir.join(JOBS_FILE_NAME);
        let lock_path = state_dir.join(JOBS_LOCK_FILE_NAME);
        Ok(Self {
            state_dir,
            jobs_path,
            lock_path,
            lock_timeout: DEFAULT_STORE_LOCK_TIMEOUT,
        })
    }

    /// Replace the lock-acquisition deadline.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The state directory this store lives under.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Path of the jobs document.
    #[must_use]
    pub fn jobs_path(&self) -> &Path {
        &self.jobs_path
    }

    /// Read the current document under the lock.
    ///
    /// A missing jobs file reads as an empty document; first use needs no
    /// initialization step.
    ///
    /// # Errors
    ///
    /// Returns lock, I/O, and integrity errors.
    pub fn load(&self) -> Result<JobsDocumentV1, JobStoreError> {
        let _guard = acquire_store_lock(&self.lock_path, self.lock_timeout)?;
        read_document(&self.jobs_path)
    }

    /// Apply one atomic mutation to the document.
    ///
    /// Acquires the lock, reads and validates the document, runs `op`,
    /// revalidates, and atomically replaces the file. If `op` returns an
    /// error the document on disk is left untouched.
    ///
    /// The error type only needs a conversion from [`JobStoreError`], so
    /// callers can abort with their own domain errors from inside `op`.
    ///
    /// # Errors
    ///
    /// Returns lock, I/O, and integrity errors, or whatever `op` returns.
    pub fn mutate<T, E>(
        &self,
        op: impl FnOnce(&mut JobsDocumentV1) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<JobStoreError>,
    {
        let _guard = acquire_store_lock(&self.lock_path, self.lock_timeout)
            .map_err(E::from)?;
        let mut document = read_document(&self.jobs_path).map_err(E::from)?;
        let value = op(&mut document)?;
        document
            .validate_structure()
            .map_err(|e| E::from(JobStoreError::from(e)))?;
        write_document(&self.jobs_path, &document).map_err(E::from)?;
        Ok(value)
    }

    /// Fetch one record by id.
    ///
    /// # Errors
    ///
    /// Returns lock, I/O, and integrity errors. A missing id is `None`,
    /// not an error.
    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.load()?.jobs.get(job_id).cloned())
    }

    /// List all records, oldest first (ties broken by id).
    ///
    /// # Errors
    ///
    /// Returns lock, I/O, and integrity errors.
    pub fn list(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        let document = self.load()?;
        let mut records: Vec<JobRecord> = document.jobs.into_values().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }

    /// Insert or replace one record.
    ///
    /// # Errors
    ///
    /// Returns integrity errors for an invalid id, plus lock and I/O
    /// errors.
    pub fn put(&self, record: JobRecord) -> Result<(), JobStoreError> {
        self.mutate(|document| {
            document.jobs.insert(record.id.clone(), record);
            Ok::<(), JobStoreError>(())
        })
    }

    /// Remove one record. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns lock, I/O, and integrity errors.
    pub fn delete(&self, job_id: &str) -> Result<bool, JobStoreError> {
        self.mutate(|document| Ok::<bool, JobStoreError>(document.jobs.remove(job_id).is_some()))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Disk I/O
// ─────────────────────────────────────────────────────────────────────

fn read_document(jobs_path: &Path) -> Result<JobsDocumentV1, JobStoreError> {
    match std::fs::symlink_metadata(jobs_path) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            return Err(JobStoreError::io(
                format!("open jobs document {}", jobs_path.display()),
                io::Error::new(io::ErrorKind::InvalidInput, "refusing to follow symlink"),
            ));
        },
        Ok(_) => {},
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(JobsDocumentV1::empty());
        },
        Err(e) => {
            return Err(JobStoreError::io(
                format!("stat jobs document {}", jobs_path.display()),
                e,
            ));
        },
    }

    let bytes = bounded_read_file(jobs_path, MAX_JOBS_DOC_SIZE)?;
    Ok(deserialize_jobs_document(&bytes)?)
}

/// Read at most `max_len` bytes; anything beyond the cap is an integrity
/// error, not a truncation.
fn bounded_read_file(path: &Path, max_len: usize) -> Result<Vec<u8>, JobStoreError> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NOFOLLOW);
    }
    let mut file = options
        .open(path)
        .map_err(|e| JobStoreError::io(format!("open jobs document {}", path.display()), e))?;

    let mut bytes = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut chunk)
            .map_err(|e| JobStoreError::io(format!("read jobs document {}", path.display()), e))?;
        if n == 0 {
            return Ok(bytes);
        }
        if bytes.len() + n > max_len {
            return Err(JobStoreError::Integrity(RecordError::Oversized {
                actual: bytes.len() + n,
                max: max_len,
            }));
        }
        bytes.extend_from_slice(&chunk[..n]);
    }
}

fn write_document(jobs_path: &Path, document: &JobsDocumentV1) -> Result<(), JobStoreError> {
    let bytes = serde_json::to_vec_pretty(document).map_err(|e| {
        JobStoreError::io(
            "serialize jobs document",
            io::Error::new(io::ErrorKind::InvalidData, e),
        )
    })?;
    if bytes.len() > MAX_JOBS_DOC_SIZE {
        return Err(JobStoreError::Integrity(RecordError::Oversized {
            actual: bytes.len(),
            max: MAX_JOBS_DOC_SIZE,
        }));
    }
    atomic_write(jobs_path, &bytes)
}

/// Write bytes to a sibling temp file, fsync, then rename over the
/// target. Readers see either the old document or the new one.
fn atomic_write(target: &Path, bytes: &[u8]) -> Result<(), JobStoreError> {
    let parent = target.parent().ok_or_else(|| {
        JobStoreError::io(
            format!("resolve parent of {}", target.display()),
            io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"),
        )
    })?;

    let temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| JobStoreError::io(format!("create temp file in {}", parent.display()), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = temp.as_file().set_permissions(perms) {
            tracing::warn!(
                path = %temp.path().display(),
                err = %e,
                "failed to restrict temp file permissions"
            );
        }
    }

    temp.as_file()
        .write_all(bytes)
        .map_err(|e| JobStoreError::io(format!("write temp file {}", temp.path().display()), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| JobStoreError::io(format!("sync temp file {}", temp.path().display()), e))?;
    temp.persist(target)
        .map_err(|e| JobStoreError::io(format!("rename into {}", target.display()), e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::jobs::record::{JOBS_DOC_SCHEMA_ID, JobStatus, now_rfc3339};

    fn open_store(dir: &Path) -> JobStore {
        JobStore::open(dir).expect("store opens")
    }

    fn record(id: &str) -> JobRecord {
        JobRecord::new(id, json!({"task": "demo"}), now_rfc3339())
    }

    #[test]
    fn missing_file_reads_as_empty_document() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let document = store.load().expect("loads");
        assert_eq!(document.schema, JOBS_DOC_SCHEMA_ID);
        assert!(document.jobs.is_empty());
        assert!(!store.jobs_path().exists(), "load must not create the file");
    }

    #[test]
    fn rejects_relative_state_dir() {
        let err = JobStore::open("relative/dir").expect_err("relative rejected");
        assert!(matches!(err, JobStoreError::StateDirNotAbsolute(_)));
    }

    #[test]
    fn put_then_get_roundtrip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        store.put(record("ab12cd34")).expect("put");

        let fetched = store.get("ab12cd34").expect("get").expect("present");
        assert_eq!(fetched.id, "ab12cd34");
        assert_eq!(fetched.status, JobStatus::Pending);
        assert!(store.get("ffffffff").expect("get").is_none());
        assert!(store.jobs_path().is_file());
    }

    #[test]
    fn delete_reports_presence() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        store.put(record("ab12cd34")).expect("put");

        assert!(store.delete("ab12cd34").expect("delete"));
        assert!(!store.delete("ab12cd34").expect("delete again"));
        assert!(store.get("ab12cd34").expect("get").is_none());
    }

    #[test]
    fn list_sorts_by_creation_then_id() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());

        let mut older = record("zz999999");
        older.created_at = "2026-08-25T09:00:00Z".to_string();
        let mut newer = record("aa111111");
        newer.created_at = "2026-08-25T10:00:00Z".to_string();
        let mut tied = record("bb222222");
        tied.created_at = "2026-08-25T10:00:00Z".to_string();

        for r in [newer, older, tied] {
            store.put(r).expect("put");
        }

        let ids: Vec<String> = store.list().expect("list").into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["zz999999", "aa111111", "bb222222"]);
    }

    #[test]
    fn mutate_passes_value_through() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let count = store
            .mutate(|document| {
                document.jobs.insert("ab12cd34".to_string(), record("ab12cd34"));
                Ok::<usize, JobStoreError>(document.jobs.len())
            })
            .expect("mutate");
        assert_eq!(count, 1);
        assert!(store.get("ab12cd34").expect("get").is_some());
    }

    #[test]
    fn failed_mutation_leaves_document_untouched() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        store.put(record("ab12cd34")).expect("put");

        #[derive(Debug, thiserror::Error)]
        enum TestError {
            #[error("store: {0}")]
            Store(#[from] JobStoreError),
            #[error("abort")]
            Abort,
        }

        let err = store
            .mutate(|document| {
                document.jobs.clear();
                Err::<(), TestError>(TestError::Abort)
            })
            .expect_err("op error propagates");
        assert!(matches!(err, TestError::Abort));

        let document = store.load().expect("load");
        assert_eq!(document.jobs.len(), 1, "aborted mutation must not persist");
    }

    #[test]
    fn rejects_corrupt_json_on_disk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        std::fs::write(store.jobs_path(), b"{definitely not json").expect("write");

        let err = store.load().expect_err("corrupt rejected");
        assert!(matches!(
            err,
            JobStoreError::Integrity(RecordError::Parse(_))
        ));
    }

    #[test]
    fn rejects_schema_mismatch_on_disk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        std::fs::write(
            store.jobs_path(),
            br#"{"schema": "drover.jobs.v99", "jobs": {}}"#,
        )
        .expect("write");

        let err = store.load().expect_err("schema rejected");
        assert!(matches!(
            err,
            JobStoreError::Integrity(RecordError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn rejects_oversized_document_on_disk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        let oversized = vec![b'x'; MAX_JOBS_DOC_SIZE + 1];
        std::fs::write(store.jobs_path(), &oversized).expect("write");

        let err = store.load().expect_err("oversized rejected");
        assert!(matches!(
            err,
            JobStoreError::Integrity(RecordError::Oversized { .. })
        ));
    }

    #[test]
    fn refuses_to_grow_document_past_cap() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        store.put(record("ab12cd34")).expect("put");

        let huge = "y".repeat(MAX_JOBS_DOC_SIZE);
        let err = store
            .mutate(|document| {
                if let Some(r) = document.jobs.get_mut("ab12cd34") {
                    r.config = json!({ "blob": huge });
                }
                Ok::<(), JobStoreError>(())
            })
            .expect_err("oversized write rejected");
        assert!(matches!(
            err,
            JobStoreError::Integrity(RecordError::Oversized { .. })
        ));

        let reloaded = store.get("ab12cd34").expect("get").expect("present");
        assert_eq!(reloaded.config, json!({"task": "demo"}), "write must not land");
    }

    #[test]
    fn concurrent_mutations_all_land() {
        const THREADS: usize = 8;
        const ITERS: usize = 5;

        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().to_path_buf();

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let dir = dir.clone();
                scope.spawn(move || {
                    let store = open_store(&dir);
                    for i in 0..ITERS {
                        let id = format!("job-{t}-{i}");
                        store.put(record(&id)).expect("concurrent put");
                    }
                });
            }
        });

        let store = open_store(&dir);
        let document = store.load().expect("load");
        document.validate_structure().expect("valid after race");
        assert_eq!(document.jobs.len(), THREADS * ITERS, "lost update detected");
    }

    #[test]
    fn contention_times_out_within_bounds() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path()).with_lock_timeout(Duration::from_secs(2));

        // Hold the lock on a separate file handle for the whole test.
        let holder = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(tmp.path().join(JOBS_LOCK_FILE_NAME))
            .expect("open lock file");
        holder.try_lock_exclusive().expect("hold lock");

        let start = Instant::now();
        let err = store.load().expect_err("times out");
        let elapsed = start.elapsed();

        assert!(matches!(err, JobStoreError::LockTimeout { .. }), "got {err:?}");
        assert!(elapsed >= Duration::from_secs(2), "gave up early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "gave up late: {elapsed:?}");
    }

    #[test]
    fn lock_releases_after_operation() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open_store(tmp.path());
        store.put(record("ab12cd34")).expect("put");

        let probe = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(tmp.path().join(JOBS_LOCK_FILE_NAME))
            .expect("open lock file");
        probe.try_lock_exclusive().expect("lock free after put");
    }
}
