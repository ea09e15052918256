//! Per-tag build coordination.
//!
//! Building the same agent image from several processes at once wastes
//! minutes of CPU and can leave the runtime cache in a mess. Each image
//! tag gets a named advisory lock file under `locks/`; whoever holds it
//! may build. Everyone else waits, then re-checks the image cache before
//! building, so one tag is built at most once no matter how many `run`
//! invocations race.
//!
//! The check-lock-check dance is the contract:
//!
//! 1. image exists? done, no lock touched.
//! 2. acquire the tag lock (bounded wait).
//! 3. image exists now? someone else built it while we waited; done.
//! 4. build, then release.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::Serialize;
use thiserror::Error;

use crate::config::create_dir_private;
use crate::runtime::launcher::{LauncherError, tag_digest};

/// Base interval between build lock attempts.
pub const BUILD_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Maximum random jitter added to each poll interval, in milliseconds.
pub const BUILD_LOCK_POLL_JITTER_MS: u64 = 100;

/// Default deadline for build lock acquisition. Builds are slow; waiting
/// out a full build someone else started is the common case.
pub const DEFAULT_BUILD_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors from build coordination.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildLockError {
    /// Filesystem operation failed.
    #[error("I/O failure during {context}: {source}")]
    Io {
        /// What the coordinator was doing.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The tag lock could not be acquired before the deadline.
    #[error("timed out waiting for build lock on {tag} after {elapsed_secs}s (limit {timeout_secs}s)")]
    LockTimeout {
        /// Image tag being coordinated.
        tag: String,
        /// Seconds spent waiting.
        elapsed_secs: u64,
        /// Configured deadline in seconds.
        timeout_secs: u64,
    },

    /// The lock syscall failed for a reason other than contention.
    #[error("failed to acquire build lock on {tag}: {source}")]
    LockFailed {
        /// Image tag being coordinated.
        tag: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The cache probe or the build itself failed.
    #[error(transparent)]
    Launcher(#[from] LauncherError),
}

impl BuildLockError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// How an image came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    /// Image was already present; no lock was taken.
    CacheHit,
    /// Another holder built the image while we waited for the lock.
    BuiltElsewhere,
    /// This process built the image.
    Built,
}

impl std::fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::CacheHit => "cache_hit",
            Self::BuiltElsewhere => "built_elsewhere",
            Self::Built => "built",
        })
    }
}

/// Holds one tag's build lock. Dropping releases it.
struct BuildLockGuard {
    _lock_file: std::fs::File,
}

impl std::fmt::Debug for BuildLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildLockGuard").finish_non_exhaustive()
    }
}

/// Serializes image builds per tag across processes.
#[derive(Debug, Clone)]
pub struct BuildLockCoordinator {
    locks_dir: PathBuf,
    lock_timeout: Duration,
}

impl BuildLockCoordinator {
    /// Coordinator over a locks directory. The directory is created
    /// lazily on first acquisition.
    #[must_use]
    pub fn new(locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            lock_timeout: DEFAULT_BUILD_LOCK_TIMEOUT,
        }
    }

    /// Replace the lock-acquisition deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Lock file for one tag. Tags are digested so arbitrary registry
    /// characters never reach the filesystem.
    #[must_use]
    pub fn lock_path(&self, tag: &str) -> PathBuf {
        self.locks_dir.join(format!("build-{}.lock", tag_digest(tag)))
    }

    /// Ensure an image exists, building it under the tag lock if needed.
    ///
    /// `image_exists` is consulted before taking the lock (fast path) and
    /// again after acquiring it, so a build that finished while this
    /// process waited is never repeated. `build` runs with the lock held
    /// and the lock is released whether it succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns [`BuildLockError::LockTimeout`] when the tag stays locked
    /// past the deadline, and propagates probe and build failures.
    pub fn build_if_needed<E, B>(
        &self,
        tag: &str,
        image_exists: E,
        build: B,
    ) -> Result<BuildOutcome, BuildLockError>
    where
        E: Fn() -> Result<bool, LauncherError>,
        B: FnOnce() -> Result<(), LauncherError>,
    {
        if image_exists()? {
            return Ok(BuildOutcome::CacheHit);
        }

        let _guard = self.acquire(tag)?;

        if image_exists()? {
            tracing::debug!(tag, "image appeared while waiting for build lock");
            return Ok(BuildOutcome::BuiltElsewhere);
        }

        tracing::info!(tag, "building agent image");
        build()?;
        Ok(BuildOutcome::Built)
    }

    fn try_acquire(&self, tag: &str) -> Result<Option<BuildLockGuard>, BuildLockError> {
        create_dir_private(&self.locks_dir).map_err(|e| {
            BuildLockError::io(format!("create locks dir {}", self.locks_dir.display()), e)
        })?;
        let lock_path = self.lock_path(tag);
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| {
                BuildLockError::io(format!("open lock file {}", lock_path.display()), e)
            })?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => Ok(Some(BuildLockGuard {
                _lock_file: lock_file,
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(BuildLockError::LockFailed {
                tag: tag.to_string(),
                source: e,
            }),
        }
    }

    fn acquire(&self, tag: &str) -> Result<BuildLockGuard, BuildLockError> {
        let start = Instant::now();
        let deadline = start + self.lock_timeout;
        loop {
            if let Some(guard) = self.try_acquire(tag)? {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(BuildLockError::LockTimeout {
                    tag: tag.to_string(),
                    elapsed_secs: start.elapsed().as_secs(),
                    timeout_secs: self.lock_timeout.as_secs(),
                });
            }
            let jitter = rand::random::<u64>() % (BUILD_LOCK_POLL_JITTER_MS + 1);
            std::thread::sleep(BUILD_LOCK_POLL_INTERVAL + Duration::from_millis(jitter));
        }
    }
}
