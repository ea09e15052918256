//! Numeric exit-code contract for the drover binary.
//!
//! Every failure class maps to a distinct code so scripts can branch on
//! an outcome without parsing error text:
//!
//! - 0: Success
//! - 1: Generic error (I/O, runtime internals)
//! - 2: Validation error (bad arguments or malformed input)
//! - 3: Not found (unknown job id)
//! - 4: Conflict (operation illegal for the job's current status)
//! - 5: Contention (a named lock stayed held past its deadline)
//! - 6: Integrity (the jobs document failed structural checks)
//! - 7: Launch failure (container runtime refused the job)

use drover_core::jobs::manager::JobManagerError;
use drover_core::jobs::store::JobStoreError;
use drover_core::runtime::build_lock::BuildLockError;

/// Success.
pub const SUCCESS: u8 = 0;
/// Unclassified failures.
pub const GENERIC_ERROR: u8 = 1;
/// Bad arguments or malformed input.
pub const VALIDATION_ERROR: u8 = 2;
/// Unknown job id.
pub const NOT_FOUND: u8 = 3;
/// Operation illegal for the job's current status.
pub const CONFLICT: u8 = 4;
/// A named lock stayed held past its deadline.
pub const CONTENTION: u8 = 5;
/// The jobs document failed structural checks; nothing was repaired.
pub const INTEGRITY: u8 = 6;
/// The container runtime refused to start or build.
pub const LAUNCH_FAILED: u8 = 7;

/// Stable machine-readable label for an exit code, used in JSON error
/// output.
#[must_use]
pub fn label(code: u8) -> &'static str {
    match code {
        SUCCESS => "success",
        VALIDATION_ERROR => "validation_error",
        NOT_FOUND => "not_found",
        CONFLICT => "conflict",
        CONTENTION => "contention",
        INTEGRITY => "integrity",
        LAUNCH_FAILED => "launch_failed",
        _ => "error",
    }
}

/// Map a job-lifecycle error onto the exit-code contract.
#[must_use]
pub fn for_manager_error(error: &JobManagerError) -> u8 {
    match error {
        JobManagerError::Validation(_) => VALIDATION_ERROR,
        JobManagerError::NotFound { .. } => NOT_FOUND,
        JobManagerError::Conflict { .. } => CONFLICT,
        JobManagerError::Launch { .. } => LAUNCH_FAILED,
        JobManagerError::Store(e) => for_store_error(e),
        _ => GENERIC_ERROR,
    }
}

/// Map a store error onto the exit-code contract.
#[must_use]
pub fn for_store_error(error: &JobStoreError) -> u8 {
    match error {
        JobStoreError::LockTimeout { .. } => CONTENTION,
        JobStoreError::Integrity(_) => INTEGRITY,
        JobStoreError::StateDirNotAbsolute(_) => VALIDATION_ERROR,
        _ => GENERIC_ERROR,
    }
}

/// Map a build-coordination error onto the exit-code contract.
#[must_use]
pub fn for_build_error(error: &BuildLockError) -> u8 {
    match error {
        BuildLockError::LockTimeout { .. } => CONTENTION,
        BuildLockError::Launcher(_) => LAUNCH_FAILED,
        _ => GENERIC_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use drover_core::jobs::record::{JobStatus, RecordError};
    use drover_core::runtime::launcher::LauncherError;

    use super::*;

    #[test]
    fn codes_are_distinct() {
        let codes = [
            SUCCESS,
            GENERIC_ERROR,
            VALIDATION_ERROR,
            NOT_FOUND,
            CONFLICT,
            CONTENTION,
            INTEGRITY,
            LAUNCH_FAILED,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn manager_errors_map_to_contract() {
        assert_eq!(
            for_manager_error(&JobManagerError::Validation("bad".into())),
            VALIDATION_ERROR
        );
        assert_eq!(
            for_manager_error(&JobManagerError::NotFound {
                job_id: "a1b2c3d4".into()
            }),
            NOT_FOUND
        );
        assert_eq!(
            for_manager_error(&JobManagerError::Conflict {
                job_id: "a1b2c3d4".into(),
                status: JobStatus::Killed,
            }),
            CONFLICT
        );
        assert_eq!(
            for_manager_error(&JobManagerError::Launch {
                job_id: "a1b2c3d4".into(),
                reason: "refused".into(),
            }),
            LAUNCH_FAILED
        );
    }

    #[test]
    fn store_errors_map_through_manager_wrapper() {
        let contention = JobManagerError::Store(JobStoreError::LockTimeout {
            elapsed_secs: 2,
            timeout_secs: 2,
        });
        assert_eq!(for_manager_error(&contention), CONTENTION);

        let integrity = JobManagerError::Store(JobStoreError::Integrity(
            RecordError::SchemaMismatch {
                expected: "drover.jobs.v1".into(),
                found: "other".into(),
            },
        ));
        assert_eq!(for_manager_error(&integrity), INTEGRITY);
    }

    #[test]
    fn build_errors_map_to_contract() {
        assert_eq!(
            for_build_error(&BuildLockError::LockTimeout {
                tag: "claude-agent-0011223344".into(),
                elapsed_secs: 2,
                timeout_secs: 2,
            }),
            CONTENTION
        );
        assert_eq!(
            for_build_error(&BuildLockError::Launcher(LauncherError::CommandFailed {
                context: "build image".into(),
                status: Some(1),
                stderr: "step failed".into(),
            })),
            LAUNCH_FAILED
        );
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(label(SUCCESS), "success");
        assert_eq!(label(CONTENTION), "contention");
        assert_eq!(label(GENERIC_ERROR), "error");
    }
}
