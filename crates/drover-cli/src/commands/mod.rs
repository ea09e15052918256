//! Command implementations for the drover binary.
//!
//! Each command module exposes a `run` function returning a `u8` exit
//! code from the contract in [`crate::exit_codes`]. Shared plumbing
//! (state-root resolution, manager construction, output helpers) lives
//! here.

pub mod cleanup;
pub mod kill;
pub mod logs;
pub mod run;
pub mod status;

use std::path::Path;

use anyhow::{Context, Result};
use drover_core::config::{DroverConfig, StatePaths, resolve_home};
use drover_core::jobs::manager::{JobManager, JobManagerError};
use drover_core::jobs::monitor::{MonitorError, MonitorPolicy, reconcile_jobs};
use drover_core::jobs::store::JobStore;
use drover_core::runtime::docker::DockerCli;
use serde::Serialize;

use crate::exit_codes;

/// Resolved configuration and filesystem layout shared by every
/// command.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Effective configuration (file under the state root, or defaults).
    pub config: DroverConfig,
    /// Layout under the state root.
    pub paths: StatePaths,
}

/// Resolve the state root and load configuration.
///
/// An explicit `--home` wins over `$DROVER_HOME`, which wins over
/// `~/.drover`. The layout is created on first use.
///
/// # Errors
///
/// Fails when the root cannot be resolved or created, or when a config
/// file exists but does not parse.
pub fn load_context(home_override: Option<&Path>) -> Result<CommandContext> {
    let root = match home_override {
        Some(dir) => dir.to_path_buf(),
        None => resolve_home().context("failed to resolve drover home")?,
    };
    let root = if root.is_absolute() {
        root
    } else {
        std::env::current_dir()
            .context("failed to resolve current directory")?
            .join(root)
    };

    let paths = StatePaths::new(&root);
    paths
        .ensure_layout()
        .with_context(|| format!("failed to create state root {}", root.display()))?;
    let config = DroverConfig::load_or_default(&root)
        .with_context(|| format!("failed to load config under {}", root.display()))?;

    Ok(CommandContext { config, paths })
}

impl CommandContext {
    /// Open a job manager over this context's state root.
    ///
    /// # Errors
    ///
    /// Fails when the state root is rejected by the store.
    pub fn open_manager(&self) -> Result<JobManager<DockerCli>, JobManagerError> {
        let store = JobStore::open(self.paths.root())?
            .with_lock_timeout(self.config.limits.store_lock_timeout());
        let launcher = DockerCli::with_binary(&self.config.docker.binary);
        Ok(JobManager::new(store, launcher, self.paths.clone()))
    }

    /// Monitor policy derived from the configured limits.
    #[must_use]
    pub fn monitor_policy(&self) -> MonitorPolicy {
        MonitorPolicy::from_limits(&self.config.limits)
    }
}

/// Run one reconciliation pass so query commands report fresh statuses.
///
/// Pass-level failures (store lock contention, document corruption)
/// surface as an exit code; per-job query failures are already absorbed
/// into the records.
pub fn reconcile_pass(
    context: &CommandContext,
    manager: &JobManager<DockerCli>,
    json_output: bool,
) -> Result<(), u8> {
    match reconcile_jobs(
        manager.store(),
        manager.launcher(),
        manager.paths(),
        &context.monitor_policy(),
    ) {
        Ok(report) => {
            tracing::debug!(
                inspected = report.inspected,
                completed = report.completed,
                failed = report.failed,
                "reconciliation pass before command"
            );
            Ok(())
        },
        Err(e) => {
            let code = match &e {
                MonitorError::Store(store_err) => exit_codes::for_store_error(store_err),
                _ => exit_codes::GENERIC_ERROR,
            };
            Err(output_error(
                json_output,
                code,
                &format!("reconciliation failed: {e}"),
            ))
        },
    }
}

/// Error payload for `--json` output.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Stable error code matching the exit-code contract.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Print an error in the requested format and return the exit code.
pub fn output_error(json_output: bool, code: u8, message: &str) -> u8 {
    if json_output {
        let error = ErrorResponse {
            code: exit_codes::label(code).to_string(),
            message: message.to_string(),
        };
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&error).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        eprintln!("Error: {message}");
    }
    code
}

/// Print a manager error and map it onto the exit-code contract.
pub fn output_manager_error(json_output: bool, error: &JobManagerError) -> u8 {
    output_error(
        json_output,
        exit_codes::for_manager_error(error),
        &error.to_string(),
    )
}

/// Print a value as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_creates_layout_under_explicit_home() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let context = load_context(Some(tmp.path())).expect("context loads");

        assert_eq!(context.paths.root(), tmp.path());
        assert!(context.paths.locks_dir().is_dir());
        assert!(context.paths.logs_dir().is_dir());
        assert!(context.paths.results_dir().is_dir());
        // No config file present: defaults apply.
        assert_eq!(context.config.docker.binary, "docker");
    }

    #[test]
    fn context_reads_config_from_the_state_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            tmp.path().join("config.toml"),
            "[docker]\nbinary = \"podman\"\n",
        )
        .expect("write config");

        let context = load_context(Some(tmp.path())).expect("context loads");
        assert_eq!(context.config.docker.binary, "podman");
    }

    #[test]
    fn malformed_config_fails_context_loading() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("config.toml"), "not valid toml [").expect("write config");
        assert!(load_context(Some(tmp.path())).is_err());
    }
}
