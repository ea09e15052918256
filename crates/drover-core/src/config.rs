//! Configuration and state-root layout.
//!
//! drover keeps all cross-process state under a single directory (the
//! "state root"), resolved from `$DROVER_HOME` or `~/.drover`. An optional
//! `config.toml` at the state root tunes agent defaults, the container
//! runtime binary, and operational limits.
//!
//! # State Root Layout
//!
//! ```text
//! $DROVER_HOME/jobs.json                 jobs document
//! $DROVER_HOME/jobs.lock                 store lock file
//! $DROVER_HOME/locks/build-<digest>.lock per-tag build locks
//! $DROVER_HOME/logs/<job_id>.log         captured container logs
//! $DROVER_HOME/logs/build-<digest>.log   image build output
//! $DROVER_HOME/results/<job_id>/         collaborator-written artifacts
//! $DROVER_HOME/config.toml               optional operator config
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::launcher::tag_digest;

/// Environment variable overriding the state-root location.
pub const HOME_ENV_VAR: &str = "DROVER_HOME";

/// Directory name under the user's home when no override is set.
pub const DEFAULT_HOME_DIR_NAME: &str = ".drover";

/// Name of the optional config file at the state root.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Name of the jobs document at the state root.
pub const JOBS_FILE_NAME: &str = "jobs.json";

/// Name of the store lock file at the state root.
pub const JOBS_LOCK_FILE_NAME: &str = "jobs.lock";

/// Name of the per-job result summary file inside a job's results
/// directory.
pub const RESULT_SUMMARY_FILE_NAME: &str = "summary.json";

/// Errors from configuration loading and state-root resolution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("cannot read config file: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse the config file as TOML.
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config parsed but contains invalid values.
    #[error("invalid config: {0}")]
    Validation(String),

    /// Home directory could not be resolved.
    #[error("cannot resolve drover home directory: {0}")]
    HomeResolution(String),
}

/// Top-level drover configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DroverConfig {
    /// Agent defaults.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Container runtime settings.
    #[serde(default)]
    pub docker: DockerConfig,

    /// Operational limits.
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl DroverConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a limit is zero.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file under the given state root if one exists,
    /// defaults otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error when a config file exists but cannot be read or
    /// parsed. A missing file is not an error.
    pub fn load_or_default(state_root: &Path) -> Result<Self, ConfigError> {
        let path = state_root.join(CONFIG_FILE_NAME);
        if path.is_file() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        for (name, value) in [
            ("limits.store_lock_timeout_secs", limits.store_lock_timeout_secs),
            ("limits.build_lock_timeout_secs", limits.build_lock_timeout_secs),
            ("limits.build_timeout_secs", limits.build_timeout_secs),
            ("limits.max_session_secs", limits.max_session_secs),
            ("limits.monitor_backoff_base_ms", limits.monitor_backoff_base_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be nonzero")));
            }
        }
        if limits.monitor_query_attempts == 0 {
            return Err(ConfigError::Validation(
                "limits.monitor_query_attempts must be nonzero".to_string(),
            ));
        }
        if self.agent.kind.is_empty() {
            return Err(ConfigError::Validation(
                "agent.kind must not be empty".to_string(),
            ));
        }
        if self.docker.binary.is_empty() {
            return Err(ConfigError::Validation(
                "docker.binary must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Agent defaults applied when the CLI does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent CLI flavor baked into derived image tags (e.g. `claude`).
    #[serde(default = "default_agent_kind")]
    pub kind: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kind: default_agent_kind(),
        }
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Name or path of the container runtime executable.
    #[serde(default = "default_docker_binary")]
    pub binary: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: default_docker_binary(),
        }
    }
}

/// Operational limits. All waits in the core are bounded by these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum time to wait for the store lock before failing with a
    /// contention error.
    #[serde(default = "default_store_lock_timeout_secs")]
    pub store_lock_timeout_secs: u64,

    /// Maximum time to wait for a per-tag build lock.
    #[serde(default = "default_build_lock_timeout_secs")]
    pub build_lock_timeout_secs: u64,

    /// Maximum wall-clock time for one image build attempt.
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,

    /// Maximum session duration for a running job before the monitor
    /// force-fails it.
    #[serde(default = "default_max_session_secs")]
    pub max_session_secs: u64,

    /// Container query attempts per reconciliation before the job is
    /// finalized with a monitor error.
    #[serde(default = "default_monitor_query_attempts")]
    pub monitor_query_attempts: u32,

    /// Base delay for exponential backoff between query attempts.
    #[serde(default = "default_monitor_backoff_base_ms")]
    pub monitor_backoff_base_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            store_lock_timeout_secs: default_store_lock_timeout_secs(),
            build_lock_timeout_secs: default_build_lock_timeout_secs(),
            build_timeout_secs: default_build_timeout_secs(),
            max_session_secs: default_max_session_secs(),
            monitor_query_attempts: default_monitor_query_attempts(),
            monitor_backoff_base_ms: default_monitor_backoff_base_ms(),
        }
    }
}

impl LimitsConfig {
    /// Store lock timeout as a [`Duration`].
    #[must_use]
    pub const fn store_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.store_lock_timeout_secs)
    }

    /// Build lock timeout as a [`Duration`].
    #[must_use]
    pub const fn build_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.build_lock_timeout_secs)
    }

    /// Build timeout as a [`Duration`].
    #[must_use]
    pub const fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    /// Maximum session duration as a [`Duration`].
    #[must_use]
    pub const fn max_session(&self) -> Duration {
        Duration::from_secs(self.max_session_secs)
    }

    /// Monitor backoff base as a [`Duration`].
    #[must_use]
    pub const fn monitor_backoff_base(&self) -> Duration {
        Duration::from_millis(self.monitor_backoff_base_ms)
    }
}

fn default_agent_kind() -> String {
    "claude".to_string()
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

const fn default_store_lock_timeout_secs() -> u64 {
    10
}

const fn default_build_lock_timeout_secs() -> u64 {
    300
}

const fn default_build_timeout_secs() -> u64 {
    300
}

const fn default_max_session_secs() -> u64 {
    600
}

const fn default_monitor_query_attempts() -> u32 {
    3
}

const fn default_monitor_backoff_base_ms() -> u64 {
    200
}

/// Resolve the drover state root.
///
/// Checks `$DROVER_HOME` first, then falls back to `~/.drover`.
///
/// # Errors
///
/// Returns [`ConfigError::HomeResolution`] when no override is set and the
/// user's home directory cannot be determined.
pub fn resolve_home() -> Result<PathBuf, ConfigError> {
    resolve_home_from(std::env::var_os(HOME_ENV_VAR))
}

fn resolve_home_from(override_dir: Option<std::ffi::OsString>) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = override_dir {
        let path = PathBuf::from(dir);
        if !path.as_os_str().is_empty() {
            return Ok(path);
        }
    }
    let base_dirs = directories::BaseDirs::new().ok_or_else(|| {
        ConfigError::HomeResolution("could not determine home directory".to_string())
    })?;
    Ok(base_dirs.home_dir().join(DEFAULT_HOME_DIR_NAME))
}

/// Derived filesystem layout under the state root.
///
/// Every process constructs its own instance pointing at the same root;
/// coordination happens through the filesystem, never through memory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    /// Create a layout rooted at the given directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The state root itself.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the jobs document.
    #[must_use]
    pub fn jobs_file(&self) -> PathBuf {
        self.root.join(JOBS_FILE_NAME)
    }

    /// Path to the store lock file.
    #[must_use]
    pub fn jobs_lock_file(&self) -> PathBuf {
        self.root.join(JOBS_LOCK_FILE_NAME)
    }

    /// Directory holding per-tag build locks.
    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Directory holding captured logs.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Directory holding collaborator-written result artifacts.
    #[must_use]
    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    /// Log file for one job.
    #[must_use]
    pub fn job_log_file(&self, job_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{job_id}.log"))
    }

    /// Build log file for one image tag, named by digest so arbitrary tag
    /// characters never reach the filesystem.
    #[must_use]
    pub fn build_log_file(&self, tag: &str) -> PathBuf {
        self.logs_dir().join(format!("build-{}.log", tag_digest(tag)))
    }

    /// Results directory for one job.
    #[must_use]
    pub fn job_result_dir(&self, job_id: &str) -> PathBuf {
        self.results_dir().join(job_id)
    }

    /// Result summary file for one job.
    #[must_use]
    pub fn job_result_summary_file(&self, job_id: &str) -> PathBuf {
        self.job_result_dir(job_id).join(RESULT_SUMMARY_FILE_NAME)
    }

    /// Path to the optional config file.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    /// Create the state-root directory tree with restricted permissions.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when a directory cannot be created.
    pub fn ensure_layout(&self) -> io::Result<()> {
        for dir in [
            self.root.clone(),
            self.locks_dir(),
            self.logs_dir(),
            self.results_dir(),
        ] {
            create_dir_private(&dir)?;
        }
        Ok(())
    }
}

/// Create a directory (and parents) with mode 0o700 on Unix.
pub(crate) fn create_dir_private(path: &Path) -> io::Result<()> {
    if let Ok(metadata) = fs::symlink_metadata(path) {
        if metadata.is_dir() {
            return Ok(());
        }
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path exists but is not a directory: {}", path.display()),
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DroverConfig::default();
        assert_eq!(config.agent.kind, "claude");
        assert_eq!(config.docker.binary, "docker");
        assert_eq!(config.limits.store_lock_timeout_secs, 10);
        assert_eq!(config.limits.max_session_secs, 600);
        assert_eq!(config.limits.monitor_query_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_full_toml() {
        let toml = r#"
            [agent]
            kind = "cursor"

            [docker]
            binary = "/usr/local/bin/podman"

            [limits]
            store_lock_timeout_secs = 5
            build_lock_timeout_secs = 60
            build_timeout_secs = 120
            max_session_secs = 1800
            monitor_query_attempts = 5
            monitor_backoff_base_ms = 100
        "#;

        let config = DroverConfig::from_toml(toml).expect("config parses");
        assert_eq!(config.agent.kind, "cursor");
        assert_eq!(config.docker.binary, "/usr/local/bin/podman");
        assert_eq!(config.limits.store_lock_timeout_secs, 5);
        assert_eq!(config.limits.max_session_secs, 1800);
        assert_eq!(config.limits.monitor_query_attempts, 5);
        assert_eq!(config.limits.monitor_backoff_base(), Duration::from_millis(100));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml = r#"
            [limits]
            max_session_secs = 120
        "#;

        let config = DroverConfig::from_toml(toml).expect("config parses");
        assert_eq!(config.limits.max_session_secs, 120);
        assert_eq!(config.limits.store_lock_timeout_secs, 10);
        assert_eq!(config.agent.kind, "claude");
    }

    #[test]
    fn rejects_zero_limits() {
        let toml = r#"
            [limits]
            max_session_secs = 0
        "#;

        let err = DroverConfig::from_toml(toml).expect_err("zero limit rejected");
        match err {
            ConfigError::Validation(msg) => {
                assert!(msg.contains("max_session_secs"), "unexpected message: {msg}");
            },
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_agent_kind() {
        let toml = r#"
            [agent]
            kind = ""
        "#;

        assert!(DroverConfig::from_toml(toml).is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = DroverConfig::from_toml("limits = nonsense").expect_err("bad toml");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_or_default_without_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = DroverConfig::load_or_default(tmp.path()).expect("defaults");
        assert_eq!(config.docker.binary, "docker");
    }

    #[test]
    fn load_or_default_reads_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "[agent]\nkind = \"aider\"\n",
        )
        .expect("write config");
        let config = DroverConfig::load_or_default(tmp.path()).expect("config loads");
        assert_eq!(config.agent.kind, "aider");
    }

    #[test]
    fn resolve_home_prefers_override() {
        let home = resolve_home_from(Some("/tmp/drover-test-home".into())).expect("resolves");
        assert_eq!(home, PathBuf::from("/tmp/drover-test-home"));
    }

    #[test]
    fn resolve_home_ignores_empty_override() {
        let home = resolve_home_from(Some(String::new().into())).expect("resolves");
        assert!(home.ends_with(DEFAULT_HOME_DIR_NAME));
    }

    #[test]
    fn state_paths_layout() {
        let paths = StatePaths::new("/srv/drover");
        assert_eq!(paths.jobs_file(), PathBuf::from("/srv/drover/jobs.json"));
        assert_eq!(paths.jobs_lock_file(), PathBuf::from("/srv/drover/jobs.lock"));
        assert_eq!(
            paths.job_log_file("ab12cd34"),
            PathBuf::from("/srv/drover/logs/ab12cd34.log")
        );
        assert_eq!(
            paths.job_result_summary_file("ab12cd34"),
            PathBuf::from("/srv/drover/results/ab12cd34/summary.json")
        );
    }

    #[test]
    fn ensure_layout_creates_tree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = StatePaths::new(tmp.path().join("state"));
        paths.ensure_layout().expect("layout created");
        assert!(paths.root().is_dir());
        assert!(paths.locks_dir().is_dir());
        assert!(paths.logs_dir().is_dir());
        assert!(paths.results_dir().is_dir());
    }

    #[test]
    fn build_log_file_uses_digest_name() {
        let paths = StatePaths::new("/srv/drover");
        let log = paths.build_log_file("repo/image:tag");
        let name = log.file_name().and_then(|n| n.to_str()).expect("file name");
        assert!(name.starts_with("build-"));
        assert!(name.ends_with(".log"));
        assert!(!name.contains('/'));
        assert!(!name.contains(':'));
    }
}
