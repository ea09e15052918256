//! Container launcher boundary.
//!
//! The job manager and monitor talk to the container runtime only through
//! [`ContainerLauncher`]. The production implementation shells out to the
//! `docker` CLI ([`crate::runtime::docker`]); tests substitute scripted
//! launchers so lifecycle logic runs without a runtime installed.
//!
//! Image tags for agent images are derived, not chosen: one base image
//! plus one agent flavor always map to the same tag, which is what makes
//! the per-tag build lock meaningful across processes.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Hex digits of the base-image digest embedded in derived agent tags.
pub const AGENT_TAG_DIGEST_LEN: usize = 10;

/// Hex digits used when a tag must become a filesystem name.
pub const TAG_PATH_DIGEST_LEN: usize = 16;

/// Maximum accepted length for an agent flavor name.
pub const MAX_AGENT_KIND_LENGTH: usize = 32;

/// Errors surfaced by launcher implementations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LauncherError {
    /// The runtime executable could not be spawned at all.
    #[error("failed to spawn container runtime for {context}: {source}")]
    Spawn {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The runtime ran but reported failure.
    #[error("container runtime failed during {context} (exit {status:?}): {stderr}")]
    CommandFailed {
        /// What was being attempted.
        context: String,
        /// Runtime process exit code, if it exited normally.
        status: Option<i32>,
        /// Captured (truncated) stderr.
        stderr: String,
    },

    /// A bounded runtime invocation exceeded its deadline.
    #[error("container runtime timed out during {context} after {elapsed_secs}s")]
    Timeout {
        /// What was being attempted.
        context: String,
        /// Seconds elapsed when the deadline fired.
        elapsed_secs: u64,
    },

    /// The runtime no longer knows the referenced container.
    #[error("container {container_ref} does not exist")]
    NotFound {
        /// Handle the runtime rejected.
        container_ref: String,
    },

    /// The runtime answered in a shape this crate cannot interpret.
    #[error("unexpected container runtime output during {context}")]
    Malformed {
        /// What was being attempted.
        context: String,
    },

    /// A derived or supplied image tag is unusable.
    #[error("invalid image tag: {0}")]
    InvalidTag(String),
}

impl LauncherError {
    pub(crate) fn spawn(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            context: context.into(),
            source,
        }
    }
}

/// Point-in-time answer to "what is this container doing".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerQuery {
    /// Whether the container is currently executing.
    pub alive: bool,
    /// Exit code, present once the container has stopped.
    pub exit_code: Option<i64>,
}

/// One host directory mapped into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Host path.
    pub host: PathBuf,
    /// Absolute path inside the container.
    pub container: String,
    /// Mount read-only.
    pub read_only: bool,
}

impl BindMount {
    /// Render as a runtime `-v` argument.
    #[must_use]
    pub fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Everything needed to start one job container.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Image to run.
    pub image: String,
    /// Container name; assigned by the manager when unset.
    pub name: Option<String>,
    /// Bind mounts.
    pub mounts: Vec<BindMount>,
    /// Environment variables passed to the container.
    pub env: Vec<(String, String)>,
    /// Command override; empty means the image entrypoint runs.
    pub command: Vec<String>,
}

impl LaunchSpec {
    /// A spec running `image` with its default entrypoint.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }
}

/// One bounded image build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Tag for the built image.
    pub tag: String,
    /// Dockerfile contents, fed to the runtime directly.
    pub dockerfile: String,
    /// Where build output should be captured.
    pub log_path: Option<PathBuf>,
    /// Wall-clock deadline for the build.
    pub timeout: Duration,
}

/// Abstraction over the container runtime.
///
/// Implementations are synchronous and stateless; every method stands
/// alone. Callers own retry and error-absorption policy.
pub trait ContainerLauncher {
    /// Start a container and return the runtime's handle for it.
    ///
    /// # Errors
    ///
    /// Returns an error when the container cannot be created or started.
    fn start(&self, spec: &LaunchSpec) -> Result<String, LauncherError>;

    /// Report whether a container is alive and, once stopped, its exit
    /// code.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::NotFound`] when the runtime no longer
    /// knows the handle.
    fn query(&self, container_ref: &str) -> Result<ContainerQuery, LauncherError>;

    /// Fetch captured container output, optionally only the last `tail`
    /// lines.
    ///
    /// # Errors
    ///
    /// Returns an error when the container is unknown or logs cannot be
    /// read.
    fn logs(&self, container_ref: &str, tail: Option<u32>) -> Result<String, LauncherError>;

    /// Terminate a running container.
    ///
    /// # Errors
    ///
    /// Returns an error when the container is unknown or refuses to die.
    fn stop(&self, container_ref: &str) -> Result<(), LauncherError>;

    /// Remove a stopped container and its runtime bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns an error when removal fails for a reason other than the
    /// container already being gone.
    fn remove(&self, container_ref: &str) -> Result<(), LauncherError>;

    /// Whether an image with this tag exists locally.
    ///
    /// # Errors
    ///
    /// Returns an error when the runtime cannot answer.
    fn image_exists(&self, tag: &str) -> Result<bool, LauncherError>;

    /// Build an image. Blocks until the build finishes or times out.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::Timeout`] past the deadline and
    /// [`LauncherError::CommandFailed`] for a failed build.
    fn build_image(&self, request: &BuildRequest) -> Result<(), LauncherError>;
}

// ─────────────────────────────────────────────────────────────────────
// Tag derivation
// ─────────────────────────────────────────────────────────────────────

/// Derive the agent image tag for a base image and agent flavor.
///
/// The tag is `<kind>-agent-<digest>` where the digest is the first
/// [`AGENT_TAG_DIGEST_LEN`] hex characters of the base image's hash.
/// Deterministic: same inputs, same tag, in every process.
///
/// # Errors
///
/// Returns [`LauncherError::InvalidTag`] when the agent flavor is empty,
/// too long, or not lowercase alphanumeric with dashes, or when the base
/// image is empty.
pub fn derive_agent_tag(agent_kind: &str, base_image: &str) -> Result<String, LauncherError> {
    if agent_kind.is_empty() || agent_kind.len() > MAX_AGENT_KIND_LENGTH {
        return Err(LauncherError::InvalidTag(format!(
            "agent kind {agent_kind:?} must be 1-{MAX_AGENT_KIND_LENGTH} chars"
        )));
    }
    if !agent_kind
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(LauncherError::InvalidTag(format!(
            "agent kind {agent_kind:?} must be lowercase alphanumeric with dashes"
        )));
    }
    let base_image = base_image.trim();
    if base_image.is_empty() {
        return Err(LauncherError::InvalidTag(
            "base image must not be empty".to_string(),
        ));
    }
    let digest = blake3::hash(base_image.as_bytes());
    let short = hex::encode(&digest.as_bytes()[..AGENT_TAG_DIGEST_LEN.div_ceil(2)]);
    Ok(format!("{agent_kind}-agent-{}", &short[..AGENT_TAG_DIGEST_LEN]))
}

/// Collapse an arbitrary tag into a fixed-width hex digest safe for lock
/// and log file names.
#[must_use]
pub fn tag_digest(tag: &str) -> String {
    let digest = blake3::hash(tag.as_bytes());
    hex::encode(&digest.as_bytes()[..TAG_PATH_DIGEST_LEN / 2])
}

/// Render the Dockerfile that layers an agent CLI onto a base image.
///
/// Builds run with the Dockerfile on stdin and no context directory,
/// so the template never uses `COPY`.
#[must_use]
pub fn agent_dockerfile(base_image: &str, agent_kind: &str) -> String {
    format!(
        "FROM {base_image}\n\
         RUN if command -v apt-get >/dev/null 2>&1; \
         then apt-get update && apt-get install -y curl git ca-certificates; \
         elif command -v apk >/dev/null 2>&1; \
         then apk add --no-cache curl git ca-certificates bash; \
         elif command -v yum >/dev/null 2>&1; \
         then yum install -y curl git ca-certificates; fi\n\
         {install}\
         LABEL drover.agent=\"{agent_kind}\"\n\
         ENV DROVER_AGENT={agent_kind}\n\
         WORKDIR /workspace\n",
        install = agent_install_step(agent_kind),
    )
}

/// Installation step for a known agent flavor. Unknown flavors fall
/// back to the claude installer, mirroring the config default.
fn agent_install_step(agent_kind: &str) -> &'static str {
    match agent_kind {
        "gemini" => "RUN npm install -g @google/generative-ai-cli\n",
        "codex" => "RUN npm install -g @openai/codex\n",
        _ => "RUN curl -fsSL https://claude.ai/install.sh | bash\n",
    }
}
