//! Container runtime module.
//!
//! The seam between job bookkeeping and the container runtime. Lifecycle
//! code depends only on the [`launcher::ContainerLauncher`] trait; the
//! `docker` CLI implementation and the per-tag build coordination live
//! behind it.
//!
//! # Components
//!
//! - **Launcher**: the runtime trait, launch/build request types, and
//!   deterministic agent-tag derivation
//! - **Docker**: `docker`-CLI launcher with an env allowlist and bounded
//!   builds
//! - **Build lock**: named per-tag locks with double-checked cache
//!   probes

pub mod build_lock;
pub mod docker;
pub mod launcher;

// Re-export build lock types
pub use build_lock::{
    BUILD_LOCK_POLL_INTERVAL, BUILD_LOCK_POLL_JITTER_MS, BuildLockCoordinator, BuildLockError,
    BuildOutcome, DEFAULT_BUILD_LOCK_TIMEOUT,
};
// Re-export docker launcher types
pub use docker::{DEFAULT_DOCKER_BINARY, DockerCli, MAX_CAPTURED_OUTPUT};
// Re-export launcher types
pub use launcher::{
    AGENT_TAG_DIGEST_LEN, BindMount, BuildRequest, ContainerLauncher, ContainerQuery, LaunchSpec,
    LauncherError, MAX_AGENT_KIND_LENGTH, TAG_PATH_DIGEST_LEN, agent_dockerfile, derive_agent_tag,
    tag_digest,
};
