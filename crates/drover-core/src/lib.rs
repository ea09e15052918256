//! Core library for drover, a container-backed agent job runner.
//!
//! drover starts AI-agent task runs inside containers and tracks each as
//! a background job. This crate holds everything below the CLI surface:
//!
//! # Components
//!
//! - **Jobs** ([`jobs`]): the jobs document and its lock-protected
//!   store, lifecycle operations (create, get, list, kill, cleanup), and
//!   the stateless monitor that reconciles records against containers
//! - **Runtime** ([`runtime`]): the [`runtime::ContainerLauncher`]
//!   boundary, the `docker` CLI implementation, and per-tag build locks
//! - **Config** ([`config`]): the state-root layout under `$DROVER_HOME`
//!   and the optional `config.toml`
//!
//! # Coordination Model
//!
//! There is no daemon. Every invocation is a short-lived process; all
//! shared state is a single JSON document guarded by an advisory file
//! lock, and image builds are serialized by per-tag lock files. Any two
//! drover processes may run concurrently against the same state root.
//! Waits are bounded: lock acquisition, container queries, and builds
//! all carry deadlines.
//!
//! # Lifecycle
//!
//! ```text
//! pending ──> running ──> completed
//!    │           │──────> failed
//!    └───────────┴──────> killed      (terminal states are sticky)
//! ```

pub mod config;
pub mod jobs;
pub mod runtime;
