//! `docker`-CLI-backed [`ContainerLauncher`].
//!
//! Every operation is one short-lived `docker` invocation with a cleared
//! environment; only an allowlist of variables the runtime client needs
//! is forwarded. Argument vectors are built by pure functions so tests
//! can assert on exact invocations without a docker daemon present.
//!
//! Image builds are the one long-running invocation. They stream the
//! Dockerfile over stdin, capture output to a log file, and are bounded
//! by a wall-clock deadline enforced with a poll-and-kill loop.

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::runtime::launcher::{
    BuildRequest, ContainerLauncher, ContainerQuery, LaunchSpec, LauncherError,
};

/// Runtime executable used when none is configured.
pub const DEFAULT_DOCKER_BINARY: &str = "docker";

/// Cap on captured stderr carried inside error values.
pub const MAX_CAPTURED_OUTPUT: usize = 8 * 1024;

/// Environment variables forwarded to the runtime client. Everything
/// else is dropped.
const FORWARDED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "DOCKER_HOST",
    "DOCKER_CONFIG",
    "DOCKER_CERT_PATH",
    "DOCKER_TLS_VERIFY",
];

/// Go-template handed to `docker inspect`; keeps parsing trivial.
const INSPECT_FORMAT: &str = "{{.State.Running}} {{.State.ExitCode}}";

/// Poll interval while waiting on a bounded build.
const BUILD_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Launcher that shells out to the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    /// Launcher using [`DEFAULT_DOCKER_BINARY`] from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_DOCKER_BINARY)
    }

    /// Launcher using a specific runtime executable.
    #[must_use]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Base command with a cleared environment and the forwarding
    /// allowlist applied.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.env_clear();
        for var in FORWARDED_ENV_VARS {
            if let Some(value) = std::env::var_os(var) {
                command.env(var, value);
            }
        }
        command
    }

    fn run(&self, args: &[String], context: &str) -> Result<std::process::Output, LauncherError> {
        let mut command = self.command();
        command.args(args);
        command.stdin(Stdio::null());
        command
            .output()
            .map_err(|e| LauncherError::spawn(context, e))
    }

    /// Run and demand success. Maps "no such container" stderr onto
    /// [`LauncherError::NotFound`] when a handle is in play.
    fn run_checked(
        &self,
        args: &[String],
        context: &str,
        container_ref: Option<&str>,
    ) -> Result<String, LauncherError> {
        let output = self.run(args, context)?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr));
        if let Some(cref) = container_ref {
            if is_not_found(&stderr) {
                return Err(LauncherError::NotFound {
                    container_ref: cref.to_string(),
                });
            }
        }
        Err(LauncherError::CommandFailed {
            context: context.to_string(),
            status: output.status.code(),
            stderr,
        })
    }

    /// Stream container logs to the current terminal until the container
    /// stops. Returns the runtime's exit code.
    ///
    /// # Errors
    ///
    /// Returns an error when the runtime cannot be spawned.
    pub fn follow_logs(&self, container_ref: &str) -> Result<i32, LauncherError> {
        let mut command = self.command();
        command.args(["logs", "--follow", container_ref]);
        let status = command
            .status()
            .map_err(|e| LauncherError::spawn(format!("follow logs of {container_ref}"), e))?;
        Ok(status.code().unwrap_or(1))
    }
}

impl ContainerLauncher for DockerCli {
    fn start(&self, spec: &LaunchSpec) -> Result<String, LauncherError> {
        let context = format!("start container from {}", spec.image);
        let stdout = self.run_checked(&start_args(spec), &context, None)?;
        let container_ref = stdout.trim();
        if container_ref.is_empty() || container_ref.contains(char::is_whitespace) {
            return Err(LauncherError::Malformed { context });
        }
        Ok(container_ref.to_string())
    }

    fn query(&self, container_ref: &str) -> Result<ContainerQuery, LauncherError> {
        let context = format!("inspect container {container_ref}");
        let stdout = self.run_checked(&query_args(container_ref), &context, Some(container_ref))?;
        parse_inspect_output(&stdout, &context)
    }

    fn logs(&self, container_ref: &str, tail: Option<u32>) -> Result<String, LauncherError> {
        let context = format!("fetch logs of {container_ref}");
        let output = self.run(&logs_args(container_ref, tail), &context)?;
        if !output.status.success() {
            let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr));
            if is_not_found(&stderr) {
                return Err(LauncherError::NotFound {
                    container_ref: container_ref.to_string(),
                });
            }
            return Err(LauncherError::CommandFailed {
                context,
                status: output.status.code(),
                stderr,
            });
        }
        // docker multiplexes container stdout/stderr onto both streams.
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
    }

    fn stop(&self, container_ref: &str) -> Result<(), LauncherError> {
        let context = format!("kill container {container_ref}");
        self.run_checked(&stop_args(container_ref), &context, Some(container_ref))?;
        Ok(())
    }

    fn remove(&self, container_ref: &str) -> Result<(), LauncherError> {
        let context = format!("remove container {container_ref}");
        match self.run_checked(&remove_args(container_ref), &context, Some(container_ref)) {
            Ok(_) => Ok(()),
            // Removal is idempotent: already-gone is success.
            Err(LauncherError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn image_exists(&self, tag: &str) -> Result<bool, LauncherError> {
        let context = format!("look up image {tag}");
        let stdout = self.run_checked(&image_exists_args(tag), &context, None)?;
        Ok(!stdout.trim().is_empty())
    }

    fn build_image(&self, request: &BuildRequest) -> Result<(), LauncherError> {
        let context = format!("build image {}", request.tag);
        let mut command = self.command();
        command.args(build_args(&request.tag));
        command.stdin(Stdio::piped());
        match &request.log_path {
            Some(path) => {
                let log = std::fs::File::create(path).map_err(|e| {
                    LauncherError::spawn(format!("create build log {}", path.display()), e)
                })?;
                let log_err = log
                    .try_clone()
                    .map_err(|e| LauncherError::spawn(context.clone(), e))?;
                command.stdout(Stdio::from(log));
                command.stderr(Stdio::from(log_err));
            },
            None => {
                command.stdout(Stdio::null());
                command.stderr(Stdio::null());
            },
        }

        let mut child = command
            .spawn()
            .map_err(|e| LauncherError::spawn(context.clone(), e))?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(request.dockerfile.as_bytes()) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(LauncherError::spawn(context, e));
            }
            // Dropping stdin closes the pipe; the runtime sees EOF.
        }

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if status.success() {
                        return Ok(());
                    }
                    let stderr = match &request.log_path {
                        Some(path) => format!("see build log at {}", path.display()),
                        None => "build output was not captured".to_string(),
                    };
                    return Err(LauncherError::CommandFailed {
                        context,
                        status: status.code(),
                        stderr,
                    });
                },
                Ok(None) => {},
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(LauncherError::spawn(context, e));
                },
            }
            if start.elapsed() >= request.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(LauncherError::Timeout {
                    context,
                    elapsed_secs: start.elapsed().as_secs(),
                });
            }
            std::thread::sleep(BUILD_POLL_INTERVAL);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Argument builders and output parsing
// ─────────────────────────────────────────────────────────────────────

fn start_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec!["run".to_string(), "-d".to_string()];
    if let Some(name) = &spec.name {
        args.push("--name".to_string());
        args.push(name.clone());
    }
    for mount in &spec.mounts {
        args.push("-v".to_string());
        args.push(mount.to_arg());
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

fn query_args(container_ref: &str) -> Vec<String> {
    vec![
        "inspect".to_string(),
        "--format".to_string(),
        INSPECT_FORMAT.to_string(),
        container_ref.to_string(),
    ]
}

fn logs_args(container_ref: &str, tail: Option<u32>) -> Vec<String> {
    let mut args = vec!["logs".to_string()];
    if let Some(n) = tail {
        args.push("--tail".to_string());
        args.push(n.to_string());
    }
    args.push(container_ref.to_string());
    args
}

fn stop_args(container_ref: &str) -> Vec<String> {
    vec!["kill".to_string(), container_ref.to_string()]
}

fn remove_args(container_ref: &str) -> Vec<String> {
    vec![
        "rm".to_string(),
        "-f".to_string(),
        container_ref.to_string(),
    ]
}

fn image_exists_args(tag: &str) -> Vec<String> {
    vec!["images".to_string(), "-q".to_string(), tag.to_string()]
}

fn build_args(tag: &str) -> Vec<String> {
    vec![
        "build".to_string(),
        "-t".to_string(),
        tag.to_string(),
        "-".to_string(),
    ]
}

fn parse_inspect_output(stdout: &str, context: &str) -> Result<ContainerQuery, LauncherError> {
    let mut parts = stdout.split_whitespace();
    let running = match parts.next() {
        Some("true") => true,
        Some("false") => false,
        _ => {
            return Err(LauncherError::Malformed {
                context: context.to_string(),
            });
        },
    };
    let exit_code: i64 = parts
        .next()
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| LauncherError::Malformed {
            context: context.to_string(),
        })?;
    if parts.next().is_some() {
        return Err(LauncherError::Malformed {
            context: context.to_string(),
        });
    }
    Ok(ContainerQuery {
        alive: running,
        // ExitCode is only meaningful once the container has stopped.
        exit_code: if running { None } else { Some(exit_code) },
    })
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such object") || lower.contains("no such container")
}

fn truncate_output(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.len() <= MAX_CAPTURED_OUTPUT {
        return trimmed.to_string();
    }
    let mut end = MAX_CAPTURED_OUTPUT;
    while end > 0 && !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::runtime::launcher::BindMount;

    #[test]
    fn command_env_is_allowlisted() {
        let docker = DockerCli::new();
        let command = docker.command();
        for (key, value) in command.get_envs() {
            let key = key.to_str().expect("env key is utf-8");
            assert!(
                FORWARDED_ENV_VARS.contains(&key),
                "unexpected forwarded var {key}"
            );
            assert!(value.is_some(), "allowlisted var {key} must carry a value");
        }
    }

    #[test]
    fn start_args_cover_the_whole_spec() {
        let spec = LaunchSpec {
            image: "claude-agent-0123456789".to_string(),
            name: Some("drover-agent-ab12cd34".to_string()),
            mounts: vec![BindMount {
                host: PathBuf::from("/srv/results/ab12cd34"),
                container: "/drover/out".to_string(),
                read_only: false,
            }],
            env: vec![("DROVER_JOB_ID".to_string(), "ab12cd34".to_string())],
            command: vec!["sleep".to_string(), "30".to_string()],
        };

        let args = start_args(&spec);
        assert_eq!(
            args,
            vec![
                "run",
                "-d",
                "--name",
                "drover-agent-ab12cd34",
                "-v",
                "/srv/results/ab12cd34:/drover/out",
                "-e",
                "DROVER_JOB_ID=ab12cd34",
                "claude-agent-0123456789",
                "sleep",
                "30",
            ]
        );
    }

    #[test]
    fn minimal_start_args() {
        let args = start_args(&LaunchSpec::new("ubuntu:24.04"));
        assert_eq!(args, vec!["run", "-d", "ubuntu:24.04"]);
    }

    #[test]
    fn logs_args_respect_tail() {
        assert_eq!(logs_args("abc", None), vec!["logs", "abc"]);
        assert_eq!(
            logs_args("abc", Some(50)),
            vec!["logs", "--tail", "50", "abc"]
        );
    }

    #[test]
    fn query_and_lifecycle_args() {
        assert_eq!(
            query_args("abc"),
            vec!["inspect", "--format", INSPECT_FORMAT, "abc"]
        );
        assert_eq!(stop_args("abc"), vec!["kill", "abc"]);
        assert_eq!(remove_args("abc"), vec!["rm", "-f", "abc"]);
        assert_eq!(image_exists_args("t:1"), vec!["images", "-q", "t:1"]);
        assert_eq!(build_args("t:1"), vec!["build", "-t", "t:1", "-"]);
    }

    #[test]
    fn inspect_parsing_running_container() {
        let query = parse_inspect_output("true 0\n", "inspect").expect("parses");
        assert!(query.alive);
        assert_eq!(query.exit_code, None);
    }

    #[test]
    fn inspect_parsing_exited_container() {
        let query = parse_inspect_output("false 137\n", "inspect").expect("parses");
        assert!(!query.alive);
        assert_eq!(query.exit_code, Some(137));

        let query = parse_inspect_output("false 0", "inspect").expect("parses");
        assert_eq!(query.exit_code, Some(0));
    }

    #[test]
    fn inspect_parsing_rejects_garbage() {
        for raw in ["", "true", "maybe 0", "false abc", "true 0 extra"] {
            assert!(
                parse_inspect_output(raw, "inspect").is_err(),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found("Error: No such object: abc123"));
        assert!(is_not_found(
            "Error response from daemon: No such container: abc123"
        ));
        assert!(!is_not_found("permission denied while trying to connect"));
        assert!(!is_not_found(""));
    }

    #[test]
    fn stderr_truncation_is_bounded() {
        let short = truncate_output("  plain error\n");
        assert_eq!(short, "plain error");

        let long = "x".repeat(MAX_CAPTURED_OUTPUT * 2);
        let truncated = truncate_output(&long);
        assert!(truncated.len() < MAX_CAPTURED_OUTPUT + 32);
        assert!(truncated.ends_with("(truncated)"));
    }
}
