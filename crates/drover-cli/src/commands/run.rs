//! `drover run` — ensure the agent image exists and launch a job.
//!
//! Flow: derive the agent image tag from the base image, run the
//! double-checked build under the per-tag lock, create the job, print
//! its id. With `--wait` the command keeps running reconciliation
//! passes until the job reaches a terminal status and exits nonzero
//! unless it completed.

use std::time::Duration;

use clap::Args;
use drover_core::jobs::manager::{CreateJobRequest, JobManager};
use drover_core::jobs::record::JobRecord;
use drover_core::runtime::build_lock::{BuildLockCoordinator, BuildOutcome};
use drover_core::runtime::docker::DockerCli;
use drover_core::runtime::launcher::{
    BindMount, BuildRequest, ContainerLauncher, LaunchSpec, agent_dockerfile, derive_agent_tag,
};
use serde::Serialize;

use super::{CommandContext, output_error, output_manager_error, print_json, reconcile_pass};
use crate::exit_codes;

/// Delay between reconciliation passes under `--wait`.
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Arguments for `drover run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Base container image the agent image derives from.
    #[arg(long)]
    pub image: String,

    /// Task prompt handed to the agent.
    #[arg(long)]
    pub task: Option<String>,

    /// Branch the agent should work on.
    #[arg(long)]
    pub branch: Option<String>,

    /// Agent flavor (defaults to the configured one).
    #[arg(long)]
    pub agent: Option<String>,

    /// Extra environment variables for the container.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Extra bind mounts.
    #[arg(long = "mount", value_name = "HOST:CONTAINER[:ro]")]
    pub mount: Vec<String>,

    /// Per-job session limit in seconds, overriding the configured
    /// default.
    #[arg(long, value_name = "SECS")]
    pub timelimit: Option<u64>,

    /// Block until the job reaches a terminal status.
    #[arg(long)]
    pub wait: bool,

    /// Machine-readable JSON output.
    #[arg(long)]
    pub json: bool,
}

/// Response for `drover run` without `--wait`.
#[derive(Debug, Clone, Serialize)]
pub struct RunResponse {
    /// Launched job id.
    pub job_id: String,
    /// Status after launch confirmation.
    pub status: String,
    /// Runtime handle for the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,
    /// Derived agent image tag.
    pub image_tag: String,
    /// How the image came to exist (`cache_hit`, `built_elsewhere`,
    /// `built`).
    pub build: String,
}

/// Execute the run command.
pub fn run(context: &CommandContext, args: &RunArgs) -> u8 {
    let launch = match assemble_launch_spec(args) {
        Ok(spec) => spec,
        Err(message) => return output_error(args.json, exit_codes::VALIDATION_ERROR, &message),
    };

    let agent_kind = args
        .agent
        .clone()
        .unwrap_or_else(|| context.config.agent.kind.clone());
    let tag = match derive_agent_tag(&agent_kind, &args.image) {
        Ok(tag) => tag,
        Err(e) => return output_error(args.json, exit_codes::VALIDATION_ERROR, &e.to_string()),
    };

    let manager = match context.open_manager() {
        Ok(manager) => manager,
        Err(e) => return output_manager_error(args.json, &e),
    };

    let coordinator = BuildLockCoordinator::new(context.paths.locks_dir())
        .with_timeout(context.config.limits.build_lock_timeout());
    let build_request = BuildRequest {
        tag: tag.clone(),
        dockerfile: agent_dockerfile(&args.image, &agent_kind),
        log_path: Some(context.paths.build_log_file(&tag)),
        timeout: context.config.limits.build_timeout(),
    };
    let launcher = manager.launcher();
    let outcome = match coordinator.build_if_needed(
        &tag,
        || launcher.image_exists(&tag),
        || launcher.build_image(&build_request),
    ) {
        Ok(outcome) => outcome,
        Err(e) => return output_error(args.json, exit_codes::for_build_error(&e), &e.to_string()),
    };
    if outcome == BuildOutcome::Built {
        tracing::info!(tag = %tag, "agent image built");
    }

    let request = CreateJobRequest {
        config: job_config(args, &agent_kind),
        launch: LaunchSpec {
            image: tag.clone(),
            ..launch
        },
        max_session_secs: args.timelimit,
    };
    let record = match manager.create(request) {
        Ok(record) => record,
        Err(e) => return output_manager_error(args.json, &e),
    };

    if !args.wait {
        let response = RunResponse {
            job_id: record.id.clone(),
            status: record.status.to_string(),
            container_ref: record.container_ref.clone(),
            image_tag: tag,
            build: outcome.to_string(),
        };
        if args.json {
            print_json(&response);
        } else {
            println!("Job launched");
            println!("  Job ID:     {}", response.job_id);
            println!("  Status:     {}", response.status);
            if let Some(container_ref) = &response.container_ref {
                println!("  Container:  {container_ref}");
            }
            println!("  Image Tag:  {}", response.image_tag);
            println!("  Build:      {}", response.build);
        }
        return exit_codes::SUCCESS;
    }

    wait_for_terminal(context, &manager, &record.id, args.json)
}

/// Poll reconciliation passes until the job is terminal.
fn wait_for_terminal(
    context: &CommandContext,
    manager: &JobManager<DockerCli>,
    job_id: &str,
    json_output: bool,
) -> u8 {
    let record = loop {
        if let Err(code) = reconcile_pass(context, manager, json_output) {
            return code;
        }
        let record = match manager.get(job_id) {
            Ok(record) => record,
            Err(e) => return output_manager_error(json_output, &e),
        };
        if record.status.is_terminal() {
            break record;
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    };

    if json_output {
        print_json(&record);
    } else {
        print_final_record(&record);
    }
    if record.exit_code == Some(0) {
        exit_codes::SUCCESS
    } else {
        exit_codes::GENERIC_ERROR
    }
}

fn print_final_record(record: &JobRecord) {
    println!("Job finished");
    println!("  Job ID:     {}", record.id);
    println!("  Status:     {}", record.status);
    if let Some(code) = record.exit_code {
        println!("  Exit Code:  {code}");
    }
    if let Some(reason) = &record.failure_reason {
        println!("  Reason:     {reason}");
    }
    if let Some(summary) = &record.result_summary {
        println!(
            "  Summary:    {}",
            serde_json::to_string(summary).unwrap_or_else(|_| "{}".to_string())
        );
    }
}

/// Build the job's config payload from the CLI arguments.
fn job_config(args: &RunArgs, agent_kind: &str) -> serde_json::Value {
    let mut config = serde_json::Map::new();
    config.insert("base_image".to_string(), args.image.clone().into());
    config.insert("agent".to_string(), agent_kind.to_string().into());
    if let Some(task) = &args.task {
        config.insert("task".to_string(), task.clone().into());
    }
    if let Some(branch) = &args.branch {
        config.insert("branch".to_string(), branch.clone().into());
    }
    serde_json::Value::Object(config)
}

/// Parse `--env` and `--mount` arguments into a launch spec.
fn assemble_launch_spec(args: &RunArgs) -> Result<LaunchSpec, String> {
    if args.timelimit == Some(0) {
        return Err("--timelimit must be nonzero".to_string());
    }
    let mut spec = LaunchSpec::default();
    for raw in &args.env {
        spec.env.push(parse_env_pair(raw)?);
    }
    for raw in &args.mount {
        spec.mounts.push(parse_mount_spec(raw)?);
    }
    Ok(spec)
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(format!("--env expects KEY=VALUE, got {raw:?}"));
    };
    if key.is_empty() {
        return Err(format!("--env has an empty key: {raw:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_mount_spec(raw: &str) -> Result<BindMount, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    let (host, container, read_only) = match parts.as_slice() {
        [host, container] => (*host, *container, false),
        [host, container, "ro"] => (*host, *container, true),
        [_, _, flag] => {
            return Err(format!("--mount flag must be \"ro\", got {flag:?}"));
        },
        _ => {
            return Err(format!("--mount expects HOST:CONTAINER[:ro], got {raw:?}"));
        },
    };
    if host.is_empty() {
        return Err(format!("--mount has an empty host path: {raw:?}"));
    }
    if !container.starts_with('/') {
        return Err(format!(
            "--mount container path must be absolute, got {container:?}"
        ));
    }
    Ok(BindMount {
        host: host.into(),
        container: container.to_string(),
        read_only,
    })
}
