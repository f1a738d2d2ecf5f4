//! Docker-backed plan executor.
//!
//! The plan generator runs as a detached, network-isolated container with
//! the run's artifact directory bind-mounted read-write. The task sees
//! only `ARTIFACT_ROOT` and, when configured, a scoped `PLAN_TOKEN`;
//! supervision goes through `docker inspect`, cancellation through
//! `docker stop`/`docker rm`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::dispatcher::{PlanExecutor, PlanTaskSpec, TaskHandle, TaskPoll};
use crate::config::DeepPassConfig;

/// Mount point for the run's artifact directory inside the task.
pub const CONTAINER_ARTIFACT_DIR: &str = "/artifacts";

pub struct DockerPlanExecutor {
    config: DeepPassConfig,
}

impl DockerPlanExecutor {
    pub fn new(config: DeepPassConfig) -> Self {
        Self { config }
    }

    fn build_run_args(&self, spec: &PlanTaskSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            self.config.memory.clone(),
            "--cpus".into(),
            self.config.cpus.to_string(),
            "--label".into(),
            format!("surveyor.run={}", spec.identity),
            "-v".into(),
            format!("{}:{}", spec.artifact_dir.display(), spec.artifact_root),
            "-e".into(),
            format!("ARTIFACT_ROOT={}", spec.artifact_root),
        ];
        if let Some(credential) = &spec.credential {
            args.push("-e".into());
            args.push(format!("PLAN_TOKEN={}", credential));
        }
        args.push(self.config.image.clone());
        args
    }
}

#[async_trait]
impl PlanExecutor for DockerPlanExecutor {
    async fn launch(&self, spec: &PlanTaskSpec) -> Result<TaskHandle> {
        tokio::fs::create_dir_all(&spec.artifact_dir)
            .await
            .with_context(|| format!("Failed to create {}", spec.artifact_dir.display()))?;

        let output = Command::new("docker")
            .args(self.build_run_args(spec))
            .output()
            .await
            .context("Failed to run docker")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("docker run failed: {}", stderr.trim());
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            anyhow::bail!("docker run produced no container id");
        }
        debug!(run = %spec.identity, container = %id, "Plan container started");
        Ok(TaskHandle { id })
    }

    async fn poll(&self, handle: &TaskHandle) -> Result<TaskPoll> {
        let output = Command::new("docker")
            .args([
                "inspect",
                "--format",
                "{{.State.Status}} {{.State.ExitCode}}",
                &handle.id,
            ])
            .output()
            .await
            .context("Failed to run docker inspect")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("docker inspect failed: {}", stderr.trim());
        }
        let poll = parse_inspect(String::from_utf8_lossy(&output.stdout).trim())?;

        // artifacts live on the bind mount, the exited container is noise
        if matches!(poll, TaskPoll::Exited { .. }) {
            remove_container(&handle.id).await;
        }
        Ok(poll)
    }

    async fn cancel(&self, handle: &TaskHandle) -> Result<()> {
        let output = Command::new("docker")
            .args(["stop", "--time", "10", &handle.id])
            .output()
            .await
            .context("Failed to run docker stop")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(container = %handle.id, error = %stderr.trim(), "docker stop failed");
        }
        remove_container(&handle.id).await;
        Ok(())
    }
}

async fn remove_container(id: &str) {
    match Command::new("docker")
        .args(["rm", "--force", id])
        .output()
        .await
    {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(container = %id, error = %stderr.trim(), "docker rm failed");
        }
        Ok(_) => {}
        Err(e) => warn!(container = %id, error = %e, "Failed to run docker rm"),
    }
}

/// Parse `"{{.State.Status}} {{.State.ExitCode}}"` output.
fn parse_inspect(text: &str) -> Result<TaskPoll> {
    let mut parts = text.split_whitespace();
    let status = parts.next().unwrap_or("");
    match status {
        "created" | "running" | "restarting" | "paused" => Ok(TaskPoll::Running),
        "exited" | "dead" => {
            let exit_code = parts
                .next()
                .and_then(|c| c.parse::<i64>().ok())
                .context("docker inspect reported exit without a code")?;
            Ok(TaskPoll::Exited { exit_code })
        }
        other => anyhow::bail!("Unrecognized container status '{}'", other),
    }
}
