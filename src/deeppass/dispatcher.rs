//! Launch, supervise, and verify the sandboxed plan task.
//!
//! The dispatcher drives one task through
//! `NOT_STARTED -> LAUNCHING -> RUNNING -> {SUCCEEDED, FAILED, TIMED_OUT}`
//! under a wall-clock ceiling. Launches retry with jittered exponential
//! backoff; polls tolerate transient errors; a reported success without
//! the expected plan artifact is a failure. Whatever happens inside, the
//! caller always gets a terminal outcome back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactStore, artifact_ref, run_prefix};
use crate::config::DeepPassConfig;
use crate::errors::RunError;
use crate::models::RunIdentity;

/// In-process lifecycle of one plan task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    NotStarted,
    Launching,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::NotStarted => "not_started",
            TaskState::Launching => "launching",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::TimedOut
        )
    }

    /// Valid forward steps. Terminal states have no successors; the
    /// ceiling may fire at any non-terminal point.
    pub fn can_step_to(&self, next: &TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::NotStarted, TaskState::Launching)
                | (TaskState::NotStarted, TaskState::TimedOut)
                | (TaskState::Launching, TaskState::Running)
                | (TaskState::Launching, TaskState::Failed)
                | (TaskState::Launching, TaskState::TimedOut)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Failed)
                | (TaskState::Running, TaskState::TimedOut)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct TaskProgress {
    state: TaskState,
}

impl TaskProgress {
    fn new() -> Self {
        Self {
            state: TaskState::NotStarted,
        }
    }

    fn advance(&mut self, next: TaskState) {
        debug_assert!(
            self.state.can_step_to(&next),
            "invalid task step {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }
}

/// Everything an executor needs to start one plan task.
#[derive(Debug, Clone)]
pub struct PlanTaskSpec {
    pub identity: RunIdentity,
    /// Host directory the task writes its artifacts into.
    pub artifact_dir: PathBuf,
    /// Artifact root path as seen by the task itself.
    pub artifact_root: String,
    /// Scoped credential forwarded to the task, if configured.
    pub credential: Option<String>,
}

/// Opaque handle to a launched task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub id: String,
}

/// One poll observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll {
    Running,
    Exited { exit_code: i64 },
}

/// Abstraction over sandboxed plan-task execution for testability.
/// Real implementation: `DockerPlanExecutor`. Test doubles live in the
/// dispatcher tests.
#[async_trait]
pub trait PlanExecutor: Send + Sync {
    async fn launch(&self, spec: &PlanTaskSpec) -> Result<TaskHandle>;

    async fn poll(&self, handle: &TaskHandle) -> Result<TaskPoll>;

    async fn cancel(&self, handle: &TaskHandle) -> Result<()>;
}

/// Terminal result of one dispatched plan task.
#[derive(Debug)]
pub struct DeepPassOutcome {
    pub state: TaskState,
    /// Reference to the verified plan artifact, present iff succeeded.
    pub plan_ref: Option<String>,
    pub detail: Option<String>,
}

pub struct DeepPassDispatcher {
    executor: Arc<dyn PlanExecutor>,
    artifacts: Arc<dyn ArtifactStore>,
    config: DeepPassConfig,
}

impl DeepPassDispatcher {
    pub fn new(
        executor: Arc<dyn PlanExecutor>,
        artifacts: Arc<dyn ArtifactStore>,
        config: DeepPassConfig,
    ) -> Self {
        Self {
            executor,
            artifacts,
            config,
        }
    }

    /// Drive one plan task to a terminal state. The wall-clock ceiling
    /// wraps launch and supervision together; on expiry the underlying
    /// task is cancelled best-effort and the outcome is `TimedOut` whether
    /// or not the cancellation is acknowledged.
    pub async fn run(&self, spec: PlanTaskSpec) -> DeepPassOutcome {
        let ceiling = self.config.ceiling();
        let handle_slot: Arc<Mutex<Option<TaskHandle>>> = Arc::new(Mutex::new(None));

        match tokio::time::timeout(ceiling, self.drive(&spec, handle_slot.clone())).await {
            Ok(outcome) => outcome,
            Err(_) => {
                if let Some(handle) = handle_slot.lock().await.take() {
                    info!(run = %spec.identity, task = %handle.id, "Ceiling reached, cancelling plan task");
                    if let Err(e) = self.executor.cancel(&handle).await {
                        warn!(task = %handle.id, error = format!("{:#}", e), "Plan task cancellation failed");
                    }
                }
                let detail = RunError::TaskTimeout {
                    seconds: ceiling.as_secs(),
                }
                .to_string();
                DeepPassOutcome {
                    state: TaskState::TimedOut,
                    plan_ref: None,
                    detail: Some(detail),
                }
            }
        }
    }

    async fn drive(
        &self,
        spec: &PlanTaskSpec,
        handle_slot: Arc<Mutex<Option<TaskHandle>>>,
    ) -> DeepPassOutcome {
        let mut progress = TaskProgress::new();
        progress.advance(TaskState::Launching);

        let handle = match self.launch_with_retry(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                progress.advance(TaskState::Failed);
                return DeepPassOutcome {
                    state: TaskState::Failed,
                    plan_ref: None,
                    detail: Some(e.to_string()),
                };
            }
        };
        *handle_slot.lock().await = Some(handle.clone());
        progress.advance(TaskState::Running);
        info!(run = %spec.identity, task = %handle.id, "Plan task running");

        let exit_code = self.poll_until_exit(&handle, &spec.identity).await;

        // trust-but-verify: an exit report alone proves nothing, the plan
        // artifact has to be there
        let reference = artifact_ref(&spec.identity, &self.config.plan_artifact);
        let artifact_present = match self.artifacts.get(&reference).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(run = %spec.identity, error = format!("{:#}", e), "Plan artifact check failed");
                false
            }
        };

        if exit_code == 0 && artifact_present {
            progress.advance(TaskState::Succeeded);
            info!(run = %spec.identity, plan = %reference, "Plan task succeeded");
            DeepPassOutcome {
                state: TaskState::Succeeded,
                plan_ref: Some(reference),
                detail: None,
            }
        } else if exit_code == 0 {
            let detail = RunError::ArtifactMissing {
                root: run_prefix(&spec.identity),
                name: self.config.plan_artifact.clone(),
            }
            .to_string();
            warn!(run = %spec.identity, "Plan task reported success without its artifact");
            progress.advance(TaskState::Failed);
            DeepPassOutcome {
                state: TaskState::Failed,
                plan_ref: None,
                detail: Some(detail),
            }
        } else {
            progress.advance(TaskState::Failed);
            DeepPassOutcome {
                state: TaskState::Failed,
                plan_ref: None,
                detail: Some(format!("Plan task exited with code {}", exit_code)),
            }
        }
    }

    async fn launch_with_retry(&self, spec: &PlanTaskSpec) -> Result<TaskHandle, RunError> {
        let attempts = self.config.launch_attempts.max(1);
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.launch_backoff(attempt - 1);
                debug!(
                    run = %spec.identity,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying plan task launch"
                );
                tokio::time::sleep(delay).await;
            }
            match self.executor.launch(spec).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    warn!(
                        run = %spec.identity,
                        attempt,
                        error = format!("{:#}", e),
                        "Plan task launch failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(RunError::DispatchFailure {
            attempts,
            source: last_err.unwrap_or_else(|| anyhow!("Launch was never attempted")),
        })
    }

    /// Delay before the given retry: base × factor^(retry−1), ±10% jitter.
    fn launch_backoff(&self, retry: u32) -> Duration {
        let base = self.config.backoff_base_ms as f64;
        let exp = self.config.backoff_factor.powi(retry.saturating_sub(1) as i32);
        let jitter = rand::rng().random_range(0.9..1.1);
        Duration::from_millis((base * exp * jitter) as u64)
    }

    /// Fixed-interval supervision loop. Poll errors are "no new
    /// information", not task failure; the ceiling bounds how long this
    /// can spin.
    async fn poll_until_exit(&self, handle: &TaskHandle, identity: &RunIdentity) -> i64 {
        let interval = self.config.poll_interval();
        loop {
            tokio::time::sleep(interval).await;
            match self.executor.poll(handle).await {
                Ok(TaskPoll::Running) => {
                    debug!(run = %identity, task = %handle.id, "Plan task still running");
                }
                Ok(TaskPoll::Exited { exit_code }) => return exit_code,
                Err(e) => {
                    warn!(
                        run = %identity,
                        task = %handle.id,
                        error = format!("{:#}", e),
                        "Poll failed, treating as no new information"
                    );
                }
            }
        }
    }
}
