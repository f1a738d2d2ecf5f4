//! Run lifecycle orchestration.
//!
//! `Orchestrator` owns one run from webhook event to terminal state:
//! admission through the state store, the fast tool pass, the optional
//! deep plan pass with its enhanced tools, report rendering, comment
//! reconciliation, and the final status transition. One spawned task per
//! admitted run; an overall watchdog deadline forces a terminal state on
//! runaways, and a startup sweep reclaims runs orphaned by a crash.

use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactStore, FsArtifactStore, run_prefix};
use crate::classify::{Classification, classify};
use crate::config::SurveyorConfig;
use crate::deeppass::docker::CONTAINER_ARTIFACT_DIR;
use crate::deeppass::{DeepPassDispatcher, PlanExecutor, PlanTaskSpec, TaskState};
use crate::errors::RunError;
use crate::fastpass::{FastPassCoordinator, FastPassReport};
use crate::models::{AnalysisDepth, RunIdentity, RunStatus, ToolInvocation, WebhookEvent};
use crate::reconcile::{CommentReconciler, CommentSink};
use crate::report::{self, DeepReport, ReportInput};
use crate::store::{RunUpdate, StoreHandle};
use crate::tools::{TOOL_COMPLIANCE_CHECK, TOOL_COST_DEEP, ToolInvoker, ToolRegistry};

/// What admission decided, echoed back to the webhook caller.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionOutcome {
    pub created: bool,
    pub status: RunStatus,
    pub run_type: AnalysisDepth,
}

/// Everything `analyze` hands to `finalize`.
struct RunFinish {
    status: RunStatus,
    fast: FastPassReport,
    deep: Option<DeepReport>,
    error: Option<String>,
}

pub struct Orchestrator {
    config: SurveyorConfig,
    store: StoreHandle,
    artifacts: Arc<FsArtifactStore>,
    registry: Arc<ToolRegistry>,
    invoker: Arc<ToolInvoker>,
    fastpass: FastPassCoordinator,
    dispatcher: DeepPassDispatcher,
    reconciler: Option<CommentReconciler>,
    tasks: Mutex<JoinSet<()>>,
}

impl Orchestrator {
    /// Wires the pipeline together. `sink` is optional so the service can
    /// run without a GitHub token; reports are still rendered and stored
    /// as artifacts, just not posted.
    pub fn new(
        config: SurveyorConfig,
        store: StoreHandle,
        artifacts: Arc<FsArtifactStore>,
        executor: Arc<dyn PlanExecutor>,
        sink: Option<Arc<dyn CommentSink>>,
    ) -> Arc<Self> {
        let dyn_artifacts: Arc<dyn ArtifactStore> = artifacts.clone();
        let registry = Arc::new(ToolRegistry::from_config(&config.tools));
        let invoker = Arc::new(ToolInvoker::new(
            store.clone(),
            dyn_artifacts.clone(),
            config.fast_pass.tool_timeout(),
        ));
        let fastpass = FastPassCoordinator::new(
            store.clone(),
            dyn_artifacts.clone(),
            registry.clone(),
            invoker.clone(),
            config.fast_pass.aggregate_deadline(),
        );
        let dispatcher = DeepPassDispatcher::new(executor, dyn_artifacts, config.deep_pass.clone());
        let reconciler = sink.map(|sink| CommentReconciler::new(store.clone(), sink));

        Arc::new(Self {
            config,
            store,
            artifacts,
            registry,
            invoker,
            fastpass,
            dispatcher,
            reconciler,
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// Admission: validate, remember the PR head, classify, and create the
    /// run row. At-least-once delivery collapses here; only the event that
    /// actually created the row spawns analysis.
    pub async fn handle_event(
        self: Arc<Self>,
        event: WebhookEvent,
    ) -> Result<AdmissionOutcome, RunError> {
        event
            .validate()
            .map_err(|detail| RunError::InvalidEvent { detail })?;
        let identity = event.identity();

        {
            let owner_repo = event.repository.clone();
            let head = event.commit_sha.clone();
            let pr_number = event.pr_number;
            self.store
                .call(move |db| db.record_pr_head(&owner_repo, pr_number, &head))
                .await?;
        }

        let classification = classify(&event, &self.config.classifier);
        let (run, created) = {
            let identity = identity.clone();
            let depth = classification.depth;
            self.store
                .call(move |db| db.create_if_absent(&identity, depth))
                .await?
        };

        if !created {
            debug!(run = %identity, status = %run.status, "Duplicate delivery collapsed");
            return Ok(AdmissionOutcome {
                created: false,
                status: run.status,
                run_type: run.run_type,
            });
        }

        info!(
            run = %identity,
            depth = %classification.depth,
            trigger = %classification.reason,
            "Run admitted"
        );
        let this = self.clone();
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            this.execute_run(event, classification).await;
        });

        Ok(AdmissionOutcome {
            created: true,
            status: run.status,
            run_type: run.run_type,
        })
    }

    /// Drives one admitted run to a terminal state. Never returns an error:
    /// every failure mode ends in a recorded status.
    async fn execute_run(self: Arc<Self>, event: WebhookEvent, classification: Classification) {
        let identity = event.identity();
        let started = Instant::now();
        let deadline = self.config.run_deadline();

        let finish =
            match tokio::time::timeout(deadline, self.analyze(&event, &classification)).await {
                Ok(Ok(finish)) => finish,
                Ok(Err(err)) => {
                    error!(run = %identity, error = format!("{:#}", err), "Run aborted");
                    self.force_terminal(&identity, RunStatus::Failed, format!("{:#}", err), started)
                        .await;
                    return;
                }
                Err(_) => {
                    warn!(run = %identity, deadline_secs = deadline.as_secs(), "Run watchdog fired");
                    let detail =
                        format!("Run exceeded the {}s overall deadline", deadline.as_secs());
                    self.force_terminal(&identity, RunStatus::TimedOut, detail, started)
                        .await;
                    return;
                }
            };

        self.finalize(&identity, &classification, finish, started)
            .await;
    }

    /// The analysis body: both passes, no finalization. Errors out only on
    /// store unavailability; tool and task failures degrade instead.
    async fn analyze(
        &self,
        event: &WebhookEvent,
        classification: &Classification,
    ) -> Result<RunFinish, RunError> {
        let identity = event.identity();
        self.step(&identity, RunStatus::Pending, RunStatus::RunningFast)
            .await?;

        let fast = self.fastpass.run(&identity, event).await?;

        if classification.depth == AnalysisDepth::Fast {
            return Ok(RunFinish {
                status: RunStatus::Completed,
                fast,
                deep: None,
                error: None,
            });
        }

        self.step(&identity, RunStatus::RunningFast, RunStatus::RunningDeep)
            .await?;

        let spec = PlanTaskSpec {
            identity: identity.clone(),
            artifact_dir: self.artifacts.local_dir(&identity),
            artifact_root: CONTAINER_ARTIFACT_DIR.to_string(),
            credential: self.config.github.resolve_token(),
        };
        let outcome = self.dispatcher.run(spec).await;

        let deep = match outcome.state {
            TaskState::Succeeded => {
                let plan = match outcome.plan_ref.as_deref() {
                    Some(reference) => self.read_json_artifact(reference).await,
                    None => None,
                };
                let payload = json!({ "plan_ref": outcome.plan_ref });
                let (cost_deep, compliance) = tokio::join!(
                    self.enhanced_section(TOOL_COST_DEEP, &identity, payload.clone()),
                    self.enhanced_section(TOOL_COMPLIANCE_CHECK, &identity, payload.clone()),
                );
                DeepReport {
                    state: TaskState::Succeeded,
                    detail: None,
                    plan,
                    cost_deep: cost_deep?,
                    compliance: compliance?,
                }
            }
            state => {
                warn!(
                    run = %identity,
                    state = %state,
                    detail = outcome.detail.as_deref().unwrap_or(""),
                    "Deep pass degraded"
                );
                DeepReport::unavailable(state, outcome.detail)
            }
        };

        let (status, error) = match deep.state {
            TaskState::Succeeded => (RunStatus::Completed, None),
            TaskState::TimedOut => (RunStatus::TimedOut, deep.detail.clone()),
            _ => (RunStatus::Failed, deep.detail.clone()),
        };

        Ok(RunFinish {
            status,
            fast,
            deep: Some(deep),
            error,
        })
    }

    /// Render, persist, reconcile, and write the terminal row. The report
    /// is posted for failed and timed-out runs too; degraded sections say
    /// so inline rather than suppressing the comment.
    async fn finalize(
        &self,
        identity: &RunIdentity,
        classification: &Classification,
        finish: RunFinish,
        started: Instant,
    ) {
        let findings = report::findings_summary(&finish.fast);
        let cost = report::cost_summary(&finish.fast, finish.deep.as_ref());
        let deep_degraded = finish
            .deep
            .as_ref()
            .is_some_and(|d| d.state != TaskState::Succeeded);
        let partial = finish.fast.partial || deep_degraded;
        let trigger = classification.reason.to_string();

        let body = report::render(&ReportInput {
            identity,
            depth: classification.depth,
            status: finish.status,
            trigger: &trigger,
            duration: started.elapsed(),
            fast: &finish.fast,
            deep: finish.deep.as_ref(),
        });

        if let Err(e) = self.artifacts.put(identity, "report.md", body.as_bytes()).await {
            warn!(run = %identity, error = format!("{:#}", e), "Failed to persist report artifact");
        }

        if let Some(reconciler) = &self.reconciler {
            match reconciler.reconcile(identity, &body).await {
                Ok(comment_id) => {
                    debug!(run = %identity, comment_id, "Report comment reconciled");
                }
                Err(RunError::ReconcileStale { head_sha, .. }) => {
                    info!(run = %identity, head = %head_sha, "Skipped comment write, PR head has moved on");
                }
                Err(err) => {
                    warn!(run = %identity, error = format!("{:#}", err), "Report reconcile failed");
                }
            }
        }

        let from = match classification.depth {
            AnalysisDepth::Fast => RunStatus::RunningFast,
            AnalysisDepth::Deep => RunStatus::RunningDeep,
        };
        let update = RunUpdate {
            duration_ms: Some(started.elapsed().as_millis() as i64),
            findings_summary: findings,
            cost_summary: cost,
            artifact_root: Some(run_prefix(identity)),
            error: finish.error,
            partial: Some(partial),
        };
        let result = {
            let identity = identity.clone();
            let to = finish.status;
            self.store
                .call(move |db| db.transition(&identity, from, to, &update))
                .await
        };
        match result {
            Ok(run) => {
                info!(
                    run = %identity,
                    status = %run.status,
                    partial,
                    duration_ms = run.duration_ms,
                    "Run finalized"
                );
            }
            Err(e) => {
                warn!(run = %identity, error = format!("{:#}", e), "Final transition failed");
            }
        }
    }

    /// Best-effort jump to a terminal state from wherever the run is now.
    /// Used by the watchdog and the store-failure path, where the normal
    /// from-status bookkeeping is unavailable.
    async fn force_terminal(
        &self,
        identity: &RunIdentity,
        to: RunStatus,
        error: String,
        started: Instant,
    ) {
        let current = {
            let id = identity.clone();
            match self.store.call(move |db| db.find(&id)).await {
                Ok(Some(run)) => run.status,
                Ok(None) => return,
                Err(e) => {
                    error!(run = %identity, error = format!("{:#}", e), "Cannot read run for terminal transition");
                    return;
                }
            }
        };
        if current.is_terminal() {
            return;
        }

        let update = RunUpdate {
            duration_ms: Some(started.elapsed().as_millis() as i64),
            error: Some(error),
            partial: Some(true),
            ..Default::default()
        };
        let result = {
            let identity = identity.clone();
            self.store
                .call(move |db| db.transition(&identity, current, to, &update))
                .await
        };
        if let Err(e) = result {
            warn!(run = %identity, error = format!("{:#}", e), "Forced terminal transition failed");
        }
    }

    async fn step(
        &self,
        identity: &RunIdentity,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<(), RunError> {
        let identity = identity.clone();
        self.store
            .call(move |db| db.transition(&identity, from, to, &RunUpdate::default()).map(|_| ()))
            .await?;
        Ok(())
    }

    /// Invoke one enhanced tool and read its output section back. Tool
    /// failures degrade to `None`; only store failures propagate.
    async fn enhanced_section(
        &self,
        tool: &str,
        identity: &RunIdentity,
        payload: Value,
    ) -> Result<Option<Value>, RunError> {
        match self
            .invoker
            .invoke(&self.registry, tool, identity, payload)
            .await
        {
            Ok(invocation) => Ok(self.read_section(&invocation).await),
            Err(RunError::Store(e)) => Err(RunError::Store(e)),
            Err(err) => {
                warn!(run = %identity, tool, error = format!("{:#}", err), "Enhanced tool degraded");
                Ok(None)
            }
        }
    }

    async fn read_section(&self, invocation: &ToolInvocation) -> Option<Value> {
        let reference = invocation.output_ref.as_deref()?;
        self.read_json_artifact(reference).await
    }

    async fn read_json_artifact(&self, reference: &str) -> Option<Value> {
        match self.artifacts.get(reference).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(reference, error = %e, "Artifact is not valid JSON");
                    None
                }
            },
            Ok(None) => {
                warn!(reference, "Referenced artifact is missing");
                None
            }
            Err(e) => {
                warn!(reference, error = format!("{:#}", e), "Artifact read failed");
                None
            }
        }
    }

    /// Marks non-terminal runs older than the overall deadline as timed
    /// out. Called once at startup to absorb crashes, and periodically
    /// after that.
    pub async fn reclaim_stale_runs(&self) -> Result<usize, RunError> {
        let deadline = self.config.run_deadline();
        let cutoff = (Utc::now() - chrono::Duration::seconds(deadline.as_secs() as i64))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let reclaimed = self
            .store
            .call(move |db| db.reclaim_overdue(&cutoff))
            .await?;
        for run in &reclaimed {
            warn!(run = %run.identity(), "Reclaimed overdue run as timed_out");
        }
        Ok(reclaimed.len())
    }

    /// Waits for all in-flight run tasks to finish.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Run task panicked");
                }
            }
        }
    }
}
