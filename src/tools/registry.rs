//! Tool registry and the deadline/cache-enforcing invoker.
//!
//! Every analysis capability goes through `ToolInvoker::invoke`: it owns
//! the per-invocation deadline, the within-run result cache, and the rule
//! that a successful invocation always leaves an `output_ref` behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::envelope::{ToolOutcome, ToolRequest};
use super::http::HttpTool;
use crate::artifacts::ArtifactStore;
use crate::errors::RunError;
use crate::models::{RunIdentity, ToolInvocation, ToolStatus};
use crate::store::{InvocationRecord, StoreHandle};

pub const TOOL_PR_CONTEXT: &str = "pr-context";
pub const TOOL_SECURITY_SCAN: &str = "security-scan";
pub const TOOL_COST_ESTIMATE: &str = "cost-estimate";
pub const TOOL_COST_DEEP: &str = "cost-deep";
pub const TOOL_COMPLIANCE_CHECK: &str = "compliance-check";

/// Abstraction over analysis tool execution for testability.
/// Real implementations: `HttpTool`, `EventContextTool`. Test doubles live
/// in the test modules that exercise the invoker and coordinators.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: &ToolRequest) -> Result<ToolOutcome>;
}

/// Built-in context tool: summarizes the facts the triggering event
/// already carries. Registered by default and replaced when an HTTP
/// endpoint is configured under the same name.
pub struct EventContextTool;

#[async_trait]
impl Tool for EventContextTool {
    fn name(&self) -> &str {
        TOOL_PR_CONTEXT
    }

    async fn invoke(&self, request: &ToolRequest) -> Result<ToolOutcome> {
        let changed = request
            .payload
            .get("changed_files_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let additions = request
            .payload
            .get("additions")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let labels = request
            .payload
            .get("labels")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        Ok(ToolOutcome::success(json!({
            "repository": request.identity.owner_repo,
            "pr_number": request.identity.pr_number,
            "commit_sha": request.identity.commit_sha,
            "changed_files_count": changed,
            "additions": additions,
            "labels": labels,
            "summary": format!("{} changed files, {} added lines", changed, additions),
        })))
    }
}

/// Name-keyed table of registered tools, built once at startup.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registration table from configuration: the built-in context tool
    /// plus one HTTP adapter per `[tools]` entry. A configured entry under
    /// a built-in name replaces the built-in.
    pub fn from_config(endpoints: &HashMap<String, String>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EventContextTool));
        let client = reqwest::Client::new();
        for (name, endpoint) in endpoints {
            registry.register(Arc::new(HttpTool::new(
                name.clone(),
                endpoint.clone(),
                client.clone(),
            )));
        }
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Invokes tools under the per-invocation deadline and records every
/// outcome against the owning run.
pub struct ToolInvoker {
    store: StoreHandle,
    artifacts: Arc<dyn ArtifactStore>,
    deadline: Duration,
}

impl ToolInvoker {
    pub fn new(store: StoreHandle, artifacts: Arc<dyn ArtifactStore>, deadline: Duration) -> Self {
        Self {
            store,
            artifacts,
            deadline,
        }
    }

    /// Invoke `tool_name` for the run, returning the recorded invocation.
    ///
    /// A previously recorded successful invocation with the same input
    /// digest is reused without re-invoking the tool; digests never match
    /// across commits, so reuse stays within one run. Failures and
    /// timeouts are persisted before the typed error surfaces, keeping
    /// the run's invocation history complete either way.
    pub async fn invoke(
        &self,
        registry: &ToolRegistry,
        tool_name: &str,
        identity: &RunIdentity,
        payload: Value,
    ) -> Result<ToolInvocation, RunError> {
        let request = ToolRequest::new(tool_name, identity.clone(), payload);

        let cached = {
            let identity = identity.clone();
            let tool = request.tool_name.clone();
            let digest = request.input_digest.clone();
            self.store
                .call(move |db| db.cached_invocation(&identity, &tool, &digest))
                .await?
        };
        if let Some(invocation) = cached {
            debug!(tool = tool_name, run = %identity, "Reusing recorded tool outcome");
            return Ok(invocation);
        }

        let Some(tool) = registry.get(tool_name) else {
            let detail = "No implementation registered for tool".to_string();
            self.persist(&request, ToolStatus::Failed, None, Some(detail.clone()), Some(0))
                .await?;
            return Err(RunError::ToolFailure {
                tool: tool_name.to_string(),
                detail,
            });
        };

        let deadline_secs = self.deadline.as_secs();
        let started = Instant::now();
        match tokio::time::timeout(self.deadline, tool.invoke(&request)).await {
            Ok(Ok(outcome)) => {
                let elapsed = started.elapsed().as_millis() as i64;
                self.record_outcome(&request, outcome, elapsed, deadline_secs)
                    .await
            }
            Ok(Err(e)) => {
                let elapsed = started.elapsed().as_millis() as i64;
                let detail = format!("{:#}", e);
                self.persist(&request, ToolStatus::Failed, None, Some(detail.clone()), Some(elapsed))
                    .await?;
                Err(RunError::ToolFailure {
                    tool: tool_name.to_string(),
                    detail,
                })
            }
            Err(_) => {
                let detail = format!("Invocation exceeded its {}s deadline", deadline_secs);
                self.persist(
                    &request,
                    ToolStatus::TimedOut,
                    None,
                    Some(detail),
                    Some(self.deadline.as_millis() as i64),
                )
                .await?;
                Err(RunError::ToolTimeout {
                    tool: tool_name.to_string(),
                    seconds: deadline_secs,
                })
            }
        }
    }

    async fn record_outcome(
        &self,
        request: &ToolRequest,
        outcome: ToolOutcome,
        elapsed_ms: i64,
        deadline_secs: u64,
    ) -> Result<ToolInvocation, RunError> {
        match outcome.status {
            ToolStatus::Success => {
                match self.resolve_output_ref(request, &outcome).await {
                    Ok(reference) => {
                        self.persist(
                            request,
                            ToolStatus::Success,
                            Some(reference),
                            None,
                            Some(elapsed_ms),
                        )
                        .await
                    }
                    Err(e) => {
                        let detail = format!("Failed to persist tool output: {:#}", e);
                        self.persist(
                            request,
                            ToolStatus::Failed,
                            None,
                            Some(detail.clone()),
                            Some(elapsed_ms),
                        )
                        .await?;
                        Err(RunError::ToolFailure {
                            tool: request.tool_name.clone(),
                            detail,
                        })
                    }
                }
            }
            ToolStatus::Failed => {
                let detail = outcome
                    .error
                    .unwrap_or_else(|| "Tool reported failure".to_string());
                self.persist(
                    request,
                    ToolStatus::Failed,
                    None,
                    Some(detail.clone()),
                    Some(elapsed_ms),
                )
                .await?;
                Err(RunError::ToolFailure {
                    tool: request.tool_name.clone(),
                    detail,
                })
            }
            ToolStatus::TimedOut => {
                let detail = outcome
                    .error
                    .unwrap_or_else(|| "Tool reported timeout".to_string());
                self.persist(
                    request,
                    ToolStatus::TimedOut,
                    None,
                    Some(detail),
                    Some(elapsed_ms),
                )
                .await?;
                Err(RunError::ToolTimeout {
                    tool: request.tool_name.clone(),
                    seconds: deadline_secs,
                })
            }
        }
    }

    /// `output_ref` is always populated on success: tools that wrote their
    /// own artifacts report them in `artifact_refs`; otherwise the
    /// structured result is stored as `<tool>.json` under the run prefix.
    async fn resolve_output_ref(
        &self,
        request: &ToolRequest,
        outcome: &ToolOutcome,
    ) -> Result<String> {
        if let Some(reference) = outcome.artifact_refs.first() {
            return Ok(reference.clone());
        }
        let result = outcome.result.clone().unwrap_or(Value::Null);
        let bytes = serde_json::to_vec_pretty(&result).context("Failed to serialize tool result")?;
        self.artifacts
            .put(
                &request.identity,
                &format!("{}.json", request.tool_name),
                &bytes,
            )
            .await
    }

    async fn persist(
        &self,
        request: &ToolRequest,
        status: ToolStatus,
        output_ref: Option<String>,
        error_detail: Option<String>,
        duration_ms: Option<i64>,
    ) -> Result<ToolInvocation, RunError> {
        let record = InvocationRecord {
            tool_name: request.tool_name.clone(),
            input_digest: request.input_digest.clone(),
            status,
            output_ref,
            error_detail,
            duration_ms,
        };
        let identity = request.identity.clone();
        Ok(self
            .store
            .call(move |db| db.record_invocation(&identity, &record))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::artifacts::FsArtifactStore;
    use crate::store::RunDb;

    struct StaticTool {
        name: &'static str,
        outcome: ToolOutcome,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for StaticTool {
        fn name(&self) -> &str {
            self.name
        }

        async fn invoke(&self, _request: &ToolRequest) -> Result<ToolOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome.clone())
        }
    }

    struct HangingTool;

    #[async_trait]
    impl Tool for HangingTool {
        fn name(&self) -> &str {
            TOOL_SECURITY_SCAN
        }

        async fn invoke(&self, _request: &ToolRequest) -> Result<ToolOutcome> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ToolOutcome::success(json!({})))
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            TOOL_COST_ESTIMATE
        }

        async fn invoke(&self, _request: &ToolRequest) -> Result<ToolOutcome> {
            anyhow::bail!("connection reset by peer")
        }
    }

    fn identity() -> RunIdentity {
        RunIdentity::new("acme/payments", 42, "aaa111")
    }

    fn harness(deadline: Duration) -> (tempfile::TempDir, StoreHandle, ToolInvoker) {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreHandle::new(RunDb::new_in_memory().unwrap());
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(dir.path()));
        let invoker = ToolInvoker::new(store.clone(), artifacts, deadline);
        (dir, store, invoker)
    }

    fn registry_with(tool: Arc<dyn Tool>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        registry
    }

    #[tokio::test]
    async fn test_success_persists_row_and_result_artifact() {
        let (_dir, store, invoker) = harness(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Arc::new(StaticTool {
            name: TOOL_SECURITY_SCAN,
            outcome: ToolOutcome::success(json!({"findings": []})),
            calls: calls.clone(),
        }));

        let invocation = invoker
            .invoke(&registry, TOOL_SECURITY_SCAN, &identity(), json!({"depth": "fast"}))
            .await
            .unwrap();
        assert_eq!(invocation.status, ToolStatus::Success);
        assert_eq!(
            invocation.output_ref.as_deref(),
            Some("acme/payments/42/aaa111/security-scan.json")
        );
        assert!(invocation.duration_ms.is_some());

        let id = identity();
        let rows = store
            .call(move |db| db.invocations_for_run(&id))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_identical_invocation_reuses_outcome() {
        let (_dir, _store, invoker) = harness(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Arc::new(StaticTool {
            name: TOOL_SECURITY_SCAN,
            outcome: ToolOutcome::success(json!({"findings": []})),
            calls: calls.clone(),
        }));

        let first = invoker
            .invoke(&registry, TOOL_SECURITY_SCAN, &identity(), json!({"depth": "fast"}))
            .await
            .unwrap();
        let second = invoker
            .invoke(&registry, TOOL_SECURITY_SCAN, &identity(), json!({"depth": "fast"}))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.id, second.id);

        // a different payload is a different invocation
        invoker
            .invoke(&registry, TOOL_SECURITY_SCAN, &identity(), json!({"depth": "deep"}))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reuse_never_crosses_commits() {
        let (_dir, _store, invoker) = harness(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Arc::new(StaticTool {
            name: TOOL_SECURITY_SCAN,
            outcome: ToolOutcome::success(json!({"findings": []})),
            calls: calls.clone(),
        }));

        invoker
            .invoke(&registry, TOOL_SECURITY_SCAN, &identity(), json!({"depth": "fast"}))
            .await
            .unwrap();
        let next_commit = RunIdentity::new("acme/payments", 42, "bbb222");
        invoker
            .invoke(&registry, TOOL_SECURITY_SCAN, &next_commit, json!({"depth": "fast"}))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_persisted_then_surfaced() {
        let (_dir, store, invoker) = harness(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Arc::new(StaticTool {
            name: TOOL_SECURITY_SCAN,
            outcome: ToolOutcome::failure("scanner crashed"),
            calls: calls.clone(),
        }));

        let err = invoker
            .invoke(&registry, TOOL_SECURITY_SCAN, &identity(), json!({}))
            .await
            .unwrap_err();
        match err {
            RunError::ToolFailure { tool, detail } => {
                assert_eq!(tool, TOOL_SECURITY_SCAN);
                assert_eq!(detail, "scanner crashed");
            }
            other => panic!("Expected ToolFailure, got {:?}", other),
        }

        let id = identity();
        let rows = store
            .call(move |db| db.invocations_for_run(&id))
            .await
            .unwrap();
        assert_eq!(rows[0].status, ToolStatus::Failed);
        assert_eq!(rows[0].error_detail.as_deref(), Some("scanner crashed"));
        assert!(rows[0].output_ref.is_none());
    }

    #[tokio::test]
    async fn test_failures_are_not_served_from_cache() {
        let (_dir, _store, invoker) = harness(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Arc::new(StaticTool {
            name: TOOL_SECURITY_SCAN,
            outcome: ToolOutcome::failure("scanner crashed"),
            calls: calls.clone(),
        }));

        let _ = invoker
            .invoke(&registry, TOOL_SECURITY_SCAN, &identity(), json!({}))
            .await;
        let _ = invoker
            .invoke(&registry, TOOL_SECURITY_SCAN, &identity(), json!({}))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deadline_elapsed_records_timed_out() {
        let (_dir, store, invoker) = harness(Duration::from_millis(50));
        let registry = registry_with(Arc::new(HangingTool));

        let err = invoker
            .invoke(&registry, TOOL_SECURITY_SCAN, &identity(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::ToolTimeout { .. }));

        let id = identity();
        let rows = store
            .call(move |db| db.invocations_for_run(&id))
            .await
            .unwrap();
        assert_eq!(rows[0].status, ToolStatus::TimedOut);
        assert!(rows[0].error_detail.as_deref().unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn test_tool_error_recorded_as_failure() {
        let (_dir, store, invoker) = harness(Duration::from_secs(5));
        let registry = registry_with(Arc::new(BrokenTool));

        let err = invoker
            .invoke(&registry, TOOL_COST_ESTIMATE, &identity(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::ToolFailure { .. }));

        let id = identity();
        let rows = store
            .call(move |db| db.invocations_for_run(&id))
            .await
            .unwrap();
        assert_eq!(rows[0].status, ToolStatus::Failed);
        assert!(
            rows[0]
                .error_detail
                .as_deref()
                .unwrap()
                .contains("connection reset")
        );
    }

    #[tokio::test]
    async fn test_unregistered_tool_is_recorded_failure() {
        let (_dir, store, invoker) = harness(Duration::from_secs(5));
        let registry = ToolRegistry::new();

        let err = invoker
            .invoke(&registry, TOOL_COMPLIANCE_CHECK, &identity(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::ToolFailure { .. }));

        let id = identity();
        let rows = store
            .call(move |db| db.invocations_for_run(&id))
            .await
            .unwrap();
        assert_eq!(rows[0].tool_name, TOOL_COMPLIANCE_CHECK);
        assert_eq!(rows[0].status, ToolStatus::Failed);
    }

    #[tokio::test]
    async fn test_event_context_tool_summarizes_payload() {
        let request = ToolRequest::new(
            TOOL_PR_CONTEXT,
            identity(),
            json!({"changed_files_count": 3, "additions": 120, "labels": ["bug"]}),
        );
        let outcome = EventContextTool.invoke(&request).await.unwrap();
        assert_eq!(outcome.status, ToolStatus::Success);
        let result = outcome.result.unwrap();
        assert_eq!(result["summary"], "3 changed files, 120 added lines");
        assert_eq!(result["labels"], json!(["bug"]));
        assert_eq!(result["repository"], "acme/payments");
    }

    #[test]
    fn test_registry_from_config_overrides_builtin() {
        let registry = ToolRegistry::from_config(&HashMap::new());
        assert_eq!(registry.names(), vec![TOOL_PR_CONTEXT.to_string()]);

        let mut endpoints = HashMap::new();
        endpoints.insert(
            TOOL_PR_CONTEXT.to_string(),
            "http://tools.internal/context".to_string(),
        );
        endpoints.insert(
            TOOL_SECURITY_SCAN.to_string(),
            "http://tools.internal/scan".to_string(),
        );
        let registry = ToolRegistry::from_config(&endpoints);
        assert_eq!(
            registry.names(),
            vec![TOOL_PR_CONTEXT.to_string(), TOOL_SECURITY_SCAN.to_string()]
        );
        assert!(registry.get(TOOL_COST_ESTIMATE).is_none());
    }
}
