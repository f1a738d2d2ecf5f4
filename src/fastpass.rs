//! Fast-pass coordinator: bounded-time concurrent baseline analysis.
//!
//! Runs the fast tool set concurrently under one aggregate deadline.
//! Whatever has finished when the deadline fires is the result; tools
//! still outstanding are recorded `timed_out` and the pass finalizes with
//! the completed subset. A failing or slow tool degrades the report, it
//! never fails the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::artifacts::ArtifactStore;
use crate::errors::RunError;
use crate::models::{RunIdentity, ToolInvocation, ToolStatus, WebhookEvent};
use crate::store::{InvocationRecord, StoreHandle};
use crate::tools::{
    TOOL_COST_ESTIMATE, TOOL_PR_CONTEXT, TOOL_SECURITY_SCAN, ToolInvoker, ToolRegistry, ToolRequest,
};

/// The fast tool set, invoked concurrently on every run.
pub const FAST_TOOLS: [&str; 3] = [TOOL_PR_CONTEXT, TOOL_SECURITY_SCAN, TOOL_COST_ESTIMATE];

/// What the fast pass produced: per-tool result sections keyed by tool
/// name, the recorded invocation rows, and whether any section is missing.
#[derive(Debug, Default)]
pub struct FastPassReport {
    pub sections: HashMap<String, Value>,
    pub invocations: Vec<ToolInvocation>,
    pub partial: bool,
}

impl FastPassReport {
    pub fn section(&self, tool_name: &str) -> Option<&Value> {
        self.sections.get(tool_name)
    }
}

pub struct FastPassCoordinator {
    store: StoreHandle,
    artifacts: Arc<dyn ArtifactStore>,
    registry: Arc<ToolRegistry>,
    invoker: Arc<ToolInvoker>,
    aggregate_deadline: Duration,
}

impl FastPassCoordinator {
    pub fn new(
        store: StoreHandle,
        artifacts: Arc<dyn ArtifactStore>,
        registry: Arc<ToolRegistry>,
        invoker: Arc<ToolInvoker>,
        aggregate_deadline: Duration,
    ) -> Self {
        Self {
            store,
            artifacts,
            registry,
            invoker,
            aggregate_deadline,
        }
    }

    /// Run the fast tool set for one run. Only store unavailability is an
    /// error; every tool-level problem is recorded and degrades the
    /// resulting report instead.
    pub async fn run(
        &self,
        identity: &RunIdentity,
        event: &WebhookEvent,
    ) -> Result<FastPassReport, RunError> {
        let payload = tool_payload(event);

        // digests computed up front so expiry can synthesize rows for
        // tools that never got to record their own
        let requests: Vec<ToolRequest> = FAST_TOOLS
            .iter()
            .map(|name| ToolRequest::new(*name, identity.clone(), payload.clone()))
            .collect();

        let mut futures = FuturesUnordered::new();
        for name in FAST_TOOLS {
            let invoker = self.invoker.clone();
            let registry = self.registry.clone();
            let identity = identity.clone();
            let payload = payload.clone();
            futures.push(async move {
                let result = invoker.invoke(&registry, name, &identity, payload).await;
                (name, result)
            });
        }

        let deadline = tokio::time::sleep(self.aggregate_deadline);
        tokio::pin!(deadline);
        let mut store_failure: Option<RunError> = None;

        loop {
            tokio::select! {
                next = futures.next() => {
                    let Some((name, result)) = next else { break };
                    match result {
                        Ok(invocation) => {
                            debug!(run = %identity, tool = name, status = %invocation.status, "Fast tool finished");
                        }
                        Err(RunError::Store(e)) => {
                            store_failure = Some(RunError::Store(e));
                            break;
                        }
                        Err(e) => {
                            warn!(run = %identity, tool = name, error = %e, "Fast tool degraded");
                        }
                    }
                    if futures.is_empty() {
                        break;
                    }
                }
                _ = &mut deadline => {
                    warn!(
                        run = %identity,
                        outstanding = futures.len(),
                        "Aggregate deadline reached, finalizing with completed subset"
                    );
                    break;
                }
            }
        }
        // dropping the stream cancels whatever is still in flight
        drop(futures);

        if let Some(e) = store_failure {
            return Err(e);
        }

        self.finalize(identity, &requests).await
    }

    /// Synthesize `timed_out` rows for tools that never recorded one, then
    /// assemble the report from the persisted rows.
    async fn finalize(
        &self,
        identity: &RunIdentity,
        requests: &[ToolRequest],
    ) -> Result<FastPassReport, RunError> {
        let deadline_secs = self.aggregate_deadline.as_secs();
        let mut invocations = Vec::with_capacity(requests.len());
        for request in requests {
            let id = identity.clone();
            let tool = request.tool_name.clone();
            let digest = request.input_digest.clone();
            let invocation = self
                .store
                .call(move |db| {
                    if let Some(existing) = db.find_invocation(&id, &tool, &digest)? {
                        return Ok(existing);
                    }
                    db.record_invocation(
                        &id,
                        &InvocationRecord {
                            tool_name: tool.clone(),
                            input_digest: digest.clone(),
                            status: ToolStatus::TimedOut,
                            output_ref: None,
                            error_detail: Some(format!(
                                "Outstanding at the {}s aggregate deadline",
                                deadline_secs
                            )),
                            duration_ms: None,
                        },
                    )
                })
                .await?;
            invocations.push(invocation);
        }

        let mut sections = HashMap::new();
        for invocation in &invocations {
            if invocation.status != ToolStatus::Success {
                continue;
            }
            let Some(reference) = invocation.output_ref.as_deref() else {
                warn!(run = %identity, tool = %invocation.tool_name, "Successful invocation without output");
                continue;
            };
            match self.artifacts.get(reference).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<Value>(&bytes) {
                    Ok(value) => {
                        sections.insert(invocation.tool_name.clone(), value);
                    }
                    Err(e) => {
                        warn!(run = %identity, tool = %invocation.tool_name, error = %e, "Tool output is not JSON");
                    }
                },
                Ok(None) => {
                    warn!(run = %identity, tool = %invocation.tool_name, reference, "Tool output artifact missing");
                }
                Err(e) => {
                    warn!(run = %identity, tool = %invocation.tool_name, error = %e, "Failed to read tool output");
                }
            }
        }

        let partial = sections.len() < FAST_TOOLS.len();
        Ok(FastPassReport {
            sections,
            invocations,
            partial,
        })
    }
}

/// Shared payload for the fast tool set: the facts the event carries.
fn tool_payload(event: &WebhookEvent) -> Value {
    json!({
        "changed_files_count": event.changed_files_count,
        "additions": event.additions,
        "labels": event.labels,
    })
}
