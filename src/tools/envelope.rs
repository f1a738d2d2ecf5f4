//! Request/outcome envelope shared by every tool invocation.
//!
//! The digest computed at construction is the cache key for the run: two
//! requests with the same tool, identity and payload produce the same
//! digest, and a digest never matches across commits because the identity
//! is folded in.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::digest::envelope_digest;
use crate::models::{RunIdentity, ToolStatus};

/// Input to one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub tool_name: String,
    pub identity: RunIdentity,
    pub payload: Value,
    pub input_digest: String,
}

impl ToolRequest {
    pub fn new(tool_name: impl Into<String>, identity: RunIdentity, payload: Value) -> Self {
        let tool_name = tool_name.into();
        let input_digest = envelope_digest(&tool_name, &identity, &payload);
        Self {
            tool_name,
            identity,
            payload,
            input_digest,
        }
    }

    /// Wire form posted to HTTP-backed tools.
    pub fn envelope(&self) -> Value {
        json!({
            "tool_name": self.tool_name,
            "repository": self.identity.owner_repo,
            "pr_number": self.identity.pr_number,
            "commit_sha": self.identity.commit_sha,
            "input_digest": self.input_digest,
            "payload": self.payload,
        })
    }
}

/// What a tool reported back. `error` is set iff the status is not
/// success; `artifact_refs` names artifacts the tool wrote itself, in
/// store-reference form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_refs: Vec<String>,
}

impl ToolOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            result: Some(result),
            error: None,
            artifact_refs: Vec::new(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Failed,
            result: None,
            error: Some(detail.into()),
            artifact_refs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> RunIdentity {
        RunIdentity::new("acme/payments", 42, "aaa111")
    }

    #[test]
    fn test_digest_computed_at_construction() {
        let a = ToolRequest::new("security-scan", identity(), json!({"depth": "fast"}));
        let b = ToolRequest::new("security-scan", identity(), json!({"depth": "fast"}));
        assert_eq!(a.input_digest, b.input_digest);

        let c = ToolRequest::new("cost-estimate", identity(), json!({"depth": "fast"}));
        assert_ne!(a.input_digest, c.input_digest);
    }

    #[test]
    fn test_envelope_carries_identity_and_digest() {
        let request = ToolRequest::new("security-scan", identity(), json!({"depth": "fast"}));
        let envelope = request.envelope();
        assert_eq!(envelope["tool_name"], "security-scan");
        assert_eq!(envelope["repository"], "acme/payments");
        assert_eq!(envelope["pr_number"], 42);
        assert_eq!(envelope["commit_sha"], "aaa111");
        assert_eq!(envelope["input_digest"], json!(request.input_digest));
        assert_eq!(envelope["payload"]["depth"], "fast");
    }

    #[test]
    fn test_outcome_serde_skips_empty_fields() {
        let outcome = ToolOutcome::success(json!({"ok": true}));
        let wire = serde_json::to_value(&outcome).unwrap();
        assert_eq!(wire, json!({"status": "success", "result": {"ok": true}}));

        let parsed: ToolOutcome = serde_json::from_value(json!({
            "status": "failed",
            "error": "scanner crashed"
        }))
        .unwrap();
        assert_eq!(parsed.status, ToolStatus::Failed);
        assert_eq!(parsed.error.as_deref(), Some("scanner crashed"));
        assert!(parsed.artifact_refs.is_empty());
    }
}
