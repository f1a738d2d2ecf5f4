//! Canonical input digests for tool invocations.
//!
//! Two invocations are "the same call" iff their digests match. Digests are
//! scoped to a run identity, so an identical payload against a different
//! commit always digests differently and is never served from cache.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::models::RunIdentity;

/// SHA-256 hex of the canonical JSON form of `value`.
///
/// `Value` objects are BTree-backed, so re-serializing through `Value`
/// yields sorted keys and compact separators: one canonical byte stream
/// per logical input, regardless of field order at the call site.
pub fn canonical_digest(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest of a full tool envelope: tool name, run identity, and payload.
pub fn envelope_digest(tool_name: &str, identity: &RunIdentity, payload: &Value) -> String {
    canonical_digest(&json!({
        "tool": tool_name,
        "repository": identity.owner_repo,
        "pr_number": identity.pr_number,
        "commit_sha": identity.commit_sha,
        "payload": payload,
    }))
}
