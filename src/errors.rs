//! Typed error hierarchy for the surveyor orchestrator.
//!
//! Two top-level enums cover the two subsystems:
//! - `StoreError`: run state store failures (admission, transitions, SQLite)
//! - `RunError`: run lifecycle failures (tools, dispatch, artifacts, reconcile)
//!
//! HTTP-facing errors live in `server.rs` next to their `IntoResponse` impl.

use thiserror::Error;

use crate::models::{RunIdentity, RunStatus};

/// Errors from the run state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run {identity} not found")]
    RunNotFound { identity: RunIdentity },

    #[error("Transition conflict for {identity}: stored status is {actual}, expected {expected}")]
    TransitionConflict {
        identity: RunIdentity,
        expected: RunStatus,
        actual: RunStatus,
    },

    #[error("Refusing non-monotonic transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the run lifecycle. None of these is fatal to the process;
/// the worst outcome for a single run is a degraded report plus a recorded
/// failed/timed_out status. Store unavailability is the exception and
/// surfaces through the `Store` variant.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid event: {detail}")]
    InvalidEvent { detail: String },

    #[error("Tool {tool} timed out after {seconds}s")]
    ToolTimeout { tool: String, seconds: u64 },

    #[error("Tool {tool} failed: {detail}")]
    ToolFailure { tool: String, detail: String },

    #[error("Plan task launch failed after {attempts} attempts: {source}")]
    DispatchFailure {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("Plan task exceeded the {seconds}s ceiling")]
    TaskTimeout { seconds: u64 },

    #[error("Artifact {name} missing under {root}")]
    ArtifactMissing { root: String, name: String },

    #[error("Stale reconcile for {identity}: PR head has moved to {head_sha}")]
    ReconcileStale {
        identity: RunIdentity,
        head_sha: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
