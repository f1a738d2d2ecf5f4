//! Tool invocation contract.
//!
//! Analysis capabilities (context retrieval, scanners, cost estimators)
//! are invoked through one uniform seam:
//!
//! - [`envelope`]: `ToolRequest` / `ToolOutcome` plus the canonical input
//!   digest computed at construction
//! - [`registry`]: the `Tool` trait, the name-keyed registry built from
//!   configuration, and the deadline/cache-enforcing `ToolInvoker`
//! - [`http`]: adapter that posts the envelope to an external HTTP tool
//!
//! Callers never talk to a tool directly; everything flows through
//! `ToolInvoker::invoke`, which records an invocation row per attempt.

pub mod envelope;
pub mod http;
pub mod registry;

pub use envelope::{ToolOutcome, ToolRequest};
pub use http::HttpTool;
pub use registry::{
    EventContextTool, TOOL_COMPLIANCE_CHECK, TOOL_COST_DEEP, TOOL_COST_ESTIMATE, TOOL_PR_CONTEXT,
    TOOL_SECURITY_SCAN, Tool, ToolInvoker, ToolRegistry,
};
