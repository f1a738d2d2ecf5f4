//! Deep-pass task supervision.
//!
//! - [`dispatcher`]: the launch/poll/cancel state machine with retry
//!   backoff, the trust-but-verify artifact check, and the wall-clock
//!   ceiling
//! - [`docker`]: the sandboxed executor backend driving the docker CLI

pub mod dispatcher;
pub mod docker;

pub use dispatcher::{
    DeepPassDispatcher, DeepPassOutcome, PlanExecutor, PlanTaskSpec, TaskHandle, TaskPoll,
    TaskState,
};
pub use docker::DockerPlanExecutor;
