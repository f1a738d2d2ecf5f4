pub mod artifacts;
pub mod classify;
pub mod config;
pub mod deeppass;
pub mod digest;
pub mod errors;
pub mod fastpass;
pub mod models;
pub mod orchestrator;
pub mod reconcile;
pub mod report;
pub mod server;
pub mod store;
pub mod tools;
