//! Configuration models for the orchestrator and its workers.

pub mod orchestrator;

pub use orchestrator::*;
