//! Process runtime: daemon supervision and shutdown.

pub mod daemons;

pub use daemons::{Daemons, OrchestratorRuntime};
