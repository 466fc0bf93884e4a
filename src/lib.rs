//! # Prometheus Orchestrator
//!
//! A distributed task scheduler for fleets of executor processes sharing one
//! Postgres database.
//!
//! Callers schedule one-off tasks or recurring schedules; executors dequeue
//! tasks of a group, report heartbeats and finally succeed or fail them. The
//! orchestrator keeps the rest consistent across processes:
//!
//! - **Task state machine**: `CREATED → STARTED → SUCCEEDED | FAILED |
//!   CANCELLED | EXPIRED`, with idempotent terminal transitions
//! - **Per-group concurrency**: a group never has more `STARTED` tasks than its
//!   ceiling, even with many concurrent dequeuers
//! - **Recurring schedules**: materialized into tasks by a single worker at a
//!   time under an advisory lock
//! - **Timeouts**: created→started, started→completed and heartbeat deadlines
//! - **Retries**: failed tasks are re-created under a shared retry key
//! - **Events**: in-process and cross-process notifications with debouncing
//!   of `created` bursts
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_orchestrator::builders::OrchestratorBuilder;
//! use prometheus_orchestrator::core::{ScheduleRequest, TaskProps};
//! use prometheus_orchestrator::infra::store::InMemoryStore;
//!
//! let built = OrchestratorBuilder::new()
//!     .store(Arc::new(InMemoryStore::new()))
//!     .build()?;
//! let (orchestrator, runtime) = built.start();
//!
//! orchestrator
//!     .schedule(ScheduleRequest::Immediate(TaskProps::new("resize", "images", payload)))
//!     .await?;
//! let claimed = orchestrator.dequeue("images", 10).await?;
//! orchestrator.succeed(claimed[0].id, serde_json::json!({"ok": true})).await?;
//!
//! runtime.shutdown().await;
//! ```
//!
//! For complete scenarios see `tests/orchestrator_test.rs` and
//! `tests/scheduling_test.rs`.

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core data model, state machine, engines and workers.
pub mod core;
/// Configuration models for workers, events and storage.
pub mod config;
/// Builders to construct orchestrator components from configuration.
pub mod builders;
/// Infrastructure adapters for storage and notification transports.
pub mod infra;
/// Daemon supervision and shutdown.
pub mod runtime;
/// Shared utilities.
pub mod util;
