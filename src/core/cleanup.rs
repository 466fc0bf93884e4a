//! Retention: hard-deletes old terminated tasks and soft-deleted schedules.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::core::error::Result;
use crate::core::store::{CleanupReport, Store};
use crate::util::clock::Clock;

/// Periodic retention pass.
pub struct CleanupWorker {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    task_retention: TimeDelta,
    schedule_retention: TimeDelta,
    batch_size: usize,
}

impl CleanupWorker {
    /// Create a worker keeping tasks for `task_retention_days` and deleted
    /// schedules for `schedule_retention_days`.
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        task_retention_days: u32,
        schedule_retention_days: u32,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            clock,
            interval,
            task_retention: TimeDelta::days(i64::from(task_retention_days)),
            schedule_retention: TimeDelta::days(i64::from(schedule_retention_days)),
            batch_size,
        }
    }

    /// Run one pass.
    pub async fn tick(&self) -> Result<CleanupReport> {
        let now = self.clock.now();
        let report = self
            .store
            .cleanup(
                now - self.task_retention,
                now - self.schedule_retention,
                self.batch_size,
            )
            .await?;
        if report != CleanupReport::default() {
            info!(
                tasks = report.tasks_deleted,
                schedules = report.schedules_deleted,
                "cleanup removed rows"
            );
        }
        Ok(report)
    }

    /// Clean until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "cleanup failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("cleanup worker stopped");
    }
}
