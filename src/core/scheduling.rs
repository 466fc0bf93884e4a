//! Scheduling worker: turns due schedules into tasks.
//!
//! Every process runs one. The store's advisory lock makes sure only one of
//! them materializes tasks at any instant; the others see
//! [`SchedulingTick::LockNotGranted`] and back off.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::core::error::Result;
use crate::core::events::{EventBus, TaskEvent};
use crate::core::store::{SchedulingTick, Store};
use crate::util::clock::Clock;

/// Periodic schedule materializer.
pub struct SchedulingWorker {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    lock_backoff: Duration,
}

impl SchedulingWorker {
    /// Create a worker ticking every `interval`, sleeping an extra
    /// `lock_backoff` whenever another process holds the lock.
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        lock_backoff: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            interval,
            lock_backoff,
        }
    }

    /// Run one tick and publish a `created` event for each new task.
    pub async fn tick(&self) -> Result<SchedulingTick> {
        let outcome = self
            .store
            .materialize_due_schedules(self.clock.now())
            .await?;
        if let SchedulingTick::Completed { created, failures } = &outcome {
            for failure in failures {
                warn!(
                    schedule_id = %failure.schedule_id,
                    schedule = %failure.schedule_name,
                    error = %failure.error,
                    "failed to materialize schedule"
                );
            }
            if !created.is_empty() {
                info!(count = created.len(), "materialized due schedules");
            }
            for task in created {
                self.bus.publish(TaskEvent::from_task(task)).await;
            }
        }
        Ok(outcome)
    }

    /// Tick until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let pause = match self.tick().await {
                Ok(SchedulingTick::LockNotGranted) => {
                    debug!("scheduling lock held elsewhere, backing off");
                    self.interval + self.lock_backoff
                }
                Ok(SchedulingTick::Completed { .. }) => self.interval,
                Err(e) => {
                    error!(error = %e, "scheduling tick failed");
                    self.interval
                }
            };
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("scheduling worker stopped");
    }
}
