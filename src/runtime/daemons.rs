//! Background worker lifecycle: the scheduling worker, the timeout monitor
//! and the optional cleanup worker share one shutdown signal.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::core::{CleanupWorker, EventBus, SchedulingWorker, TimeoutMonitor};

/// Workers that run for the lifetime of a process.
pub struct Daemons {
    /// Materializes due schedules.
    pub scheduling: Arc<SchedulingWorker>,
    /// Expires tasks past a deadline.
    pub timeouts: Arc<TimeoutMonitor>,
    /// Removes old rows; `None` when retention is disabled.
    pub cleanup: Option<Arc<CleanupWorker>>,
}

/// Handle over running daemons and the event bus listener.
pub struct OrchestratorRuntime {
    shutdown: watch::Sender<bool>,
    workers: JoinSet<()>,
    bus: Arc<EventBus>,
}

impl OrchestratorRuntime {
    /// Start the bus listener and spawn every daemon. Must be called inside a
    /// tokio runtime.
    #[must_use]
    pub fn start(bus: Arc<EventBus>, daemons: Daemons) -> Self {
        bus.start();
        let (shutdown, rx) = watch::channel(false);
        let mut workers = JoinSet::new();
        workers.spawn(Arc::clone(&daemons.scheduling).run(rx.clone()));
        workers.spawn(Arc::clone(&daemons.timeouts).run(rx.clone()));
        if let Some(cleanup) = &daemons.cleanup {
            workers.spawn(Arc::clone(cleanup).run(rx));
        }
        info!(workers = workers.len(), "orchestrator runtime started");
        Self {
            shutdown,
            workers,
            bus,
        }
    }

    /// Number of daemons still running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.workers.len()
    }

    /// Signal every daemon, wait for them to finish their current tick, then
    /// stop the event bus.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "daemon ended abnormally");
            }
        }
        self.bus.shutdown();
        info!("orchestrator runtime stopped");
    }
}
