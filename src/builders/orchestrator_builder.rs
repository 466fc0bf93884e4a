//! Builder wiring a store, a transport and configuration into an orchestrator
//! and its daemons.

use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::core::{
    CleanupWorker, EventBus, NotificationTransport, Orchestrator, RetryEngine, SchedulerError,
    SchedulingWorker, Store, TimeoutMonitor,
};
use crate::runtime::{Daemons, OrchestratorRuntime};
use crate::util::clock::{Clock, SystemClock};

/// Assembles an [`Orchestrator`] from its parts.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn Store>>,
    transport: Option<Arc<dyn NotificationTransport>>,
    clock: Option<Arc<dyn Clock>>,
}

/// Output of [`OrchestratorBuilder::build`]: the façade plus daemons not yet
/// running.
pub struct BuiltOrchestrator {
    /// Client façade.
    pub orchestrator: Arc<Orchestrator>,
    /// Background workers.
    pub daemons: Daemons,
}

impl BuiltOrchestrator {
    /// Start the daemons and the event bus listener.
    #[must_use]
    pub fn start(self) -> (Arc<Orchestrator>, OrchestratorRuntime) {
        let bus = Arc::clone(self.orchestrator.bus());
        let runtime = OrchestratorRuntime::start(bus, self.daemons);
        (self.orchestrator, runtime)
    }
}

impl OrchestratorBuilder {
    /// Builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` for every component.
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist through `store`. Required.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Fan events out across processes. Without one the bus is local only.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn NotificationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Read time from `clock` instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and assemble every component.
    pub fn build(self) -> Result<BuiltOrchestrator, SchedulerError> {
        let cfg = self.config;
        cfg.validate()
            .map_err(|e| SchedulerError::Config(format!("config invalid: {e}")))?;
        let store = self
            .store
            .ok_or_else(|| SchedulerError::Config("a store is required".into()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let bus = match self.transport {
            Some(transport) => EventBus::with_transport(cfg.event_bus(), transport),
            None => EventBus::local(cfg.event_bus()),
        };
        let retry = RetryEngine::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&clock),
            cfg.retry_policy(),
        );

        let scheduling = Arc::new(SchedulingWorker::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&clock),
            cfg.scheduling_interval(),
            cfg.lock_backoff(),
        ));
        let timeouts = Arc::new(TimeoutMonitor::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            retry.clone(),
            Arc::clone(&clock),
            cfg.timeout_interval(),
        ));
        let cleanup = cfg.cleanup.enabled.then(|| {
            Arc::new(CleanupWorker::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                cfg.cleanup_interval(),
                cfg.cleanup.task_retention_days,
                cfg.cleanup.schedule_retention_days,
                cfg.cleanup.batch_size,
            ))
        });

        let orchestrator = Arc::new(Orchestrator::new(
            store,
            bus,
            retry,
            clock,
            cfg.execute_settings(),
        ));
        Ok(BuiltOrchestrator {
            orchestrator,
            daemons: Daemons {
                scheduling,
                timeouts,
                cleanup,
            },
        })
    }
}
