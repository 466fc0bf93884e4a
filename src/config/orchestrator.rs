//! Orchestrator configuration structures.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::events::EventBusConfig;
use crate::core::orchestrator::ExecuteSettings;
use crate::core::retry::RetryPolicy;

/// Scheduling worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Milliseconds between ticks.
    pub tick_interval_ms: u64,
    /// Extra milliseconds to wait after losing the scheduling lock.
    pub lock_backoff_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            lock_backoff_ms: 1_000,
        }
    }
}

/// Timeout monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutMonitorConfig {
    /// Milliseconds between sweeps.
    pub tick_interval_ms: u64,
}

impl Default for TimeoutMonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Postgres notification channel.
    pub channel: String,
    /// Debounce window for `created` events; 0 disables debouncing.
    pub debounce_window_ms: u64,
    /// Largest payload sent through the transport.
    pub max_payload_bytes: usize,
    /// Buffer of each local subscription.
    pub local_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel: "orchestrator_task_events".into(),
            debounce_window_ms: 100,
            max_payload_bytes: 8_000,
            local_capacity: 256,
        }
    }
}

/// `execute` settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteConfig {
    /// Store re-read interval while waiting.
    pub poll_interval_ms: u64,
    /// Default wait when the caller supplies none.
    pub default_timeout_ms: u64,
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            default_timeout_ms: 300_000,
        }
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry expired tasks like failed ones.
    pub retry_expired: bool,
    /// First retry delay; 0 retries immediately.
    pub base_delay_ms: u64,
    /// Delay growth per attempt.
    pub multiplier: f64,
    /// Cap on any retry delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_expired: false,
            base_delay_ms: 0,
            multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

/// Retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Run the cleanup worker.
    pub enabled: bool,
    /// Milliseconds between passes.
    pub tick_interval_ms: u64,
    /// Days terminated tasks are kept.
    pub task_retention_days: u32,
    /// Days soft-deleted schedules are kept.
    pub schedule_retention_days: u32,
    /// Rows removed per table per pass.
    pub batch_size: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 60_000,
            task_retention_days: 5,
            schedule_retention_days: 30,
            batch_size: 1_000,
        }
    }
}

/// Database connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection string.
    pub url: Option<String>,
    /// Pool size.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One JSON object per line instead of human-readable text.
    pub json: bool,
}

/// Root orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Scheduling worker.
    pub scheduling: SchedulingConfig,
    /// Timeout monitor.
    pub timeouts: TimeoutMonitorConfig,
    /// Event bus.
    pub events: EventsConfig,
    /// `execute` waiting.
    pub execute: ExecuteConfig,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Retention.
    pub cleanup: CleanupConfig,
    /// Database.
    pub database: DatabaseConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    /// Validate all sections.
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduling.tick_interval_ms == 0 {
            return Err("scheduling.tick_interval_ms must be greater than 0".into());
        }
        if self.timeouts.tick_interval_ms == 0 {
            return Err("timeouts.tick_interval_ms must be greater than 0".into());
        }
        if self.events.channel.is_empty()
            || !self
                .events
                .channel
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err("events.channel must be a non-empty identifier".into());
        }
        if self.events.max_payload_bytes == 0 {
            return Err("events.max_payload_bytes must be greater than 0".into());
        }
        if self.events.local_capacity == 0 {
            return Err("events.local_capacity must be greater than 0".into());
        }
        if self.execute.poll_interval_ms == 0 {
            return Err("execute.poll_interval_ms must be greater than 0".into());
        }
        if self.execute.default_timeout_ms == 0 {
            return Err("execute.default_timeout_ms must be greater than 0".into());
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err("retry.multiplier must be at least 1.0".into());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err("retry.max_delay_ms must not be below retry.base_delay_ms".into());
        }
        if self.cleanup.enabled {
            if self.cleanup.tick_interval_ms == 0 {
                return Err("cleanup.tick_interval_ms must be greater than 0".into());
            }
            if self.cleanup.batch_size == 0 {
                return Err("cleanup.batch_size must be greater than 0".into());
            }
        }
        if self.database.max_connections == 0 {
            return Err("database.max_connections must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `ORCHESTRATOR_*` environment variables and
    /// `DATABASE_URL`, after loading a `.env` file if present.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        override_from_env(&mut cfg.scheduling.tick_interval_ms, "ORCHESTRATOR_SCHEDULING_TICK_MS")?;
        override_from_env(&mut cfg.scheduling.lock_backoff_ms, "ORCHESTRATOR_SCHEDULING_LOCK_BACKOFF_MS")?;
        override_from_env(&mut cfg.timeouts.tick_interval_ms, "ORCHESTRATOR_TIMEOUT_TICK_MS")?;
        override_from_env(&mut cfg.events.channel, "ORCHESTRATOR_EVENTS_CHANNEL")?;
        override_from_env(&mut cfg.events.debounce_window_ms, "ORCHESTRATOR_EVENTS_DEBOUNCE_MS")?;
        override_from_env(&mut cfg.events.max_payload_bytes, "ORCHESTRATOR_EVENTS_MAX_PAYLOAD_BYTES")?;
        override_from_env(&mut cfg.execute.poll_interval_ms, "ORCHESTRATOR_EXECUTE_POLL_MS")?;
        override_from_env(&mut cfg.execute.default_timeout_ms, "ORCHESTRATOR_EXECUTE_TIMEOUT_MS")?;
        override_from_env(&mut cfg.retry.retry_expired, "ORCHESTRATOR_RETRY_EXPIRED")?;
        override_from_env(&mut cfg.retry.base_delay_ms, "ORCHESTRATOR_RETRY_BASE_DELAY_MS")?;
        override_from_env(&mut cfg.cleanup.enabled, "ORCHESTRATOR_CLEANUP_ENABLED")?;
        override_from_env(&mut cfg.cleanup.task_retention_days, "ORCHESTRATOR_CLEANUP_TASK_RETENTION_DAYS")?;
        override_from_env(&mut cfg.cleanup.schedule_retention_days, "ORCHESTRATOR_CLEANUP_SCHEDULE_RETENTION_DAYS")?;
        override_from_env(&mut cfg.database.max_connections, "ORCHESTRATOR_DATABASE_MAX_CONNECTIONS")?;
        override_from_env(&mut cfg.logging.json, "ORCHESTRATOR_LOG_JSON")?;
        if let Ok(url) = env::var("DATABASE_URL") {
            cfg.database.url = Some(url);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Scheduling tick interval.
    #[must_use]
    pub const fn scheduling_interval(&self) -> Duration {
        Duration::from_millis(self.scheduling.tick_interval_ms)
    }

    /// Extra wait after losing the scheduling lock.
    #[must_use]
    pub const fn lock_backoff(&self) -> Duration {
        Duration::from_millis(self.scheduling.lock_backoff_ms)
    }

    /// Timeout sweep interval.
    #[must_use]
    pub const fn timeout_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.tick_interval_ms)
    }

    /// Cleanup interval.
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup.tick_interval_ms)
    }

    /// Event bus settings.
    #[must_use]
    pub const fn event_bus(&self) -> EventBusConfig {
        EventBusConfig {
            debounce_window: Duration::from_millis(self.events.debounce_window_ms),
            local_capacity: self.events.local_capacity,
        }
    }

    /// `execute` settings.
    #[must_use]
    pub const fn execute_settings(&self) -> ExecuteSettings {
        ExecuteSettings {
            poll_interval: Duration::from_millis(self.execute.poll_interval_ms),
            default_timeout: Duration::from_millis(self.execute.default_timeout_ms),
        }
    }

    /// Retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_expired: self.retry.retry_expired,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}

fn override_from_env<T: FromStr>(target: &mut T, key: &str) -> Result<(), String>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => {
            *target = raw
                .parse()
                .map_err(|e| format!("invalid value for {key}: {e}"))?;
            Ok(())
        }
        Err(_) => Ok(()),
    }
}
