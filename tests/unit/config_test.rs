//! Tests for configuration validation

use std::time::Duration;

use prometheus_orchestrator::config::OrchestratorConfig;

#[test]
fn test_default_config_is_valid() {
    let cfg = OrchestratorConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.events.max_payload_bytes, 8_000);
    assert_eq!(cfg.events.debounce_window_ms, 100);
    assert!(!cfg.retry.retry_expired);
}

#[test]
fn test_zero_scheduling_tick_rejected() {
    let mut cfg = OrchestratorConfig::default();
    cfg.scheduling.tick_interval_ms = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_invalid_channel_rejected() {
    let mut cfg = OrchestratorConfig::default();
    cfg.events.channel = "task-events; DROP".into();
    assert!(cfg.validate().is_err());
    cfg.events.channel = String::new();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_retry_bounds_rejected() {
    let mut cfg = OrchestratorConfig::default();
    cfg.retry.multiplier = 0.5;
    assert!(cfg.validate().is_err());

    let mut cfg = OrchestratorConfig::default();
    cfg.retry.base_delay_ms = 10_000;
    cfg.retry.max_delay_ms = 1_000;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_disabled_cleanup_skips_its_checks() {
    let mut cfg = OrchestratorConfig::default();
    cfg.cleanup.enabled = false;
    cfg.cleanup.batch_size = 0;
    assert!(cfg.validate().is_ok());
    cfg.cleanup.enabled = true;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_from_json_str_fills_defaults() {
    let json = r#"{
        "scheduling": { "tick_interval_ms": 250 },
        "retry": { "retry_expired": true, "base_delay_ms": 500 },
        "database": { "url": "postgres://localhost/orchestrator" },
        "logging": { "json": true }
    }"#;
    let cfg = OrchestratorConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.scheduling.tick_interval_ms, 250);
    assert_eq!(cfg.scheduling.lock_backoff_ms, 1_000);
    assert!(cfg.retry.retry_expired);
    assert_eq!(
        cfg.database.url.as_deref(),
        Some("postgres://localhost/orchestrator")
    );
    assert_eq!(cfg.events.channel, "orchestrator_task_events");
    assert!(cfg.logging.json);
    assert!(!OrchestratorConfig::default().logging.json);
}

#[test]
fn test_from_json_str_rejects_invalid() {
    assert!(OrchestratorConfig::from_json_str("{ not json").is_err());
    assert!(OrchestratorConfig::from_json_str(r#"{"execute": {"poll_interval_ms": 0}}"#).is_err());
}

#[test]
fn test_section_conversions() {
    let mut cfg = OrchestratorConfig::default();
    cfg.retry.base_delay_ms = 200;
    cfg.execute.poll_interval_ms = 50;
    cfg.events.debounce_window_ms = 0;

    let policy = cfg.retry_policy();
    assert_eq!(policy.base_delay, Duration::from_millis(200));
    assert_eq!(policy.delay_for(1), Duration::from_millis(200));

    assert_eq!(cfg.execute_settings().poll_interval, Duration::from_millis(50));
    assert!(cfg.event_bus().debounce_window.is_zero());
    assert_eq!(cfg.scheduling_interval(), Duration::from_millis(100));
}
