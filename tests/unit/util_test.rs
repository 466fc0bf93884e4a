//! Tests for utility functions

use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use prometheus_orchestrator::util::{
    saturating_add, secs, to_time_delta, Clock, ManualClock, SystemClock,
};

#[test]
fn test_manual_clock_advances_only_when_told() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    assert_eq!(clock.now(), start);
    assert_eq!(clock.now(), start);

    clock.advance(Duration::from_secs(90));
    assert_eq!(clock.now(), start + TimeDelta::seconds(90));

    let later = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    clock.set(later);
    assert_eq!(clock.now(), later);
}

#[test]
fn test_system_clock_moves_forward() {
    let clock = SystemClock;
    let a = clock.now();
    let b = clock.now();
    assert!(b >= a);
}

#[test]
fn test_to_time_delta_saturates() {
    assert_eq!(to_time_delta(Duration::from_millis(1500)), TimeDelta::milliseconds(1500));
    assert_eq!(to_time_delta(Duration::MAX), TimeDelta::MAX);
}

#[test]
fn test_secs() {
    assert_eq!(secs(60), TimeDelta::minutes(1));
    assert_eq!(secs(0), TimeDelta::zero());
}

#[test]
fn test_manual_clock_saturates_at_end_of_time() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    clock.advance(Duration::MAX);
    assert_eq!(clock.now(), DateTime::<Utc>::MAX_UTC);
    clock.advance(Duration::from_secs(1));
    assert_eq!(clock.now(), DateTime::<Utc>::MAX_UTC);
}

#[test]
fn test_saturating_add() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(saturating_add(start, secs(60)), start + TimeDelta::minutes(1));
    assert_eq!(saturating_add(DateTime::<Utc>::MAX_UTC, secs(1)), DateTime::<Utc>::MAX_UTC);
    assert_eq!(
        saturating_add(DateTime::<Utc>::MIN_UTC, -secs(1)),
        DateTime::<Utc>::MIN_UTC
    );
}
