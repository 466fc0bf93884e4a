//! Group concurrency accounting shared by the store backends.

/// How many tasks a dequeue may claim.
///
/// A ceiling of 0 means the group is unlimited and only `limit` applies.
#[must_use]
pub fn available_slots(ceiling: u32, started: usize, limit: usize) -> usize {
    if ceiling == 0 {
        return limit;
    }
    let free = (ceiling as usize).saturating_sub(started);
    free.min(limit)
}

/// Advisory lock key used to serialize dequeuers of one group.
#[must_use]
pub fn group_lock_name(group_key: &str) -> String {
    format!("orchestrator:dequeue:{group_key}")
}
