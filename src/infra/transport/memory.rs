//! In-process notification hub.
//!
//! Every handle produced by [`InMemoryTransport::attach`] behaves like a
//! separate process listening on the same database channel, which is how
//! cross-process delivery is exercised without a database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::core::error::{Result, SchedulerError};
use crate::core::events::NotificationTransport;

/// Largest payload accepted by Postgres `NOTIFY`.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 8_000;

/// Broadcast hub shared by every attached handle.
pub struct InMemoryTransport {
    hub: broadcast::Sender<String>,
    max_payload_bytes: usize,
    connected: AtomicBool,
}

impl InMemoryTransport {
    /// New hub with a single handle.
    #[must_use]
    pub fn new(max_payload_bytes: usize) -> Arc<Self> {
        let (hub, _) = broadcast::channel(1024);
        Arc::new(Self {
            hub,
            max_payload_bytes,
            connected: AtomicBool::new(true),
        })
    }

    /// Another handle on the same hub, as a second process would have.
    #[must_use]
    pub fn attach(&self) -> Arc<Self> {
        Arc::new(Self {
            hub: self.hub.clone(),
            max_payload_bytes: self.max_payload_bytes,
            connected: AtomicBool::new(true),
        })
    }

    /// Simulate losing or regaining the connection of this handle.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

#[async_trait]
impl NotificationTransport for InMemoryTransport {
    async fn notify(&self, payload: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(SchedulerError::Backend("transport disconnected".into()));
        }
        if payload.len() > self.max_payload_bytes {
            return Err(SchedulerError::Backend(format!(
                "payload too large: {} bytes (max: {})",
                payload.len(),
                self.max_payload_bytes
            )));
        }
        // nobody listening is not an error
        let _ = self.hub.send(payload.to_owned());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.hub.subscribe()
    }

    fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
