//! Postgres `LISTEN`/`NOTIFY` transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::error::{Result, SchedulerError};
use crate::core::events::NotificationTransport;

const RECONNECT_START: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Publishes with `pg_notify` and relays `LISTEN` notifications.
pub struct PgNotifyTransport {
    pool: PgPool,
    channel: String,
    max_payload_bytes: usize,
    relay: broadcast::Sender<String>,
    connected: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PgNotifyTransport {
    /// Start listening on `channel`. Fails if the first connection cannot be
    /// established; later disconnects are retried with backoff.
    pub async fn connect(
        pool: PgPool,
        channel: &str,
        max_payload_bytes: usize,
    ) -> Result<Arc<Self>> {
        if channel.is_empty()
            || !channel
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(SchedulerError::Config(format!(
                "invalid notification channel `{channel}`"
            )));
        }
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(channel).await?;
        info!(channel, "listening for task events");

        let (relay, _) = broadcast::channel(1024);
        let connected = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(relay_notifications(
            listener,
            relay.clone(),
            Arc::clone(&connected),
        ));
        Ok(Arc::new(Self {
            pool,
            channel: channel.to_owned(),
            max_payload_bytes,
            relay,
            connected,
            listener: Mutex::new(Some(handle)),
        }))
    }

    /// Stop listening.
    pub fn close(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::Release);
    }
}

async fn relay_notifications(
    mut listener: PgListener,
    relay: broadcast::Sender<String>,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = RECONNECT_START;
    loop {
        match listener.try_recv().await {
            Ok(Some(notification)) => {
                connected.store(true, Ordering::Release);
                backoff = RECONNECT_START;
                let _ = relay.send(notification.payload().to_owned());
            }
            Ok(None) => {
                connected.store(false, Ordering::Release);
                warn!("notification connection lost, reconnecting");
            }
            Err(e) => {
                connected.store(false, Ordering::Release);
                error!(error = %e, retry_in_ms = backoff.as_millis(), "notification listener failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 3).min(RECONNECT_MAX);
            }
        }
    }
}

#[async_trait]
impl NotificationTransport for PgNotifyTransport {
    async fn notify(&self, payload: &str) -> Result<()> {
        if payload.len() > self.max_payload_bytes {
            return Err(SchedulerError::Backend(format!(
                "payload too large: {} bytes (max: {})",
                payload.len(),
                self.max_payload_bytes
            )));
        }
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        debug!(channel = %self.channel, size = payload.len(), "notified");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.relay.subscribe()
    }

    fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Drop for PgNotifyTransport {
    fn drop(&mut self) {
        self.close();
    }
}
