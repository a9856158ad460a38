//! Notification bridge: store change feed → broker queue.
//!
//! Listens on the `task_created` and `task_updated` channels and republishes
//! each task id onto the broker. At-least-once: a received event is never
//! dropped — the push retries with capped backoff until it lands or the
//! configured outage horizon elapses, at which point the bridge terminates
//! so a supervisor can restart it. No deduplication is attempted; the
//! processor's lock and CAS absorb duplicates.

use sqlx::postgres::PgListener;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ChangeNotification, QueueMessage, CHANNEL_TASK_CREATED, CHANNEL_TASK_UPDATED,
};
use crate::domain::ports::BrokerQueue;
use crate::services::retry::RetryPolicy;

pub struct NotifyBridge {
    store_dsn: String,
    broker: Arc<dyn BrokerQueue>,
    queue: String,
    retry: RetryPolicy,
    horizon: Duration,
    shutdown: CancellationToken,
}

impl NotifyBridge {
    pub fn new(
        store_dsn: impl Into<String>,
        broker: Arc<dyn BrokerQueue>,
        queue: impl Into<String>,
        retry: RetryPolicy,
        horizon: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store_dsn: store_dsn.into(),
            broker,
            queue: queue.into(),
            retry,
            horizon,
            shutdown,
        }
    }

    /// Run until shutdown or a broker outage longer than the horizon.
    ///
    /// Store connection loss is retried with backoff indefinitely: missing
    /// the change feed only delays work, while silently dropping received
    /// events would lose it.
    pub async fn run(&self) -> DomainResult<()> {
        info!(queue = %self.queue, "notification bridge starting");

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let mut listener = match self.connect().await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!(error = %err, "store listener connect failed; backing off");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = sleep(self.retry.backoff(2)) => continue,
                    }
                }
            };
            info!("listening for task change notifications");

            loop {
                let notification = tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    received = listener.recv() => received,
                };

                match notification {
                    Ok(event) => {
                        let parsed =
                            ChangeNotification::parse(event.channel(), event.payload());
                        match parsed {
                            Ok(change) => self.publish(change).await?,
                            Err(err) => {
                                warn!(
                                    channel = event.channel(),
                                    error = %err,
                                    "discarding malformed notification payload"
                                );
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "change feed dropped; reconnecting");
                        break;
                    }
                }
            }
        }
    }

    async fn connect(&self) -> DomainResult<PgListener> {
        let mut listener = PgListener::connect(&self.store_dsn).await?;
        listener
            .listen_all([CHANNEL_TASK_CREATED, CHANNEL_TASK_UPDATED])
            .await?;
        Ok(listener)
    }

    /// Push one task id onto the broker, retrying until it is durably
    /// enqueued. Gives up — fatally — once the outage horizon elapses.
    async fn publish(&self, change: ChangeNotification) -> DomainResult<()> {
        let payload = QueueMessage::new(change.task_id()).encode();
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match self.broker.push(&self.queue, &payload).await {
                Ok(()) => {
                    debug!(task_id = %change.task_id(), "task id enqueued");
                    return Ok(());
                }
                Err(err) if started.elapsed() >= self.horizon => {
                    error!(
                        error = %err,
                        horizon_secs = self.horizon.as_secs(),
                        "broker unavailable beyond horizon; terminating bridge"
                    );
                    return Err(DomainError::Broker(format!(
                        "broker unavailable for {}s: {err}",
                        self.horizon.as_secs()
                    )));
                }
                Err(err) => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(error = %err, ?backoff, "broker push failed; retrying");
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            // Shutting down with an unpublished event: surface
                            // it so the supervisor knows the feed is behind.
                            return Err(DomainError::Broker(
                                "shutdown with unpublished notification".to_string(),
                            ));
                        }
                        _ = sleep(backoff) => {}
                    }
                }
            }
        }
    }
}
