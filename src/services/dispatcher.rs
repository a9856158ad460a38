//! Dispatcher: the blocking worker loop over the broker queue.
//!
//! Each worker pops task ids, opens a span (adopting any propagated trace
//! context), and hands off to the task processor. Per-task faults never
//! crash the worker: recoverable contention is logged at debug, everything
//! else at error, and the loop continues. Redelivery and row locks make the
//! duplicates harmless.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::domain::models::QueueMessage;
use crate::domain::ports::BrokerQueue;
use crate::services::task_processor::TaskProcessor;

pub struct Dispatcher {
    broker: Arc<dyn BrokerQueue>,
    processor: Arc<TaskProcessor>,
    queue: String,
    pop_timeout: Duration,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn BrokerQueue>,
        processor: Arc<TaskProcessor>,
        queue: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            broker,
            processor,
            queue: queue.into(),
            pop_timeout: Duration::from_secs(5),
            shutdown,
        }
    }

    /// Run until the shutdown token fires. The in-flight task always runs to
    /// completion; cancellation is only observed between pops.
    pub async fn run(&self, worker_id: usize) {
        info!(worker_id, queue = %self.queue, "dispatcher started");

        loop {
            let popped = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                popped = self.broker.pop(&self.queue, self.pop_timeout) => popped,
            };

            match popped {
                Ok(None) => continue,
                Ok(Some(payload)) => self.dispatch(&payload).await,
                Err(err) => {
                    warn!(worker_id, error = %err, "broker pop failed; backing off");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id, "dispatcher stopped");
    }

    async fn dispatch(&self, payload: &str) {
        let message = match QueueMessage::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(payload, error = %err, "discarding malformed queue payload");
                return;
            }
        };

        let span = info_span!(
            "process_task",
            task_id = %message.task_id,
            traceparent = message.traceparent.as_deref().unwrap_or(""),
        );

        match self
            .processor
            .process(message.task_id)
            .instrument(span)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_contention() => {
                debug!(task_id = %message.task_id, error = %err, "contention; dropped in favor of redelivery");
            }
            Err(err) if err.is_transient() => {
                debug!(task_id = %message.task_id, error = %err, "transient store error; awaiting redelivery");
            }
            Err(err) => {
                error!(task_id = %message.task_id, error = %err, "task processing failed");
            }
        }
    }
}
