//! Broker queue port: a blocking-pop FIFO used to wake workers.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::errors::DomainResult;

/// The queue between the notification bridge and the dispatchers.
///
/// The broker is advisory: it may reorder or duplicate; the store's row lock
/// and version CAS are the arbiters of correctness.
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    /// Enqueue a payload. Returns only once the element is durably queued.
    async fn push(&self, queue: &str, payload: &str) -> DomainResult<()>;

    /// Blocking pop with a bounded timeout. `None` on timeout.
    async fn pop(&self, queue: &str, timeout: Duration) -> DomainResult<Option<String>>;
}
