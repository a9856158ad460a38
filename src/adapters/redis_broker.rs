//! Redis implementation of the broker queue.
//!
//! The bridge `LPUSH`es task ids; dispatchers `BRPOP` with a bounded
//! timeout. A `ConnectionManager` reconnects transparently on broken
//! connections, so transient outages surface as retryable broker errors.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use crate::domain::errors::DomainResult;
use crate::domain::ports::BrokerQueue;

#[derive(Clone)]
pub struct RedisBroker {
    connection: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> DomainResult<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl BrokerQueue for RedisBroker {
    async fn push(&self, queue: &str, payload: &str) -> DomainResult<()> {
        let mut connection = self.connection.clone();
        let _: i64 = connection.lpush(queue, payload).await?;
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> DomainResult<Option<String>> {
        let mut connection = self.connection.clone();
        // BRPOP returns (queue, element) or nil on timeout.
        let popped: Option<(String, String)> =
            connection.brpop(queue, timeout.as_secs_f64()).await?;
        Ok(popped.map(|(_, payload)| payload))
    }
}
