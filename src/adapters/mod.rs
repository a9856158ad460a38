//! Infrastructure adapters for the store and the broker.

pub mod memory;
pub mod postgres;
pub mod redis_broker;

pub use memory::{InMemoryBroker, InMemoryGateway};
pub use postgres::PgPersistenceGateway;
pub use redis_broker::RedisBroker;
