//! PostgreSQL persistence adapter.

pub mod gateway;

pub use gateway::PgPersistenceGateway;
