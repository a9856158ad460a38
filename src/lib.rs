//! Synapse graph engine: the event-driven workflow orchestrator of the
//! Synapse agent platform.
//!
//! Tasks form a directed graph per workflow. The engine dequeues task ids
//! from a broker queue fed by the store's change notifications, advances
//! each task under a row lock and version CAS, interprets agent intents,
//! and propagates conditions and data flow along edges. The store is the
//! single source of truth; everything else is replayable.

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod logging;
pub mod services;

pub use domain::models::EngineConfig;
pub use domain::{DomainError, DomainResult};
