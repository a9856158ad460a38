//! Ports: interfaces the engine core consumes, implemented by adapters and
//! external collaborators.

pub mod agent_runtime;
pub mod broker;
pub mod capability_registry;
pub mod gateway;
pub mod null_runtime;
pub mod tool_runtime;

pub use agent_runtime::{AgentInvocation, AgentRuntime};
pub use broker::BrokerQueue;
pub use capability_registry::{AgentCapability, AgentRole, CapabilityRegistry};
pub use gateway::{PersistenceGateway, StoreSession};
pub use null_runtime::{NullAgentRuntime, NullCapabilityRegistry, NullToolRuntime};
pub use tool_runtime::ToolRuntime;
