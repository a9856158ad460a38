//! Capability registry port: agent roles and metadata.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainResult;

/// Role of an agent, gating which intents it may emit. Only planners may
/// return a plan blueprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    Planner,
    Worker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapability {
    pub role: AgentRole,
}

/// External registry of agent capabilities.
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    async fn get_agent(&self, agent_id: &str) -> DomainResult<Option<AgentCapability>>;
}
