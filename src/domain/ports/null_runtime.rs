//! Null collaborators for running the engine without attached runtimes.
//!
//! A bare `synapse-engine run` has no agent or tool service wired in;
//! tasks dispatched against these fail cleanly with `RESOURCE_UNAVAILABLE`
//! instead of wedging the queue. Deployments inject real clients through
//! the library API.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{AgentResult, FailureDetails, FailureKind, JsonMap, ToolResult};
use crate::domain::ports::{
    AgentCapability, AgentInvocation, AgentRuntime, CapabilityRegistry, ToolRuntime,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct NullAgentRuntime;

#[async_trait]
impl AgentRuntime for NullAgentRuntime {
    async fn invoke(&self, invocation: AgentInvocation) -> DomainResult<AgentResult> {
        Ok(AgentResult::Failure {
            details: FailureDetails::new(
                FailureKind::ResourceUnavailable,
                format!(
                    "no agent runtime attached for agent '{}'",
                    invocation.agent_id
                ),
            ),
            thought: None,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullToolRuntime;

#[async_trait]
impl ToolRuntime for NullToolRuntime {
    async fn invoke(&self, tool_id: &str, _arguments: &JsonMap) -> DomainResult<ToolResult> {
        Ok(ToolResult::failure(
            "RESOURCE_UNAVAILABLE",
            format!("no tool runtime attached for tool '{tool_id}'"),
        ))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullCapabilityRegistry;

#[async_trait]
impl CapabilityRegistry for NullCapabilityRegistry {
    async fn get_agent(&self, _agent_id: &str) -> DomainResult<Option<AgentCapability>> {
        Ok(None)
    }
}
