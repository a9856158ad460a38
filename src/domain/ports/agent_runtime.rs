//! Agent runtime port.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{AgentResult, JsonMap};

/// Everything an agent invocation sees. `accumulated_context` is the task's
/// current `result` map, which carries `last_tool_result` entries across
/// re-entry hops.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub task_id: Uuid,
    pub agent_id: String,
    pub input_data: JsonMap,
    pub accumulated_context: JsonMap,
    pub directives: Option<Value>,
}

/// External agent execution runtime. Must be side-effect-free with respect
/// to the store; the engine interprets the returned intent itself.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn invoke(&self, invocation: AgentInvocation) -> DomainResult<AgentResult>;
}
