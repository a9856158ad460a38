//! Tool runtime port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{JsonMap, ToolResult};

/// External deterministic tool runtime. Tools should be idempotent on their
/// input: fan-in targets may be dispatched once per edge contribution.
#[async_trait]
pub trait ToolRuntime: Send + Sync {
    async fn invoke(&self, tool_id: &str, arguments: &JsonMap) -> DomainResult<ToolResult>;
}
