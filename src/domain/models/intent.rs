//! Agent intents and collaborator results.
//!
//! The agent runtime answers every invocation with an [`AgentResult`]: a
//! declarative intent on success, or structured failure details. The engine
//! interprets the intent in one transaction; it never inspects agent
//! reasoning beyond the optional `thought`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::models::blueprint::PlanBlueprint;
use crate::domain::models::task::JsonMap;

/// Declarative next action produced by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Intent {
    /// Task is done; `content` becomes the task result.
    FinalAnswer { content: Value },
    /// Invoke a tool and re-enter with its output merged into context.
    ToolCallRequest { tool_id: String, arguments: JsonMap },
    /// Splice a new subgraph into the workflow.
    Plan(PlanBlueprint),
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentResult {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
        intent: Intent,
    },
    Failure {
        details: FailureDetails,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
    },
}

/// Failure taxonomy persisted as `result.failure_details.type`.
///
/// Downstream edges can route on these via conditions over
/// `result.failure_details`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    LlmRefusal,
    ToolExecutionFailed,
    ValidationError,
    ResourceUnavailable,
    Timeout,
    AgentExecutionError,
    UnknownAssignee,
    PlannerRoleViolation,
    BlueprintUnresolvedRef,
    BlueprintCycle,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmRefusal => "LLM_REFUSAL",
            Self::ToolExecutionFailed => "TOOL_EXECUTION_FAILED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::AgentExecutionError => "AGENT_EXECUTION_ERROR",
            Self::UnknownAssignee => "UNKNOWN_ASSIGNEE",
            Self::PlannerRoleViolation => "PLANNER_ROLE_VIOLATION",
            Self::BlueprintUnresolvedRef => "BLUEPRINT_UNRESOLVED_REF",
            Self::BlueprintCycle => "BLUEPRINT_CYCLE",
        }
    }
}

/// Typed failure payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetails {
    #[serde(rename = "type")]
    pub kind: FailureKind,
    pub message: String,
}

impl FailureDetails {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The `{type, message}` object stored under `result.failure_details`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::String(self.kind.as_str().into()));
        map.insert("message".to_string(), Value::String(self.message.clone()));
        Value::Object(map)
    }
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolStatus {
    Success,
    Failure,
}

impl ToolResult {
    pub fn success(output: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            output: Some(output),
            error_type: None,
            error_message: None,
        }
    }

    pub fn failure(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Failure,
            output: None,
            error_type: Some(error_type.into()),
            error_message: Some(error_message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// The object merged under `result.last_tool_result` on re-entry.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Coerce an intent payload into the `result` map shape. Objects are stored
/// as-is; scalars and arrays are wrapped under a single key.
pub fn result_map_from(content: Value, wrap_key: &str) -> JsonMap {
    match content {
        Value::Object(map) => map,
        other => {
            let mut map = JsonMap::new();
            map.insert(wrap_key.to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_details_wire_shape() {
        let details = FailureDetails::new(FailureKind::PlannerRoleViolation, "not a planner");
        let value = details.to_value();
        assert_eq!(value["type"], "PLANNER_ROLE_VIOLATION");
        assert_eq!(value["message"], "not a planner");
    }

    #[test]
    fn test_intent_tagging() {
        let intent = Intent::ToolCallRequest {
            tool_id: "search_weather".to_string(),
            arguments: result_map_from(json!({"city": "Beijing"}), "value"),
        };
        let value = serde_json::to_value(&intent).unwrap();
        assert_eq!(value["kind"], "tool_call_request");
        assert_eq!(value["tool_id"], "search_weather");
    }

    #[test]
    fn test_result_map_wraps_scalars() {
        let map = result_map_from(json!("It is 25°C in Beijing"), "content");
        assert_eq!(map["content"], json!("It is 25°C in Beijing"));

        let map = result_map_from(json!({"echo": "hi"}), "content");
        assert_eq!(map["echo"], json!("hi"));
    }

    #[test]
    fn test_tool_result_round_trip() {
        let result = ToolResult::success(json!({"temperature": 25}));
        let value = result.to_value();
        assert_eq!(value["status"], "SUCCESS");
        assert_eq!(value["output"]["temperature"], 25);

        let failed = ToolResult::failure("HTTP_ERROR", "503 from upstream");
        assert!(!failed.is_success());
        assert_eq!(failed.to_value()["error_type"], "HTTP_ERROR");
    }
}
