//! Edge domain model.
//!
//! Edges connect tasks within a workflow and are immutable once created.
//! A condition gates activation; a data-flow mapping projects the source
//! result into the target input.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Expression dialect of an edge condition. Only the CEL-like subset is
/// supported; anything else renders the edge inactive.
///
/// Unrecognized tags deserialize to `Unknown` so one edge with a future or
/// malformed evaluator is skipped at evaluation time instead of failing the
/// whole edge list of its source task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum Evaluator {
    #[serde(rename = "CEL")]
    Cel,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl From<String> for Evaluator {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "CEL" => Self::Cel,
            _ => Self::Unknown,
        }
    }
}

/// Boolean expression gating an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub evaluator: Evaluator,
    pub expression: String,
}

impl Condition {
    pub fn cel(expression: impl Into<String>) -> Self {
        Self {
            evaluator: Evaluator::Cel,
            expression: expression.into(),
        }
    }
}

/// Projection of a completed task's `{result, input}` context into the
/// target task's input. Keys are dot paths into the target input; values are
/// expressions over the source context. A `BTreeMap` keeps application
/// order independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFlow {
    pub mappings: BTreeMap<String, String>,
}

impl DataFlow {
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// A directed edge between two tasks of the same workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub source_task_id: Uuid,
    pub target_task_id: Uuid,
    pub condition: Option<Condition>,
    pub data_flow: Option<DataFlow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_wire_format() {
        let condition = Condition::cel("result.score >= 60");
        let value = serde_json::to_value(&condition).unwrap();
        assert_eq!(value["evaluator"], "CEL");
        assert_eq!(value["expression"], "result.score >= 60");
    }

    #[test]
    fn test_unknown_evaluator_deserializes_permissively() {
        let condition: Condition = serde_json::from_value(serde_json::json!({
            "evaluator": "JSONPATH",
            "expression": "$.result.score",
        }))
        .unwrap();
        assert_eq!(condition.evaluator, Evaluator::Unknown);
        assert_eq!(condition.expression, "$.result.score");
    }

    #[test]
    fn test_data_flow_orders_mappings_by_key() {
        let json = serde_json::json!({
            "mappings": {"z.last": "result.b", "a.first": "result.a"}
        });
        let flow: DataFlow = serde_json::from_value(json).unwrap();
        let keys: Vec<_> = flow.mappings.keys().collect();
        assert_eq!(keys, vec!["a.first", "z.last"]);
    }
}
