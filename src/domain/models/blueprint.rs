//! Plan blueprints: atomically-applied deltas to the workflow graph.
//!
//! A planner agent emits a blueprint with *local* string ids; the gateway
//! assigns fresh uuids, rewrites edge references, and inserts everything in
//! one transaction. Validation happens before any row is written, so a bad
//! blueprint never leaves partial state behind.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::edge::{Condition, DataFlow};
use crate::domain::models::intent::{FailureDetails, FailureKind};
use crate::domain::models::task::{JsonMap, TaskStatus};

/// A task to be created, identified by a blueprint-local string id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    pub assignee: String,
    #[serde(default)]
    pub input_data: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directives: Option<serde_json::Value>,
}

/// An edge to be created. Endpoints name either a local task id from
/// `new_tasks` or an existing task's uuid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub source_task_id: String,
    pub target_task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_flow: Option<DataFlow>,
}

/// A CAS-checked amendment to an existing task, applied with the expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_input_data: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<TaskStatus>,
}

/// The graph delta a planner agent hands back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanBlueprint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub new_tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub new_edges: Vec<EdgeDefinition>,
    #[serde(default)]
    pub update_tasks: Vec<TaskUpdate>,
}

/// Result of a committed expansion: the local-id map plus the handle stored
/// in the planner task's result (`plan_id`).
#[derive(Debug, Clone, PartialEq)]
pub struct BlueprintCommit {
    pub id_map: BTreeMap<String, Uuid>,
    pub plan_handle: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlueprintError {
    #[error("Blueprint edge references unresolved id '{0}'")]
    UnresolvedRef(String),

    #[error("Blueprint task id '{0}' is defined more than once")]
    DuplicateLocalId(String),

    #[error("Blueprint contains a cycle through '{0}'")]
    Cycle(String),

    #[error("Blueprint creates no tasks, edges, or updates")]
    Empty,
}

impl BlueprintError {
    /// The failure taxonomy entry recorded on the source task.
    pub fn failure_details(&self) -> FailureDetails {
        let kind = match self {
            Self::UnresolvedRef(_) | Self::DuplicateLocalId(_) => {
                FailureKind::BlueprintUnresolvedRef
            }
            Self::Cycle(_) => FailureKind::BlueprintCycle,
            Self::Empty => FailureKind::ValidationError,
        };
        FailureDetails::new(kind, self.to_string())
    }
}

impl PlanBlueprint {
    /// Validate local-id uniqueness, edge reference resolvability, and
    /// acyclicity of the spliced subgraph. Must pass before any row is
    /// inserted; the gateway calls this again inside the transaction.
    pub fn validate(&self) -> Result<(), BlueprintError> {
        if self.new_tasks.is_empty() && self.new_edges.is_empty() && self.update_tasks.is_empty() {
            return Err(BlueprintError::Empty);
        }

        let mut local_ids = HashSet::new();
        for task in &self.new_tasks {
            if !local_ids.insert(task.task_id.as_str()) {
                return Err(BlueprintError::DuplicateLocalId(task.task_id.clone()));
            }
        }

        for task in &self.new_tasks {
            if let Some(parent) = &task.parent_task_id {
                Self::check_ref(parent, &local_ids)?;
            }
        }
        for edge in &self.new_edges {
            Self::check_ref(&edge.source_task_id, &local_ids)?;
            Self::check_ref(&edge.target_task_id, &local_ids)?;
        }

        self.check_acyclic()
    }

    /// Resolve an endpoint string against the local-id map, falling back to
    /// an existing-task uuid.
    pub fn resolve_ref(
        reference: &str,
        id_map: &BTreeMap<String, Uuid>,
    ) -> Result<Uuid, BlueprintError> {
        if let Some(id) = id_map.get(reference) {
            return Ok(*id);
        }
        Uuid::parse_str(reference)
            .map_err(|_| BlueprintError::UnresolvedRef(reference.to_string()))
    }

    fn check_ref(reference: &str, local_ids: &HashSet<&str>) -> Result<(), BlueprintError> {
        if local_ids.contains(reference) || Uuid::parse_str(reference).is_ok() {
            Ok(())
        } else {
            Err(BlueprintError::UnresolvedRef(reference.to_string()))
        }
    }

    /// Depth-first cycle detection over the blueprint's own edges. Re-entry
    /// loops are expressed as status flips on a single task, never as edges,
    /// so a cyclic blueprint is always a planner bug.
    fn check_acyclic(&self) -> Result<(), BlueprintError> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.new_edges {
            adjacency
                .entry(edge.source_task_id.as_str())
                .or_default()
                .push(edge.target_task_id.as_str());
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            node: &'a str,
            adjacency: &HashMap<&'a str, Vec<&'a str>>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), BlueprintError> {
            match marks.get(node) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(BlueprintError::Cycle(node.to_string())),
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            if let Some(next) = adjacency.get(node) {
                for target in next {
                    visit(target, adjacency, marks)?;
                }
            }
            marks.insert(node, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for node in adjacency.keys() {
            visit(node, &adjacency, &mut marks)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_def(id: &str) -> TaskDefinition {
        TaskDefinition {
            task_id: id.to_string(),
            parent_task_id: None,
            assignee: "Agent:Worker".to_string(),
            input_data: JsonMap::new(),
            directives: None,
        }
    }

    fn edge_def(source: &str, target: &str) -> EdgeDefinition {
        EdgeDefinition {
            source_task_id: source.to_string(),
            target_task_id: target.to_string(),
            condition: None,
            data_flow: None,
        }
    }

    #[test]
    fn test_valid_blueprint() {
        let blueprint = PlanBlueprint {
            workflow_id: None,
            new_tasks: vec![task_def("reader"), task_def("writer")],
            new_edges: vec![edge_def("reader", "writer")],
            update_tasks: vec![],
        };
        assert!(blueprint.validate().is_ok());
    }

    #[test]
    fn test_empty_blueprint_rejected() {
        assert_eq!(
            PlanBlueprint::default().validate(),
            Err(BlueprintError::Empty)
        );
    }

    #[test]
    fn test_duplicate_local_id_rejected() {
        let blueprint = PlanBlueprint {
            new_tasks: vec![task_def("step"), task_def("step")],
            ..Default::default()
        };
        assert_eq!(
            blueprint.validate(),
            Err(BlueprintError::DuplicateLocalId("step".to_string()))
        );
    }

    #[test]
    fn test_unresolved_edge_ref_rejected() {
        let blueprint = PlanBlueprint {
            new_tasks: vec![task_def("reader")],
            new_edges: vec![edge_def("reader", "nonexistent")],
            ..Default::default()
        };
        assert_eq!(
            blueprint.validate(),
            Err(BlueprintError::UnresolvedRef("nonexistent".to_string()))
        );
    }

    #[test]
    fn test_edge_to_existing_uuid_allowed() {
        let existing = Uuid::new_v4();
        let blueprint = PlanBlueprint {
            new_tasks: vec![task_def("reader")],
            new_edges: vec![edge_def("reader", &existing.to_string())],
            ..Default::default()
        };
        assert!(blueprint.validate().is_ok());
    }

    #[test]
    fn test_cycle_rejected() {
        let blueprint = PlanBlueprint {
            new_tasks: vec![task_def("a"), task_def("b"), task_def("c")],
            new_edges: vec![edge_def("a", "b"), edge_def("b", "c"), edge_def("c", "a")],
            ..Default::default()
        };
        assert!(matches!(
            blueprint.validate(),
            Err(BlueprintError::Cycle(_))
        ));
    }

    #[test]
    fn test_cycle_maps_to_blueprint_cycle_failure() {
        let details = BlueprintError::Cycle("a".to_string()).failure_details();
        assert_eq!(details.kind, FailureKind::BlueprintCycle);

        let details = BlueprintError::UnresolvedRef("x".to_string()).failure_details();
        assert_eq!(details.kind, FailureKind::BlueprintUnresolvedRef);
    }

    #[test]
    fn test_resolve_ref() {
        let mut id_map = BTreeMap::new();
        let mapped = Uuid::new_v4();
        id_map.insert("reader".to_string(), mapped);

        assert_eq!(PlanBlueprint::resolve_ref("reader", &id_map), Ok(mapped));

        let existing = Uuid::new_v4();
        assert_eq!(
            PlanBlueprint::resolve_ref(&existing.to_string(), &id_map),
            Ok(existing)
        );

        assert!(PlanBlueprint::resolve_ref("missing", &id_map).is_err());
    }
}
