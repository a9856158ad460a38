//! Task domain model.
//!
//! Tasks are the unit of execution in a workflow graph. They are created by
//! blueprint expansion, advanced exclusively by the task processor under a
//! store row lock, and never deleted: terminal statuses are soft-terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Open JSON object used for task payloads (`input_data`, `result`).
pub type JsonMap = Map<String, Value>;

/// Status of a task in the workflow lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task is waiting to be dispatched
    Pending,
    /// Task is being executed by a worker
    Running,
    /// Task finished successfully
    Completed,
    /// Task failed; details live in `result.failure_details`
    Failed,
    /// Task was cancelled by intervention
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" | "CANCELED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions from this status.
    ///
    /// `Running -> Pending` is the tool re-entry loop: an agent that emits a
    /// tool call goes back to PENDING with the tool result merged into its
    /// accumulated context, and the change notification re-enqueues it.
    pub fn valid_transitions(&self) -> Vec<TaskStatus> {
        match self {
            Self::Pending => vec![Self::Running, Self::Cancelled],
            Self::Running => vec![Self::Pending, Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => vec![],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Parsed form of the `assignee_id` column (`"Agent:<id>"` or `"Tool:<id>"`).
///
/// Parsing is deferred to the processor so that a malformed assignee fails
/// the task with `UNKNOWN_ASSIGNEE` instead of poisoning row loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignee {
    Agent(String),
    Tool(String),
}

impl Assignee {
    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, id) = raw.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match kind {
            "Agent" => Some(Self::Agent(id.to_string())),
            "Tool" => Some(Self::Tool(id.to_string())),
            _ => None,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Agent(id) | Self::Tool(id) => id,
        }
    }
}

impl std::fmt::Display for Assignee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "Agent:{id}"),
            Self::Tool(id) => write!(f, "Tool:{id}"),
        }
    }
}

/// A node of the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: Uuid,
    /// Workflow this task belongs to
    pub workflow_id: Uuid,
    /// Parent task (set when spliced in by a planner)
    pub parent_id: Option<Uuid>,
    /// Raw assignee string, `"Agent:<id>"` or `"Tool:<id>"`
    pub assignee: String,
    /// Current status
    pub status: TaskStatus,
    /// Input payload, amended by data-flow contributions
    pub input_data: JsonMap,
    /// Source attribution for data-flow contributions: input dot path ->
    /// contributing task uuid. Arbitrates conflicting fan-in writes so the
    /// highest source uuid wins a path regardless of commit order.
    #[serde(default)]
    pub input_provenance: JsonMap,
    /// Result payload; also carries accumulated re-entry context
    pub result: Option<JsonMap>,
    /// Opaque execution directives forwarded to the agent runtime
    pub directives: Option<Value>,
    /// Monotonic version for optimistic locking
    pub version: i64,
    /// When created
    pub created_at: DateTime<Utc>,
    /// When last mutated
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Parsed assignee, if well-formed.
    pub fn assignee(&self) -> Option<Assignee> {
        Assignee::parse(&self.assignee)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Full JSON snapshot of the task, as written to `task_history`.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Fields needed to insert a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub workflow_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub assignee: String,
    pub input_data: JsonMap,
    pub directives: Option<Value>,
}

impl NewTask {
    pub fn new(workflow_id: Uuid, assignee: impl Into<String>) -> Self {
        Self {
            workflow_id,
            parent_id: None,
            assignee: assignee.into(),
            input_data: JsonMap::new(),
            directives: None,
        }
    }

    pub fn with_input(mut self, input_data: JsonMap) -> Self {
        self.input_data = input_data;
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_directives(mut self, directives: Value) -> Self {
        self.directives = Some(directives);
        self
    }

    /// Materialize the row the store will hold after insertion.
    pub fn into_task(self, id: Uuid) -> Task {
        let now = Utc::now();
        Task {
            id,
            workflow_id: self.workflow_id,
            parent_id: self.parent_id,
            assignee: self.assignee,
            status: TaskStatus::Pending,
            input_data: self.input_data,
            input_provenance: JsonMap::new(),
            result: None,
            directives: self.directives,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied to a task under lock with a version CAS.
///
/// `None` fields keep their stored value; there is intentionally no way to
/// null a field out, matching the append-only shape of the lifecycle.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub result: Option<JsonMap>,
    pub input_data: Option<JsonMap>,
    pub input_provenance: Option<JsonMap>,
    pub directives: Option<Value>,
}

impl TaskPatch {
    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn result(mut self, result: JsonMap) -> Self {
        self.result = Some(result);
        self
    }

    pub fn input_data(mut self, input_data: JsonMap) -> Self {
        self.input_data = Some(input_data);
        self
    }

    pub fn input_provenance(mut self, input_provenance: JsonMap) -> Self {
        self.input_provenance = Some(input_provenance);
        self
    }

    pub fn directives(mut self, directives: Value) -> Self {
        self.directives = Some(directives);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.result.is_none()
            && self.input_data.is_none()
            && self.input_provenance.is_none()
            && self.directives.is_none()
    }

    /// Apply the patch to a task, bumping version and `updated_at`.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
        if let Some(input) = &self.input_data {
            task.input_data = input.clone();
        }
        if let Some(provenance) = &self.input_provenance {
            task.input_provenance = provenance.clone();
        }
        if let Some(directives) = &self.directives {
            task.directives = Some(directives.clone());
        }
        task.version += 1;
        task.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        // Tool re-entry loop
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        // Terminal states are sinks
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_str("canceled"), Some(TaskStatus::Cancelled));
        assert_eq!(TaskStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_assignee_parsing() {
        assert_eq!(
            Assignee::parse("Agent:Echo"),
            Some(Assignee::Agent("Echo".to_string()))
        );
        assert_eq!(
            Assignee::parse("Tool:search_weather"),
            Some(Assignee::Tool("search_weather".to_string()))
        );
        assert_eq!(Assignee::parse("Group:reviewers"), None);
        assert_eq!(Assignee::parse("Agent:"), None);
        assert_eq!(Assignee::parse("Echo"), None);
    }

    #[test]
    fn test_assignee_display_round_trip() {
        let assignee = Assignee::Agent("Planner".to_string());
        assert_eq!(Assignee::parse(&assignee.to_string()), Some(assignee));
    }

    #[test]
    fn test_new_task_materialization() {
        let workflow_id = Uuid::new_v4();
        let mut input = JsonMap::new();
        input.insert("msg".to_string(), json!("hi"));

        let id = Uuid::new_v4();
        let task = NewTask::new(workflow_id, "Agent:Echo")
            .with_input(input.clone())
            .into_task(id);

        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.version, 1);
        assert_eq!(task.input_data, input);
        assert!(task.result.is_none());
    }

    #[test]
    fn test_patch_apply_bumps_version() {
        let mut task = NewTask::new(Uuid::new_v4(), "Agent:Echo").into_task(Uuid::new_v4());
        let before = task.version;

        let mut result = JsonMap::new();
        result.insert("echo".to_string(), json!("hi"));
        TaskPatch::default()
            .status(TaskStatus::Completed)
            .result(result.clone())
            .apply_to(&mut task);

        assert_eq!(task.version, before + 1);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(result));
    }
}
