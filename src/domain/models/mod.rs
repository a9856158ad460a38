//! Domain models for the Synapse graph engine.

pub mod blueprint;
pub mod config;
pub mod edge;
pub mod history;
pub mod intent;
pub mod notification;
pub mod task;

pub use blueprint::{
    BlueprintCommit, BlueprintError, EdgeDefinition, PlanBlueprint, TaskDefinition, TaskUpdate,
};
pub use config::EngineConfig;
pub use edge::{Condition, DataFlow, Edge, Evaluator};
pub use history::TaskHistoryRecord;
pub use intent::{
    result_map_from, AgentResult, FailureDetails, FailureKind, Intent, ToolResult, ToolStatus,
};
pub use notification::{
    ChangeNotification, QueueMessage, TaskCreatedPayload, TaskUpdatedPayload, CHANNEL_TASK_CREATED,
    CHANNEL_TASK_UPDATED,
};
pub use task::{Assignee, JsonMap, NewTask, Task, TaskPatch, TaskStatus};
