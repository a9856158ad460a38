//! Task history: append-only snapshots supporting intervention rollback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One accepted mutation of a task. `version_number` equals the task's
/// version after the mutation; `snapshot` is the full serialized task at
/// that version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistoryRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub version_number: i64,
    pub snapshot: Value,
    pub created_at: DateTime<Utc>,
}

impl TaskHistoryRecord {
    pub fn new(task_id: Uuid, version_number: i64, snapshot: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            version_number,
            snapshot,
            created_at: Utc::now(),
        }
    }
}
