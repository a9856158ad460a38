//! Persistence gateway port: the sole mediator to the relational store.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    BlueprintCommit, Edge, JsonMap, NewTask, PlanBlueprint, Task, TaskHistoryRecord, TaskPatch,
};

/// Transaction-free operations plus the entry point into a session.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Open a transaction scope. The caller must `commit` or `rollback`;
    /// change notifications are emitted only on commit.
    async fn begin(&self) -> DomainResult<Box<dyn StoreSession>>;

    /// Insert a task in its own transaction. Emits `task_created`.
    async fn create_task(&self, task: NewTask) -> DomainResult<Uuid>;

    /// Plain read, no lock.
    async fn get_task(&self, id: Uuid) -> DomainResult<Option<Task>>;

    /// All history snapshots, oldest first.
    async fn get_task_history(&self, id: Uuid) -> DomainResult<Vec<TaskHistoryRecord>>;

    /// Intervention rollback: create a new version whose content equals the
    /// snapshot at `version`. Returns the new version number.
    async fn rollback_task(&self, id: Uuid, version: i64) -> DomainResult<i64>;

    /// Find tasks whose `result` carries the given top-level property.
    async fn find_tasks_by_result_property(
        &self,
        key: &str,
        value: &Value,
    ) -> DomainResult<Vec<Task>>;
}

/// One open store transaction.
///
/// `lock_task` takes the row lock (`FOR UPDATE SKIP LOCKED` semantics):
/// a contended row yields `DomainError::LockMiss` instead of blocking.
/// Mutations stage inside the transaction and become visible, along with
/// their change notifications, on `commit`.
#[async_trait]
pub trait StoreSession: Send {
    async fn lock_task(&mut self, id: Uuid) -> DomainResult<Task>;

    /// Compound CAS update. Fails with `VersionConflict` if the stored
    /// version differs from `expected_version`. Writes a history snapshot at
    /// the new version and returns it.
    async fn update_task(
        &mut self,
        id: Uuid,
        patch: TaskPatch,
        expected_version: i64,
    ) -> DomainResult<i64>;

    /// Merge keys into `result` without touching `status` (tool re-entry).
    /// Also writes a history snapshot so rollback works mid-re-entry.
    async fn update_task_context(&mut self, id: Uuid, merge: JsonMap) -> DomainResult<i64>;

    /// Outgoing edges of a task, ordered by edge id for determinism.
    async fn get_outgoing_edges(&mut self, task_id: Uuid) -> DomainResult<Vec<Edge>>;

    /// Atomic blueprint expansion: assign uuids, rewrite refs, insert tasks
    /// and edges, apply updates. All-or-nothing within this transaction.
    async fn apply_blueprint(
        &mut self,
        blueprint: &PlanBlueprint,
        default_workflow: Uuid,
    ) -> DomainResult<BlueprintCommit>;

    async fn commit(self: Box<Self>) -> DomainResult<()>;

    async fn rollback(self: Box<Self>) -> DomainResult<()>;
}
