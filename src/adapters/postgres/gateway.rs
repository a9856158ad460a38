//! PostgreSQL implementation of the persistence gateway.
//!
//! The schema (tables `tasks`, `edges`, `task_history` plus the NOTIFY
//! triggers on `tasks`) is owned by the platform's migration pipeline; this
//! adapter only assumes it. Row locking uses `FOR UPDATE SKIP LOCKED` so a
//! contended task surfaces as a `LockMiss` instead of blocking a worker.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    BlueprintCommit, Condition, DataFlow, Edge, JsonMap, NewTask, PlanBlueprint, Task,
    TaskHistoryRecord, TaskPatch, TaskStatus,
};
use crate::domain::ports::{PersistenceGateway, StoreSession};

#[derive(Clone)]
pub struct PgPersistenceGateway {
    pool: PgPool,
}

impl PgPersistenceGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str, max_connections: u32) -> DomainResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PersistenceGateway for PgPersistenceGateway {
    async fn begin(&self) -> DomainResult<Box<dyn StoreSession>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreSession { tx }))
    }

    #[instrument(skip(self, task), fields(workflow_id = %task.workflow_id))]
    async fn create_task(&self, task: NewTask) -> DomainResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO tasks (id, workflow_id, parent_task_id, assignee_id, status,
               input_data, input_provenance, result, directives, version, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, '{}'::jsonb, NULL, $7, 1, NOW(), NOW())"#,
        )
        .bind(id)
        .bind(task.workflow_id)
        .bind(task.parent_id)
        .bind(&task.assignee)
        .bind(TaskStatus::Pending.as_str())
        .bind(Value::Object(task.input_data))
        .bind(task.directives)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_task(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn get_task_history(&self, id: Uuid) -> DomainResult<Vec<TaskHistoryRecord>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT * FROM task_history WHERE task_id = $1 ORDER BY version_number ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(HistoryRow::into_record).collect())
    }

    #[instrument(skip(self))]
    async fn rollback_task(&self, id: Uuid, version: i64) -> DomainResult<i64> {
        let mut tx = self.pool.begin().await?;

        let current: Option<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let current = current.ok_or(DomainError::TaskNotFound(id))?;

        let prior: Option<HistoryRow> = sqlx::query_as(
            "SELECT * FROM task_history WHERE task_id = $1 AND version_number = $2",
        )
        .bind(id)
        .bind(version)
        .fetch_optional(&mut *tx)
        .await?;
        let prior = prior.ok_or(DomainError::HistoryVersionNotFound {
            task_id: id,
            version,
        })?;

        let restored: Task = serde_json::from_value(prior.snapshot.clone())?;
        let new_version = current.version + 1;

        sqlx::query(
            r#"UPDATE tasks SET status = $2, input_data = $3, input_provenance = $4,
               result = $5, directives = $6, version = $7, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(restored.status.as_str())
        .bind(Value::Object(restored.input_data))
        .bind(Value::Object(restored.input_provenance))
        .bind(restored.result.map(Value::Object))
        .bind(restored.directives)
        .bind(new_version)
        .execute(&mut *tx)
        .await?;

        insert_history(&mut tx, id, new_version, prior.snapshot).await?;
        tx.commit().await?;
        Ok(new_version)
    }

    async fn find_tasks_by_result_property(
        &self,
        key: &str,
        value: &Value,
    ) -> DomainResult<Vec<Task>> {
        let needle = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE result ->> $1 = $2 ORDER BY created_at ASC")
                .bind(key)
                .bind(needle)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Task::try_from).collect()
    }
}

pub struct PgStoreSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreSession for PgStoreSession {
    async fn lock_task(&mut self, id: Uuid) -> DomainResult<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE id = $1 FOR UPDATE SKIP LOCKED")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;

        match row {
            Some(row) => Task::try_from(row),
            None => {
                // Distinguish a held lock from a missing row; plain reads do
                // not block on row locks.
                let exists: (bool,) =
                    sqlx::query_as("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
                        .bind(id)
                        .fetch_one(&mut *self.tx)
                        .await?;
                if exists.0 {
                    Err(DomainError::LockMiss(id))
                } else {
                    Err(DomainError::TaskNotFound(id))
                }
            }
        }
    }

    async fn update_task(
        &mut self,
        id: Uuid,
        patch: TaskPatch,
        expected_version: i64,
    ) -> DomainResult<i64> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"UPDATE tasks SET
                   status = COALESCE($3, status),
                   result = COALESCE($4, result),
                   input_data = COALESCE($5, input_data),
                   input_provenance = COALESCE($6, input_provenance),
                   directives = COALESCE($7, directives),
                   version = version + 1,
                   updated_at = NOW()
               WHERE id = $1 AND version = $2
               RETURNING *"#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.result.map(Value::Object))
        .bind(patch.input_data.map(Value::Object))
        .bind(patch.input_provenance.map(Value::Object))
        .bind(patch.directives)
        .fetch_optional(&mut *self.tx)
        .await?;

        let row = match row {
            Some(row) => row,
            None => {
                let exists: (bool,) =
                    sqlx::query_as("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
                        .bind(id)
                        .fetch_one(&mut *self.tx)
                        .await?;
                return Err(if exists.0 {
                    DomainError::VersionConflict {
                        task_id: id,
                        expected: expected_version,
                    }
                } else {
                    DomainError::TaskNotFound(id)
                });
            }
        };

        let task = Task::try_from(row)?;
        let new_version = task.version;
        insert_history(&mut self.tx, id, new_version, task.snapshot()).await?;
        Ok(new_version)
    }

    async fn update_task_context(&mut self, id: Uuid, merge: JsonMap) -> DomainResult<i64> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"UPDATE tasks SET
                   result = COALESCE(result, '{}'::jsonb) || $2::jsonb,
                   version = version + 1,
                   updated_at = NOW()
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(Value::Object(merge))
        .fetch_optional(&mut *self.tx)
        .await?;

        let row = row.ok_or(DomainError::TaskNotFound(id))?;
        let task = Task::try_from(row)?;
        let new_version = task.version;
        insert_history(&mut self.tx, id, new_version, task.snapshot()).await?;
        Ok(new_version)
    }

    async fn get_outgoing_edges(&mut self, task_id: Uuid) -> DomainResult<Vec<Edge>> {
        let rows: Vec<EdgeRow> =
            sqlx::query_as("SELECT * FROM edges WHERE source_task_id = $1 ORDER BY id ASC")
                .bind(task_id)
                .fetch_all(&mut *self.tx)
                .await?;
        rows.into_iter().map(Edge::try_from).collect()
    }

    async fn apply_blueprint(
        &mut self,
        blueprint: &PlanBlueprint,
        default_workflow: Uuid,
    ) -> DomainResult<BlueprintCommit> {
        blueprint.validate()?;
        let workflow_id = blueprint.workflow_id.unwrap_or(default_workflow);

        let mut id_map = BTreeMap::new();
        for definition in &blueprint.new_tasks {
            id_map.insert(definition.task_id.clone(), Uuid::new_v4());
        }

        for definition in &blueprint.new_tasks {
            let id = id_map[&definition.task_id];
            let parent_id = definition
                .parent_task_id
                .as_deref()
                .map(|reference| PlanBlueprint::resolve_ref(reference, &id_map))
                .transpose()?;

            sqlx::query(
                r#"INSERT INTO tasks (id, workflow_id, parent_task_id, assignee_id, status,
                   input_data, input_provenance, result, directives, version, created_at, updated_at)
                   VALUES ($1, $2, $3, $4, $5, $6, '{}'::jsonb, NULL, $7, 1, NOW(), NOW())"#,
            )
            .bind(id)
            .bind(workflow_id)
            .bind(parent_id)
            .bind(&definition.assignee)
            .bind(TaskStatus::Pending.as_str())
            .bind(Value::Object(definition.input_data.clone()))
            .bind(definition.directives.clone())
            .execute(&mut *self.tx)
            .await?;
        }

        for definition in &blueprint.new_edges {
            let source = PlanBlueprint::resolve_ref(&definition.source_task_id, &id_map)?;
            let target = PlanBlueprint::resolve_ref(&definition.target_task_id, &id_map)?;

            sqlx::query(
                r#"INSERT INTO edges (id, workflow_id, source_task_id, target_task_id,
                   condition, data_flow)
                   VALUES ($1, $2, $3, $4, $5, $6)"#,
            )
            .bind(Uuid::new_v4())
            .bind(workflow_id)
            .bind(source)
            .bind(target)
            .bind(
                definition
                    .condition
                    .as_ref()
                    .map(serde_json::to_value)
                    .transpose()?,
            )
            .bind(
                definition
                    .data_flow
                    .as_ref()
                    .map(serde_json::to_value)
                    .transpose()?,
            )
            .execute(&mut *self.tx)
            .await?;
        }

        for update in &blueprint.update_tasks {
            let current = self.lock_task(update.task_id).await?;
            let mut patch = TaskPatch::default();
            if let Some(input) = &update.new_input_data {
                patch = patch.input_data(input.clone());
            }
            if let Some(status) = update.new_status {
                patch = patch.status(status);
            }
            if !patch.is_empty() {
                self.update_task(update.task_id, patch, current.version)
                    .await?;
            }
        }

        let plan_handle = blueprint
            .new_tasks
            .first()
            .map(|definition| id_map[&definition.task_id])
            .unwrap_or(default_workflow);

        Ok(BlueprintCommit {
            id_map,
            plan_handle,
        })
    }

    async fn commit(self: Box<Self>) -> DomainResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DomainResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

async fn insert_history(
    tx: &mut Transaction<'static, Postgres>,
    task_id: Uuid,
    version: i64,
    snapshot: Value,
) -> DomainResult<()> {
    sqlx::query(
        r#"INSERT INTO task_history (id, task_id, version_number, snapshot, created_at)
           VALUES ($1, $2, $3, $4, NOW())"#,
    )
    .bind(Uuid::new_v4())
    .bind(task_id)
    .bind(version)
    .bind(snapshot)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    workflow_id: Uuid,
    parent_task_id: Option<Uuid>,
    assignee_id: String,
    status: String,
    input_data: Option<Value>,
    input_provenance: Option<Value>,
    result: Option<Value>,
    directives: Option<Value>,
    version: i64,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status).ok_or_else(|| {
            DomainError::Serialization(format!("invalid status: {}", row.status))
        })?;

        let input_data = match row.input_data {
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(DomainError::Serialization(format!(
                    "input_data is not an object: {other}"
                )))
            }
            None => JsonMap::new(),
        };

        let input_provenance = match row.input_provenance {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => JsonMap::new(),
            Some(other) => {
                return Err(DomainError::Serialization(format!(
                    "input_provenance is not an object: {other}"
                )))
            }
        };

        let result = match row.result {
            Some(Value::Object(map)) => Some(map),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(DomainError::Serialization(format!(
                    "result is not an object: {other}"
                )))
            }
        };

        Ok(Task {
            id: row.id,
            workflow_id: row.workflow_id,
            parent_id: row.parent_task_id,
            assignee: row.assignee_id,
            status,
            input_data,
            input_provenance,
            result,
            directives: row.directives,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    task_id: Uuid,
    version_number: i64,
    snapshot: Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl HistoryRow {
    fn into_record(self) -> TaskHistoryRecord {
        TaskHistoryRecord {
            id: self.id,
            task_id: self.task_id,
            version_number: self.version_number,
            snapshot: self.snapshot,
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EdgeRow {
    id: Uuid,
    workflow_id: Uuid,
    source_task_id: Uuid,
    target_task_id: Uuid,
    condition: Option<Value>,
    data_flow: Option<Value>,
}

impl TryFrom<EdgeRow> for Edge {
    type Error = DomainError;

    fn try_from(row: EdgeRow) -> Result<Self, Self::Error> {
        let condition: Option<Condition> =
            row.condition.map(serde_json::from_value).transpose()?;
        let data_flow: Option<DataFlow> =
            row.data_flow.map(serde_json::from_value).transpose()?;

        Ok(Edge {
            id: row.id,
            workflow_id: row.workflow_id,
            source_task_id: row.source_task_id,
            target_task_id: row.target_task_id,
            condition,
            data_flow,
        })
    }
}
