//! In-memory gateway and broker honoring the same contracts as the
//! Postgres/Redis adapters: skip-locked row locks, version CAS, history
//! snapshots, transactional staging, and change notifications on commit.
//!
//! Used by the engine integration tests, where whole workflows run without
//! external infrastructure.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    BlueprintCommit, Edge, JsonMap, NewTask, PlanBlueprint, Task, TaskHistoryRecord, TaskPatch,
};
use crate::domain::ports::{BrokerQueue, PersistenceGateway, StoreSession};

#[derive(Default)]
struct StoreState {
    tasks: HashMap<Uuid, Task>,
    edges: Vec<Edge>,
    history: HashMap<Uuid, Vec<TaskHistoryRecord>>,
    locked: HashSet<Uuid>,
}

/// Where committed change notifications go: task ids are pushed onto the
/// attached broker queue, standing in for the NOTIFY-trigger + bridge pair.
#[derive(Clone)]
struct ChangeFeed {
    broker: Arc<dyn BrokerQueue>,
    queue: String,
}

#[derive(Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<StoreState>>,
    feed: Arc<Mutex<Option<ChangeFeed>>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route committed change notifications onto a broker queue.
    pub fn attach_feed(&self, broker: Arc<dyn BrokerQueue>, queue: impl Into<String>) {
        *self.feed.lock().unwrap() = Some(ChangeFeed {
            broker,
            queue: queue.into(),
        });
    }

    /// Seed an edge directly; tests build graphs without blueprints.
    pub fn insert_edge(&self, edge: Edge) {
        self.state.lock().unwrap().edges.push(edge);
    }

    /// Snapshot of every task, oldest first.
    pub fn all_tasks(&self) -> Vec<Task> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    fn feed(&self) -> Option<ChangeFeed> {
        self.feed.lock().unwrap().clone()
    }

    async fn emit(&self, task_ids: &[Uuid]) -> DomainResult<()> {
        if let Some(feed) = self.feed() {
            for task_id in task_ids {
                feed.broker
                    .push(&feed.queue, &task_id.to_string())
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn begin(&self) -> DomainResult<Box<dyn StoreSession>> {
        Ok(Box::new(InMemorySession {
            gateway: self.clone(),
            held_locks: Vec::new(),
            staged_tasks: HashMap::new(),
            staged_edges: Vec::new(),
            staged_history: Vec::new(),
            staged_created: Vec::new(),
            staged_updated: Vec::new(),
            finished: false,
        }))
    }

    async fn create_task(&self, task: NewTask) -> DomainResult<Uuid> {
        let id = Uuid::new_v4();
        {
            let mut state = self.state.lock().unwrap();
            state.tasks.insert(id, task.into_task(id));
        }
        self.emit(&[id]).await?;
        Ok(id)
    }

    async fn get_task(&self, id: Uuid) -> DomainResult<Option<Task>> {
        Ok(self.state.lock().unwrap().tasks.get(&id).cloned())
    }

    async fn get_task_history(&self, id: Uuid) -> DomainResult<Vec<TaskHistoryRecord>> {
        let state = self.state.lock().unwrap();
        let mut records = state.history.get(&id).cloned().unwrap_or_default();
        records.sort_by_key(|record| record.version_number);
        Ok(records)
    }

    async fn rollback_task(&self, id: Uuid, version: i64) -> DomainResult<i64> {
        let new_version = {
            let mut state = self.state.lock().unwrap();
            if state.locked.contains(&id) {
                return Err(DomainError::LockMiss(id));
            }
            let prior = state
                .history
                .get(&id)
                .and_then(|records| {
                    records
                        .iter()
                        .find(|record| record.version_number == version)
                })
                .cloned()
                .ok_or(DomainError::HistoryVersionNotFound {
                    task_id: id,
                    version,
                })?;

            let restored: Task = serde_json::from_value(prior.snapshot.clone())?;
            let task = state
                .tasks
                .get_mut(&id)
                .ok_or(DomainError::TaskNotFound(id))?;

            task.status = restored.status;
            task.input_data = restored.input_data;
            task.input_provenance = restored.input_provenance;
            task.result = restored.result;
            task.directives = restored.directives;
            task.version += 1;
            task.updated_at = Utc::now();
            let new_version = task.version;

            state
                .history
                .entry(id)
                .or_default()
                .push(TaskHistoryRecord::new(id, new_version, prior.snapshot));
            new_version
        };
        self.emit(&[id]).await?;
        Ok(new_version)
    }

    async fn find_tasks_by_result_property(
        &self,
        key: &str,
        value: &Value,
    ) -> DomainResult<Vec<Task>> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| {
                task.result
                    .as_ref()
                    .and_then(|result| result.get(key))
                    .is_some_and(|found| found == value)
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        Ok(tasks)
    }
}

pub struct InMemorySession {
    gateway: InMemoryGateway,
    held_locks: Vec<Uuid>,
    staged_tasks: HashMap<Uuid, Task>,
    staged_edges: Vec<Edge>,
    staged_history: Vec<TaskHistoryRecord>,
    staged_created: Vec<Uuid>,
    staged_updated: Vec<Uuid>,
    finished: bool,
}

impl InMemorySession {
    /// Current view of a task: staged overlay first, then committed state.
    fn view(&self, id: Uuid) -> DomainResult<Task> {
        if let Some(task) = self.staged_tasks.get(&id) {
            return Ok(task.clone());
        }
        self.gateway
            .state
            .lock()
            .unwrap()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(DomainError::TaskNotFound(id))
    }

    fn release_locks(&mut self) {
        if self.held_locks.is_empty() {
            return;
        }
        let mut state = self.gateway.state.lock().unwrap();
        for id in self.held_locks.drain(..) {
            state.locked.remove(&id);
        }
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        // An abandoned session is a rollback: staged work vanishes, locks
        // must not leak.
        if !self.finished {
            self.release_locks();
        }
    }
}

#[async_trait]
impl StoreSession for InMemorySession {
    async fn lock_task(&mut self, id: Uuid) -> DomainResult<Task> {
        if self.held_locks.contains(&id) {
            return self.view(id);
        }

        {
            let mut state = self.gateway.state.lock().unwrap();
            if !state.tasks.contains_key(&id) && !self.staged_tasks.contains_key(&id) {
                return Err(DomainError::TaskNotFound(id));
            }
            if state.locked.contains(&id) {
                return Err(DomainError::LockMiss(id));
            }
            state.locked.insert(id);
        }
        self.held_locks.push(id);
        self.view(id)
    }

    async fn update_task(
        &mut self,
        id: Uuid,
        patch: TaskPatch,
        expected_version: i64,
    ) -> DomainResult<i64> {
        let mut task = self.view(id)?;
        if task.version != expected_version {
            return Err(DomainError::VersionConflict {
                task_id: id,
                expected: expected_version,
            });
        }

        patch.apply_to(&mut task);
        let new_version = task.version;
        self.staged_history
            .push(TaskHistoryRecord::new(id, new_version, task.snapshot()));
        self.staged_tasks.insert(id, task);
        self.staged_updated.push(id);
        Ok(new_version)
    }

    async fn update_task_context(&mut self, id: Uuid, merge: JsonMap) -> DomainResult<i64> {
        let mut task = self.view(id)?;
        let mut result = task.result.take().unwrap_or_default();
        for (key, value) in merge {
            result.insert(key, value);
        }
        task.result = Some(result);
        task.version += 1;
        task.updated_at = Utc::now();

        let new_version = task.version;
        self.staged_history
            .push(TaskHistoryRecord::new(id, new_version, task.snapshot()));
        self.staged_tasks.insert(id, task);
        self.staged_updated.push(id);
        Ok(new_version)
    }

    async fn get_outgoing_edges(&mut self, task_id: Uuid) -> DomainResult<Vec<Edge>> {
        let mut edges: Vec<Edge> = {
            let state = self.gateway.state.lock().unwrap();
            state
                .edges
                .iter()
                .chain(self.staged_edges.iter())
                .filter(|edge| edge.source_task_id == task_id)
                .cloned()
                .collect()
        };
        edges.sort_by_key(|edge| edge.id);
        Ok(edges)
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

            let task = NewTask {
                workflow_id,
                parent_id,
                assignee: definition.assignee.clone(),
                input_data: definition.input_data.clone(),
                directives: definition.directives.clone(),
            }
            .into_task(id);

            self.staged_tasks.insert(id, task);
            self.staged_created.push(id);
        }

        for definition in &blueprint.new_edges {
            let source = PlanBlueprint::resolve_ref(&definition.source_task_id, &id_map)?;
            let target = PlanBlueprint::resolve_ref(&definition.target_task_id, &id_map)?;
            self.staged_edges.push(Edge {
                id: Uuid::new_v4(),
                workflow_id,
                source_task_id: source,
                target_task_id: target,
                condition: definition.condition.clone(),
                data_flow: definition.data_flow.clone(),
            });
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

    async fn commit(mut self: Box<Self>) -> DomainResult<()> {
        let mut notify: Vec<Uuid> = Vec::new();
        {
            let mut state = self.gateway.state.lock().unwrap();
            for (id, task) in self.staged_tasks.drain() {
                state.tasks.insert(id, task);
            }
            state.edges.append(&mut self.staged_edges);
            for record in self.staged_history.drain(..) {
                state.history.entry(record.task_id).or_default().push(record);
            }
            notify.extend(self.staged_created.drain(..));
            notify.extend(self.staged_updated.drain(..));
        }
        self.release_locks();
        self.finished = true;

        self.gateway.emit(&notify).await
    }

    async fn rollback(mut self: Box<Self>) -> DomainResult<()> {
        self.release_locks();
        self.finished = true;
        Ok(())
    }
}

/// Blocking-pop FIFO backed by per-queue `VecDeque`s. Elements are pushed
/// at the front and popped from the back, like LPUSH/BRPOP.
#[derive(Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_pop(&self, queue: &str) -> Option<String> {
        self.queues
            .lock()
            .unwrap()
            .get_mut(queue)
            .and_then(VecDeque::pop_back)
    }

    pub fn len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }
}

#[async_trait]
impl BrokerQueue for InMemoryBroker {
    async fn push(&self, queue: &str, payload: &str) -> DomainResult<()> {
        self.queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push_front(payload.to_string());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> DomainResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(payload) = self.try_pop(queue) {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop(queue));
            }
        }
    }
}
