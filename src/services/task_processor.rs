//! The per-task state machine.
//!
//! `process(task_id)` locks the task row, routes on status, interprets the
//! agent's intent, writes the next state, and lets the store's change
//! notifications drive everything downstream. No transaction is ever held
//! across an agent or tool invocation: the task row is the continuation.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    result_map_from, AgentResult, Assignee, Edge, FailureDetails, FailureKind, Intent, JsonMap,
    PlanBlueprint, Task, TaskPatch, TaskStatus, ToolResult,
};
use crate::domain::ports::{
    AgentInvocation, AgentRuntime, AgentRole, CapabilityRegistry, PersistenceGateway,
    StoreSession, ToolRuntime,
};
use crate::services::retry::RetryPolicy;
use crate::services::{condition_evaluator, data_flow};

/// Drives a single task through one dispatch.
pub struct TaskProcessor {
    gateway: Arc<dyn PersistenceGateway>,
    agents: Arc<dyn AgentRuntime>,
    tools: Arc<dyn ToolRuntime>,
    capabilities: Arc<dyn CapabilityRegistry>,
    retry: RetryPolicy,
    task_deadline: Duration,
}

impl TaskProcessor {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        agents: Arc<dyn AgentRuntime>,
        tools: Arc<dyn ToolRuntime>,
        capabilities: Arc<dyn CapabilityRegistry>,
        retry: RetryPolicy,
        task_deadline: Duration,
    ) -> Self {
        Self {
            gateway,
            agents,
            tools,
            capabilities,
            retry,
            task_deadline,
        }
    }

    /// Process one dispatched task id.
    ///
    /// Returns `Ok(())` for every expected outcome, including lock misses:
    /// another worker owning the row means this event is already handled.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn process(&self, task_id: Uuid) -> DomainResult<()> {
        let mut session = self.gateway.begin().await?;

        let task = match session.lock_task(task_id).await {
            Ok(task) => task,
            Err(DomainError::LockMiss(_)) => {
                debug!("task locked by another worker; skipping");
                session.rollback().await?;
                return Ok(());
            }
            Err(DomainError::TaskNotFound(_)) => {
                warn!("dispatched task does not exist");
                session.rollback().await?;
                return Ok(());
            }
            Err(err) => {
                let _ = session.rollback().await;
                return Err(err);
            }
        };

        match task.status {
            TaskStatus::Pending => self.execute_assignee(session, task).await,
            TaskStatus::Running => {
                // Only reachable if a worker died mid-transaction; recover by
                // treating the task as pending again.
                warn!("found RUNNING task under lock; recovering as PENDING");
                self.execute_assignee(session, task).await
            }
            TaskStatus::Completed => self.propagate(session, task).await,
            TaskStatus::Failed | TaskStatus::Cancelled => {
                debug!(status = task.status.as_str(), "terminal task; dropping");
                session.rollback().await?;
                Ok(())
            }
        }
    }

    async fn execute_assignee(
        &self,
        session: Box<dyn StoreSession>,
        task: Task,
    ) -> DomainResult<()> {
        match task.assignee() {
            Some(Assignee::Agent(agent_id)) => self.run_agent(session, task, agent_id).await,
            Some(Assignee::Tool(tool_id)) => self.run_tool(session, task, tool_id).await,
            None => {
                warn!(assignee = %task.assignee, "unknown assignee format");
                let details = FailureDetails::new(
                    FailureKind::UnknownAssignee,
                    format!("unrecognized assignee '{}'", task.assignee),
                );
                self.fail_with(session, task.id, task.version, details, None)
                    .await
            }
        }
    }

    // --- Agent execution (§ agent lifecycle) ---

    async fn run_agent(
        &self,
        mut session: Box<dyn StoreSession>,
        task: Task,
        agent_id: String,
    ) -> DomainResult<()> {
        if let Some(directives) = &task.directives {
            debug!(?directives, "task carries directives; forwarding to agent");
        }

        // Mark RUNNING and release the lock before touching the runtime.
        let running_version = session
            .update_task(
                task.id,
                TaskPatch::default().status(TaskStatus::Running),
                task.version,
            )
            .await?;
        session.commit().await?;

        let invocation = AgentInvocation {
            task_id: task.id,
            agent_id: agent_id.clone(),
            input_data: task.input_data.clone(),
            accumulated_context: task.result.clone().unwrap_or_default(),
            directives: task.directives.clone(),
        };
        let outcome = timeout(self.task_deadline, self.agents.invoke(invocation)).await;

        // Re-acquire and make sure nobody advanced the task while the agent
        // was thinking; a duplicate dispatch loses the CAS race here.
        let mut session = self.gateway.begin().await?;
        let current = match self.relock_at(&mut session, task.id, running_version).await? {
            Some(task) => task,
            None => {
                session.rollback().await?;
                return Ok(());
            }
        };

        let result = match outcome {
            Err(_) => {
                let details = FailureDetails::new(
                    FailureKind::Timeout,
                    format!("agent exceeded {}s deadline", self.task_deadline.as_secs()),
                );
                return self
                    .fail_with(session, task.id, current.version, details, None)
                    .await;
            }
            Ok(Err(err)) => {
                let details =
                    FailureDetails::new(FailureKind::AgentExecutionError, err.to_string());
                return self
                    .fail_with(session, task.id, current.version, details, None)
                    .await;
            }
            Ok(Ok(result)) => result,
        };

        match result {
            AgentResult::Failure { details, thought } => {
                info!(kind = details.kind.as_str(), "agent reported failure");
                self.fail_with(session, task.id, current.version, details, thought)
                    .await
            }
            AgentResult::Success { intent, .. } => match intent {
                Intent::FinalAnswer { content } => {
                    let result = result_map_from(content, "content");
                    session
                        .update_task(
                            task.id,
                            TaskPatch::default()
                                .status(TaskStatus::Completed)
                                .result(result),
                            current.version,
                        )
                        .await?;
                    session.commit().await?;
                    info!("task completed with final answer");
                    Ok(())
                }
                Intent::ToolCallRequest { tool_id, arguments } => {
                    // Release the lock for the duration of the tool call.
                    session.rollback().await?;
                    self.handle_tool_call(&task, running_version, &tool_id, &arguments)
                        .await
                }
                Intent::Plan(blueprint) => {
                    self.handle_plan(session, &task, current.version, &agent_id, blueprint)
                        .await
                }
            },
        }
    }

    /// Agent-requested tool call: invoke, merge the result into the task's
    /// accumulated context, and flip the task back to PENDING so the change
    /// notification re-enqueues it for re-entry.
    async fn handle_tool_call(
        &self,
        task: &Task,
        running_version: i64,
        tool_id: &str,
        arguments: &JsonMap,
    ) -> DomainResult<()> {
        let tool_result = match timeout(self.task_deadline, self.tools.invoke(tool_id, arguments))
            .await
        {
            Err(_) => {
                let details = FailureDetails::new(
                    FailureKind::Timeout,
                    format!("tool '{tool_id}' exceeded {}s deadline", self.task_deadline.as_secs()),
                );
                return self
                    .fail_relocked(task.id, running_version, details, None)
                    .await;
            }
            Ok(Err(err)) => {
                let details = FailureDetails::new(
                    FailureKind::ToolExecutionFailed,
                    format!("tool '{tool_id}' invocation failed: {err}"),
                );
                return self
                    .fail_relocked(task.id, running_version, details, None)
                    .await;
            }
            Ok(Ok(result)) => result,
        };

        let mut session = self.gateway.begin().await?;
        if self
            .relock_at(&mut session, task.id, running_version)
            .await?
            .is_none()
        {
            session.rollback().await?;
            return Ok(());
        }

        let mut merge = JsonMap::new();
        merge.insert("last_tool_result".to_string(), tool_result.to_value());
        let merged_version = session.update_task_context(task.id, merge).await?;
        session
            .update_task(
                task.id,
                TaskPatch::default().status(TaskStatus::Pending),
                merged_version,
            )
            .await?;
        session.commit().await?;

        info!(
            tool_id,
            success = tool_result.is_success(),
            "tool result merged; task re-queued for re-entry"
        );
        Ok(())
    }

    /// Planner intent: verify the role, validate the blueprint, expand it in
    /// the same transaction as the task's completion.
    async fn handle_plan(
        &self,
        mut session: Box<dyn StoreSession>,
        task: &Task,
        current_version: i64,
        agent_id: &str,
        blueprint: PlanBlueprint,
    ) -> DomainResult<()> {
        let capability = self.capabilities.get_agent(agent_id).await?;
        let is_planner = capability.is_some_and(|c| c.role == AgentRole::Planner);
        if !is_planner {
            let details = FailureDetails::new(
                FailureKind::PlannerRoleViolation,
                format!("agent '{agent_id}' is not registered as a planner"),
            );
            return self
                .fail_with(session, task.id, current_version, details, None)
                .await;
        }

        if let Err(err) = blueprint.validate() {
            warn!(error = %err, "rejecting invalid blueprint");
            return self
                .fail_with(session, task.id, current_version, err.failure_details(), None)
                .await;
        }

        match session.apply_blueprint(&blueprint, task.workflow_id).await {
            Ok(commit) => {
                let mut result = JsonMap::new();
                result.insert(
                    "plan_id".to_string(),
                    Value::String(commit.plan_handle.to_string()),
                );
                session
                    .update_task(
                        task.id,
                        TaskPatch::default()
                            .status(TaskStatus::Completed)
                            .result(result),
                        current_version,
                    )
                    .await?;
                session.commit().await?;
                info!(
                    new_tasks = commit.id_map.len(),
                    "blueprint expanded; planner task completed"
                );
                Ok(())
            }
            Err(DomainError::Blueprint(err)) => {
                // The transaction is poisoned after a failed expansion; the
                // rollback discards any partial rows before we record the
                // failure in a fresh one.
                warn!(error = %err, "blueprint rejected by store");
                session.rollback().await?;
                self.fail_relocked(task.id, current_version, err.failure_details(), None)
                    .await
            }
            Err(err) => {
                let _ = session.rollback().await;
                Err(err)
            }
        }
    }

    // --- Direct tool execution (non-agent task) ---

    async fn run_tool(
        &self,
        mut session: Box<dyn StoreSession>,
        task: Task,
        tool_id: String,
    ) -> DomainResult<()> {
        let running_version = session
            .update_task(
                task.id,
                TaskPatch::default().status(TaskStatus::Running),
                task.version,
            )
            .await?;
        session.commit().await?;

        let outcome = timeout(self.task_deadline, self.tools.invoke(&tool_id, &task.input_data))
            .await;

        let mut session = self.gateway.begin().await?;
        let Some(current) = self.relock_at(&mut session, task.id, running_version).await? else {
            session.rollback().await?;
            return Ok(());
        };

        match outcome {
            Err(_) => {
                let details = FailureDetails::new(
                    FailureKind::Timeout,
                    format!("tool '{tool_id}' exceeded {}s deadline", self.task_deadline.as_secs()),
                );
                self.fail_with(session, task.id, current.version, details, None)
                    .await
            }
            Ok(Err(err)) => {
                let details = FailureDetails::new(
                    FailureKind::ToolExecutionFailed,
                    format!("tool '{tool_id}' invocation failed: {err}"),
                );
                self.fail_with(session, task.id, current.version, details, None)
                    .await
            }
            Ok(Ok(tool_result)) if tool_result.is_success() => {
                let output = tool_result.output.clone().unwrap_or(Value::Null);
                session
                    .update_task(
                        task.id,
                        TaskPatch::default()
                            .status(TaskStatus::Completed)
                            .result(result_map_from(output, "output")),
                        current.version,
                    )
                    .await?;
                session.commit().await?;
                info!(tool_id, "tool task completed");
                Ok(())
            }
            Ok(Ok(tool_result)) => {
                self.fail_tool_task(session, &task, current.version, &tool_id, tool_result)
                    .await
            }
        }
    }

    async fn fail_tool_task(
        &self,
        mut session: Box<dyn StoreSession>,
        task: &Task,
        expected_version: i64,
        tool_id: &str,
        tool_result: ToolResult,
    ) -> DomainResult<()> {
        let message = tool_result
            .error_message
            .clone()
            .unwrap_or_else(|| format!("tool '{tool_id}' failed"));
        let details = FailureDetails::new(FailureKind::ToolExecutionFailed, message);

        let mut result = JsonMap::new();
        result.insert("failure_details".to_string(), details.to_value());
        // Preserve the tool's own taxonomy alongside the engine's.
        result.insert("last_tool_result".to_string(), tool_result.to_value());

        session
            .update_task(
                task.id,
                TaskPatch::default()
                    .status(TaskStatus::Failed)
                    .result(result),
                expected_version,
            )
            .await?;
        session.commit().await?;
        warn!(tool_id, "tool task failed");
        Ok(())
    }

    // --- Propagation (source task COMPLETED) ---

    /// Evaluate outgoing edges and amend still-PENDING targets. Activation
    /// is implicit: the target's update notification re-enqueues it.
    async fn propagate(&self, mut session: Box<dyn StoreSession>, task: Task) -> DomainResult<()> {
        let edges = session.get_outgoing_edges(task.id).await?;
        // The source is terminal; release its lock before touching targets.
        session.commit().await?;

        if edges.is_empty() {
            debug!("completed task has no outgoing edges");
            return Ok(());
        }

        let context = serde_json::json!({
            "result": task.result.clone().map(Value::Object).unwrap_or(Value::Object(JsonMap::new())),
            "input": Value::Object(task.input_data.clone()),
        });

        for edge in &edges {
            if !edge_is_active(edge, &context) {
                continue;
            }
            let delta = data_flow::apply(edge.data_flow.as_ref(), &context);

            let outcome = self
                .retry
                .execute(|| self.contribute_to_target(edge, &delta))
                .await;
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_contention() => {
                    debug!(target = %edge.target_task_id, "target contended; a later notification will converge it");
                }
                Err(DomainError::TaskNotFound(id)) => {
                    warn!(target = %id, "edge points at missing task");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// One transaction per edge: lock the target, merge the delta into its
    /// input, bump the version. Only still-PENDING targets participate.
    /// Conflicting fan-in paths are arbitrated by source task uuid through
    /// the persisted provenance map, so concurrently completing sources
    /// converge to the same input regardless of commit order.
    async fn contribute_to_target(&self, edge: &Edge, delta: &JsonMap) -> DomainResult<()> {
        let mut session = self.gateway.begin().await?;
        let target = match session.lock_task(edge.target_task_id).await {
            Ok(target) => target,
            Err(err) => {
                let _ = session.rollback().await;
                return Err(err);
            }
        };

        if target.status != TaskStatus::Pending {
            debug!(
                target = %target.id,
                status = target.status.as_str(),
                "target not pending; contribution skipped"
            );
            session.rollback().await?;
            return Ok(());
        }

        let mut input = target.input_data.clone();
        let mut provenance = target.input_provenance.clone();
        data_flow::merge_contribution(&mut input, &mut provenance, delta, edge.source_task_id);

        session
            .update_task(
                target.id,
                TaskPatch::default()
                    .input_data(input)
                    .input_provenance(provenance),
                target.version,
            )
            .await?;
        session.commit().await?;
        debug!(target = %edge.target_task_id, "edge contribution merged");
        Ok(())
    }

    // --- Shared failure paths ---

    /// Re-lock a task and verify it is still RUNNING at the version this
    /// worker wrote. Any drift means a concurrent worker or an intervention
    /// advanced it: our result is stale and must be discarded.
    async fn relock_at(
        &self,
        session: &mut Box<dyn StoreSession>,
        task_id: Uuid,
        expected_version: i64,
    ) -> DomainResult<Option<Task>> {
        match session.lock_task(task_id).await {
            Ok(task) if task.status == TaskStatus::Running && task.version == expected_version => {
                Ok(Some(task))
            }
            Ok(task) => {
                debug!(
                    status = task.status.as_str(),
                    version = task.version,
                    expected = expected_version,
                    "task advanced concurrently; discarding stale outcome"
                );
                Ok(None)
            }
            Err(DomainError::LockMiss(_)) => {
                debug!("lost re-acquire race; discarding stale outcome");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn fail_with(
        &self,
        mut session: Box<dyn StoreSession>,
        task_id: Uuid,
        expected_version: i64,
        details: FailureDetails,
        thought: Option<String>,
    ) -> DomainResult<()> {
        let mut result = JsonMap::new();
        result.insert("failure_details".to_string(), details.to_value());
        if let Some(thought) = thought {
            result.insert("thought".to_string(), Value::String(thought));
        }
        session
            .update_task(
                task_id,
                TaskPatch::default()
                    .status(TaskStatus::Failed)
                    .result(result),
                expected_version,
            )
            .await?;
        session.commit().await?;
        warn!(kind = details.kind.as_str(), "task failed");
        Ok(())
    }

    /// Failure path for callers that no longer hold the lock.
    async fn fail_relocked(
        &self,
        task_id: Uuid,
        expected_version: i64,
        details: FailureDetails,
        thought: Option<String>,
    ) -> DomainResult<()> {
        let mut session = self.gateway.begin().await?;
        match self.relock_at(&mut session, task_id, expected_version).await? {
            Some(current) => {
                self.fail_with(session, task_id, current.version, details, thought)
                    .await
            }
            None => {
                session.rollback().await?;
                Ok(())
            }
        }
    }
}

fn edge_is_active(edge: &Edge, context: &Value) -> bool {
    match &edge.condition {
        None => true,
        Some(condition) => match condition_evaluator::evaluate(condition, context) {
            Ok(active) => active,
            Err(err) => {
                warn!(
                    edge = %edge.id,
                    expression = %condition.expression,
                    error = %err,
                    "condition evaluation failed; edge treated as inactive"
                );
                false
            }
        },
    }
}
