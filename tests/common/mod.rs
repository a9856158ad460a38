//! Shared harness for engine integration tests: in-memory store and broker
//! wired to a real processor, with scripted agent and tool runtimes.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use synapse_engine::adapters::{InMemoryBroker, InMemoryGateway};
use synapse_engine::domain::errors::DomainResult;
use synapse_engine::domain::models::{
    AgentResult, FailureKind, Intent, JsonMap, QueueMessage, ToolResult,
};
use synapse_engine::domain::ports::{
    AgentCapability, AgentInvocation, AgentRole, AgentRuntime, BrokerQueue, CapabilityRegistry,
    ToolRuntime,
};
use synapse_engine::services::{RetryPolicy, TaskProcessor};

pub const QUEUE: &str = "task_execution_queue";

/// Agent runtime driven by per-agent scripts. Each invocation consumes the
/// next scripted result; agents without a script complete immediately so
/// fan-out targets quiesce without extra setup.
#[derive(Default)]
pub struct ScriptedAgents {
    scripts: Mutex<HashMap<String, VecDeque<AgentResult>>>,
    invocations: Mutex<Vec<AgentInvocation>>,
}

impl ScriptedAgents {
    pub fn script(&self, agent_id: &str, results: Vec<AgentResult>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(agent_id.to_string())
            .or_default()
            .extend(results);
    }

    pub fn invocations_of(&self, agent_id: &str) -> Vec<AgentInvocation> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|invocation| invocation.agent_id == agent_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedAgents {
    async fn invoke(&self, invocation: AgentInvocation) -> DomainResult<AgentResult> {
        self.invocations.lock().unwrap().push(invocation.clone());
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&invocation.agent_id)
            .and_then(VecDeque::pop_front);
        Ok(next.unwrap_or(AgentResult::Success {
            thought: None,
            intent: Intent::FinalAnswer {
                content: Value::Object(JsonMap::new()),
            },
        }))
    }
}

/// Tool runtime with fixed per-tool results and call counting.
#[derive(Default)]
pub struct ScriptedTools {
    results: Mutex<HashMap<String, ToolResult>>,
    calls: AtomicU32,
}

impl ScriptedTools {
    pub fn script(&self, tool_id: &str, result: ToolResult) {
        self.results
            .lock()
            .unwrap()
            .insert(tool_id.to_string(), result);
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolRuntime for ScriptedTools {
    async fn invoke(&self, tool_id: &str, _arguments: &JsonMap) -> DomainResult<ToolResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.results.lock().unwrap().get(tool_id).cloned();
        Ok(result.unwrap_or_else(|| {
            ToolResult::failure("UNKNOWN_TOOL", format!("no script for tool '{tool_id}'"))
        }))
    }
}

/// Registry where named agents are planners and everyone else is a worker.
#[derive(Default)]
pub struct StaticRegistry {
    planners: Vec<String>,
}

impl StaticRegistry {
    pub fn with_planners(planners: &[&str]) -> Self {
        Self {
            planners: planners.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl CapabilityRegistry for StaticRegistry {
    async fn get_agent(&self, agent_id: &str) -> DomainResult<Option<AgentCapability>> {
        let role = if self.planners.iter().any(|p| p == agent_id) {
            AgentRole::Planner
        } else {
            AgentRole::Worker
        };
        Ok(Some(AgentCapability { role }))
    }
}

pub struct Harness {
    pub gateway: Arc<InMemoryGateway>,
    pub broker: Arc<InMemoryBroker>,
    pub agents: Arc<ScriptedAgents>,
    pub tools: Arc<ScriptedTools>,
    pub processor: Arc<TaskProcessor>,
}

impl Harness {
    pub fn new(planners: &[&str]) -> Self {
        let gateway = Arc::new(InMemoryGateway::new());
        let broker = Arc::new(InMemoryBroker::new());
        gateway.attach_feed(broker.clone(), QUEUE);

        let agents = Arc::new(ScriptedAgents::default());
        let tools = Arc::new(ScriptedTools::default());
        let processor = Arc::new(TaskProcessor::new(
            gateway.clone(),
            agents.clone(),
            tools.clone(),
            Arc::new(StaticRegistry::with_planners(planners)),
            RetryPolicy::new(2, 1, 10),
            Duration::from_secs(5),
        ));

        Self {
            gateway,
            broker,
            agents,
            tools,
            processor,
        }
    }

    /// Pump the queue until it is empty, processing each dispatched id the
    /// way a worker would. Panics if the workflow does not quiesce.
    pub async fn drain(&self) {
        let mut hops = 0;
        while let Some(payload) = self
            .broker
            .pop(QUEUE, Duration::from_millis(5))
            .await
            .expect("in-memory pop cannot fail")
        {
            let message = QueueMessage::decode(&payload).expect("well-formed payload");
            self.processor
                .process(message.task_id)
                .await
                .expect("processing returns Ok for expected outcomes");

            hops += 1;
            assert!(hops < 200, "workflow did not quiesce after {hops} dispatches");
        }
    }
}

/// Assert the engine-side failure taxonomy entry on a failed task result.
pub fn assert_failure_kind(result: &JsonMap, kind: FailureKind) {
    let details = result
        .get("failure_details")
        .and_then(Value::as_object)
        .unwrap_or_else(|| panic!("missing failure_details in {result:?}"));
    assert_eq!(details.get("type").and_then(Value::as_str), Some(kind.as_str()));
}
