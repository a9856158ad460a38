//! Concurrency properties: row locks arbitrate between workers, and the
//! version CAS discards stale outcomes from duplicate dispatches.

mod common;

use serde_json::json;
use uuid::Uuid;

use common::Harness;
use synapse_engine::domain::models::{AgentResult, Intent, NewTask, TaskStatus, ToolResult};
use synapse_engine::domain::ports::{PersistenceGateway, StoreSession};

#[tokio::test]
async fn test_lock_contention_one_worker_advances() {
    let harness = Harness::new(&[]);
    harness.agents.script(
        "Echo",
        vec![AgentResult::Success {
            thought: None,
            intent: Intent::FinalAnswer {
                content: json!({"echo": "hi"}),
            },
        }],
    );

    let task_id = harness
        .gateway
        .create_task(NewTask::new(Uuid::new_v4(), "Agent:Echo"))
        .await
        .unwrap();

    // Worker A holds the row lock.
    let mut holder = harness.gateway.begin().await.unwrap();
    holder.lock_task(task_id).await.unwrap();

    // Worker B receives the same task id, observes the miss, and returns
    // silently: no mutation, no agent invocation.
    harness.processor.process(task_id).await.unwrap();
    assert!(harness.agents.invocations_of("Echo").is_empty());
    let task = harness.gateway.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.version, 1);

    // Lock released: the next delivery advances the task normally.
    holder.rollback().await.unwrap();
    harness.drain().await;

    let task = harness.gateway.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(harness.agents.invocations_of("Echo").len(), 1);
}

#[tokio::test]
async fn test_concurrent_workers_commit_exactly_one_outcome() {
    let harness = Harness::new(&[]);
    // Two scripted results: if both racing workers invoke the agent, each
    // consumes one, but only a single COMPLETED commit may land.
    harness.agents.script(
        "Racer",
        vec![
            AgentResult::Success {
                thought: None,
                intent: Intent::FinalAnswer {
                    content: json!({"winner": "first"}),
                },
            },
            AgentResult::Success {
                thought: None,
                intent: Intent::FinalAnswer {
                    content: json!({"winner": "second"}),
                },
            },
        ],
    );

    let task_id = harness
        .gateway
        .create_task(NewTask::new(Uuid::new_v4(), "Agent:Racer"))
        .await
        .unwrap();

    let first = harness.processor.clone();
    let second = harness.processor.clone();
    let (a, b) = tokio::join!(first.process(task_id), second.process(task_id));
    a.unwrap();
    b.unwrap();

    let task = harness.gateway.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    // Exactly one COMPLETED history row regardless of how the race unfolded.
    let history = harness.gateway.get_task_history(task_id).await.unwrap();
    let completed_rows = history
        .iter()
        .filter(|record| record.snapshot["status"] == json!("COMPLETED"))
        .count();
    assert_eq!(completed_rows, 1);

    // Versions stay strictly increasing and contiguous.
    let versions: Vec<i64> = history.iter().map(|r| r.version_number).collect();
    let mut expected = versions.clone();
    expected.sort_unstable();
    expected.dedup();
    assert_eq!(versions, expected, "history versions must not repeat");
}

#[tokio::test]
async fn test_replayed_event_does_not_rerun_tool() {
    let harness = Harness::new(&[]);
    harness.agents.script(
        "Weather",
        vec![
            AgentResult::Success {
                thought: None,
                intent: Intent::ToolCallRequest {
                    tool_id: "search_weather".to_string(),
                    arguments: Default::default(),
                },
            },
            AgentResult::Success {
                thought: None,
                intent: Intent::FinalAnswer {
                    content: json!("done"),
                },
            },
        ],
    );
    harness
        .tools
        .script("search_weather", ToolResult::success(json!({"temperature": 25})));

    let task_id = harness
        .gateway
        .create_task(NewTask::new(Uuid::new_v4(), "Agent:Weather"))
        .await
        .unwrap();

    harness.drain().await;
    assert_eq!(harness.tools.call_count(), 1);

    // Replaying stale deliveries for the now-terminal task is a no-op.
    harness.processor.process(task_id).await.unwrap();
    harness.processor.process(task_id).await.unwrap();
    assert_eq!(harness.tools.call_count(), 1);

    let task = harness.gateway.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_terminal_tasks_are_dropped_silently() {
    let harness = Harness::new(&[]);
    harness.agents.script(
        "Flaky",
        vec![AgentResult::Failure {
            details: synapse_engine::domain::models::FailureDetails::new(
                synapse_engine::domain::models::FailureKind::ValidationError,
                "bad input",
            ),
            thought: None,
        }],
    );

    let task_id = harness
        .gateway
        .create_task(NewTask::new(Uuid::new_v4(), "Agent:Flaky"))
        .await
        .unwrap();
    harness.drain().await;

    let failed = harness.gateway.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    let version_before = failed.version;

    // Redelivery of a terminal task mutates nothing.
    harness.processor.process(task_id).await.unwrap();
    let after = harness.gateway.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(after.version, version_before);
    assert_eq!(after.status, TaskStatus::Failed);
}
