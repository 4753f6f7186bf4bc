//! Test: delegated tasks and their result reports

use crate::helpers::*;
use orchestrator::core::error::FailureInfo;
use orchestrator::core::response::ResponseData;
use orchestrator::dispatch::Delegate;
use orchestrator::events::ResponseEventKind;
use orchestrator::NodeStatus;
use serde_json::json;
use std::sync::Arc;

const SHELL_PLAN: &str = r#"
name: delegated
nodes:
  - id: compile
    step_type: shell
    parameters: { script: "make all", env: { CC: clang } }
"#;

fn engine_with(
    transport: orchestrator::TransportKind,
    delegate: Arc<RecordingDelegate>,
) -> (orchestrator::Engine, EventLog) {
    let counters = Counters::default();
    let log = EventLog::default();
    let engine = builder(transport, &counters, &log)
        .with_delegate(delegate as Arc<dyn Delegate>)
        .build()
        .unwrap();
    (engine, log)
}

#[tokio::test]
async fn test_duplicate_task_result_is_noop() {
    for transport in TRANSPORTS {
        let delegate = Arc::new(RecordingDelegate::default());
        let (engine, log) = engine_with(transport, delegate.clone());

        let plan_id = engine.start_plan(&plan_from_yaml(SHELL_PLAN)).await.unwrap();
        let task = delegate.first_task().await;
        assert_eq!(task.kind, "shell");
        let payload: serde_json::Value = serde_json::from_str(&task.payload).unwrap();
        assert_eq!(payload["script"], "make all");
        assert_eq!(payload["env"]["CC"], "clang");

        engine
            .report_task_result(task.task_id, ResponseData::success(json!({"exit_code": 0})))
            .await
            .unwrap();
        let execution = engine.wait_for_plan(plan_id, WAIT).await.unwrap();
        assert_plan_succeeded(&execution);

        // Second delivery after the node resumed
        engine
            .report_task_result(task.task_id, ResponseData::success(json!({"exit_code": 0})))
            .await
            .unwrap();
        // A report for a task nobody queued
        engine
            .report_task_result(uuid::Uuid::new_v4(), ResponseData::skipped())
            .await
            .unwrap();

        let node = wait_for_node(&engine, plan_id, "compile", |_| true).await;
        assert_eq!(node.status, NodeStatus::Succeeded);
        assert_eq!(node.outcome.unwrap().output, json!({"exit_code": 0}));
        assert_eq!(log.ended_count("compile"), 1);

        let resumes = engine
            .journal()
            .into_iter()
            .filter(|e| e.node_execution_id == node.id && e.kind() == ResponseEventKind::ResumeNodeExecution)
            .count();
        assert_eq!(resumes, 1);
    }
}

#[tokio::test]
async fn test_failed_task_result_fails_node() {
    let delegate = Arc::new(RecordingDelegate::default());
    let (engine, _) = engine_with(orchestrator::TransportKind::Queued, delegate.clone());

    let plan_id = engine.start_plan(&plan_from_yaml(SHELL_PLAN)).await.unwrap();
    let task = delegate.first_task().await;
    engine
        .report_task_result(task.task_id, ResponseData::failure(FailureInfo::step("exit 2")))
        .await
        .unwrap();

    let execution = engine.wait_for_plan(plan_id, WAIT).await.unwrap();
    assert_plan_failed(&execution, "compile");
    let node = wait_for_node(&engine, plan_id, "compile", |_| true).await;
    assert_eq!(node.failure.unwrap().message, "exit 2");
}

#[tokio::test]
async fn test_local_shell_task_runs() {
    let (engine, _, _) = test_engine(orchestrator::TransportKind::Queued);
    let execution = run_yaml(
        &engine,
        r#"
name: local-shell
nodes:
  - id: greet
    step_type: shell
    parameters: { script: "echo hello" }
  - id: broken
    step_type: shell
    depends_on: [greet]
    parameters: { script: "exit 3" }
"#,
    )
    .await;

    assert_plan_failed(&execution, "broken");
    assert_eq!(status_of(&engine, execution.id, "greet").await, NodeStatus::Succeeded);
}
