//! Test: waits past their deadline fail the node

use crate::helpers::*;
use orchestrator::core::error::FailureKind;
use orchestrator::dispatch::Delegate;
use orchestrator::{NodeStatus, TransportKind};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_task_timeout_fails_node() {
    let delegate = Arc::new(RecordingDelegate::default());
    let counters = Counters::default();
    let log = EventLog::default();
    let engine = builder(TransportKind::Queued, &counters, &log)
        .with_delegate(delegate.clone() as Arc<dyn Delegate>)
        .build()
        .unwrap();

    let execution = run_yaml(
        &engine,
        r#"
name: silent-delegate
nodes:
  - id: hang
    step_type: shell
    timeout_secs: 1
    parameters: { script: "sleep 600" }
"#,
    )
    .await;

    assert_plan_failed(&execution, "hang");
    let node = wait_for_node(&engine, execution.id, "hang", |_| true).await;
    assert_eq!(node.status, NodeStatus::Failed);
    assert_eq!(node.failure.unwrap().kind, FailureKind::Timeout);

    let task_ids = delegate.task_ids();
    assert_eq!(task_ids.len(), 1);
    assert_eq!(delegate.cancelled(), task_ids, "expired task is cancelled remotely");

    // A late result after the deadline changes nothing
    engine
        .report_task_result(task_ids[0], orchestrator::core::response::ResponseData::skipped())
        .await
        .unwrap();
    assert_eq!(status_of(&engine, execution.id, "hang").await, NodeStatus::Failed);
}

#[tokio::test]
async fn test_async_timeout_fails_node() {
    for transport in TRANSPORTS {
        let (engine, log, _) = test_engine(transport);
        let execution = run_yaml(
            &engine,
            r#"
name: slow-callback
nodes:
  - id: slow
    step_type: wait
    parameters: { millis: 5000, timeout_secs: 1 }
"#,
        )
        .await;

        assert_plan_failed(&execution, "slow");
        let node = wait_for_node(&engine, execution.id, "slow", |_| true).await;
        assert_eq!(node.failure.unwrap().kind, FailureKind::Timeout);
        assert_eq!(log.ended_count("slow"), 1);
    }
}

#[tokio::test]
async fn test_plan_default_timeout_applies() {
    let (engine, _, _) = test_engine(TransportKind::Direct);
    let execution = run_yaml(
        &engine,
        r#"
name: default-timeout
defaults:
  timeout_secs: 1
nodes:
  - id: parked
    step_type: gate
"#,
    )
    .await;

    assert_plan_failed(&execution, "parked");
}

#[tokio::test]
async fn test_delegate_timeout_report_fails_node() {
    // Sweeper too slow to win; the local pool's own timeout report must fail the node
    let counters = Counters::default();
    let log = EventLog::default();
    let engine = builder(TransportKind::Queued, &counters, &log)
        .with_config(test_config(TransportKind::Queued).with_timeout_sweep_interval(Duration::from_secs(30)))
        .build()
        .unwrap();

    let execution = run_yaml(
        &engine,
        r#"
name: local-timeout
nodes:
  - id: sleepy
    step_type: shell
    timeout_secs: 1
    parameters: { script: "sleep 5" }
    advisers:
      - type: on_failure
        action: ignore
"#,
    )
    .await;

    assert_plan_failed(&execution, "sleepy");
    let node = wait_for_node(&engine, execution.id, "sleepy", |_| true).await;
    assert_eq!(node.status, NodeStatus::Failed);
    assert_eq!(node.failure.unwrap().kind, FailureKind::Timeout);
    assert!(node.outcome.is_none(), "advisers are not consulted on a timeout");
}
