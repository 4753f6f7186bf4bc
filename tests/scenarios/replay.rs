//! Test: re-applying delivered response events changes nothing

use crate::helpers::*;
use orchestrator::core::response::ResponseData;
use orchestrator::{NodeExecution, NodeStatus};
use serde_json::json;

fn snapshot(mut nodes: Vec<NodeExecution>) -> Vec<(uuid::Uuid, NodeStatus, u64)> {
    nodes.sort_by_key(|n| n.id);
    nodes.into_iter().map(|n| (n.id, n.status, n.version)).collect()
}

#[tokio::test]
async fn test_replaying_journal_is_idempotent() {
    for transport in TRANSPORTS {
        let (engine, log, _) = test_engine(transport);
        let execution = run_yaml(
            &engine,
            r#"
name: replay
nodes:
  - id: fanout
    step_type: parallel
    children: [first, second]
    parameters: { children: [first, second] }
  - id: first
    step_type: wait
    parameters: { millis: 5, callbacks: 2 }
  - id: second
    step_type: echo
  - id: last
    step_type: flaky
    depends_on: [fanout]
    max_retries: 3
"#,
        )
        .await;
        assert_plan_succeeded(&execution);

        let before = snapshot(engine.node_executions(execution.id).await.unwrap());
        let journal = engine.journal();
        let events_before = log.events().len();
        assert!(!journal.is_empty());

        for event in journal.iter().cloned() {
            engine.apply(event).await.unwrap();
        }

        let after = snapshot(engine.node_executions(execution.id).await.unwrap());
        assert_eq!(before, after, "replay changed node state ({:?})", transport);
        assert_eq!(engine.journal().len(), journal.len());
        assert_eq!(log.events().len(), events_before, "replay published lifecycle events");
    }
}

#[tokio::test]
async fn test_duplicate_callback_while_waiting() {
    let (engine, log, _) = test_engine(orchestrator::TransportKind::Queued);
    let plan_id = engine
        .start_plan(&plan_from_yaml(
            r#"
name: duplicate-callback
nodes:
  - id: gate
    step_type: gate
"#,
        ))
        .await
        .unwrap();

    let node = wait_for_node(&engine, plan_id, "gate", |n| n.status == NodeStatus::AsyncWaiting).await;
    engine
        .notify_callback(node.id, GATE, ResponseData::success(json!(1)))
        .await
        .unwrap();
    engine
        .notify_callback(node.id, GATE, ResponseData::success(json!(2)))
        .await
        .unwrap();
    // Unknown callback ids are ignored
    engine
        .notify_callback(node.id, "stranger", ResponseData::success(json!(3)))
        .await
        .unwrap();

    let execution = engine.wait_for_plan(plan_id, WAIT).await.unwrap();
    assert_plan_succeeded(&execution);
    let node = engine.node_execution(node.id).await.unwrap();
    assert_eq!(node.outcome.unwrap().output, json!({ "gate": 1 }));
    assert_eq!(log.ended_count("gate"), 1);
}

#[tokio::test]
async fn test_journal_keeps_most_recent_events() {
    let counters = Counters::default();
    let log = EventLog::default();
    let engine = builder(orchestrator::TransportKind::Direct, &counters, &log)
        .with_config(test_config(orchestrator::TransportKind::Direct).with_journal_capacity(4))
        .build()
        .unwrap();

    let execution = run_yaml(
        &engine,
        r#"
name: capped-journal
nodes:
  - id: one
    step_type: echo
  - id: two
    step_type: echo
    depends_on: [one]
  - id: three
    step_type: echo
    depends_on: [two]
"#,
    )
    .await;
    assert_plan_succeeded(&execution);

    let journal = engine.journal();
    assert_eq!(journal.len(), 4);
    let three = wait_for_node(&engine, execution.id, "three", |_| true).await;
    assert_eq!(
        journal.last().map(|e| e.node_execution_id),
        Some(three.id),
        "the newest event survives the cap"
    );
}
