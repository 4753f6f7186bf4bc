//! Test: abort, early end and adviser routing

use crate::helpers::*;
use orchestrator::core::error::FailureKind;
use orchestrator::{NodeStatus, PlanStatus, TransportKind};
use std::time::Duration;

#[tokio::test]
async fn test_abort_plan() {
    for transport in TRANSPORTS {
        let (engine, log, _) = test_engine(transport);
        let plan_id = engine
            .start_plan(&plan_from_yaml(
                r#"
name: abortable
nodes:
  - id: parked
    step_type: gate
  - id: fanout
    step_type: parallel
    children: [inner]
    parameters: { children: [inner] }
  - id: inner
    step_type: gate
  - id: later
    step_type: echo
    depends_on: [parked]
"#,
            ))
            .await
            .unwrap();

        wait_for_node(&engine, plan_id, "parked", |n| n.status == NodeStatus::AsyncWaiting).await;
        wait_for_node(&engine, plan_id, "inner", |n| n.status == NodeStatus::AsyncWaiting).await;

        engine.abort_plan(plan_id).await.unwrap();
        let execution = engine.wait_for_plan(plan_id, WAIT).await.unwrap();
        assert_eq!(execution.status, PlanStatus::Aborted, "{:?}", transport);

        for node in engine.node_executions(plan_id).await.unwrap() {
            assert_eq!(node.status, NodeStatus::Aborted, "{}", node.plan_node_id);
            assert_eq!(node.failure.map(|f| f.kind), Some(FailureKind::Aborted));
        }
        assert_eq!(log.ended_count("later"), 0);
        assert_eq!(log.plan_ended_count(), 1);
    }
}

#[tokio::test]
async fn test_end_stops_remaining_nodes() {
    let (engine, log, _) = test_engine(TransportKind::Queued);
    let plan_id = engine
        .start_plan(&plan_from_yaml(
            r#"
name: early-end
nodes:
  - id: parked
    step_type: gate
  - id: guard
    step_type: fail
    parameters: { message: precondition not met }
    advisers:
      - type: on_failure
        action: end
  - id: after_guard
    step_type: echo
    depends_on: [guard]
"#,
        ))
        .await
        .unwrap();

    let execution = engine.wait_for_plan(plan_id, WAIT).await.unwrap();
    assert_plan_failed(&execution, "guard");
    assert!(
        !execution.failed_nodes.contains(&"parked".to_string()),
        "nodes stopped by the engine are not failures"
    );
    assert_eq!(status_of(&engine, plan_id, "parked").await, NodeStatus::Aborted);
    assert_eq!(log.ended_count("after_guard"), 0);
}

#[tokio::test]
async fn test_end_on_exhausted_retries() {
    let (engine, _, _) = test_engine(TransportKind::Direct);
    let execution = run_yaml(
        &engine,
        r#"
name: end-on-exhausted
nodes:
  - id: gatekeeper
    step_type: fail
    advisers:
      - type: retry
        max_retries: 0
        on_exhausted: end
  - id: skipped_by_end
    step_type: echo
    depends_on: [gatekeeper]
"#,
    )
    .await;

    // END commits the failure the step reported
    assert_eq!(execution.status, PlanStatus::Failed);
    assert!(execution.failed_nodes.contains(&"gatekeeper".to_string()));
}

#[tokio::test]
async fn test_failure_routes_to_fallback() {
    for transport in TRANSPORTS {
        let (engine, log, _) = test_engine(transport);
        let execution = run_yaml(
            &engine,
            r#"
name: fallback-routing
nodes:
  - id: risky
    step_type: fail
    parameters: { message: flaky network }
    advisers:
      - type: on_failure
        action: next_step
        target: fallback
  - id: fallback
    step_type: echo
    depends_on: [risky]
    parameters: { message: recovered }
"#,
        )
        .await;

        assert_plan_failed(&execution, "risky");
        assert_eq!(status_of(&engine, execution.id, "fallback").await, NodeStatus::Succeeded);
        assert_eq!(log.ended_count("fallback"), 1, "{:?}", transport);
    }
}

#[tokio::test]
async fn test_success_routes_next_step_once() {
    let (engine, log, _) = test_engine(TransportKind::Queued);
    let execution = run_yaml(
        &engine,
        r#"
name: success-routing
nodes:
  - id: start
    step_type: echo
    advisers:
      - type: on_success
        next: notify
  - id: notify
    step_type: echo
    depends_on: [start]
"#,
    )
    .await;

    assert_plan_succeeded(&execution);
    assert_eq!(log.ended_count("notify"), 1);
}

#[tokio::test]
async fn test_stage_failure_strategy_applies() {
    let (engine, _, _) = test_engine(TransportKind::Queued);
    let execution = run_yaml(
        &engine,
        r#"
name: stage-strategy
failure_strategy:
  - type: on_failure
    action: ignore
nodes:
  - id: shaky
    step_type: fail
  - id: next
    step_type: echo
    depends_on: [shaky]
"#,
    )
    .await;

    assert_plan_succeeded(&execution);
    assert_eq!(status_of(&engine, execution.id, "next").await, NodeStatus::Succeeded);
}

#[tokio::test]
async fn test_finished_runs_are_pruned_after_retention() {
    let counters = Counters::default();
    let log = EventLog::default();
    let engine = builder(TransportKind::Queued, &counters, &log)
        .with_config(test_config(TransportKind::Queued).with_retention(Duration::from_millis(200)))
        .build()
        .unwrap();

    let finished = run_yaml(
        &engine,
        r#"
name: short-lived
nodes:
  - id: only
    step_type: echo
"#,
    )
    .await;
    assert_plan_succeeded(&finished);

    let running = engine
        .start_plan(&plan_from_yaml(
            r#"
name: long-lived
nodes:
  - id: parked
    step_type: gate
"#,
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(engine.plan_execution(finished.id).is_none(), "finished run kept past retention");
    assert!(engine.plan_execution(running).is_some(), "running plans are never pruned");
}
