//! Test: retry advisers

use crate::helpers::*;
use orchestrator::{NodeStatus, TransportKind};

#[tokio::test]
async fn test_sync_failure_retries_as_new_execution() {
    for transport in TRANSPORTS {
        let (engine, log, counters) = test_engine(transport);
        let execution = run_yaml(
            &engine,
            r#"
name: flaky-sync
nodes:
  - id: flaky
    step_type: flaky
    max_retries: 3
  - id: after
    step_type: echo
    depends_on: [flaky]
"#,
        )
        .await;
        assert_plan_succeeded(&execution);
        assert_eq!(counters.flaky_calls(), 3);

        let attempts = executions_of(&engine, execution.id, "flaky").await;
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().map(|n| n.status).collect::<Vec<_>>(),
            vec![NodeStatus::Failed, NodeStatus::Failed, NodeStatus::Succeeded]
        );
        assert_eq!(attempts[0].retried_by, Some(attempts[1].id));
        assert_eq!(attempts[1].retried_by, Some(attempts[2].id));
        assert_eq!(attempts[2].retry_ids, vec![attempts[0].id, attempts[1].id]);
        assert_eq!(attempts[2].retry_index, 2);
        assert_eq!(attempts[2].retry_history.len(), 2);

        let effective = engine.effective_executions(execution.id).await.unwrap();
        let flaky: Vec<_> = effective.iter().filter(|n| n.plan_node_id == "flaky").collect();
        assert_eq!(flaky.len(), 1);
        assert_eq!(flaky[0].id, attempts[2].id);

        assert_eq!(log.ended_count("flaky"), 3);
        assert_eq!(log.ended_count("after"), 1);
    }
}

#[tokio::test]
async fn test_async_failure_retries_in_place() {
    for transport in TRANSPORTS {
        let (engine, _, counters) = test_engine(transport);
        let execution = run_yaml(
            &engine,
            r#"
name: flaky-async
defaults:
  retry_backoff_ms: 5
nodes:
  - id: remote
    step_type: flaky_async
    max_retries: 2
"#,
        )
        .await;
        assert_plan_succeeded(&execution);
        assert_eq!(counters.flaky_async_calls(), 3);

        let attempts = executions_of(&engine, execution.id, "remote").await;
        assert_eq!(attempts.len(), 1, "in-place retries reuse the execution");
        let node = &attempts[0];
        assert_eq!(node.status, NodeStatus::Succeeded);
        assert_eq!(node.retry_count, 2);
        assert_eq!(node.retry_history.len(), 2);
        assert!(node.retry_ids.is_empty());
    }
}

#[tokio::test]
async fn test_retries_exhausted_marks_failure() {
    let (engine, log, _) = test_engine(TransportKind::Queued);
    let execution = run_yaml(
        &engine,
        r#"
name: hopeless
nodes:
  - id: doomed
    step_type: fail
    max_retries: 1
  - id: never
    step_type: echo
    depends_on: [doomed]
"#,
    )
    .await;

    assert_plan_failed(&execution, "doomed");
    assert_eq!(execution.not_run, vec!["never".to_string()]);
    assert_eq!(executions_of(&engine, execution.id, "doomed").await.len(), 2);
    assert_eq!(log.ended_count("never"), 0);
}

#[tokio::test]
async fn test_exhausted_retry_can_ignore_failure() {
    let (engine, _, _) = test_engine(TransportKind::Direct);
    let execution = run_yaml(
        &engine,
        r#"
name: tolerant
nodes:
  - id: optional
    step_type: fail
    advisers:
      - type: retry
        max_retries: 1
        backoff_ms: 0
        on_exhausted: ignore
  - id: next
    step_type: echo
    depends_on: [optional]
"#,
    )
    .await;

    assert_plan_succeeded(&execution);
    assert_eq!(status_of(&engine, execution.id, "optional").await, NodeStatus::Succeeded);
    assert_eq!(status_of(&engine, execution.id, "next").await, NodeStatus::Succeeded);
}

#[tokio::test]
async fn test_retried_child_notifies_parent_once() {
    let (engine, log, counters) = test_engine(TransportKind::Queued);
    let execution = run_yaml(
        &engine,
        r#"
name: retried-child
nodes:
  - id: parent
    step_type: parallel
    children: [flaky]
    parameters: { children: [flaky] }
  - id: flaky
    step_type: flaky
    max_retries: 2
"#,
    )
    .await;

    assert_plan_succeeded(&execution);
    assert_eq!(counters.flaky_calls(), 3);
    assert_eq!(log.ended_count("parent"), 1);

    let parent = wait_for_node(&engine, execution.id, "parent", |_| true).await;
    let counts = engine.count_children_by_status(parent.id).await.unwrap();
    assert_eq!(counts.get(&NodeStatus::Succeeded), Some(&1));
    assert_eq!(counts.get(&NodeStatus::Failed), None, "superseded attempts are not counted");
}

#[tokio::test]
async fn test_in_place_retry_ignores_late_callbacks_of_failed_attempt() {
    for transport in TRANSPORTS {
        let (engine, _, counters) = test_engine(transport);
        let execution = run_yaml(
            &engine,
            r#"
name: racing-retry
defaults:
  retry_backoff_ms: 5
nodes:
  - id: race
    step_type: racing_flaky
    max_retries: 1
"#,
        )
        .await;

        // The first run's late `slow` failure must not consume the second run's wait
        assert_plan_succeeded(&execution);
        assert_eq!(counters.racing_calls(), 2, "{:?}", transport);

        let node = wait_for_node(&engine, execution.id, "race", |_| true).await;
        assert_eq!(node.status, NodeStatus::Succeeded);
        assert_eq!(node.retry_count, 1);
        assert_eq!(node.responses.len(), 1);
        assert!(node.responses.contains_key("fast"));
        assert_eq!(node.outcome.unwrap().output["fast"]["call"], 2);
    }
}
