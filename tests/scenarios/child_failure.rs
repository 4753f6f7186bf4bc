//! Test: child outcomes flow back into their parent

use crate::helpers::*;
use orchestrator::core::error::FailureKind;
use orchestrator::NodeStatus;

#[tokio::test]
async fn test_failed_child_fails_parent() {
    for transport in TRANSPORTS {
        let (engine, _, _) = test_engine(transport);
        let execution = run_yaml(
            &engine,
            r#"
name: fanout
nodes:
  - id: fanout
    step_type: parallel
    children: [bad, good]
    parameters: { children: [bad, good] }
  - id: bad
    step_type: fail
    parameters: { message: boom }
  - id: good
    step_type: echo
"#,
        )
        .await;

        assert_plan_failed(&execution, "fanout");
        assert!(
            !execution.failed_nodes.contains(&"bad".to_string()),
            "child nodes are not plan-level failures"
        );

        let parent = wait_for_node(&engine, execution.id, "fanout", |_| true).await;
        assert_eq!(parent.status, NodeStatus::Failed);
        let failure = parent.failure.expect("parent failure");
        assert_eq!(failure.kind, FailureKind::StepExecution);
        assert!(failure.message.contains("1 of 2"), "{}", failure.message);

        let children = engine.children_of(parent.id, false).await.unwrap();
        assert_eq!(children.len(), 2);
        for child in &children {
            let expected = match child.plan_node_id.as_str() {
                "bad" => NodeStatus::Failed,
                _ => NodeStatus::Succeeded,
            };
            assert_eq!(child.status, expected, "{}", child.plan_node_id);
            assert_eq!(child.parent_id, Some(parent.id));
        }
    }
}

#[tokio::test]
async fn test_chain_stops_at_failed_link() {
    let (engine, log, _) = test_engine(orchestrator::TransportKind::Queued);
    let execution = run_yaml(
        &engine,
        r#"
name: chained
nodes:
  - id: release
    step_type: chain
    children: [prepare, publish, announce]
    parameters: { children: [prepare, publish, announce] }
  - id: prepare
    step_type: echo
  - id: publish
    step_type: fail
    parameters: { message: registry down }
  - id: announce
    step_type: echo
"#,
    )
    .await;

    assert_plan_failed(&execution, "release");
    assert_eq!(log.ended_count("prepare"), 1);
    assert_eq!(log.ended_count("publish"), 1);
    assert_eq!(log.ended_count("announce"), 0, "links after a failure never start");

    let parent = wait_for_node(&engine, execution.id, "release", |_| true).await;
    let children = engine.children_of(parent.id, false).await.unwrap();
    let mut started: Vec<&str> = children.iter().map(|c| c.plan_node_id.as_str()).collect();
    started.sort();
    assert_eq!(started, vec!["prepare", "publish"]);
}

#[tokio::test]
async fn test_nested_children_counted() {
    let (engine, _, _) = test_engine(orchestrator::TransportKind::Direct);
    let execution = run_yaml(
        &engine,
        r#"
name: nested
nodes:
  - id: outer
    step_type: parallel
    children: [inner]
    parameters: { children: [inner] }
  - id: inner
    step_type: parallel
    children: [leaf_a, leaf_b]
    parameters: { children: [leaf_a, leaf_b], max_concurrency: 1 }
  - id: leaf_a
    step_type: echo
  - id: leaf_b
    step_type: echo
"#,
    )
    .await;
    assert_plan_succeeded(&execution);

    let outer = wait_for_node(&engine, execution.id, "outer", |_| true).await;
    assert_eq!(engine.children_of(outer.id, false).await.unwrap().len(), 1);
    assert_eq!(engine.children_of(outer.id, true).await.unwrap().len(), 3);

    let counts = engine.count_children_by_status(outer.id).await.unwrap();
    assert_eq!(counts.get(&NodeStatus::Succeeded), Some(&1));
}
