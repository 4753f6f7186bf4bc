//! Test: independent siblings complete in any order

use crate::helpers::*;
use orchestrator::core::response::ResponseData;
use orchestrator::{NodeStatus, PlanStatus};
use serde_json::json;

const SIBLINGS: &str = r#"
name: siblings
nodes:
  - id: a
    step_type: gate
  - id: b
    step_type: gate
  - id: c
    step_type: gate
"#;

#[tokio::test]
async fn test_siblings_complete_out_of_order() {
    for transport in TRANSPORTS {
        let (engine, log, _) = test_engine(transport);
        let plan_id = engine.start_plan(&plan_from_yaml(SIBLINGS)).await.unwrap();

        for id in ["a", "b", "c"] {
            wait_for_node(&engine, plan_id, id, |n| n.status == NodeStatus::AsyncWaiting).await;
        }
        let nodes = engine.node_executions(plan_id).await.unwrap();
        assert_eq!(nodes.len(), 3);

        for id in ["c", "a"] {
            open_gate(&engine, plan_id, id, ResponseData::success(json!(id))).await;
            wait_for_node(&engine, plan_id, id, |n| n.status == NodeStatus::Succeeded).await;
            assert_eq!(
                engine.plan_execution(plan_id).unwrap().status,
                PlanStatus::Running,
                "plan settled before every sibling finished ({:?})",
                transport
            );
        }

        open_gate(&engine, plan_id, "b", ResponseData::success(json!("b"))).await;
        let execution = engine.wait_for_plan(plan_id, WAIT).await.unwrap();
        assert_plan_succeeded(&execution);

        for id in ["a", "b", "c"] {
            assert_eq!(status_of(&engine, plan_id, id).await, NodeStatus::Succeeded);
            assert_eq!(log.ended_count(id), 1);
        }
        assert_eq!(log.plan_ended_count(), 1);
    }
}

#[tokio::test]
async fn test_dependencies_run_in_order() {
    let (engine, log, _) = test_engine(orchestrator::TransportKind::Queued);
    let execution = run_yaml(
        &engine,
        r#"
name: ordered
nodes:
  - id: build
    step_type: echo
    parameters: { message: built }
  - id: test
    step_type: echo
    depends_on: [build]
  - id: deploy
    step_type: echo
    depends_on: [test]
"#,
    )
    .await;
    assert_plan_succeeded(&execution);

    let started: Vec<String> = log
        .events()
        .into_iter()
        .filter_map(|e| match e {
            orchestrator::OrchestrationEvent::NodeStarted { plan_node_id, .. } => Some(plan_node_id),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["build", "test", "deploy"]);
}

#[tokio::test]
async fn test_summary_tracks_progress() {
    let (engine, _, _) = test_engine(orchestrator::TransportKind::Direct);
    let execution = run_yaml(
        &engine,
        r#"
name: summary
nodes:
  - id: one
    step_type: echo
  - id: two
    step_type: echo
    parameters: { skip: true }
"#,
    )
    .await;
    assert_plan_succeeded(&execution);
    assert_eq!(
        status_of(&engine, execution.id, "two").await,
        NodeStatus::Succeeded,
        "a skip reported from EXECUTING commits as success"
    );

    let summary = engine.summary(execution.id).unwrap();
    assert_eq!(summary.status, PlanStatus::Succeeded);
    assert_eq!(summary.total_nodes, 2);
    assert_eq!(summary.completed_nodes, 2);
    assert_eq!(summary.failed_nodes, 0);
    assert!((summary.progress - 1.0).abs() < f64::EPSILON);
}
