//! Test: async joins and races

use crate::helpers::*;
use orchestrator::NodeStatus;
use serde_json::Value;

#[tokio::test]
async fn test_join_waits_for_every_callback() {
    for transport in TRANSPORTS {
        let (engine, _, _) = test_engine(transport);
        let execution = run_yaml(
            &engine,
            r#"
name: join
nodes:
  - id: join
    step_type: wait
    parameters: { millis: 5, callbacks: 3, wait: all }
"#,
        )
        .await;
        assert_plan_succeeded(&execution);

        let node = wait_for_node(&engine, execution.id, "join", |_| true).await;
        assert_eq!(node.resolved_callbacks.len(), 3);
        let Value::Object(output) = node.outcome.unwrap().output else {
            panic!("join output is not a map");
        };
        assert_eq!(output.len(), 3);
    }
}

#[tokio::test]
async fn test_race_resumes_on_first_callback() {
    for transport in TRANSPORTS {
        let (engine, log, _) = test_engine(transport);
        let execution = run_yaml(
            &engine,
            r#"
name: race
nodes:
  - id: race
    step_type: wait
    parameters: { millis: 20, callbacks: 3, wait: any }
"#,
        )
        .await;
        assert_plan_succeeded(&execution);

        let node = wait_for_node(&engine, execution.id, "race", |_| true).await;
        assert_eq!(node.responses.len(), 1);
        assert!(node.responses.contains_key(&format!("{}-attempt0-timer-0", node.id)));

        // Let the slower timers fire against the finished node
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let node = engine.node_execution(node.id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Succeeded);
        assert_eq!(node.responses.len(), 1);
        assert_eq!(log.ended_count("race"), 1);
    }
}

#[tokio::test]
async fn test_failed_callback_fails_node() {
    let (engine, _, _) = test_engine(orchestrator::TransportKind::Queued);
    let execution = run_yaml(
        &engine,
        r#"
name: failing-callbacks
nodes:
  - id: sensor
    step_type: wait
    parameters: { millis: 5, callbacks: 2, fail: true }
"#,
    )
    .await;

    assert_plan_failed(&execution, "sensor");
    let node = wait_for_node(&engine, execution.id, "sensor", |_| true).await;
    assert!(node.failure.unwrap().message.contains("2 of 2"));
}
