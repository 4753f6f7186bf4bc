//! Test: startup configuration errors

use crate::helpers::*;
use orchestrator::core::config::PlanConfig;
use orchestrator::step::builtin::EchoStep;
use orchestrator::{Engine, EngineError, StepRegistry, TransportKind};

#[test]
fn test_duplicate_step_type_is_configuration_error() {
    let result = StepRegistry::builder()
        .register("deploy", EchoStep)
        .and_then(|b| b.register("deploy", EchoStep));

    match result {
        Err(EngineError::Configuration(message)) => assert!(message.contains("deploy")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("duplicate registration accepted"),
    }
}

#[test]
fn test_builtin_names_cannot_be_reused() {
    let result = orchestrator::step::builtin::register_all(StepRegistry::builder())
        .and_then(|b| b.register("echo", EchoStep));
    assert!(matches!(result, Err(EngineError::Configuration(_))));
}

#[tokio::test]
async fn test_unregistered_step_type_rejected() {
    let engine = Engine::builder()
        .with_config(test_config(TransportKind::Queued))
        .build()
        .unwrap();

    let config = plan_from_yaml(
        r#"
name: unknown-steps
nodes:
  - id: a
    step_type: teleport
  - id: b
    step_type: echo
  - id: c
    step_type: beam
"#,
    );

    match engine.start_plan(&config).await {
        Err(EngineError::Configuration(message)) => {
            assert!(message.contains("beam, teleport"), "{}", message);
        }
        other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_invalid_plan_rejected() {
    let cyclic = PlanConfig::from_yaml(
        r#"
name: cyclic
nodes:
  - id: a
    step_type: echo
    depends_on: [b]
  - id: b
    step_type: echo
    depends_on: [a]
"#,
    );
    assert!(matches!(cyclic, Err(EngineError::Configuration(_))));

    let undeclared_child = PlanConfig::from_yaml(
        r#"
name: undeclared
nodes:
  - id: parent
    step_type: parallel
    children: [ghost]
"#,
    );
    assert!(matches!(undeclared_child, Err(EngineError::Configuration(_))));
}
