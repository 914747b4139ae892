//! End-to-end coordination over the in-process bus with simulated agents.

use serde_json::json;
use std::time::Duration;

use conductor::engine::coordinator::{CoordinationOptions, CoordinationRequest};
use conductor::engine::correlation::Correlator;
use conductor::engine::registry::unregister_message;
use conductor::engine::Orchestrator;
use conductor::simulation::{Behavior, SimulatedAgent, SimulatedAgentHandle};
use conductor::types::message::StatusMetrics;
use conductor::{
    AgentOutcome, AgentRole, AgentStatus, Capability, Config, CoordinationError, CoordinationType,
    Envelope, ExecutionResult, MessageKind, StatusReport, Tier,
};

fn test_config() -> Config {
    Config {
        default_timeout_ms: 500,
        health_probe_timeout_ms: 50,
        specialist_min_capabilities: 2,
        ..Config::default()
    }
}

fn launch(orchestrator: &Orchestrator, agent: SimulatedAgent) -> SimulatedAgentHandle {
    orchestrator.register_agent(agent.descriptor().clone());
    agent.spawn(orchestrator.bus())
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_translate_scenario_end_to_end() {
    let orchestrator = Orchestrator::new(test_config()).unwrap();
    let a = launch(
        &orchestrator,
        SimulatedAgent::new("A", &["translate", "analyze"]).unwrap(),
    );
    let b = launch(&orchestrator, SimulatedAgent::new("B", &["translate"]).unwrap());
    orchestrator
        .registry()
        .update_health("B", |agent| agent.health_score = 80);

    let request = CoordinationRequest::new("translate")
        .with_strategy("capability_based")
        .with_options(CoordinationOptions {
            max_agents: Some(2),
            ..Default::default()
        });

    let plan = orchestrator.coordinator().plan(&request).unwrap();
    assert_eq!(plan.coordination_type, CoordinationType::Parallel);
    let tier = |id: &str| plan.agents.iter().find(|p| p.agent_id == id).unwrap().tier;
    assert_eq!(tier("A"), Tier::Specialist);
    assert_eq!(tier("B"), Tier::Generalist);

    let result = orchestrator.coordinate(request).await.unwrap();
    assert!(result.success);
    assert_eq!(result.fulfilled_count(), 2);
    match &result.results["A"] {
        AgentOutcome::Fulfilled { result } => {
            assert_eq!(result["agent"], "A");
            assert_eq!(result["role"], "primary");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(a.dispatched(), 1);
    assert_eq!(b.dispatched(), 1);
}

#[tokio::test]
async fn test_parallel_records_timeouts_as_data() {
    let orchestrator = Orchestrator::new(test_config()).unwrap();
    let _fast = launch(&orchestrator, SimulatedAgent::new("fast", &["research"]).unwrap());
    let _mute = launch(
        &orchestrator,
        SimulatedAgent::new("mute", &["research"])
            .unwrap()
            .with_behavior(Behavior::Silent),
    );
    let _broken = launch(
        &orchestrator,
        SimulatedAgent::new("broken", &["web_search"])
            .unwrap()
            .with_behavior(Behavior::Fail {
                reason: "quota exceeded".into(),
            }),
    );

    let result: ExecutionResult = orchestrator
        .coordinate(CoordinationRequest::new("research").with_options(CoordinationOptions {
            max_agents: Some(3),
            timeout_ms: Some(100),
            ..Default::default()
        }))
        .await
        .unwrap();

    assert_eq!(result.results.len(), 3);
    assert!(result.success);
    assert!(result.results["fast"].is_fulfilled());
    match &result.results["mute"] {
        AgentOutcome::Rejected { error } => assert!(error.contains("within 100ms")),
        other => panic!("unexpected outcome {:?}", other),
    }
    match &result.results["broken"] {
        AgentOutcome::Rejected { error } => assert!(error.contains("quota exceeded")),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_sequential_dispatches_in_plan_order_and_stops_early() {
    let orchestrator = Orchestrator::new(test_config()).unwrap();
    let s1 = launch(
        &orchestrator,
        SimulatedAgent::new("s1", &["analysis"])
            .unwrap()
            .with_behavior(Behavior::Fail {
                reason: "busy".into(),
            }),
    );
    let s2 = launch(&orchestrator, SimulatedAgent::new("s2", &["analysis"]).unwrap());
    let s3 = launch(&orchestrator, SimulatedAgent::new("s3", &["analysis"]).unwrap());

    let result = orchestrator
        .coordinate(
            CoordinationRequest::new("analysis")
                .with_strategy("round_robin")
                .with_options(CoordinationOptions {
                    coordination_type: Some(CoordinationType::Sequential),
                    max_agents: Some(3),
                    ..Default::default()
                }),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.results.len(), 2);
    assert_eq!((s1.dispatched(), s2.dispatched(), s3.dispatched()), (1, 1, 0));
}

#[tokio::test]
async fn test_structural_errors_reject_the_request() {
    let orchestrator = Orchestrator::new(test_config()).unwrap();
    let _agent = launch(&orchestrator, SimulatedAgent::new("x", &["analysis"]).unwrap());

    let err = orchestrator
        .coordinate(CoordinationRequest::new("translation"))
        .await
        .unwrap_err();
    assert!(err.is_structural());
    assert!(matches!(err, CoordinationError::NoSuitableAgents { .. }));

    let metrics = orchestrator.coordinator().metrics();
    assert_eq!(metrics.requests_failed, 1);
    assert_eq!(metrics.active_coordinations, 0);
}

#[tokio::test]
async fn test_health_sweeps_demote_silent_agents() {
    let orchestrator = Orchestrator::new(test_config()).unwrap();
    let _steady = launch(
        &orchestrator,
        SimulatedAgent::new("steady", &["analysis"])
            .unwrap()
            .with_status(StatusReport {
                status: "active".into(),
                metrics: StatusMetrics {
                    errors: 0,
                    average_response_time: 80.0,
                    load: Some(30.0),
                    queue_size: Some(1),
                },
            }),
    );
    let _mute = launch(
        &orchestrator,
        SimulatedAgent::new("mute", &["analysis"])
            .unwrap()
            .with_behavior(Behavior::Silent),
    );

    for _ in 0..5 {
        orchestrator.health().check_all().await;
    }

    let steady = orchestrator.registry().get("steady").unwrap();
    assert_eq!(steady.health_score, 100);
    assert_eq!(steady.performance_metrics.load, 30.0);

    let mute = orchestrator.registry().get("mute").unwrap();
    assert_eq!(mute.health_score, 0);
    assert_eq!(mute.status, AgentStatus::Unhealthy);

    // Still routable, but ranked behind healthy agents.
    let candidates = orchestrator
        .registry()
        .find_suitable(&Capability::new("analysis").unwrap(), None);
    let ids: Vec<_> = candidates.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["steady", "mute"]);

    // Explicit selection only accepts active agents.
    let explicit = orchestrator.registry().find_suitable(
        &Capability::new("analysis").unwrap(),
        Some(&["mute".to_string(), "steady".to_string()]),
    );
    assert_eq!(explicit.len(), 1);
    assert_eq!(explicit[0].id, "steady");
}

#[tokio::test]
async fn test_bus_clients_get_one_answer_per_request() {
    let orchestrator = Orchestrator::new(test_config()).unwrap();
    orchestrator.start();
    let _worker = launch(
        &orchestrator,
        SimulatedAgent::new("worker", &["summarization"]).unwrap(),
    );

    let client = Correlator::new(orchestrator.bus().clone(), "client");
    let request = Envelope::new(
        MessageKind::CoordinationRequest,
        "client",
        json!({"task_type": "summarization", "priority": "high"}),
    )
    .to("orchestrator");
    let request_id = request.id;

    let reply = client
        .request(request, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(
        reply.metadata.topic,
        Some(format!("coordination.result.{}", request_id))
    );
    let result: ExecutionResult = serde_json::from_value(reply.payload).unwrap();
    assert!(result.success);
    assert_eq!(client.pending_count(), 0);

    orchestrator.shutdown();
}

#[tokio::test]
async fn test_membership_changes_over_the_bus() {
    let orchestrator = Orchestrator::new(test_config()).unwrap();
    orchestrator.start();

    let agent = SimulatedAgent::new("roamer", &["code_review", "orchestration"]).unwrap();
    orchestrator.bus().publish(agent.registration());
    let registry = orchestrator.registry().clone();
    assert!(eventually(|| registry.contains("roamer")).await);

    let plan = orchestrator
        .coordinator()
        .plan(&CoordinationRequest::new("code_review"))
        .unwrap();
    assert_eq!(plan.agents[0].role, AgentRole::Coordinator);

    orchestrator
        .bus()
        .publish(unregister_message("roamer", "roamer"));
    assert!(eventually(|| !registry.contains("roamer")).await);
    assert!(registry
        .routing_table()
        .agents_for(&Capability::new("code_review").unwrap())
        .is_none());

    orchestrator.shutdown();
}
