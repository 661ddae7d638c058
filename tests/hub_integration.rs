//! End-to-end tests of the hub: mutations, optimization tasks and the
//! live channel working together.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cockpit::engine::{
    Envelope, Hub, NewAgent, OptimizerConfig, ResourceKey, StartOptimization, TerminationCause,
};
use cockpit::providers::{Evaluator, Proposal};
use cockpit::storage::StateStore;
use cockpit::{AgentStatus, Evaluation, HubError, PlanetTelemetry, TelemetryReport};

/// Mock evaluator returning a fixed score
struct FixedEvaluator {
    score: f64,
    calls: AtomicUsize,
}

impl FixedEvaluator {
    fn new(score: f64) -> Self {
        Self {
            score,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Evaluator for FixedEvaluator {
    async fn evaluate(&self, artifact: &str, _base_score: f64) -> Result<Proposal> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Proposal {
            text: format!("{} (rev {})", artifact, call + 1),
            evaluation: Evaluation::new(self.score).with_metric("cost", 0.01),
        })
    }
}

/// Mock evaluator that always errors
struct FailingEvaluator;

#[async_trait::async_trait]
impl Evaluator for FailingEvaluator {
    async fn evaluate(&self, _artifact: &str, _base_score: f64) -> Result<Proposal> {
        Err(anyhow!("evaluator offline"))
    }
}

/// Mock evaluator that panics mid-iteration
struct PanickingEvaluator;

#[async_trait::async_trait]
impl Evaluator for PanickingEvaluator {
    async fn evaluate(&self, _artifact: &str, _base_score: f64) -> Result<Proposal> {
        panic!("evaluator bug");
    }
}

fn fast_defaults() -> OptimizerConfig {
    OptimizerConfig {
        interval: Duration::from_millis(5),
        jitter: Duration::from_millis(5),
        ..OptimizerConfig::default()
    }
}

async fn create_hub(evaluator: Arc<dyn Evaluator>) -> Arc<Hub> {
    let hub = Arc::new(Hub::new(Arc::new(StateStore::new()), evaluator, fast_defaults()));
    hub.onboard(NewAgent {
        id: "A1".into(),
        name: "Agent One".into(),
        ..Default::default()
    })
    .await
    .unwrap();
    hub.ingest_telemetry(TelemetryReport {
        agent_id: "A1".into(),
        planets: vec![PlanetTelemetry {
            id: "P1".into(),
            name: Some("Planet One".into()),
            prompt: Some("You are a helpful assistant.".into()),
            score: Some(0.50),
            ..Default::default()
        }],
        payload: None,
    })
    .await
    .unwrap();
    hub
}

fn start_request(threshold: f64) -> StartOptimization {
    StartOptimization {
        agent_id: "A1".into(),
        planet_id: "P1".into(),
        score_threshold: Some(threshold),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_threshold_reached_leaves_deployed_unchanged() {
    let hub = create_hub(Arc::new(FixedEvaluator::new(0.97))).await;
    let before = hub.get_agent("A1").await.unwrap();
    assert_eq!(before.status, AgentStatus::Critical);
    let deployed_id = before.planets[0].deployed_version.id.clone();

    let handle = hub.start_optimization(start_request(0.95)).await.unwrap();
    let cause = handle.finished().await;

    assert_eq!(cause, TerminationCause::ThresholdReached { score: 0.97 });
    assert!(hub.tasks().list_active().await.is_empty());

    let agent = hub.get_agent("A1").await.unwrap();
    let planet = agent.planet("P1").unwrap();
    assert_eq!(planet.deployed_version.id, deployed_id);
    assert_eq!(planet.trace_history.front().unwrap().score(), Some(0.97));
    assert_eq!(agent.status, AgentStatus::Critical);
}

#[tokio::test]
async fn test_at_most_one_task_per_planet() {
    let hub = create_hub(Arc::new(FixedEvaluator::new(0.4))).await;

    let handle = hub.start_optimization(start_request(0.95)).await.unwrap();
    let second = hub.start_optimization(start_request(0.95)).await;
    assert!(matches!(second, Err(HubError::AlreadyRunning(_))));
    assert_eq!(hub.tasks().list_active().await, vec![ResourceKey::new("A1", "P1")]);
    assert_eq!(
        hub.get_agent("A1").await.unwrap().status,
        AgentStatus::Optimizing
    );

    hub.stop_optimization("A1", "P1").await.unwrap();
    assert_eq!(handle.finished().await, TerminationCause::Cancelled);
    assert!(matches!(
        hub.stop_optimization("A1", "P1").await,
        Err(HubError::TaskNotFound(_))
    ));

    let restarted = hub.start_optimization(start_request(0.95)).await.unwrap();
    hub.stop_optimization("A1", "P1").await.unwrap();
    restarted.finished().await;
}

#[tokio::test]
async fn test_delete_agent_with_active_task() {
    let hub = create_hub(Arc::new(FixedEvaluator::new(0.4))).await;
    let mut sub = hub.connect().await;

    let handle = hub.start_optimization(start_request(0.95)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    hub.delete_agent("A1").await.unwrap();

    assert!(hub.tasks().list_active().await.is_empty());
    let cause = handle.finished().await;
    assert!(matches!(
        cause,
        TerminationCause::Cancelled | TerminationCause::ResourceGone
    ));

    // Once the delete broadcast is seen, nothing after it mentions the agent.
    let mut deleted_seen = false;
    while let Some(envelope) = sub.try_recv() {
        let snapshot = envelope.snapshot();
        if !snapshot.agents.contains_key("A1") {
            deleted_seen = true;
        } else {
            assert!(!deleted_seen, "deleted agent reappeared in a broadcast");
        }
        if deleted_seen {
            assert!(snapshot.optimizing_resources.is_empty());
        }
    }
    assert!(deleted_seen);
}

#[tokio::test]
async fn test_evaluator_panic_still_cleans_up() {
    let hub = create_hub(Arc::new(PanickingEvaluator)).await;

    let handle = hub.start_optimization(start_request(0.95)).await.unwrap();
    match handle.finished().await {
        TerminationCause::Failed(_) => {}
        other => panic!("unexpected cause: {}", other),
    }

    assert!(hub.tasks().list_active().await.is_empty());
    assert_eq!(
        hub.get_agent("A1").await.unwrap().status,
        AgentStatus::Critical
    );
}

#[tokio::test]
async fn test_generate_surfaces_evaluator_failure() {
    let hub = create_hub(Arc::new(FailingEvaluator)).await;

    let result = hub.generate_variant("A1", "P1").await;
    assert!(matches!(result, Err(HubError::Evaluator(_))));

    let agent = hub.get_agent("A1").await.unwrap();
    assert!(agent.planets[0].trace_history.is_empty());
}

#[tokio::test]
async fn test_deploy_demotes_previous() {
    let hub = create_hub(Arc::new(FixedEvaluator::new(0.8))).await;
    let original = hub.get_agent("A1").await.unwrap().planets[0]
        .deployed_version
        .clone();

    let first = hub.generate_variant("A1", "P1").await.unwrap();
    let second = hub.generate_variant("A1", "P1").await.unwrap();

    let planet = hub.deploy_variant("A1", "P1", &first.id).await.unwrap();
    assert_eq!(planet.deployed_version.id, first.id);
    assert!(planet.deployed_version.is_deployed);
    assert!(!planet.trace_history.contains(&first.id));
    assert_eq!(planet.trace_history.front().unwrap().id, original.id);
    assert!(planet.trace_history.contains(&second.id));
    assert!(planet.trace_history.iter().all(|v| !v.is_deployed));

    let agent = hub.get_agent("A1").await.unwrap();
    assert_eq!(agent.status, AgentStatus::Stable);
}

#[tokio::test]
async fn test_concurrent_mutations_do_not_lose_updates() {
    let hub = create_hub(Arc::new(FixedEvaluator::new(0.8))).await;

    let mut joins = Vec::new();
    for i in 0..10 {
        let hub = hub.clone();
        joins.push(tokio::spawn(async move {
            hub.ingest_telemetry(TelemetryReport {
                agent_id: "A1".into(),
                planets: vec![PlanetTelemetry {
                    id: format!("P{}", i + 2),
                    score: Some(0.9),
                    ..Default::default()
                }],
                payload: None,
            })
            .await
            .map(|_| ())
        }));
    }
    for _ in 0..5 {
        let hub = hub.clone();
        joins.push(tokio::spawn(async move {
            hub.generate_variant("A1", "P1").await.map(|_| ())
        }));
    }
    for join in joins {
        join.await.unwrap().unwrap();
    }

    let agent = hub.get_agent("A1").await.unwrap();
    assert_eq!(agent.planets.len(), 11);
    assert_eq!(agent.planet("P1").unwrap().trace_history.len(), 5);
}

#[tokio::test]
async fn test_subscriber_sees_init_then_updates_in_order() {
    let hub = create_hub(Arc::new(FixedEvaluator::new(0.8))).await;
    let mut sub = hub.connect().await;

    let init = sub.recv().await.unwrap();
    assert!(matches!(*init, Envelope::Init(_)));

    for status in ["inactive", "active", "inactive"] {
        hub.set_planet_status("A1", "P1", status).await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let update = sub.recv().await.unwrap();
        assert!(matches!(*update, Envelope::Update(_)));
        let planet = update.snapshot().agents["A1"].planet("P1").unwrap().clone();
        seen.push(serde_json::to_value(planet.status).unwrap());
    }
    assert_eq!(seen, vec!["inactive", "active", "inactive"]);
}

#[tokio::test]
async fn test_failed_requests_have_no_side_effect() {
    let hub = create_hub(Arc::new(FixedEvaluator::new(0.8))).await;
    let before = hub.get_agent("A1").await.unwrap();
    let mut sub = hub.connect().await;
    sub.recv().await.unwrap();

    assert!(hub.deploy_variant("A1", "P1", "missing").await.is_err());
    assert!(hub.set_planet_status("A1", "P1", "sleeping").await.is_err());
    assert!(hub.start_optimization(start_request(1.5)).await.is_err());
    assert!(hub
        .ingest_telemetry(TelemetryReport {
            agent_id: "A1".into(),
            planets: vec![PlanetTelemetry {
                id: "P1".into(),
                score: Some(f64::NAN),
                ..Default::default()
            }],
            payload: None,
        })
        .await
        .is_err());

    assert_eq!(hub.get_agent("A1").await.unwrap(), before);
    assert!(sub.try_recv().is_none());
}
