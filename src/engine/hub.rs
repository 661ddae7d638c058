use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::broadcast::{Subscription, SubscriptionId};
use crate::engine::publisher::{Publisher, SharedEnvelope, StateSnapshot};
use crate::engine::tasks::{OptimizerConfig, TaskHandle, TaskManager, TaskRegistry};
use crate::error::{HubError, Result};
use crate::providers::Evaluator;
use crate::storage::{seed, StateStore};
use crate::types::{
    Agent, Evaluation, Planet, PlanetStatus, PlanetTelemetry, TelemetryEndpoint,
    TelemetryReport, Variant, PRIMARY_PLANET_ID, PRIMARY_PLANET_NAME,
};

/// Everything needed to onboard an agent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAgent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub opik_metrics: Vec<String>,
    #[serde(default)]
    pub position: Value,
    #[serde(default)]
    pub theme: Value,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Parameters of an optimization start request.
#[derive(Debug, Clone, Default)]
pub struct StartOptimization {
    pub agent_id: String,
    pub planet_id: String,
    pub optimizer: Option<String>,
    pub score_threshold: Option<f64>,
}

/// The mutation and query surface used by the transport layer.
///
/// Every mutation goes through a single store mutation (directly or via the
/// task manager) and, except for position updates, ends in one broadcast.
pub struct Hub {
    store: Arc<StateStore>,
    publisher: Arc<Publisher>,
    tasks: TaskManager,
    evaluator: Arc<dyn Evaluator>,
    defaults: OptimizerConfig,
}

impl Hub {
    pub fn new(
        store: Arc<StateStore>,
        evaluator: Arc<dyn Evaluator>,
        defaults: OptimizerConfig,
    ) -> Self {
        let registry = TaskRegistry::default();
        let publisher = Arc::new(Publisher::new(store.clone(), registry.clone()));
        let tasks = TaskManager::new(
            store.clone(),
            registry,
            publisher.clone(),
            evaluator.clone(),
        );
        Self {
            store,
            publisher,
            tasks,
            evaluator,
            defaults,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub async fn seed(&self, agents: Vec<Agent>) -> usize {
        let count = seed::seed(&self.store, agents).await;
        info!(count, "Agents seeded");
        self.publisher.publish().await;
        count
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.publisher.snapshot().await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        self.store.get(agent_id).await
    }

    pub async fn connect(&self) -> Subscription<SharedEnvelope> {
        let subscription = self.publisher.connect().await;
        info!(
            subscriber = subscription.id,
            total = self.publisher.subscriber_count(),
            "Observer connected"
        );
        subscription
    }

    pub fn disconnect(&self, id: SubscriptionId) {
        if self.publisher.disconnect(id) {
            info!(subscriber = id, "Observer disconnected");
        }
    }

    pub async fn onboard(&self, request: NewAgent) -> Result<Agent> {
        let id = request.id.trim();
        let name = request.name.trim();
        if id.is_empty() {
            return Err(HubError::validation("id is required"));
        }
        if name.is_empty() {
            return Err(HubError::validation("name is required"));
        }

        let mut agent = Agent::new(id, name);
        agent.position = request.position;
        agent.theme = request.theme;
        agent.config = request.config;
        if !request.opik_metrics.is_empty() {
            agent.config.insert(
                "evaluationMetrics".to_string(),
                Value::from(request.opik_metrics),
            );
        }
        agent.telemetry = request
            .api_url
            .filter(|url| !url.trim().is_empty())
            .map(|api_url| TelemetryEndpoint {
                api_url,
                auth_token: request.auth_token.filter(|t| !t.is_empty()),
            });

        self.store.insert(agent.clone()).await?;
        info!(agent_id = %agent.id, name = %agent.name, "Agent onboarded");
        self.publisher.publish().await;
        Ok(agent)
    }

    /// Cancels the agent's tasks, removes it, then broadcasts.
    pub async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        if !self.store.contains(agent_id).await {
            return Err(HubError::AgentNotFound(agent_id.to_string()));
        }

        let cancelled = self.tasks.cancel_agent_tasks(agent_id).await;
        if !self.store.delete(agent_id).await {
            return Err(HubError::AgentNotFound(agent_id.to_string()));
        }
        info!(agent_id, cancelled_tasks = cancelled.len(), "Agent deleted");
        self.publisher.publish().await;
        Ok(())
    }

    /// Updates the opaque position. Observers are not notified.
    pub async fn update_position(&self, agent_id: &str, position: Value) -> Result<()> {
        if position.is_null() {
            return Err(HubError::validation("position is required"));
        }
        self.store
            .mutate(agent_id, |agent| {
                agent.position = position;
                Ok(())
            })
            .await
    }

    pub async fn update_metric_mapping(
        &self,
        agent_id: &str,
        mapping: Map<String, Value>,
    ) -> Result<Agent> {
        if let Some((key, _)) = mapping.iter().find(|(_, v)| !v.is_string()) {
            return Err(HubError::validation(format!(
                "metric mapping for '{}' must be a metric name",
                key
            )));
        }

        let agent = self
            .store
            .mutate(agent_id, |agent| {
                agent
                    .config
                    .insert("metricMapping".to_string(), Value::Object(mapping));
                Ok(agent.clone())
            })
            .await?;
        self.publisher.publish().await;
        Ok(agent)
    }

    pub async fn set_planet_status(
        &self,
        agent_id: &str,
        planet_id: &str,
        status: &str,
    ) -> Result<Planet> {
        let status = PlanetStatus::parse(status).ok_or_else(|| {
            HubError::validation(format!(
                "status must be 'active' or 'inactive', got '{}'",
                status
            ))
        })?;

        let planet = self
            .store
            .mutate(agent_id, |agent| {
                let planet = agent
                    .planet_mut(planet_id)
                    .ok_or_else(|| HubError::planet_not_found(agent_id, planet_id))?;
                planet.status = status;
                Ok(planet.clone())
            })
            .await?;
        self.publisher.publish().await;
        Ok(planet)
    }

    pub async fn ingest_telemetry(&self, report: TelemetryReport) -> Result<Agent> {
        let planets = report.planet_reports()?;
        let agent = self
            .tasks
            .mutate_agent(&report.agent_id, |agent| {
                for observed in planets {
                    apply_telemetry(agent, observed);
                }
                Ok(())
            })
            .await?;

        info!(
            agent_id = %agent.id,
            planets = agent.planets.len(),
            status = agent.status.as_str(),
            "Telemetry ingested"
        );
        self.publisher.publish().await;
        Ok(agent)
    }

    pub async fn start_optimization(&self, request: StartOptimization) -> Result<TaskHandle> {
        if request.agent_id.trim().is_empty() || request.planet_id.trim().is_empty() {
            return Err(HubError::validation("agent_id and planet_id are required"));
        }
        let mut config = self.defaults.clone();
        if let Some(optimizer) = request.optimizer.filter(|o| !o.trim().is_empty()) {
            config.optimizer = optimizer;
        }
        if let Some(threshold) = request.score_threshold {
            if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
                return Err(HubError::validation(
                    "score_threshold must be between 0 and 1",
                ));
            }
            config.score_threshold = threshold;
        }

        self.tasks
            .start(&request.agent_id, &request.planet_id, config)
            .await
    }

    pub async fn stop_optimization(&self, agent_id: &str, planet_id: &str) -> Result<()> {
        if agent_id.trim().is_empty() || planet_id.trim().is_empty() {
            return Err(HubError::validation("agent_id and planet_id are required"));
        }
        self.tasks.stop(agent_id, planet_id).await
    }

    /// One synchronous evaluator round-trip; the result lands in history.
    pub async fn generate_variant(&self, agent_id: &str, planet_id: &str) -> Result<Variant> {
        let agent = self.store.get(agent_id).await?;
        let planet = agent
            .planet(planet_id)
            .ok_or_else(|| HubError::planet_not_found(agent_id, planet_id))?;

        let proposal = self
            .evaluator
            .evaluate(
                &planet.deployed_version.text,
                planet.deployed_score().unwrap_or(0.0),
            )
            .await
            .map_err(|e| {
                warn!(agent_id, planet_id, error = %e, "One-off evaluation failed");
                HubError::Evaluator(e.to_string())
            })?;

        let variant = Variant::new(proposal.text, Some(proposal.evaluation));
        let recorded = variant.clone();
        self.store
            .mutate(agent_id, |agent| {
                let planet = agent
                    .planet_mut(planet_id)
                    .ok_or_else(|| HubError::planet_not_found(agent_id, planet_id))?;
                planet.record_candidate(recorded);
                Ok(())
            })
            .await?;

        info!(agent_id, planet_id, variant_id = %variant.id, score = ?variant.score(), "Variant generated");
        self.publisher.publish().await;
        Ok(variant)
    }

    pub async fn deploy_variant(
        &self,
        agent_id: &str,
        planet_id: &str,
        variant_id: &str,
    ) -> Result<Planet> {
        if variant_id.trim().is_empty() {
            return Err(HubError::validation("variant id is required"));
        }

        let agent = self
            .tasks
            .mutate_agent(agent_id, |agent| {
                let planet = agent
                    .planet_mut(planet_id)
                    .ok_or_else(|| HubError::planet_not_found(agent_id, planet_id))?;
                planet
                    .deploy(variant_id)
                    .ok_or_else(|| HubError::VariantNotFound {
                        planet_id: planet_id.to_string(),
                        variant_id: variant_id.to_string(),
                    })?;
                Ok(())
            })
            .await?;
        let planet = agent
            .planet(planet_id)
            .cloned()
            .ok_or_else(|| HubError::planet_not_found(agent_id, planet_id))?;

        info!(agent_id, planet_id, variant_id, "Variant deployed");
        self.publisher.publish().await;
        Ok(planet)
    }
}

fn apply_telemetry(agent: &mut Agent, observed: PlanetTelemetry) {
    let evaluation = observed.score.map(|score| Evaluation {
        score,
        metrics: observed.metrics.clone(),
    });

    let Some(planet) = agent.planet_mut(&observed.id) else {
        let name = observed.name.unwrap_or_else(|| {
            if observed.id == PRIMARY_PLANET_ID {
                PRIMARY_PLANET_NAME.to_string()
            } else {
                observed.id.clone()
            }
        });
        let prompt = observed.prompt.unwrap_or_default();
        agent
            .planets
            .push(Planet::new(observed.id, name, Variant::new(prompt, evaluation)));
        return;
    };

    if let Some(name) = observed.name {
        planet.name = name;
    }

    match observed.prompt {
        Some(prompt) if prompt != planet.deployed_version.text => {
            planet.replace_deployed(Variant::new(prompt, evaluation));
        }
        _ => {
            let deployed = &mut planet.deployed_version;
            if let Some(evaluation) = evaluation {
                deployed.evaluation = Some(evaluation);
            } else if let Some(existing) = deployed.evaluation.as_mut() {
                existing.metrics.extend(observed.metrics);
            }
            deployed.timestamp = chrono::Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ResourceKey;
    use crate::providers::SimulatedEvaluator;
    use crate::types::AgentStatus;
    use serde_json::json;

    fn create_test_hub() -> Hub {
        Hub::new(
            Arc::new(StateStore::new()),
            Arc::new(SimulatedEvaluator::new()),
            OptimizerConfig::default(),
        )
    }

    fn new_agent(id: &str) -> NewAgent {
        NewAgent {
            id: id.to_string(),
            name: format!("Agent {}", id),
            ..Default::default()
        }
    }

    fn planet_report(agent_id: &str, planet_id: &str, score: f64) -> TelemetryReport {
        TelemetryReport {
            agent_id: agent_id.to_string(),
            planets: vec![PlanetTelemetry {
                id: planet_id.to_string(),
                prompt: Some("You are helpful.".to_string()),
                score: Some(score),
                ..Default::default()
            }],
            payload: None,
        }
    }

    #[tokio::test]
    async fn test_onboard_validation() {
        let hub = create_test_hub();
        let result = hub
            .onboard(NewAgent {
                name: "No id".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(HubError::Validation(_))));
        assert!(hub.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_onboard_and_duplicate() {
        let hub = create_test_hub();
        let mut sub = hub.connect().await;
        sub.recv().await.unwrap();

        let mut request = new_agent("a1");
        request.api_url = Some("https://agent.example/telemetry".into());
        request.auth_token = Some("token".into());
        request.opik_metrics = vec!["factuality".into()];
        let agent = hub.onboard(request).await.unwrap();

        assert_eq!(agent.status, AgentStatus::Stable);
        assert!(agent.planets.is_empty());
        assert_eq!(agent.config["evaluationMetrics"], json!(["factuality"]));
        assert_eq!(agent.telemetry.unwrap().auth_token.as_deref(), Some("token"));
        assert!(sub.try_recv().is_some());

        let duplicate = hub.onboard(new_agent("a1")).await;
        assert!(matches!(duplicate, Err(HubError::AgentExists(_))));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_telemetry_creates_planet_and_sets_critical() {
        let hub = create_test_hub();
        hub.onboard(new_agent("A1")).await.unwrap();

        let agent = hub
            .ingest_telemetry(planet_report("A1", "P1", 0.50))
            .await
            .unwrap();

        assert_eq!(agent.status, AgentStatus::Critical);
        let ids: Vec<&str> = agent.planets.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["P1"]);
    }

    #[tokio::test]
    async fn test_telemetry_returns_committed_agent() {
        let hub = create_test_hub();
        hub.onboard(new_agent("A1")).await.unwrap();

        let returned = hub
            .ingest_telemetry(planet_report("A1", "P1", 0.5))
            .await
            .unwrap();
        let stored = hub.get_agent("A1").await.unwrap();

        assert_eq!(returned.status, AgentStatus::Critical);
        assert_eq!(returned, stored);
    }

    #[tokio::test]
    async fn test_telemetry_payload_form() {
        let hub = create_test_hub();
        hub.onboard(new_agent("demo-agent")).await.unwrap();

        let report: TelemetryReport = serde_json::from_value(json!({
            "agent_id": "demo-agent",
            "payload": { "score": 0.9, "latency_ms": 80 }
        }))
        .unwrap();
        let agent = hub.ingest_telemetry(report).await.unwrap();

        let planet = agent.planet(PRIMARY_PLANET_ID).unwrap();
        assert_eq!(planet.name, PRIMARY_PLANET_NAME);
        assert_eq!(planet.deployed_score(), Some(0.9));
        assert_eq!(agent.status, AgentStatus::Stable);
    }

    #[tokio::test]
    async fn test_telemetry_new_prompt_demotes_deployed() {
        let hub = create_test_hub();
        hub.onboard(new_agent("a1")).await.unwrap();
        let first = hub
            .ingest_telemetry(planet_report("a1", "p1", 0.7))
            .await
            .unwrap();
        let first_id = first.planets[0].deployed_version.id.clone();

        let mut report = planet_report("a1", "p1", 0.8);
        report.planets[0].prompt = Some("You are concise.".into());
        let agent = hub.ingest_telemetry(report).await.unwrap();

        let planet = agent.planet("p1").unwrap();
        assert_eq!(planet.deployed_version.text, "You are concise.");
        assert_eq!(planet.trace_history.front().unwrap().id, first_id);
    }

    #[tokio::test]
    async fn test_telemetry_same_prompt_updates_in_place() {
        let hub = create_test_hub();
        hub.onboard(new_agent("a1")).await.unwrap();
        let first = hub
            .ingest_telemetry(planet_report("a1", "p1", 0.3))
            .await
            .unwrap();
        assert_eq!(first.status, AgentStatus::Critical);

        let agent = hub
            .ingest_telemetry(planet_report("a1", "p1", 0.9))
            .await
            .unwrap();
        let planet = agent.planet("p1").unwrap();
        assert_eq!(planet.deployed_version.id, first.planets[0].deployed_version.id);
        assert_eq!(planet.deployed_score(), Some(0.9));
        assert!(planet.trace_history.is_empty());
        assert_eq!(agent.status, AgentStatus::Stable);
    }

    #[tokio::test]
    async fn test_telemetry_unknown_agent() {
        let hub = create_test_hub();
        let result = hub.ingest_telemetry(planet_report("ghost", "p1", 0.5)).await;
        assert!(matches!(result, Err(HubError::AgentNotFound(_))));
    }

    #[tokio::test]
    async fn test_position_update_does_not_broadcast() {
        let hub = create_test_hub();
        hub.onboard(new_agent("a1")).await.unwrap();
        let mut sub = hub.connect().await;
        sub.recv().await.unwrap();

        hub.update_position("a1", json!([1, 2, 3])).await.unwrap();
        assert!(sub.try_recv().is_none());
        assert_eq!(hub.get_agent("a1").await.unwrap().position, json!([1, 2, 3]));

        assert!(hub.update_position("a1", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_metric_mapping() {
        let hub = create_test_hub();
        hub.onboard(new_agent("a1")).await.unwrap();

        let mut mapping = Map::new();
        mapping.insert("size".into(), json!("factuality"));
        let agent = hub.update_metric_mapping("a1", mapping).await.unwrap();
        assert_eq!(agent.config["metricMapping"]["size"], "factuality");

        let mut bad = Map::new();
        bad.insert("size".into(), json!(3));
        assert!(matches!(
            hub.update_metric_mapping("a1", bad).await,
            Err(HubError::Validation(_))
        ));
        let agent = hub.get_agent("a1").await.unwrap();
        assert_eq!(agent.config["metricMapping"]["size"], "factuality");
    }

    #[tokio::test]
    async fn test_planet_status_toggle() {
        let hub = create_test_hub();
        hub.onboard(new_agent("a1")).await.unwrap();
        hub.ingest_telemetry(planet_report("a1", "p1", 0.7))
            .await
            .unwrap();

        let planet = hub.set_planet_status("a1", "p1", "inactive").await.unwrap();
        assert_eq!(planet.status, PlanetStatus::Inactive);

        assert!(matches!(
            hub.set_planet_status("a1", "p1", "paused").await,
            Err(HubError::Validation(_))
        ));
        assert!(matches!(
            hub.set_planet_status("a1", "p2", "active").await,
            Err(HubError::PlanetNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_generate_and_deploy() {
        let hub = create_test_hub();
        hub.onboard(new_agent("a1")).await.unwrap();
        let agent = hub
            .ingest_telemetry(planet_report("a1", "p1", 0.7))
            .await
            .unwrap();
        let original_id = agent.planets[0].deployed_version.id.clone();

        let variant = hub.generate_variant("a1", "p1").await.unwrap();
        let agent = hub.get_agent("a1").await.unwrap();
        assert_eq!(agent.planets[0].deployed_version.id, original_id);
        assert_eq!(agent.planets[0].trace_history.front().unwrap().id, variant.id);

        let planet = hub.deploy_variant("a1", "p1", &variant.id).await.unwrap();
        assert_eq!(planet.deployed_version.id, variant.id);
        assert!(!planet.trace_history.contains(&variant.id));
        assert_eq!(planet.trace_history.front().unwrap().id, original_id);

        let missing = hub.deploy_variant("a1", "p1", "nope").await;
        assert!(matches!(missing, Err(HubError::VariantNotFound { .. })));
    }

    #[tokio::test]
    async fn test_start_validation() {
        let hub = create_test_hub();
        let result = hub
            .start_optimization(StartOptimization {
                agent_id: "a1".into(),
                planet_id: "p1".into(),
                score_threshold: Some(2.0),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(HubError::Validation(_))));

        assert!(matches!(
            hub.stop_optimization("a1", "p1").await,
            Err(HubError::TaskNotFound(_))
        ));
        assert!(matches!(
            hub.stop_optimization("", "p1").await,
            Err(HubError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_primary_planets_of_two_agents_optimize_independently() {
        let hub = create_test_hub();
        for id in ["a1", "a2"] {
            hub.onboard(new_agent(id)).await.unwrap();
            let report: TelemetryReport = serde_json::from_value(json!({
                "agent_id": id,
                "payload": { "score": 0.4 }
            }))
            .unwrap();
            hub.ingest_telemetry(report).await.unwrap();
        }

        let start = |agent_id: &str| StartOptimization {
            agent_id: agent_id.into(),
            planet_id: PRIMARY_PLANET_ID.into(),
            score_threshold: Some(1.0),
            ..Default::default()
        };
        let first = hub.start_optimization(start("a1")).await.unwrap();
        let second = hub.start_optimization(start("a2")).await.unwrap();
        assert_eq!(first.key, ResourceKey::new("a1", PRIMARY_PLANET_ID));
        assert_eq!(second.key, ResourceKey::new("a2", PRIMARY_PLANET_ID));
        assert_eq!(hub.snapshot().await.optimizing_resources.len(), 2);

        hub.stop_optimization("a1", PRIMARY_PLANET_ID).await.unwrap();
        first.finished().await;
        assert_eq!(
            hub.snapshot().await.optimizing_resources,
            vec![ResourceKey::new("a2", PRIMARY_PLANET_ID)]
        );
        assert_eq!(hub.get_agent("a1").await.unwrap().status, AgentStatus::Critical);
        assert_eq!(
            hub.get_agent("a2").await.unwrap().status,
            AgentStatus::Optimizing
        );

        hub.stop_optimization("a2", PRIMARY_PLANET_ID).await.unwrap();
        second.finished().await;
    }

    #[tokio::test]
    async fn test_delete_agent_cancels_tasks() {
        let hub = create_test_hub();
        hub.onboard(new_agent("a1")).await.unwrap();
        hub.ingest_telemetry(planet_report("a1", "p1", 0.5))
            .await
            .unwrap();

        let handle = hub
            .start_optimization(StartOptimization {
                agent_id: "a1".into(),
                planet_id: "p1".into(),
                score_threshold: Some(1.0),
                ..Default::default()
            })
            .await
            .unwrap();

        hub.delete_agent("a1").await.unwrap();
        assert!(hub.tasks().list_active().await.is_empty());
        assert!(hub.snapshot().await.agents.is_empty());
        handle.finished().await;

        assert!(matches!(
            hub.delete_agent("a1").await,
            Err(HubError::AgentNotFound(_))
        ));
    }
}
