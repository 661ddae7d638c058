use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{AgentId, Planet};

/// Mean deployed score below which an agent is reported as critical.
pub const CRITICAL_SCORE_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Stable,
    Critical,
    Optimizing,
}

impl AgentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AgentStatus::Stable => "stable",
            AgentStatus::Critical => "critical",
            AgentStatus::Optimizing => "optimizing",
        }
    }
}

/// Where an agent publishes its own telemetry, if anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEndpoint {
    pub api_url: String,
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub position: Value,
    #[serde(default)]
    pub theme: Value,
    #[serde(default)]
    pub planets: Vec<Planet>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryEndpoint>,
}

impl Agent {
    pub fn new(id: impl Into<AgentId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            position: Value::Null,
            theme: Value::Null,
            planets: Vec::new(),
            status: AgentStatus::Stable,
            config: Map::new(),
            telemetry: None,
        }
    }

    pub fn planet(&self, planet_id: &str) -> Option<&Planet> {
        self.planets.iter().find(|p| p.id == planet_id)
    }

    pub fn planet_mut(&mut self, planet_id: &str) -> Option<&mut Planet> {
        self.planets.iter_mut().find(|p| p.id == planet_id)
    }

    pub fn has_planet(&self, planet_id: &str) -> bool {
        self.planet(planet_id).is_some()
    }

    /// Mean score of the deployed variants that have been evaluated.
    pub fn mean_deployed_score(&self) -> Option<f64> {
        let scores: Vec<f64> = self
            .planets
            .iter()
            .filter_map(|p| p.deployed_score())
            .collect();
        if scores.is_empty() {
            return None;
        }
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }

    pub fn derive_status(&self, optimizing: bool) -> AgentStatus {
        if optimizing {
            return AgentStatus::Optimizing;
        }
        match self.mean_deployed_score() {
            Some(mean) if mean < CRITICAL_SCORE_THRESHOLD => AgentStatus::Critical,
            _ => AgentStatus::Stable,
        }
    }

    /// Recomputes `status`; returns whether it changed.
    pub fn refresh_status(&mut self, optimizing: bool) -> bool {
        let status = self.derive_status(optimizing);
        let changed = status != self.status;
        self.status = status;
        changed
    }

    /// Restores planet invariants on data loaded from outside.
    pub fn normalize(&mut self) {
        for planet in &mut self.planets {
            planet.normalize();
        }
    }
}
