use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{PlanetId, TraceHistory, VariantId};

/// Score plus whatever auxiliary metrics the evaluator or telemetry reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: f64,
    #[serde(flatten)]
    pub metrics: Map<String, Value>,
}

impl Evaluation {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            metrics: Map::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: VariantId,
    pub text: String,
    #[serde(default)]
    pub evaluation: Option<Evaluation>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_deployed: bool,
}

impl Variant {
    pub fn new(text: impl Into<String>, evaluation: Option<Evaluation>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            evaluation,
            timestamp: Utc::now(),
            is_deployed: false,
        }
    }

    pub fn score(&self) -> Option<f64> {
        self.evaluation.as_ref().map(|e| e.score)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanetStatus {
    #[default]
    Active,
    Inactive,
}

impl PlanetStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(PlanetStatus::Active),
            "inactive" => Some(PlanetStatus::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Planet {
    pub id: PlanetId,
    pub name: String,
    #[serde(default)]
    pub status: PlanetStatus,
    pub deployed_version: Variant,
    #[serde(default)]
    pub trace_history: TraceHistory,
}

impl Planet {
    pub fn new(id: impl Into<PlanetId>, name: impl Into<String>, mut deployed: Variant) -> Self {
        deployed.is_deployed = true;
        Self {
            id: id.into(),
            name: name.into(),
            status: PlanetStatus::Active,
            deployed_version: deployed,
            trace_history: TraceHistory::new(),
        }
    }

    pub fn deployed_score(&self) -> Option<f64> {
        self.deployed_version.score()
    }

    /// Records a candidate in the history without touching the deployed slot.
    pub fn record_candidate(&mut self, variant: Variant) -> Option<Variant> {
        self.trace_history.push_front(variant)
    }

    /// Makes `variant` the deployed version and moves the previous one into history.
    pub fn replace_deployed(&mut self, mut variant: Variant) {
        self.trace_history.remove(&variant.id);
        variant.is_deployed = true;
        let previous = std::mem::replace(&mut self.deployed_version, variant);
        if !self.trace_history.contains(&previous.id) {
            self.trace_history.push_front(previous);
        }
    }

    /// Promotes a history entry to the deployed slot.
    ///
    /// Returns `Some(false)` when `variant_id` is already deployed and `None`
    /// when it is neither deployed nor present in the history.
    pub fn deploy(&mut self, variant_id: &str) -> Option<bool> {
        if self.deployed_version.id == variant_id {
            return Some(false);
        }
        let variant = self.trace_history.remove(variant_id)?;
        self.replace_deployed(variant);
        Some(true)
    }

    /// Restores the deployed/history invariants on data loaded from outside.
    pub fn normalize(&mut self) {
        self.deployed_version.is_deployed = true;
        let deployed_id = self.deployed_version.id.clone();
        self.trace_history.remove(&deployed_id);
    }
}
