use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{AgentId, PlanetId};
use crate::error::{HubError, Result};

/// Planet that single-report telemetry is attributed to.
pub const PRIMARY_PLANET_ID: &str = "primary";
pub const PRIMARY_PLANET_NAME: &str = "Primary Prompt";

/// Observed state of one planet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanetTelemetry {
    pub id: PlanetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metrics: Map<String, Value>,
}

/// Telemetry pushed by (or polled from) an agent.
///
/// Either lists planets explicitly or carries a flat `payload` of metrics,
/// which is attributed to the agent's primary planet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    #[serde(default, alias = "agentId")]
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub planets: Vec<PlanetTelemetry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

fn check_score(score: Option<f64>) -> Result<()> {
    match score {
        Some(s) if !s.is_finite() || !(0.0..=1.0).contains(&s) => Err(HubError::validation(
            format!("score must be between 0 and 1, got {}", s),
        )),
        _ => Ok(()),
    }
}

impl TelemetryReport {
    /// Validates the report and flattens it into per-planet observations.
    pub fn planet_reports(&self) -> Result<Vec<PlanetTelemetry>> {
        if self.agent_id.trim().is_empty() {
            return Err(HubError::validation("agent_id is required"));
        }

        let mut reports = self.planets.clone();
        if let Some(payload) = &self.payload {
            let mut metrics = payload.clone();
            let score = match metrics.remove("score") {
                None | Some(Value::Null) => None,
                Some(Value::Number(n)) => n.as_f64(),
                Some(other) => {
                    return Err(HubError::validation(format!(
                        "payload.score must be a number, got {}",
                        other
                    )))
                }
            };
            let prompt = match metrics.remove("prompt") {
                Some(Value::String(prompt)) => Some(prompt),
                _ => None,
            };
            reports.push(PlanetTelemetry {
                id: PRIMARY_PLANET_ID.to_string(),
                name: None,
                prompt,
                score,
                metrics,
            });
        }

        if reports.is_empty() {
            return Err(HubError::validation(
                "telemetry must contain planets or a payload",
            ));
        }
        for report in &reports {
            if report.id.trim().is_empty() {
                return Err(HubError::validation("planet id is required"));
            }
            check_score(report.score)?;
        }
        Ok(reports)
    }
}
