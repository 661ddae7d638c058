use anyhow::{anyhow, Result};
use rand::Rng;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_TELEMETRY_ENDPOINT: &str = "http://localhost:8080/api/telemetry";

/// Randomized single-report telemetry, shaped like a real agent would send it.
pub fn random_payload() -> Map<String, Value> {
    let mut rng = rand::thread_rng();
    let score: f64 = rng.gen_range(0.1..=0.99);
    let error_count = [0, 0, 0, 0, 1, 2][rng.gen_range(0..6)];

    let mut payload = Map::new();
    payload.insert("score".into(), json!((score * 100.0).round() / 100.0));
    payload.insert("latency_ms".into(), json!(rng.gen_range(50..=500)));
    payload.insert("error_count".into(), json!(error_count));
    payload.insert("prompt_tokens".into(), json!(rng.gen_range(100..=1000)));
    payload.insert("completion_tokens".into(), json!(rng.gen_range(50..=500)));
    payload
}

/// Pushes telemetry reports for one agent to a hub.
pub struct TelemetryClient {
    client: reqwest::Client,
    endpoint: String,
    agent_id: String,
}

impl TelemetryClient {
    pub fn new(endpoint: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into(),
            agent_id: agent_id.into(),
        }
    }

    pub async fn send(&self, payload: Map<String, Value>) -> Result<()> {
        let body = json!({ "agent_id": self.agent_id, "payload": payload });
        let response = self.client.post(&self.endpoint).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("hub returned {}: {}", status, text));
        }
        Ok(())
    }

    /// Sends `count` reports (forever when `None`), one every `interval`.
    pub async fn run(&self, interval: Duration, count: Option<u64>) -> Result<u64> {
        let mut sent = 0;
        loop {
            if count.is_some_and(|limit| sent >= limit) {
                return Ok(sent);
            }

            let payload = random_payload();
            let body = Value::Object(payload.clone());
            match self.send(payload).await {
                Ok(()) => info!(agent_id = %self.agent_id, payload = %body, "Telemetry sent"),
                Err(e) => warn!(agent_id = %self.agent_id, error = %e, "Telemetry send failed"),
            }
            sent += 1;

            if count.is_some_and(|limit| sent >= limit) {
                return Ok(sent);
            }
            tokio::time::sleep(interval).await;
        }
    }
}
