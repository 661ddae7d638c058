use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::hub::Hub;
use crate::types::{Agent, TelemetryReport};

/// Periodically pulls telemetry from every agent that registered an endpoint.
pub struct TelemetryPoller {
    hub: Arc<Hub>,
    client: reqwest::Client,
    interval: Duration,
}

impl TelemetryPoller {
    pub fn new(hub: Arc<Hub>, interval: Duration) -> Self {
        Self {
            hub,
            client: reqwest::Client::new(),
            interval,
        }
    }

    /// Polls each endpoint once; returns how many reports were ingested.
    pub async fn poll_once(&self) -> usize {
        let agents = self.hub.snapshot().await.agents;
        let mut ingested = 0;

        for agent in agents.values().filter(|a| a.telemetry.is_some()) {
            match self.fetch(agent).await {
                Ok(report) => match self.hub.ingest_telemetry(report).await {
                    Ok(_) => ingested += 1,
                    Err(e) => warn!(agent_id = %agent.id, error = %e, "Rejected polled telemetry"),
                },
                Err(e) => warn!(agent_id = %agent.id, error = %e, "Telemetry poll failed"),
            }
        }

        debug!(ingested, "Telemetry poll complete");
        ingested
    }

    async fn fetch(&self, agent: &Agent) -> Result<TelemetryReport> {
        let endpoint = agent
            .telemetry
            .as_ref()
            .ok_or_else(|| anyhow!("agent has no telemetry endpoint"))?;

        let mut request = self.client.get(&endpoint.api_url);
        if let Some(token) = &endpoint.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("endpoint returned {}", response.status()));
        }

        let mut report: TelemetryReport = response.json().await?;
        report.agent_id = agent.id.clone();
        Ok(report)
    }

    /// Runs until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Telemetry poller started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.poll_once().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("Telemetry poller stopped");
    }
}
