use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;

use crate::storage::StateStore;
use crate::types::{Agent, Evaluation, Planet, PlanetStatus, Variant};

fn initial_version(text: &str, score: f64, latency_ms: u32) -> Variant {
    Variant::new(
        text,
        Some(Evaluation::new(score).with_metric("latency", format!("{}ms", latency_ms))),
    )
}

fn demo_planet(id: &str, name: &str, status: PlanetStatus, text: &str, score: f64) -> Planet {
    let mut planet = Planet::new(id, name, initial_version(text, score, 120));
    planet.status = status;
    planet
}

/// The two sample agents the dashboard ships with.
pub fn demo_agents() -> Vec<Agent> {
    let mut support = Agent::new("galaxy-alpha", "E-commerce Support Agent");
    support.position = json!([-50, 0, 0]);
    support.theme = json!({ "hue": 0.6 });
    support.planets = vec![
        demo_planet(
            "planet_intent",
            "Intent Classifier",
            PlanetStatus::Active,
            "Classify user intent for an e-commerce query.",
            0.92,
        ),
        demo_planet(
            "planet_retrieval",
            "Product Retriever",
            PlanetStatus::Inactive,
            "Retrieve relevant products based on the classified intent.",
            0.85,
        ),
        demo_planet(
            "planet_generator",
            "Answer Generator",
            PlanetStatus::Active,
            "Generate a helpful response incorporating product details.",
            0.88,
        ),
    ];
    support.config.insert("activeOptimizer".into(), json!("Evolutionary Strategy"));
    support
        .config
        .insert("evaluationMetrics".into(), json!(["Score", "Toxicity", "Latency"]));

    let mut developer = Agent::new("galaxy-beta", "Developer Assistant Agent");
    developer.position = json!([50, 0, 0]);
    developer.theme = json!({ "hue": 0.1 });
    developer.planets = vec![
        demo_planet(
            "planet_code_gen",
            "Code Generator",
            PlanetStatus::Active,
            "Generate a Python function based on the user's request.",
            0.95,
        ),
        demo_planet(
            "planet_code_explain",
            "Code Explainer",
            PlanetStatus::Inactive,
            "Explain a complex piece of code in simple terms.",
            0.91,
        ),
    ];
    developer.config.insert("activeOptimizer".into(), json!("A/B Test"));
    developer.config.insert(
        "evaluationMetrics".into(),
        json!(["Score", "Correctness", "Readability"]),
    );

    vec![support, developer]
}

/// Reads a JSON array of agents.
pub fn load_agents(path: &Path) -> Result<Vec<Agent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file {}", path.display()))?;
    let agents: Vec<Agent> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse seed file {}", path.display()))?;
    Ok(agents)
}

/// Installs agents into the store, restoring planet invariants and status.
pub async fn seed(store: &StateStore, agents: Vec<Agent>) -> usize {
    let count = agents.len();
    for mut agent in agents {
        agent.normalize();
        agent.refresh_status(false);
        store.upsert(agent).await;
    }
    count
}
