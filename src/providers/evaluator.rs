use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::Evaluation;

/// A candidate artifact together with its evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub text: String,
    pub evaluation: Evaluation,
}

/// Produces and scores a candidate derived from the current artifact.
///
/// Implementations may be slow and may fail; callers treat failures as
/// transient.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, artifact: &str, base_score: f64) -> Result<Proposal>;
}

const PROMPT_MODIFIERS: &[&str] = &[
    "Be more direct.",
    "Use simpler language.",
    "Adopt a professional tone.",
    "Explain it like I'm five.",
    "Be more expressive and use emojis.",
    "Sound more empathetic.",
    "Focus on the key takeaways.",
    "Provide a step-by-step guide.",
    "Ensure the answer is factually accurate.",
    "Format the response as a list.",
    "Summarize the main point in one sentence.",
    "Add a historical context.",
];

const SIMULATED_SCORE_CAP: f64 = 0.99;

/// Local stand-in for a real optimizer: appends an instruction to the prompt
/// and perturbs the previous score.
#[derive(Debug, Clone, Default)]
pub struct SimulatedEvaluator;

impl SimulatedEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn propose(artifact: &str, base_score: f64) -> Proposal {
        let mut rng = rand::thread_rng();
        let modifier = PROMPT_MODIFIERS
            .choose(&mut rng)
            .copied()
            .unwrap_or("Be more direct.");
        let base = if base_score > 0.0 { base_score } else { 0.5 };
        let raw = base * rng.gen_range(0.95..1.08);
        let score = ((raw * 100.0).round() / 100.0).min(SIMULATED_SCORE_CAP);

        let evaluation = Evaluation::new(score)
            .with_metric("latency", format!("{}ms", rng.gen_range(80..=250)))
            .with_metric("cost", format!("${:.4}", rng.gen_range(0.0005..0.005)));

        Proposal {
            text: format!("{} Instruction: {}", artifact, modifier),
            evaluation,
        }
    }
}

#[async_trait]
impl Evaluator for SimulatedEvaluator {
    async fn evaluate(&self, artifact: &str, base_score: f64) -> Result<Proposal> {
        Ok(Self::propose(artifact, base_score))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateRequest<'a> {
    artifact: &'a str,
    base_score: f64,
}

#[derive(Debug, Deserialize)]
struct EvaluateResponse {
    text: String,
    score: f64,
    #[serde(default)]
    metrics: Map<String, Value>,
}

/// Delegates evaluation to a remote scoring service.
#[derive(Debug, Clone)]
pub struct HttpEvaluator {
    url: String,
    client: reqwest::Client,
}

impl HttpEvaluator {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(&self, artifact: &str, base_score: f64) -> Result<Proposal> {
        let response = self
            .client
            .post(&self.url)
            .json(&EvaluateRequest {
                artifact,
                base_score,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Evaluator returned {}: {}", status, body));
        }

        let parsed: EvaluateResponse = response.json().await?;
        if !parsed.score.is_finite() {
            return Err(anyhow!("Evaluator returned a non-finite score"));
        }

        Ok(Proposal {
            text: parsed.text,
            evaluation: Evaluation {
                score: parsed.score,
                metrics: parsed.metrics,
            },
        })
    }
}
