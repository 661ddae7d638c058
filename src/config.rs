use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::OptimizerConfig;
use crate::providers::{Evaluator, HttpEvaluator, SimulatedEvaluator};

const ENV_PREFIX: &str = "COCKPIT_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluatorKind {
    #[default]
    Simulated,
    Http,
}

impl FromStr for EvaluatorKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simulated" => Ok(EvaluatorKind::Simulated),
            "http" => Ok(EvaluatorKind::Http),
            other => Err(anyhow!("unknown evaluator '{}', expected simulated or http", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub task_interval_ms: u64,
    pub task_jitter_ms: u64,
    pub default_score_threshold: f64,
    pub default_optimizer: String,
    pub max_consecutive_failures: u32,
    pub evaluator: EvaluatorKind,
    pub evaluator_url: Option<String>,
    pub poll_interval_secs: u64,
    pub seed_demo: bool,
    pub seed_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            task_interval_ms: 5000,
            task_jitter_ms: 5000,
            default_score_threshold: 0.95,
            default_optimizer: "Few-shot Bayesian".to_string(),
            max_consecutive_failures: 0,
            evaluator: EvaluatorKind::Simulated,
            evaluator_url: None,
            poll_interval_secs: 0,
            seed_demo: false,
            seed_path: None,
        }
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("invalid {}{}='{}': {}", ENV_PREFIX, key, value, e))
}

impl Config {
    /// Reads the optional TOML file, then applies `COCKPIT_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Applies overrides looked up by unprefixed key (`PORT`, `EVALUATOR`, ...).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("PORT") {
            self.port = parse_var("PORT", &v)?;
        }
        if let Some(v) = lookup("TASK_INTERVAL_MS") {
            self.task_interval_ms = parse_var("TASK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("TASK_JITTER_MS") {
            self.task_jitter_ms = parse_var("TASK_JITTER_MS", &v)?;
        }
        if let Some(v) = lookup("SCORE_THRESHOLD") {
            self.default_score_threshold = parse_var("SCORE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("OPTIMIZER") {
            self.default_optimizer = v;
        }
        if let Some(v) = lookup("MAX_FAILURES") {
            self.max_consecutive_failures = parse_var("MAX_FAILURES", &v)?;
        }
        if let Some(v) = lookup("EVALUATOR") {
            self.evaluator = v.parse()?;
        }
        if let Some(v) = lookup("EVALUATOR_URL") {
            self.evaluator_url = Some(v).filter(|url| !url.is_empty());
        }
        if let Some(v) = lookup("POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_var("POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("SEED_DEMO") {
            self.seed_demo = parse_var("SEED_DEMO", &v)?;
        }
        if let Some(v) = lookup("SEED_PATH") {
            self.seed_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_score_threshold) {
            bail!(
                "default_score_threshold must be between 0 and 1, got {}",
                self.default_score_threshold
            );
        }
        if self.evaluator == EvaluatorKind::Http && self.evaluator_url.is_none() {
            bail!("evaluator_url is required when evaluator = \"http\"");
        }
        Ok(())
    }

    pub fn optimizer_defaults(&self) -> OptimizerConfig {
        OptimizerConfig {
            optimizer: self.default_optimizer.clone(),
            score_threshold: self.default_score_threshold,
            interval: Duration::from_millis(self.task_interval_ms),
            jitter: Duration::from_millis(self.task_jitter_ms),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    pub fn build_evaluator(&self) -> Result<Arc<dyn Evaluator>> {
        match self.evaluator {
            EvaluatorKind::Simulated => Ok(Arc::new(SimulatedEvaluator::new())),
            EvaluatorKind::Http => {
                let url = self
                    .evaluator_url
                    .clone()
                    .ok_or_else(|| anyhow!("evaluator_url is required for the http evaluator"))?;
                Ok(Arc::new(HttpEvaluator::new(url)))
            }
        }
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
