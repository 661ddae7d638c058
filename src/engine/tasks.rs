use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::publisher::Publisher;
use crate::error::{HubError, Result};
use crate::providers::Evaluator;
use crate::storage::StateStore;
use crate::types::{Agent, AgentId, PlanetId, Variant};

/// Why an optimization task stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationCause {
    Cancelled,
    ThresholdReached { score: f64 },
    ResourceGone,
    Failed(String),
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCause::Cancelled => write!(f, "cancelled"),
            TerminationCause::ThresholdReached { score } => {
                write!(f, "threshold reached ({:.2})", score)
            }
            TerminationCause::ResourceGone => write!(f, "resource gone"),
            TerminationCause::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Per-task settings.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Display name of the optimizer strategy.
    pub optimizer: String,
    /// Stop once a candidate scores at least this much.
    pub score_threshold: f64,
    /// Base wait between iterations.
    pub interval: Duration,
    /// Upper bound of the random extra wait added to `interval`.
    pub jitter: Duration,
    /// Consecutive evaluator failures that end the task; 0 means never.
    pub max_consecutive_failures: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer: "Few-shot Bayesian".to_string(),
            score_threshold: 0.95,
            interval: Duration::from_secs(5),
            jitter: Duration::from_secs(5),
            max_consecutive_failures: 0,
        }
    }
}

impl OptimizerConfig {
    fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.interval;
        }
        self.interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Identifies one optimizable resource. Planet ids are only unique within
/// their agent, so both halves are needed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    pub agent_id: AgentId,
    pub planet_id: PlanetId,
}

impl ResourceKey {
    pub fn new(agent_id: impl Into<AgentId>, planet_id: impl Into<PlanetId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            planet_id: planet_id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.planet_id)
    }
}

struct TaskEntry {
    task_id: Uuid,
    cancel: watch::Sender<bool>,
    optimizer: String,
    started_at: DateTime<Utc>,
}

type TaskTable = HashMap<ResourceKey, TaskEntry>;

/// Registry of running tasks keyed by (agent, planet). At most one entry per key.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<TaskTable>>,
}

impl TaskRegistry {
    async fn lock(&self) -> MutexGuard<'_, TaskTable> {
        self.inner.lock().await
    }

    pub async fn active_keys(&self) -> Vec<ResourceKey> {
        let tasks = self.lock().await;
        let mut keys: Vec<ResourceKey> = tasks.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn contains(&self, key: &ResourceKey) -> bool {
        self.lock().await.contains_key(key)
    }
}

fn agent_is_optimizing(tasks: &TaskTable, agent_id: &str) -> bool {
    tasks.keys().any(|key| key.agent_id == agent_id)
}

/// Public view of a registered task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub planet_id: PlanetId,
    pub agent_id: AgentId,
    pub task_id: Uuid,
    pub optimizer: String,
    pub started_at: DateTime<Utc>,
}

/// Handle returned by [`TaskManager::start`].
pub struct TaskHandle {
    pub key: ResourceKey,
    pub task_id: Uuid,
    done: watch::Receiver<Option<TerminationCause>>,
}

impl TaskHandle {
    /// The termination cause, once cleanup has completed.
    pub fn cause(&self) -> Option<TerminationCause> {
        self.done.borrow().clone()
    }

    /// Waits until the task has terminated and its cleanup has run.
    pub async fn finished(mut self) -> TerminationCause {
        match self.done.wait_for(|cause| cause.is_some()).await {
            Ok(cause) => cause
                .clone()
                .unwrap_or_else(|| TerminationCause::Failed("task vanished".to_string())),
            Err(_) => TerminationCause::Failed("task vanished".to_string()),
        }
    }
}

#[derive(Clone)]
struct Target {
    key: ResourceKey,
    task_id: Uuid,
}

#[derive(Clone)]
struct TaskContext {
    store: Arc<StateStore>,
    registry: TaskRegistry,
    publisher: Arc<Publisher>,
    evaluator: Arc<dyn Evaluator>,
}

/// Owns every background optimization loop.
pub struct TaskManager {
    ctx: TaskContext,
}

impl TaskManager {
    pub fn new(
        store: Arc<StateStore>,
        registry: TaskRegistry,
        publisher: Arc<Publisher>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        Self {
            ctx: TaskContext {
                store,
                registry,
                publisher,
                evaluator,
            },
        }
    }

    /// Registers and spawns an optimization loop for a planet.
    pub async fn start(
        &self,
        agent_id: &str,
        planet_id: &str,
        config: OptimizerConfig,
    ) -> Result<TaskHandle> {
        if !config.score_threshold.is_finite() {
            return Err(HubError::validation("score_threshold must be a finite number"));
        }

        let key = ResourceKey::new(agent_id, planet_id);
        let task_id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(None);
        {
            let mut tasks = self.ctx.registry.lock().await;
            if tasks.contains_key(&key) {
                warn!(agent_id, planet_id, "Optimization already running");
                return Err(HubError::AlreadyRunning(key.to_string()));
            }

            self.ctx
                .store
                .mutate(agent_id, |agent| {
                    if !agent.has_planet(planet_id) {
                        return Err(HubError::planet_not_found(agent_id, planet_id));
                    }
                    agent.refresh_status(true);
                    Ok(())
                })
                .await?;

            tasks.insert(
                key.clone(),
                TaskEntry {
                    task_id,
                    cancel: cancel_tx,
                    optimizer: config.optimizer.clone(),
                    started_at: Utc::now(),
                },
            );
        }

        info!(
            agent_id,
            planet_id,
            %task_id,
            optimizer = %config.optimizer,
            threshold = config.score_threshold,
            "Optimization started"
        );

        let target = Target {
            key: key.clone(),
            task_id,
        };
        tokio::spawn(supervise(
            self.ctx.clone(),
            target,
            config,
            cancel_rx,
            done_tx,
        ));
        self.ctx.publisher.publish().await;

        Ok(TaskHandle {
            key,
            task_id,
            done: done_rx,
        })
    }

    /// Requests cooperative cancellation. Teardown happens in the task.
    pub async fn stop(&self, agent_id: &str, planet_id: &str) -> Result<()> {
        let key = ResourceKey::new(agent_id, planet_id);
        let tasks = self.ctx.registry.lock().await;
        let entry = tasks
            .get(&key)
            .ok_or_else(|| HubError::TaskNotFound(key.to_string()))?;
        entry.cancel.send_replace(true);
        info!(agent_id, planet_id, task_id = %entry.task_id, "Optimization stop requested");
        Ok(())
    }

    /// Cancels and deregisters every task of an agent. The loops still run
    /// their cleanup, which finds the entries already gone.
    pub async fn cancel_agent_tasks(&self, agent_id: &str) -> Vec<PlanetId> {
        let mut tasks = self.ctx.registry.lock().await;
        let mut owned: Vec<ResourceKey> = tasks
            .keys()
            .filter(|key| key.agent_id == agent_id)
            .cloned()
            .collect();
        owned.sort();

        for key in &owned {
            if let Some(entry) = tasks.remove(key) {
                entry.cancel.send_replace(true);
                info!(agent_id, planet_id = %key.planet_id, task_id = %entry.task_id, "Optimization cancelled with agent");
            }
        }
        owned.into_iter().map(|key| key.planet_id).collect()
    }

    pub async fn list_active(&self) -> Vec<ResourceKey> {
        self.ctx.registry.active_keys().await
    }

    pub async fn is_running(&self, agent_id: &str, planet_id: &str) -> bool {
        self.ctx
            .registry
            .contains(&ResourceKey::new(agent_id, planet_id))
            .await
    }

    pub async fn describe(&self) -> Vec<TaskInfo> {
        let tasks = self.ctx.registry.lock().await;
        let mut infos: Vec<TaskInfo> = tasks
            .iter()
            .map(|(key, entry)| TaskInfo {
                planet_id: key.planet_id.clone(),
                agent_id: key.agent_id.clone(),
                task_id: entry.task_id,
                optimizer: entry.optimizer.clone(),
                started_at: entry.started_at,
            })
            .collect();
        infos.sort_by(|a, b| (&a.agent_id, &a.planet_id).cmp(&(&b.agent_id, &b.planet_id)));
        infos
    }

    /// Mutates an agent, recomputes its derived status in the same step and
    /// returns the committed agent.
    ///
    /// The registry stays locked for the duration, so no task can start or
    /// finish between reading the optimizing flag and writing the status.
    pub async fn mutate_agent<F>(&self, agent_id: &str, f: F) -> Result<Agent>
    where
        F: FnOnce(&mut Agent) -> Result<()>,
    {
        let tasks = self.ctx.registry.lock().await;
        let optimizing = agent_is_optimizing(&tasks, agent_id);
        self.ctx
            .store
            .mutate(agent_id, |agent| {
                f(agent)?;
                agent.refresh_status(optimizing);
                Ok(agent.clone())
            })
            .await
    }
}

/// Runs the loop in its own task so that a panic inside it still reaches
/// the cleanup below.
async fn supervise(
    ctx: TaskContext,
    target: Target,
    config: OptimizerConfig,
    cancel: watch::Receiver<bool>,
    done: watch::Sender<Option<TerminationCause>>,
) {
    let run = tokio::spawn(run_loop(ctx.clone(), target.clone(), config, cancel));
    let cause = match run.await {
        Ok(cause) => cause,
        Err(e) => {
            error!(resource = %target.key, task_id = %target.task_id, error = %e, "Optimization loop aborted");
            TerminationCause::Failed(e.to_string())
        }
    };

    finalize(&ctx, &target, &cause).await;
    done.send_replace(Some(cause));
}

async fn run_loop(
    ctx: TaskContext,
    target: Target,
    config: OptimizerConfig,
    mut cancel: watch::Receiver<bool>,
) -> TerminationCause {
    let mut failures: u32 = 0;
    let mut iteration: u64 = 0;
    let ResourceKey { agent_id, planet_id } = &target.key;

    loop {
        if *cancel.borrow() {
            return TerminationCause::Cancelled;
        }
        iteration += 1;

        let (artifact, base_score) = match ctx.store.get(agent_id).await {
            Ok(agent) => match agent.planet(planet_id) {
                Some(planet) => (
                    planet.deployed_version.text.clone(),
                    planet.deployed_score().unwrap_or(0.0),
                ),
                None => return TerminationCause::ResourceGone,
            },
            Err(e) if e.is_not_found() => return TerminationCause::ResourceGone,
            Err(e) => return TerminationCause::Failed(e.to_string()),
        };

        match ctx.evaluator.evaluate(&artifact, base_score).await {
            Ok(proposal) => {
                failures = 0;
                let score = proposal.evaluation.score;
                let candidate = Variant::new(proposal.text, Some(proposal.evaluation));
                let candidate_id = candidate.id.clone();

                let recorded = ctx
                    .store
                    .mutate(agent_id, |agent| {
                        let planet = agent
                            .planet_mut(planet_id)
                            .ok_or_else(|| HubError::planet_not_found(agent_id, planet_id))?;
                        planet.record_candidate(candidate);
                        Ok(())
                    })
                    .await;
                match recorded {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => return TerminationCause::ResourceGone,
                    Err(e) => return TerminationCause::Failed(e.to_string()),
                }

                info!(
                    resource = %target.key,
                    task_id = %target.task_id,
                    iteration,
                    variant_id = %candidate_id,
                    score,
                    "Candidate recorded"
                );
                ctx.publisher.publish().await;

                if score >= config.score_threshold {
                    return TerminationCause::ThresholdReached { score };
                }
            }
            Err(e) => {
                failures += 1;
                warn!(
                    resource = %target.key,
                    task_id = %target.task_id,
                    iteration,
                    failures,
                    error = %e,
                    "Evaluator failed, skipping iteration"
                );
                if config.max_consecutive_failures > 0 && failures >= config.max_consecutive_failures {
                    return TerminationCause::Failed(format!(
                        "{} consecutive evaluator failures, last: {}",
                        failures, e
                    ));
                }
            }
        }

        let delay = config.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.changed() => {}
        }
    }
}

async fn finalize(ctx: &TaskContext, target: &Target, cause: &TerminationCause) {
    {
        let mut tasks = ctx.registry.lock().await;
        let owned = tasks
            .get(&target.key)
            .is_some_and(|entry| entry.task_id == target.task_id);
        if owned {
            tasks.remove(&target.key);
        }

        let optimizing = agent_is_optimizing(&tasks, &target.key.agent_id);
        let refreshed = ctx
            .store
            .mutate(&target.key.agent_id, |agent| {
                agent.refresh_status(optimizing);
                Ok(())
            })
            .await;
        match refreshed {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!(agent_id = %target.key.agent_id, error = %e, "Failed to refresh agent status")
            }
        }
    }

    info!(
        agent_id = %target.key.agent_id,
        planet_id = %target.key.planet_id,
        task_id = %target.task_id,
        cause = %cause,
        "Optimization terminated"
    );
    ctx.publisher.publish().await;
}
