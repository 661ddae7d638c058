use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::error::{HubError, Result};
use crate::types::{Agent, AgentId};

/// One agent's lock. `None` once the agent has been deleted, so a mutation
/// that raced with the delete sees the agent as gone.
type Slot = Arc<Mutex<Option<Agent>>>;

/// In-memory source of truth for every agent and its planets.
///
/// The id → slot map is guarded by a read/write lock, and every agent sits
/// behind its own mutex, so mutations of different agents never contend
/// while mutations of the same agent are fully serialized.
#[derive(Default)]
pub struct StateStore {
    agents: RwLock<HashMap<AgentId, Slot>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, agent_id: &str) -> Result<Slot> {
        let agents = self.agents.read().await;
        agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| HubError::AgentNotFound(agent_id.to_string()))
    }

    pub async fn get(&self, agent_id: &str) -> Result<Agent> {
        let slot = self.slot(agent_id).await?;
        let guard = slot.lock().await;
        guard
            .clone()
            .ok_or_else(|| HubError::AgentNotFound(agent_id.to_string()))
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.get(agent_id).await.is_ok()
    }

    /// Inserts or replaces an agent.
    pub async fn upsert(&self, agent: Agent) {
        let existing = {
            let agents = self.agents.read().await;
            agents.get(&agent.id).cloned()
        };
        if let Some(slot) = existing {
            let mut guard = slot.lock().await;
            if guard.is_some() {
                *guard = Some(agent);
                return;
            }
        }

        let mut agents = self.agents.write().await;
        agents.insert(agent.id.clone(), Arc::new(Mutex::new(Some(agent))));
    }

    /// Inserts a new agent, failing if the id is already taken.
    pub async fn insert(&self, agent: Agent) -> Result<()> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent.id) {
            return Err(HubError::AgentExists(agent.id));
        }
        agents.insert(agent.id.clone(), Arc::new(Mutex::new(Some(agent))));
        Ok(())
    }

    /// Removes an agent. Returns `false` if it did not exist.
    pub async fn delete(&self, agent_id: &str) -> bool {
        let slot = {
            let mut agents = self.agents.write().await;
            agents.remove(agent_id)
        };
        match slot {
            Some(slot) => slot.lock().await.take().is_some(),
            None => false,
        }
    }

    /// Applies `f` to the agent under its exclusive lock.
    ///
    /// `f` runs against a working copy which is only committed when it
    /// returns `Ok`, so a failed mutation leaves the agent untouched.
    pub async fn mutate<F, R>(&self, agent_id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Agent) -> Result<R>,
    {
        let slot = self.slot(agent_id).await?;
        let mut guard = slot.lock().await;
        let current = guard
            .as_ref()
            .ok_or_else(|| HubError::AgentNotFound(agent_id.to_string()))?;

        let mut draft = current.clone();
        let output = f(&mut draft)?;
        *guard = Some(draft);
        Ok(output)
    }

    /// Consistent-per-agent copy of the whole tree, ordered by agent id.
    pub async fn snapshot(&self) -> BTreeMap<AgentId, Agent> {
        let slots: Vec<Slot> = {
            let agents = self.agents.read().await;
            agents.values().cloned().collect()
        };

        let mut snapshot = BTreeMap::new();
        for slot in slots {
            if let Some(agent) = slot.lock().await.as_ref() {
                snapshot.insert(agent.id.clone(), agent.clone());
            }
        }
        snapshot
    }

    pub async fn agent_ids(&self) -> Vec<AgentId> {
        let agents = self.agents.read().await;
        let mut ids: Vec<AgentId> = agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
