use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::engine::broadcast::{Broadcaster, Subscription, SubscriptionId};
use crate::engine::tasks::{ResourceKey, TaskRegistry};
use crate::storage::StateStore;
use crate::types::{Agent, AgentId};

/// Full mirrored state as observers see it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub agents: BTreeMap<AgentId, Agent>,
    pub optimizing_resources: Vec<ResourceKey>,
}

/// Message pushed over the live channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    Init(StateSnapshot),
    Update(StateSnapshot),
}

impl Envelope {
    pub fn snapshot(&self) -> &StateSnapshot {
        match self {
            Envelope::Init(snapshot) | Envelope::Update(snapshot) => snapshot,
        }
    }
}

pub type SharedEnvelope = Arc<Envelope>;

/// Builds snapshots from the store and task registry and hands them to the
/// broadcaster.
///
/// Snapshot and send happen under one gate, so observers never receive an
/// older snapshot after a newer one.
pub struct Publisher {
    store: Arc<StateStore>,
    registry: TaskRegistry,
    broadcaster: Broadcaster<SharedEnvelope>,
    gate: Mutex<()>,
}

impl Publisher {
    pub fn new(store: Arc<StateStore>, registry: TaskRegistry) -> Self {
        Self {
            store,
            registry,
            broadcaster: Broadcaster::new(),
            gate: Mutex::new(()),
        }
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            agents: self.store.snapshot().await,
            optimizing_resources: self.registry.active_keys().await,
        }
    }

    /// Broadcasts the current state; returns the number of subscribers reached.
    pub async fn publish(&self) -> usize {
        let _gate = self.gate.lock().await;
        let snapshot = self.snapshot().await;
        let delivered = self
            .broadcaster
            .broadcast(Arc::new(Envelope::Update(snapshot)));
        debug!(subscribers = delivered, "Published state update");
        delivered
    }

    /// Registers a subscriber whose first event is a full `init` snapshot.
    pub async fn connect(&self) -> Subscription<SharedEnvelope> {
        let _gate = self.gate.lock().await;
        let snapshot = self.snapshot().await;
        self.broadcaster
            .subscribe_with(Some(Arc::new(Envelope::Init(snapshot))))
    }

    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        self.broadcaster.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }
}
