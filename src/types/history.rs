use serde::{Deserialize, Deserializer, Serialize};
use std::collections::VecDeque;

use super::Variant;

/// Maximum number of variants kept in a planet's trace history.
pub const HISTORY_CAPACITY: usize = 15;

/// Past variants of a planet, newest first, bounded by [`HISTORY_CAPACITY`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TraceHistory(VecDeque<Variant>);

impl TraceHistory {
    pub fn new() -> Self {
        Self(VecDeque::with_capacity(HISTORY_CAPACITY))
    }

    /// Inserts `variant` as the newest entry and returns the evicted oldest
    /// entry when the history was already full.
    pub fn push_front(&mut self, mut variant: Variant) -> Option<Variant> {
        variant.is_deployed = false;
        self.0.push_front(variant);
        if self.0.len() > HISTORY_CAPACITY {
            self.0.pop_back()
        } else {
            None
        }
    }

    pub fn remove(&mut self, variant_id: &str) -> Option<Variant> {
        let index = self.0.iter().position(|v| v.id == variant_id)?;
        self.0.remove(index)
    }

    pub fn get(&self, variant_id: &str) -> Option<&Variant> {
        self.0.iter().find(|v| v.id == variant_id)
    }

    pub fn contains(&self, variant_id: &str) -> bool {
        self.get(variant_id).is_some()
    }

    pub fn front(&self) -> Option<&Variant> {
        self.0.front()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variant> {
        self.0.iter()
    }
}

impl From<Vec<Variant>> for TraceHistory {
    fn from(variants: Vec<Variant>) -> Self {
        let mut entries: VecDeque<Variant> = variants.into_iter().take(HISTORY_CAPACITY).collect();
        for variant in entries.iter_mut() {
            variant.is_deployed = false;
        }
        Self(entries)
    }
}

impl<'de> Deserialize<'de> for TraceHistory {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<Variant>::deserialize(deserializer).map(Self::from)
    }
}
