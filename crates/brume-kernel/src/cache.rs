//! In-memory raw cache shared by every handler.
//!
//! Maps cache keys to the last known [`RawState`]. A key can be absent
//! (never looked up), or present with `None` (looked up in storage and known
//! to be missing). Every write is published on the cache flow bus so
//! `brume_subscribe` can push it to the foreground.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::flows::{CacheFlow, SharedCacheFlowBus, Subscription, shared_cache_flow_bus};

/// Serialized state of one cache entry, as stored and as sent to the foreground.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Unix millis of the last write.
    pub time: u64,
}

impl RawState {
    pub fn data(data: Value) -> Self {
        Self { data: Some(data), error: None, time: brume_types::now_millis() }
    }

    /// Decode the data half into `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.data.clone().map(serde_json::from_value)
    }
}

pub struct CacheCore {
    raw: DashMap<String, Option<RawState>>,
    flows: SharedCacheFlowBus,
}

impl CacheCore {
    pub fn new(flow_capacity: usize) -> Self {
        Self { raw: DashMap::new(), flows: shared_cache_flow_bus(flow_capacity) }
    }

    /// `None` if the key was never loaded, `Some(None)` if known absent.
    pub fn get(&self, key: &str) -> Option<Option<RawState>> {
        self.raw.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.raw.contains_key(key)
    }

    pub fn set(&self, key: &str, state: Option<RawState>) {
        trace!(key, present = state.is_some(), "cache set");
        self.raw.insert(key.to_string(), state.clone());
        self.flows.publish(CacheFlow::Updated { key: key.to_string(), state });
    }

    pub fn delete(&self, key: &str) -> Option<RawState> {
        let removed = self.raw.remove(key).and_then(|(_, state)| state);
        self.flows.publish(CacheFlow::Deleted { key: key.to_string() });
        removed
    }

    /// Publish the current state of `key` again without changing it.
    pub fn reindex(&self, key: &str) {
        let state = self.get(key).flatten();
        self.flows.publish(CacheFlow::Updated { key: key.to_string(), state });
    }

    /// Forget every entry (used on logout).
    pub fn clear(&self) {
        self.raw.clear();
    }

    pub fn subscribe(&self) -> Subscription<CacheFlow> {
        self.flows.subscribe("cache.*")
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl Default for CacheCore {
    fn default() -> Self {
        Self::new(crate::constants::FLOW_BUS_CAPACITY)
    }
}
