//! The indexed channel catalog: by id, by provider, by model (via
//! `ChannelAbility`), by region, plus the wildcard rule table.
//!
//! Each channel is `Arc<RwLock<Channel>>` so reads (the hot selection
//! path) take a cheap shared lock and status transitions take a brief
//! exclusive one; the secondary indices are plain `id` vectors rebuilt
//! under the registry's own lock so `refresh_all` can swap them atomically.

use crate::error::{GatewayError, GatewayResult};
use crate::models::{Channel, ChannelAbility, WildcardRule};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct Indices {
    by_provider: HashMap<String, Vec<String>>,
    by_model_group: HashMap<(String, String), Vec<ChannelAbility>>,
    by_region: HashMap<String, Vec<String>>,
}

impl Indices {
    fn empty() -> Self {
        Self {
            by_provider: HashMap::new(),
            by_model_group: HashMap::new(),
            by_region: HashMap::new(),
        }
    }

    async fn build(channels: &HashMap<String, Arc<RwLock<Channel>>>) -> Self {
        // Takes a brief shared read lock per channel; concurrent writers
        // (record_success/record_failure) only ever hold the write lock
        // briefly, so this waits rather than risks panicking on contention.
        let mut idx = Indices::empty();
        for (id, slot) in channels {
            let ch = slot.read().await;
            idx.by_provider.entry(ch.provider.clone()).or_default().push(id.clone());
            if let Some(region) = &ch.region {
                idx.by_region.entry(region.clone()).or_default().push(id.clone());
            }
            for model in &ch.models {
                idx.by_model_group
                    .entry((model.clone(), ch.group.clone()))
                    .or_default()
                    .push(ChannelAbility {
                        channel_id: id.clone(),
                        model: model.clone(),
                        group: ch.group.clone(),
                        priority: ch.priority,
                        weight: ch.weight,
                        enabled: ch.enabled(),
                    });
            }
        }
        idx
    }
}

pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<RwLock<Channel>>>>,
    indices: RwLock<Indices>,
    wildcard_rules: RwLock<Vec<WildcardRule>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            indices: RwLock::new(Indices::empty()),
            wildcard_rules: RwLock::new(Vec::new()),
        }
    }

    /// Insert or replace a channel and rebuild the indices affected by it.
    /// Concurrent with reads: only the brief index-rebuild window takes a
    /// write lock.
    pub async fn upsert(&self, channel: Channel) {
        let id = channel.id.clone();
        let mut channels = self.channels.write().await;
        channels.insert(id, Arc::new(RwLock::new(channel)));
        let rebuilt = Indices::build(&channels).await;
        drop(channels);
        *self.indices.write().await = rebuilt;
    }

    pub async fn get(&self, id: &str) -> GatewayResult<Arc<RwLock<Channel>>> {
        self.channels
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("channel {id}")))
    }

    pub async fn list_by_provider(&self, provider: &str) -> Vec<Arc<RwLock<Channel>>> {
        let ids = self
            .indices
            .read()
            .await
            .by_provider
            .get(provider)
            .cloned()
            .unwrap_or_default();
        self.resolve(&ids).await
    }

    pub async fn list_by_region(&self, region: &str) -> Vec<Arc<RwLock<Channel>>> {
        let ids = self
            .indices
            .read()
            .await
            .by_region
            .get(region)
            .cloned()
            .unwrap_or_default();
        self.resolve(&ids).await
    }

    /// O(k) candidate lookup for `(model, group)`, k = number of channels
    /// able to serve that pair. This is the lookup the selector pipeline
    /// starts from.
    pub async fn abilities_for(&self, model: &str, group: &str) -> Vec<ChannelAbility> {
        self.indices
            .read()
            .await
            .by_model_group
            .get(&(model.to_string(), group.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    async fn resolve(&self, ids: &[String]) -> Vec<Arc<RwLock<Channel>>> {
        let channels = self.channels.read().await;
        ids.iter().filter_map(|id| channels.get(id).cloned()).collect()
    }

    /// Atomic full-catalog replace: builds the new map and indices before
    /// taking any lock, then swaps both under the write lock.
    pub async fn refresh_all(&self, new_channels: Vec<Channel>) {
        let mut map = HashMap::with_capacity(new_channels.len());
        for ch in new_channels {
            map.insert(ch.id.clone(), Arc::new(RwLock::new(ch)));
        }
        let rebuilt = Indices::build(&map).await;
        {
            let mut channels = self.channels.write().await;
            *channels = map;
        }
        *self.indices.write().await = rebuilt;
    }

    /// Removes a channel and rebuilds the indices without it. No-op if
    /// the id is already absent.
    pub async fn remove(&self, id: &str) {
        let mut channels = self.channels.write().await;
        if channels.remove(id).is_none() {
            return;
        }
        let rebuilt = Indices::build(&channels).await;
        drop(channels);
        *self.indices.write().await = rebuilt;
    }

    pub async fn set_wildcard_rules(&self, rules: Vec<WildcardRule>) {
        *self.wildcard_rules.write().await = rules;
    }

    pub async fn wildcard_rules(&self) -> Vec<WildcardRule> {
        self.wildcard_rules.read().await.clone()
    }

    pub async fn all_enabled(&self) -> Vec<Arc<RwLock<Channel>>> {
        let channels = self.channels.read().await;
        let mut out = Vec::new();
        for slot in channels.values() {
            if slot.read().await.enabled() {
                out.push(slot.clone());
            }
        }
        out
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
