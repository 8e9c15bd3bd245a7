//! The channel selector: candidate filtering, wildcard bias, and five
//! load-balancing strategies.

use super::registry::ChannelRegistry;
use crate::config::SelectorStrategy;
use crate::error::{GatewayError, GatewayResult};
use crate::models::Channel;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct SelectionRequest {
    pub provider: Option<String>,
    pub model: String,
    pub group: String,
    pub region: Option<String>,
    pub min_availability: Option<f64>,
    pub exclude: HashSet<String>,
    pub preferred_id: Option<String>,
    pub strategy: Option<SelectorStrategy>,
}

impl SelectionRequest {
    pub fn new(model: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            group: group.into(),
            ..Default::default()
        }
    }
}

pub struct ChannelSelector {
    registry: Arc<ChannelRegistry>,
    default_strategy: SelectorStrategy,
    round_robin_counters: DashMap<(String, String), AtomicUsize>,
    smooth_weights: DashMap<String, AtomicI64>,
}

impl ChannelSelector {
    pub fn new(registry: Arc<ChannelRegistry>, default_strategy: SelectorStrategy) -> Self {
        Self {
            registry,
            default_strategy,
            round_robin_counters: DashMap::new(),
            smooth_weights: DashMap::new(),
        }
    }

    /// Runs the full pipeline: candidate set -> wildcard pass -> strategy
    /// step -> bump concurrency. Returns exactly one channel or
    /// `NoCandidate`.
    pub async fn select(&self, req: &SelectionRequest) -> GatewayResult<Arc<RwLock<Channel>>> {
        let abilities = self.registry.abilities_for(&req.model, &req.group).await;
        let mut candidate_ids: Vec<String> = Vec::new();
        for a in &abilities {
            if !a.enabled || req.exclude.contains(&a.channel_id) {
                continue;
            }
            candidate_ids.push(a.channel_id.clone());
        }

        let mut candidates = Vec::new();
        for id in &candidate_ids {
            let Ok(slot) = self.registry.get(id).await else { continue };
            let ch = slot.read().await;
            if !ch.eligible_for_selection() {
                continue;
            }
            if let Some(provider) = &req.provider {
                if &ch.provider != provider {
                    continue;
                }
            }
            if let Some(region) = &req.region {
                if ch.region.as_deref() != Some(region.as_str()) {
                    continue;
                }
            }
            if let Some(min_availability) = req.min_availability {
                if ch.health_score() < min_availability {
                    continue;
                }
            }
            drop(ch);
            candidates.push(slot);
        }

        if candidates.is_empty() {
            return Err(GatewayError::NoCandidate {
                model: req.model.clone(),
                group: req.group.clone(),
            });
        }

        // Wildcard pass: matching rules move their priority channels to the
        // front of the candidate list.
        let rules = self.registry.wildcard_rules().await;
        let mut priority_ids: HashSet<String> = HashSet::new();
        for rule in &rules {
            if rule.matches(&req.model) {
                priority_ids.extend(rule.priority_set().into_iter().map(String::from));
            }
        }
        if !priority_ids.is_empty() {
            let mut prioritized = Vec::new();
            let mut rest = Vec::new();
            for slot in candidates {
                let id = slot.read().await.id.clone();
                if priority_ids.contains(&id) {
                    prioritized.push(slot);
                } else {
                    rest.push(slot);
                }
            }
            prioritized.extend(rest);
            candidates = prioritized;
        }

        if let Some(preferred) = &req.preferred_id {
            if let Some(pos) = {
                let mut found = None;
                for (i, slot) in candidates.iter().enumerate() {
                    if &slot.read().await.id == preferred {
                        found = Some(i);
                        break;
                    }
                }
                found
            } {
                let preferred_slot = candidates.remove(pos);
                let chosen = preferred_slot.clone();
                self.bump_concurrency(&chosen).await;
                return Ok(chosen);
            }
        }

        let strategy = req.strategy.unwrap_or(self.default_strategy);
        let chosen = self.apply_strategy(strategy, &req.model, &req.group, candidates).await?;
        self.bump_concurrency(&chosen).await;
        Ok(chosen)
    }

    async fn bump_concurrency(&self, slot: &Arc<RwLock<Channel>>) {
        let ch = slot.read().await;
        ch.current_concurrency.fetch_add(1, Ordering::SeqCst);
    }

    /// Call after the relay pipeline finishes using a channel.
    pub async fn release(&self, slot: &Arc<RwLock<Channel>>) {
        let ch = slot.read().await;
        ch.current_concurrency.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            Some(v.saturating_sub(1))
        }).ok();
    }

    async fn apply_strategy(
        &self,
        strategy: SelectorStrategy,
        model: &str,
        group: &str,
        mut candidates: Vec<Arc<RwLock<Channel>>>,
    ) -> GatewayResult<Arc<RwLock<Channel>>> {
        match strategy {
            SelectorStrategy::Random => {
                use rand::seq::SliceRandom;
                let mut rng = rand::thread_rng();
                candidates
                    .choose(&mut rng)
                    .cloned()
                    .ok_or_else(|| no_candidate(model, group))
            }
            SelectorStrategy::RoundRobin => {
                // Stable ordering by id for a deterministic tie-break.
                let mut ids: Vec<(String, Arc<RwLock<Channel>>)> = Vec::new();
                for slot in &candidates {
                    ids.push((slot.read().await.id.clone(), slot.clone()));
                }
                ids.sort_by(|a, b| a.0.cmp(&b.0));
                let key = (model.to_string(), group.to_string());
                let counter = self
                    .round_robin_counters
                    .entry(key)
                    .or_insert_with(|| AtomicUsize::new(0));
                let idx = counter.fetch_add(1, Ordering::SeqCst) % ids.len();
                Ok(ids[idx].1.clone())
            }
            SelectorStrategy::WeightedRoundRobin => self.smooth_weighted_round_robin(candidates).await,
            SelectorStrategy::LeastConnection => {
                let mut best: Option<(u32, u64, Arc<RwLock<Channel>>)> = None;
                for slot in candidates.drain(..) {
                    let ch = slot.read().await;
                    let conc = ch.current_concurrency.load(Ordering::SeqCst);
                    let latency = ch.avg_latency_ms.load(Ordering::SeqCst);
                    drop(ch);
                    best = Some(match best {
                        None => (conc, latency, slot),
                        Some((bc, bl, bslot)) => {
                            if conc < bc || (conc == bc && latency < bl) {
                                (conc, latency, slot)
                            } else {
                                (bc, bl, bslot)
                            }
                        }
                    });
                }
                best.map(|(_, _, slot)| slot).ok_or_else(|| no_candidate(model, group))
            }
            SelectorStrategy::LowestLatency => {
                let mut best: Option<(u64, i64, Arc<RwLock<Channel>>)> = None;
                for slot in candidates.drain(..) {
                    let ch = slot.read().await;
                    let latency = ch.avg_latency_ms.load(Ordering::SeqCst);
                    let success = (ch.success_rate() * 1_000_000.0) as i64;
                    drop(ch);
                    best = Some(match best {
                        None => (latency, success, slot),
                        Some((bl, bs, bslot)) => {
                            if latency < bl || (latency == bl && success > bs) {
                                (latency, success, slot)
                            } else {
                                (bl, bs, bslot)
                            }
                        }
                    });
                }
                best.map(|(_, _, slot)| slot).ok_or_else(|| no_candidate(model, group))
            }
        }
    }

    /// Nginx-style smooth weighted round-robin: each candidate's
    /// `current_weight` accumulates by its effective weight every pick;
    /// the max is selected and then discounted by the total weight.
    async fn smooth_weighted_round_robin(
        &self,
        candidates: Vec<Arc<RwLock<Channel>>>,
    ) -> GatewayResult<Arc<RwLock<Channel>>> {
        let mut entries = Vec::with_capacity(candidates.len());
        let mut total_weight = 0i64;
        for slot in &candidates {
            let ch = slot.read().await;
            let weight = ch.effective_weight().max(1) as i64;
            let id = ch.id.clone();
            drop(ch);
            total_weight += weight;
            let current = self
                .smooth_weights
                .entry(id.clone())
                .or_insert_with(|| AtomicI64::new(0));
            let new_current = current.fetch_add(weight, Ordering::SeqCst) + weight;
            entries.push((id, weight, new_current, slot.clone()));
        }

        let (winner_id, _, _, winner_slot) = entries
            .iter()
            .max_by_key(|(_, _, current, _)| *current)
            .cloned()
            .ok_or_else(|| GatewayError::NoCandidate {
                model: String::new(),
                group: String::new(),
            })?;

        if let Some(current) = self.smooth_weights.get(&winner_id) {
            current.fetch_sub(total_weight, Ordering::SeqCst);
        }

        Ok(winner_slot)
    }
}

fn no_candidate(model: &str, group: &str) -> GatewayError {
    GatewayError::NoCandidate {
        model: model.to_string(),
        group: group.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::registry::ChannelRegistry;
    use crate::models::Channel;

    async fn registry_with(ids_and_weights: &[(&str, i32)]) -> Arc<ChannelRegistry> {
        let registry = Arc::new(ChannelRegistry::new());
        for (id, weight) in ids_and_weights {
            let mut ch = Channel::new(*id, *id, "openai", "https://api.openai.com");
            ch.models = vec!["gpt-4".to_string()];
            ch.weight = *weight;
            registry.upsert(ch).await;
        }
        registry
    }

    #[tokio::test]
    async fn no_candidate_when_model_unknown() {
        let registry = registry_with(&[]).await;
        let selector = ChannelSelector::new(registry, SelectorStrategy::Random);
        let req = SelectionRequest::new("gpt-4", "default");
        assert!(matches!(selector.select(&req).await, Err(GatewayError::NoCandidate { .. })));
    }

    #[tokio::test]
    async fn round_robin_cycles_through_candidates() {
        let registry = registry_with(&[("a", 1), ("b", 1)]).await;
        let selector = ChannelSelector::new(registry, SelectorStrategy::RoundRobin);
        let req = SelectionRequest::new("gpt-4", "default");
        let first = selector.select(&req).await.unwrap();
        let second = selector.select(&req).await.unwrap();
        let first_id = first.read().await.id.clone();
        let second_id = second.read().await.id.clone();
        assert_ne!(first_id, second_id);
    }

    #[tokio::test]
    async fn weighted_round_robin_respects_ratio_over_many_picks() {
        let registry = registry_with(&[("a", 3), ("b", 1)]).await;
        let selector = ChannelSelector::new(registry, SelectorStrategy::WeightedRoundRobin);
        let req = SelectionRequest::new("gpt-4", "default");
        let mut counts = std::collections::HashMap::new();
        for _ in 0..40 {
            let slot = selector.select(&req).await.unwrap();
            let id = slot.read().await.id.clone();
            *counts.entry(id).or_insert(0) += 1;
            selector.release(&slot).await;
        }
        let a = *counts.get("a").unwrap_or(&0);
        let b = *counts.get("b").unwrap_or(&0);
        assert!(a > b, "expected a ({a}) to be picked more often than b ({b})");
    }

    #[tokio::test]
    async fn exclude_set_removes_candidate() {
        let registry = registry_with(&[("a", 1)]).await;
        let selector = ChannelSelector::new(registry, SelectorStrategy::Random);
        let mut req = SelectionRequest::new("gpt-4", "default");
        req.exclude.insert("a".to_string());
        assert!(matches!(selector.select(&req).await, Err(GatewayError::NoCandidate { .. })));
    }
}
