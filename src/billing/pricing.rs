//! Pricing evaluator — turns a `Usage` into a charge under a model's
//! current `ModelPrice`, with a short TTL cache in front of the price
//! table lookup since config rarely changes but is read on every request.

use crate::models::{ModelPrice, PricingMode, Usage};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

pub struct PricingTable {
    /// Full version history per `(model, group)`; the last entry is current.
    history: RwLock<HashMap<(String, String), Vec<ModelPrice>>>,
    cache: DashMap<(String, String), (ModelPrice, Instant)>,
    cache_ttl: Duration,
}

impl PricingTable {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            history: RwLock::new(HashMap::new()),
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// Inserts the first version of a price, or appends a new version if
    /// one already exists for `(model, group)` — never overwrites history.
    pub async fn upsert(&self, price: ModelPrice) {
        let key = (price.model.clone(), price.group.clone());
        let mut history = self.history.write().await;
        let entry = history.entry(key.clone()).or_default();
        let next = match entry.last() {
            Some(current) => current.next_version(price.input_price_per_1k, price.output_price_per_1k),
            None => price,
        };
        entry.push(next);
        self.cache.remove(&key);
    }

    pub async fn current(&self, model: &str, group: &str) -> Option<ModelPrice> {
        let key = (model.to_string(), group.to_string());
        if let Some(cached) = self.cache.get(&key) {
            if cached.1.elapsed() < self.cache_ttl {
                return Some(cached.0.clone());
            }
        }
        let history = self.history.read().await;
        let price = history.get(&key)?.last()?.clone();
        self.cache.insert(key, (price.clone(), Instant::now()));
        Some(price)
    }

    pub async fn history(&self, model: &str, group: &str) -> Vec<ModelPrice> {
        self.history
            .read()
            .await
            .get(&(model.to_string(), group.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

/// Computes the charge for `usage` under `price`, applying the group
/// multiplier and then the minimum-price floor.
pub fn evaluate(price: &ModelPrice, usage: &Usage) -> f64 {
    let raw = match price.pricing_mode {
        PricingMode::ByToken => {
            let input_cost = (usage.prompt_tokens as f64 / 1000.0) * price.input_price_per_1k;
            let output_cost = (usage.completion_tokens as f64 / 1000.0) * price.output_price_per_1k;
            input_cost + output_cost
        }
        PricingMode::ByRequest => price.input_price_per_1k,
    };
    let charged = raw * price.group_multiplier;
    match price.min_price {
        Some(floor) => charged.max(floor),
        None => charged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_token_price() -> ModelPrice {
        ModelPrice {
            model: "gpt-4".into(),
            group: "default".into(),
            input_price_per_1k: 0.01,
            output_price_per_1k: 0.03,
            min_price: Some(0.001),
            pricing_mode: PricingMode::ByToken,
            group_multiplier: 1.0,
            version: 1,
        }
    }

    #[test]
    fn by_token_evaluates_input_and_output_separately() {
        let price = by_token_price();
        let usage = Usage { prompt_tokens: 1000, completion_tokens: 500, total_tokens: 1500 };
        let cost = evaluate(&price, &usage);
        assert!((cost - (0.01 + 0.015)).abs() < 1e-9);
    }

    #[test]
    fn min_price_floors_tiny_charges() {
        let price = by_token_price();
        let usage = Usage { prompt_tokens: 1, completion_tokens: 0, total_tokens: 1 };
        let cost = evaluate(&price, &usage);
        assert_eq!(cost, 0.001);
    }

    #[test]
    fn group_multiplier_scales_the_charge() {
        let mut price = by_token_price();
        price.group_multiplier = 2.0;
        let usage = Usage { prompt_tokens: 1000, completion_tokens: 0, total_tokens: 1000 };
        let cost = evaluate(&price, &usage);
        assert!((cost - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn upsert_appends_versions_without_overwriting_history() {
        let table = PricingTable::new(Duration::from_secs(30));
        table.upsert(by_token_price()).await;
        let mut second = by_token_price();
        second.input_price_per_1k = 0.02;
        table.upsert(second).await;

        let history = table.history("gpt-4", "default").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[1].version, 2);
        let current = table.current("gpt-4", "default").await.unwrap();
        assert_eq!(current.input_price_per_1k, 0.02);
    }

    #[tokio::test]
    async fn current_returns_none_for_unknown_model() {
        let table = PricingTable::new(Duration::from_secs(30));
        assert!(table.current("unknown", "default").await.is_none());
    }
}
