//! Periodic health checker.
//!
//! Probes every enabled channel on a fixed interval with bounded
//! concurrency, updating each channel's own latency/success history and
//! status in place.

use crate::adapter::AdapterRegistry;
use crate::channel::registry::ChannelRegistry;
use crate::config::HealthConfig;
use crate::metrics::GatewayMetrics;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Bounded ring of recent probe outcomes, used only for diagnostics (the
/// `health_score` on `Channel` already folds latency + success rate; this
/// additionally keeps the raw samples for an admin-facing history view).
pub struct ProbeHistory {
    samples: Mutex<VecDeque<bool>>,
    capacity: usize,
}

impl ProbeHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub async fn record(&self, ok: bool) {
        let mut samples = self.samples.lock().await;
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(ok);
    }
}

pub struct HealthChecker {
    registry: Arc<ChannelRegistry>,
    adapters: Arc<AdapterRegistry>,
    config: HealthConfig,
    histories: Arc<DashMap<String, Arc<ProbeHistory>>>,
    metrics: Arc<GatewayMetrics>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        adapters: Arc<AdapterRegistry>,
        config: HealthConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            registry,
            adapters,
            config,
            histories: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Recent probe outcomes for one channel, most-recent-last, oldest
    /// dropped once the ring fills. Empty if the channel has never been
    /// probed yet.
    pub async fn probe_history(&self, channel_id: &str) -> Vec<bool> {
        match self.histories.get(channel_id) {
            Some(history) => history.samples.lock().await.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Runs forever on the application's lifecycle, probing every enabled
    /// channel every `interval_secs` with `probe_concurrency` in flight at
    /// once.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.config.interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health checker shutting down");
                        return;
                    }
                }
            }
        }
    }

    pub async fn run_once(&self) {
        let channels = self.registry.all_enabled().await;
        let semaphore = Arc::new(Semaphore::new(self.config.probe_concurrency));
        let mut tasks = Vec::new();
        for slot in channels {
            let semaphore = semaphore.clone();
            let adapters = self.adapters.clone();
            let histories = self.histories.clone();
            let metrics = self.metrics.clone();
            let history_len = self.config.history_len;
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let (provider, base_url, api_key, id) = {
                    let ch = slot.read().await;
                    (
                        ch.provider.clone(),
                        ch.base_url.clone(),
                        ch.api_keys.first().cloned().unwrap_or_default(),
                        ch.id.clone(),
                    )
                };
                let Some(adapter) = adapters.get(&provider) else {
                    warn!("no adapter registered for provider {provider}, skipping probe");
                    return;
                };
                let history = histories
                    .entry(id.clone())
                    .or_insert_with(|| Arc::new(ProbeHistory::new(history_len)))
                    .clone();

                let started = Instant::now();
                let result = adapter.health_probe(&base_url, &api_key).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let now = chrono::Utc::now().timestamp();
                let ok = matches!(result, Ok(true));
                history.record(ok).await;
                let mut ch = slot.write().await;
                match result {
                    Ok(true) => {
                        let was_unavailable = ch.status == crate::models::ChannelStatus::Unavailable;
                        ch.record_success(elapsed_ms, now);
                        if was_unavailable {
                            ch.recover();
                            info!("channel {id} recovered to Healthy after successful probe");
                        }
                    }
                    Ok(false) | Err(_) => {
                        ch.record_failure(now);
                        metrics.health_probes_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        debug!("health probe failed for channel {id}");
                    }
                }
            }));
        }
        for t in tasks {
            let _ = t.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Channel;

    #[tokio::test]
    async fn probe_history_caps_at_capacity() {
        let history = ProbeHistory::new(3);
        for i in 0..5 {
            history.record(i % 2 == 0).await;
        }
        let samples = history.samples.lock().await;
        assert_eq!(samples.len(), 3);
    }

    #[tokio::test]
    async fn run_once_skips_channels_without_a_registered_adapter() {
        let registry = Arc::new(ChannelRegistry::new());
        let mut ch = Channel::new("c1", "Chan 1", "nonexistent-provider", "https://example.com");
        ch.models = vec!["m".to_string()];
        registry.upsert(ch).await;
        let adapters = Arc::new(AdapterRegistry::with_builtin_providers());
        let metrics = Arc::new(GatewayMetrics::new());
        let checker = HealthChecker::new(registry.clone(), adapters, HealthConfig::default(), metrics);
        checker.run_once().await;
        let slot = registry.get("c1").await.unwrap();
        // No adapter for the provider, so status is left untouched at Healthy.
        assert_eq!(slot.read().await.status, crate::models::ChannelStatus::Healthy);
        // Skipped before reaching the adapter call, so no history was recorded.
        assert!(checker.probe_history("c1").await.is_empty());
    }

    #[tokio::test]
    async fn probe_history_records_through_the_dashmap() {
        let history = Arc::new(ProbeHistory::new(48));
        history.record(true).await;
        history.record(false).await;
        let checker = HealthChecker::new(
            Arc::new(ChannelRegistry::new()),
            Arc::new(AdapterRegistry::with_builtin_providers()),
            HealthConfig::default(),
            Arc::new(GatewayMetrics::new()),
        );
        checker.histories.insert("c1".to_string(), history);
        let samples = checker.probe_history("c1").await;
        assert_eq!(samples, vec![true, false]);
    }
}
