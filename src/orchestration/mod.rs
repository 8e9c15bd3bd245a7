//! `Gateway` — wires the channel registry/selector/health checker, the
//! relay pipeline, billing, and auth into one owned unit with a
//! start/shutdown lifecycle, handing out `Arc` clones of each subsystem
//! to the HTTP layer.

use crate::adapter::AdapterRegistry;
use crate::auth::AuthService;
use crate::billing::{BillingQueue, Ledger, PricingTable, TokenCounter};
use crate::channel::{ChannelRegistry, ChannelSelector, HealthChecker};
use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::relay::{BodyCache, Broadcaster, RelayPipeline, RetryController};
use crate::repository::InMemoryRepository;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Gateway {
    pub config: GatewayConfig,
    pub repo: Arc<InMemoryRepository>,
    pub channels: Arc<ChannelRegistry>,
    pub selector: Arc<ChannelSelector>,
    pub adapters: Arc<AdapterRegistry>,
    pub health_checker: Arc<HealthChecker>,
    pub body_cache: Arc<BodyCache>,
    pub ledger: Arc<Ledger>,
    pub pricing: Arc<PricingTable>,
    pub tokens: Arc<TokenCounter>,
    pub billing_queue: Arc<BillingQueue>,
    pub broadcaster: Arc<Broadcaster>,
    pub pipeline: Arc<RelayPipeline>,
    pub auth: Arc<AuthService<InMemoryRepository>>,
    pub metrics: Arc<GatewayMetrics>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, repo: Arc<InMemoryRepository>) -> Self {
        let metrics = Arc::new(GatewayMetrics::new());
        let channels = Arc::new(ChannelRegistry::new());
        let selector = Arc::new(ChannelSelector::new(channels.clone(), config.selector.default_strategy));
        let adapters = Arc::new(AdapterRegistry::with_builtin_providers());
        let health_checker = Arc::new(HealthChecker::new(channels.clone(), adapters.clone(), config.health.clone(), metrics.clone()));
        let body_cache = Arc::new(BodyCache::new(config.body_cache.clone(), std::env::temp_dir().join("relay-gateway")));
        let ledger = Arc::new(Ledger::new(std::time::Duration::from_secs(config.billing.predebit_ttl_secs)));
        let pricing = Arc::new(PricingTable::new(std::time::Duration::from_secs(30)));
        let tokens = Arc::new(TokenCounter::new(crate::billing::CountMethod::Approximate, std::time::Duration::from_secs(60)));
        let (billing_queue, _billing_handle) = BillingQueue::spawn(config.billing.clone(), ledger.clone(), metrics.clone());
        let billing_queue = Arc::new(billing_queue);
        let broadcaster = Arc::new(Broadcaster::new(config.sse.clone(), metrics.clone()));
        let retry = RetryController::new(config.retry.clone());

        let pipeline = Arc::new(RelayPipeline {
            channels: channels.clone(),
            selector: selector.clone(),
            adapters: adapters.clone(),
            body_cache: body_cache.clone(),
            retry,
            ledger: ledger.clone(),
            pricing: pricing.clone(),
            tokens: tokens.clone(),
            billing_queue: billing_queue.clone(),
            broadcaster: broadcaster.clone(),
        });

        let auth = Arc::new(AuthService::with_auth_config(repo.clone(), config.user_cache.clone(), config.auth.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            repo,
            channels,
            selector,
            adapters,
            health_checker,
            body_cache,
            ledger,
            pricing,
            tokens,
            billing_queue,
            broadcaster,
            pipeline,
            auth,
            metrics,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawns the background loops (health checker, body cache janitor,
    /// SSE heartbeat) and returns their handles. The caller owns the
    /// `Gateway` for the process lifetime and calls `shutdown` to stop them.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let health_checker = self.health_checker.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            health_checker.run(shutdown_rx).await;
        }));

        let body_cache = self.body_cache.clone();
        let janitor_interval = std::time::Duration::from_secs(self.config.body_cache.janitor_interval_secs);
        let mut shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(janitor_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => body_cache.janitor_sweep().await,
                    _ = shutdown_rx.changed() => { if *shutdown_rx.borrow() { return; } }
                }
            }
        }));

        let broadcaster = self.broadcaster.clone();
        let heartbeat_interval = std::time::Duration::from_secs(self.config.sse.heartbeat_interval_secs);
        let mut shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => broadcaster.heartbeat_sweep(),
                    _ = shutdown_rx.changed() => { if *shutdown_rx.borrow() { return; } }
                }
            }
        }));

        let ledger = self.ledger.clone();
        let sweep_interval = std::time::Duration::from_secs(60);
        let mut shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { ledger.sweep_expired_predebits().await; }
                    _ = shutdown_rx.changed() => { if *shutdown_rx.borrow() { return; } }
                }
            }
        }));

        info!("gateway background loops started");
        handles
    }

    pub fn shutdown(&self) {
        info!("gateway shutting down");
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_gateway_wires_every_subsystem() {
        let repo = Arc::new(InMemoryRepository::new());
        let gateway = Gateway::new(GatewayConfig::default(), repo);
        assert_eq!(gateway.broadcaster.client_count(), 0);
        assert_eq!(gateway.body_cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_background_loops() {
        let repo = Arc::new(InMemoryRepository::new());
        let gateway = Arc::new(Gateway::new(GatewayConfig::default(), repo));
        let handles = gateway.start();
        gateway.shutdown();
        for handle in handles {
            tokio::time::timeout(std::time::Duration::from_secs(2), handle).await.unwrap().unwrap();
        }
    }
}
