//! Bounded async billing consumer.
//!
//! The relay pipeline must never block on billing I/O, so `enqueue` is a
//! non-blocking `try_send`; a full queue increments `discarded` rather
//! than applying back-pressure to the request path. The consumer task
//! batches jobs with a linger window, retries transient ledger failures
//! with backoff, and parks anything that still fails on a dead-letter
//! queue for manual replay.

use super::ledger::Ledger;
use crate::config::BillingConfig;
use crate::metrics::GatewayMetrics;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub enum BillingJob {
    Confirm { request_id: String, actual_amount: f64 },
    Refund { request_id: String },
}

pub struct BillingQueue {
    sender: mpsc::Sender<BillingJob>,
    discarded: Arc<AtomicU64>,
    dead_letters: Arc<Mutex<VecDeque<BillingJob>>>,
}

impl BillingQueue {
    /// Spawns the consumer task and returns the handle used to enqueue
    /// jobs. The returned `JoinHandle` runs until its sender half is
    /// dropped.
    pub fn spawn(config: BillingConfig, ledger: Arc<Ledger>, metrics: Arc<GatewayMetrics>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_size);
        let discarded = Arc::new(AtomicU64::new(0));
        let dead_letters = Arc::new(Mutex::new(VecDeque::new()));

        let handle = tokio::spawn(run_consumer(rx, ledger, config, dead_letters.clone(), metrics));

        (Self { sender: tx, discarded, dead_letters }, handle)
    }

    pub fn enqueue(&self, job: BillingJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(_) => {
                self.discarded.fetch_add(1, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn discarded_count(&self) -> u64 {
        self.discarded.load(Ordering::SeqCst)
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().await.len()
    }

    pub async fn drain_dead_letters(&self) -> Vec<BillingJob> {
        self.dead_letters.lock().await.drain(..).collect()
    }
}

async fn run_consumer(
    mut rx: mpsc::Receiver<BillingJob>,
    ledger: Arc<Ledger>,
    config: BillingConfig,
    dead_letters: Arc<Mutex<VecDeque<BillingJob>>>,
    metrics: Arc<GatewayMetrics>,
) {
    let mut batch = Vec::with_capacity(config.batch);
    loop {
        batch.clear();
        let deadline = Instant::now() + Duration::from_millis(config.batch_linger_ms);

        match rx.recv().await {
            Some(job) => batch.push(job),
            None => return,
        }

        while batch.len() < config.batch {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(job)) => batch.push(job),
                Ok(None) => break,
                Err(_) => break,
            }
        }

        for job in batch.drain(..) {
            apply_with_retry(&ledger, job, &config, &dead_letters, &metrics).await;
        }
    }
}

async fn apply_with_retry(
    ledger: &Arc<Ledger>,
    job: BillingJob,
    config: &BillingConfig,
    dead_letters: &Arc<Mutex<VecDeque<BillingJob>>>,
    metrics: &Arc<GatewayMetrics>,
) {
    let mut attempt = 0;
    loop {
        let result = match &job {
            BillingJob::Confirm { request_id, actual_amount } => {
                ledger.confirm(request_id, *actual_amount).await.map(|_| ())
            }
            BillingJob::Refund { request_id } => ledger.refund(request_id).await.map(|_| ()),
        };

        match result {
            Ok(()) => return,
            Err(e) if attempt < config.retry_max => {
                attempt += 1;
                warn!("billing job failed (attempt {attempt}/{}): {e}", config.retry_max);
                tokio::time::sleep(Duration::from_millis(config.retry_backoff_ms * attempt as u64)).await;
            }
            Err(e) => {
                error!("billing job permanently failed after {attempt} retries, moving to dead-letter queue: {e}");
                metrics.billing_discarded.fetch_add(1, Ordering::Relaxed);
                dead_letters.lock().await.push_back(job);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserQuota;

    async fn ledger_with_user() -> Arc<Ledger> {
        let ledger = Arc::new(Ledger::new(Duration::from_secs(600)));
        ledger.set_quota(UserQuota::new("u1", 100.0)).await;
        ledger
    }

    #[tokio::test]
    async fn enqueue_and_confirm_applies_to_ledger() {
        let ledger = ledger_with_user().await;
        ledger.pre_debit("u1", "req-1", "gpt-4", 10.0).await.unwrap();

        let mut config = BillingConfig::default();
        config.batch_linger_ms = 10;
        let (queue, handle) = BillingQueue::spawn(config, ledger.clone(), Arc::new(GatewayMetrics::new()));
        assert!(queue.enqueue(BillingJob::Confirm { request_id: "req-1".into(), actual_amount: 8.0 }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let quota = ledger.get_quota("u1").await.unwrap();
        assert_eq!(quota.used, 8.0);
        drop(queue);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn unknown_request_id_lands_on_dead_letter_queue() {
        let ledger = ledger_with_user().await;
        let mut config = BillingConfig::default();
        config.batch_linger_ms = 5;
        config.retry_max = 1;
        config.retry_backoff_ms = 1;
        let metrics = Arc::new(GatewayMetrics::new());
        let (queue, handle) = BillingQueue::spawn(config, ledger, metrics.clone());
        queue.enqueue(BillingJob::Confirm { request_id: "missing".into(), actual_amount: 1.0 });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.dead_letter_count().await, 1);
        assert_eq!(metrics.snapshot().billing_discarded, 1);
        drop(queue);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn full_queue_increments_discarded_without_blocking() {
        let ledger = ledger_with_user().await;
        let mut config = BillingConfig::default();
        config.queue_size = 1;
        let (queue, _handle) = BillingQueue::spawn(config, ledger, Arc::new(GatewayMetrics::new()));
        // Fill and overflow; exact delivery timing is not asserted, only
        // that enqueue never blocks and over-capacity pushes are counted.
        for i in 0..10 {
            queue.enqueue(BillingJob::Refund { request_id: format!("r{i}") });
        }
        // Single-threaded test runtime: the consumer task gets no chance to
        // drain before this synchronous loop finishes, so all but the first
        // `try_send` must overflow the capacity-1 channel.
        assert_eq!(queue.discarded_count(), 9);
    }
}
