//! Singleflight: coalesces concurrent lookups for the same key into one
//! authoritative fetch, so a burst of requests for a just-expired user
//! cache entry doesn't stampede the repository.

use crate::error::GatewayResult;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

pub struct SingleFlight<V: Clone + Send + Sync + 'static> {
    inflight: DashMap<String, Arc<OnceCell<GatewayResult<V>>>>,
}

impl<V: Clone + Send + Sync + 'static> SingleFlight<V> {
    pub fn new() -> Self {
        Self { inflight: DashMap::new() }
    }

    /// All concurrent callers for the same `key` share one execution of
    /// `f`; the entry is removed once it resolves so the next call (after
    /// all current waiters are satisfied) fetches fresh rather than
    /// caching indefinitely — caching is the cache tier's job, not this one's.
    pub async fn do_call<F, Fut>(&self, key: &str, f: F) -> GatewayResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<V>>,
    {
        let cell = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell.get_or_init(f).await.clone();
        self.inflight.remove(key);
        result
    }
}

impl<V: Clone + Send + Sync + 'static> Default for SingleFlight<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn concurrent_calls_for_same_key_run_loader_once() {
        let sf = Arc::new(SingleFlight::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                sf.do_call("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(7u32)
                })
                .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_calls_after_completion_run_loader_again() {
        let sf = SingleFlight::<u32>::new();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            sf.do_call("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1u32)
            })
            .await
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
