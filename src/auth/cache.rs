//! Two-tier user cache: an L1 process-local tier with a short TTL and an
//! L2 tier with a longer one, backed by the bloom filter's negative-lookup
//! short circuit and singleflight coalescing on miss.

use super::bloom::BloomFilter;
use super::singleflight::SingleFlight;
use crate::config::UserCacheConfig;
use crate::error::GatewayError;
use crate::models::User;
use dashmap::DashMap;
use std::future::Future;
use std::time::{Duration, Instant};

pub struct UserCache {
    l1: DashMap<String, (User, Instant)>,
    l2: DashMap<String, (User, Instant)>,
    bloom: BloomFilter,
    singleflight: SingleFlight<User>,
    l1_ttl: Duration,
    l2_ttl: Duration,
}

impl UserCache {
    pub fn new(config: UserCacheConfig) -> Self {
        Self {
            l1: DashMap::new(),
            l2: DashMap::new(),
            bloom: BloomFilter::new(config.bloom_capacity, config.bloom_fp_rate),
            singleflight: SingleFlight::new(),
            l1_ttl: Duration::from_secs(config.l1_ttl_secs),
            l2_ttl: Duration::from_secs(config.l2_ttl_secs),
        }
    }

    /// Call once a user id is confirmed to exist (e.g. right after a
    /// successful repository load) so future negative lookups for
    /// genuinely unknown ids keep short-circuiting cheaply.
    pub fn mark_known(&self, user_id: &str) {
        self.bloom.insert(user_id);
    }

    /// Looks up `user_id` through L1, then L2, then coalesces concurrent
    /// misses onto one call to `loader`. A bloom-filter negative short
    /// circuits straight to `NotFound` without touching either tier.
    pub async fn get_or_load<F, Fut>(&self, user_id: &str, loader: F) -> Result<User, GatewayError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<User, GatewayError>>,
    {
        if !self.bloom.might_contain(user_id) {
            return Err(GatewayError::NotFound(format!("user {user_id}")));
        }

        if let Some(entry) = self.l1.get(user_id) {
            if entry.1.elapsed() < self.l1_ttl {
                return Ok(entry.0.clone());
            }
        }
        if let Some(entry) = self.l2.get(user_id) {
            if entry.1.elapsed() < self.l2_ttl {
                let user = entry.0.clone();
                self.l1.insert(user_id.to_string(), (user.clone(), Instant::now()));
                return Ok(user);
            }
        }

        let owned_id = user_id.to_string();
        let user = self.singleflight.do_call(user_id, move || loader(owned_id)).await?;
        self.l1.insert(user_id.to_string(), (user.clone(), Instant::now()));
        self.l2.insert(user_id.to_string(), (user.clone(), Instant::now()));
        self.bloom.insert(user_id);
        Ok(user)
    }

    pub fn invalidate(&self, user_id: &str) {
        self.l1.remove(user_id);
        self.l2.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserStatus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn sample_user(id: &str) -> User {
        User { id: id.to_string(), group: "default".into(), status: UserStatus::Active, role_ids: vec![] }
    }

    #[tokio::test]
    async fn unknown_user_short_circuits_on_bloom_filter() {
        let cache = UserCache::new(UserCacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = cache
            .get_or_load("ghost", move |_| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(sample_user("ghost"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_lookup_hits_l1_cache() {
        let cache = UserCache::new(UserCacheConfig::default());
        cache.mark_known("u1");
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls_clone = calls.clone();
            cache
                .get_or_load("u1", move |id| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(sample_user(&id))
                    }
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_reload() {
        let cache = UserCache::new(UserCacheConfig::default());
        cache.mark_known("u1");
        cache.get_or_load("u1", |id| async move { Ok(sample_user(&id)) }).await.unwrap();
        cache.invalidate("u1");

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        cache
            .get_or_load("u1", move |id| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(sample_user(&id))
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
