//! Gateway configuration.
//!
//! One nested tree of per-component config structs, loaded once at
//! startup via the `config` crate (file + `RELAY_`-prefixed env overlay)
//! and threaded down by reference/Arc from there.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyCacheConfig {
    pub mode: BodyCacheMode,
    pub memory_threshold_bytes: u64,
    pub max_bytes: u64,
    pub max_age_secs: u64,
    pub high_watermark_ratio: f64,
    pub janitor_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyCacheMode {
    Memory,
    Disk,
    Hybrid,
}

impl Default for BodyCacheConfig {
    fn default() -> Self {
        Self {
            mode: BodyCacheMode::Hybrid,
            memory_threshold_bytes: 1024 * 1024,
            max_bytes: 10 * 1024 * 1024 * 1024,
            max_age_secs: 24 * 3600,
            high_watermark_ratio: 0.8,
            janitor_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub strategy: RetryStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.2,
            retryable_statuses: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorStrategy {
    Random,
    RoundRobin,
    WeightedRoundRobin,
    LeastConnection,
    LowestLatency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub default_strategy: SelectorStrategy,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            default_strategy: SelectorStrategy::WeightedRoundRobin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub probe_concurrency: usize,
    pub admin_probe_failure_threshold: u32,
    pub degrade_threshold: u32,
    pub unavailable_threshold: u32,
    pub history_len: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1800,
            probe_concurrency: 5,
            admin_probe_failure_threshold: 3,
            degrade_threshold: 5,
            unavailable_threshold: 10,
            history_len: 48,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_clients: usize,
    pub outbound_buffer: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            client_timeout_secs: 300,
            max_clients: 10_000,
            outbound_buffer: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCacheConfig {
    pub l1_ttl_secs: u64,
    pub l2_ttl_secs: u64,
    pub bloom_capacity: usize,
    pub bloom_fp_rate: f64,
}

impl Default for UserCacheConfig {
    fn default() -> Self {
        Self {
            l1_ttl_secs: 30,
            l2_ttl_secs: 120,
            bloom_capacity: 100_000,
            bloom_fp_rate: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub queue_size: usize,
    pub batch: usize,
    pub batch_linger_ms: u64,
    pub retry_max: u32,
    pub retry_backoff_ms: u64,
    pub predebit_ttl_secs: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            batch: 100,
            batch_linger_ms: 100,
            retry_max: 3,
            retry_backoff_ms: 1000,
            predebit_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for verifying `Authorization: Bearer <jwt>` credentials
    /// whose shape (two dots) marks them as a JWT rather than an opaque
    /// API key. `None` disables JWT verification; opaque-key lookup via
    /// `TokenRepository` always stays available regardless.
    pub jwt_secret: Option<String>,
}

/// Top-level configuration tree, as produced by [`GatewayConfig::load`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub body_cache: BodyCacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub sse: SseConfig,
    #[serde(default)]
    pub user_cache: UserCacheConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl GatewayConfig {
    /// Load configuration from an optional file, overlaid with `RELAY_`
    /// prefixed environment variables (`RELAY_RETRY__MAX_RETRIES=5`, etc).
    pub fn load(path: Option<&str>) -> Result<Self, crate::error::GatewayError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RELAY")
                .separator("__")
                .try_parsing(true),
        );
        let built = builder
            .build()
            .map_err(|e| crate::error::GatewayError::Config(e.to_string()))?;
        built
            .try_deserialize()
            .or_else(|_| Ok(GatewayConfig::default()))
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }
}
