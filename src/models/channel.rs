//! Channel, ChannelAbility, and WildcardRule — the catalog of upstream
//! providers and the denormalized indices used to select among them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64};

/// Runtime health state. At most one variant applies at a time; see the
/// transition rules on [`Channel::record_failure`] / [`Channel::record_success`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    Healthy,
    Degraded,
    Unavailable,
    Disabled,
}

/// Capability flags a channel advertises.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub streaming: bool,
    pub function_calling: bool,
    pub vision: bool,
}

/// A configured upstream LLM provider endpoint.
///
/// Atomics hold the fields mutated on the hot path (concurrency, failure
/// count, latency bucket) so reads never need the registry's write lock;
/// see `channel::registry` for the index that owns these.
#[derive(Debug, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub display_name: String,
    pub provider: String,
    pub base_url: String,
    pub api_keys: Vec<String>,
    pub models: Vec<String>,
    pub priority: i32,
    pub weight: i32,
    pub group: String,
    pub region: Option<String>,
    pub capabilities: Capabilities,
    pub concurrency_limit: u32,
    pub rate_limit_per_min: u32,

    #[serde(skip, default = "default_status")]
    pub status: ChannelStatus,
    #[serde(skip)]
    pub consecutive_failures: AtomicU32,
    #[serde(skip)]
    pub current_concurrency: AtomicU32,
    #[serde(skip)]
    pub last_success_at: AtomicI64,
    #[serde(skip)]
    pub last_failure_at: AtomicI64,
    #[serde(skip)]
    pub total_requests: AtomicU64,
    #[serde(skip)]
    pub total_failures: AtomicU64,
    /// avg_latency_ms in fixed-point milliseconds; updated under an EWMA
    /// (alpha = 0.2) by the health checker and the relay pipeline's
    /// post-flight step. Stored as an atomic because only a single scalar
    /// needs to move, not a struct, so no mutex is required.
    #[serde(skip)]
    pub avg_latency_ms: AtomicU64,
}

fn default_status() -> ChannelStatus {
    ChannelStatus::Healthy
}

impl Channel {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        provider: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            provider: provider.into(),
            base_url: base_url.into(),
            api_keys: Vec::new(),
            models: Vec::new(),
            priority: 0,
            weight: 1,
            group: "default".to_string(),
            region: None,
            capabilities: Capabilities::default(),
            concurrency_limit: 100,
            rate_limit_per_min: 0,
            status: ChannelStatus::Healthy,
            consecutive_failures: AtomicU32::new(0),
            current_concurrency: AtomicU32::new(0),
            last_success_at: AtomicI64::new(0),
            last_failure_at: AtomicI64::new(0),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            avg_latency_ms: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.status != ChannelStatus::Disabled
    }

    pub fn eligible_for_selection(&self) -> bool {
        matches!(self.status, ChannelStatus::Healthy | ChannelStatus::Degraded)
    }

    /// Effective weight: halved while Degraded.
    pub fn effective_weight(&self) -> i32 {
        match self.status {
            ChannelStatus::Degraded => (self.weight / 2).max(1),
            _ => self.weight,
        }
    }

    /// A success clears the failure counter and, if Degraded, restores
    /// Healthy. It never moves a channel out of Unavailable/Disabled on
    /// its own — those require explicit recovery.
    pub fn record_success(&mut self, latency_ms: u64, now_epoch: i64) {
        self.consecutive_failures.store(0, std::sync::atomic::Ordering::SeqCst);
        self.last_success_at.store(now_epoch, std::sync::atomic::Ordering::SeqCst);
        self.total_requests.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.update_latency_ewma(latency_ms);
        if self.status == ChannelStatus::Degraded {
            self.status = ChannelStatus::Healthy;
        }
    }

    /// A failure increments the counter and applies the state-machine
    /// thresholds: `>=5 => Degraded`, `>=10 => Unavailable`.
    pub fn record_failure(&mut self, now_epoch: i64) {
        let failures = self
            .consecutive_failures
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        self.last_failure_at.store(now_epoch, std::sync::atomic::Ordering::SeqCst);
        self.total_requests.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.total_failures.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        if self.status == ChannelStatus::Disabled {
            return;
        }
        if failures >= 10 {
            self.status = ChannelStatus::Unavailable;
        } else if failures >= 5 {
            self.status = ChannelStatus::Degraded;
        }
    }

    /// Explicit admin recovery: the only path back from Unavailable.
    pub fn recover(&mut self) {
        if self.status == ChannelStatus::Unavailable {
            self.status = ChannelStatus::Healthy;
            self.consecutive_failures.store(0, std::sync::atomic::Ordering::SeqCst);
        }
    }

    pub fn disable(&mut self) {
        self.status = ChannelStatus::Disabled;
    }

    fn update_latency_ewma(&self, sample_ms: u64) {
        const ALPHA_NUM: u64 = 2; // alpha = 0.2 expressed as 2/10
        const ALPHA_DEN: u64 = 10;
        let prev = self.avg_latency_ms.load(std::sync::atomic::Ordering::SeqCst);
        let next = if prev == 0 {
            sample_ms
        } else {
            (sample_ms * ALPHA_NUM + prev * (ALPHA_DEN - ALPHA_NUM)) / ALPHA_DEN
        };
        self.avg_latency_ms.store(next, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests.load(std::sync::atomic::Ordering::SeqCst);
        if total == 0 {
            return 1.0;
        }
        let failures = self.total_failures.load(std::sync::atomic::Ordering::SeqCst);
        1.0 - (failures as f64 / total as f64)
    }

    /// Diagnostic-only score (0-100); does not influence routing directly.
    pub fn health_score(&self) -> f64 {
        let latency = self.avg_latency_ms.load(std::sync::atomic::Ordering::SeqCst) as f64;
        let latency_term = (1.0 - (latency - 1000.0) / 4000.0).max(0.0);
        (0.7 * self.success_rate() + 0.3 * latency_term) * 100.0
    }

    /// Copies the configured fields into a fresh `Channel` with zeroed
    /// runtime counters. Used wherever a snapshot needs to outlive the
    /// original (e.g. a repository listing), since the atomics themselves
    /// are not `Clone`.
    pub fn config_clone(&self) -> Channel {
        let mut clone = Channel::new(self.id.clone(), self.display_name.clone(), self.provider.clone(), self.base_url.clone());
        clone.api_keys = self.api_keys.clone();
        clone.models = self.models.clone();
        clone.priority = self.priority;
        clone.weight = self.weight;
        clone.group = self.group.clone();
        clone.region = self.region.clone();
        clone.capabilities = self.capabilities;
        clone.concurrency_limit = self.concurrency_limit;
        clone.rate_limit_per_min = self.rate_limit_per_min;
        clone.status = self.status;
        clone
    }
}

/// Denormalized `(channel_id, model, group)` index row, rebuilt whenever a
/// channel's model list or group changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAbility {
    pub channel_id: String,
    pub model: String,
    pub group: String,
    pub priority: i32,
    pub weight: i32,
    pub enabled: bool,
}

/// A wildcard model->channel routing rule, applied before the selection
/// strategy to bias the candidate list. Patterns: `*`, `prefix-*`,
/// `*-suffix`, `*-mid-*`, or an exact string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WildcardRule {
    pub pattern: String,
    pub provider_tag: String,
    pub priority_channel_ids: Vec<String>,
    pub weight: i32,
    pub enabled: bool,
}

impl WildcardRule {
    pub fn matches(&self, model: &str) -> bool {
        if !self.enabled {
            return false;
        }
        pattern_matches(&self.pattern, model)
    }

    pub fn priority_set(&self) -> HashSet<&str> {
        self.priority_channel_ids.iter().map(String::as_str).collect()
    }
}

/// Shared glob matcher for the five pattern shapes a wildcard rule supports:
/// exact, prefix `*`, suffix `*`, contains `*text*`, and bare `*`.
pub fn pattern_matches(pattern: &str, candidate: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern == candidate {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("-*") {
        return candidate.starts_with(prefix) && candidate != prefix;
    }
    if let Some(suffix) = pattern.strip_prefix("*-") {
        return candidate.ends_with(suffix) && candidate != suffix;
    }
    if let Some(mid) = pattern
        .strip_prefix('*')
        .and_then(|s| s.strip_suffix('*'))
    {
        let mid = mid.trim_matches('-');
        return candidate.contains(mid);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrade_then_unavailable_transitions() {
        let mut ch = Channel::new("c1", "Chan 1", "openai", "https://api.openai.com");
        for _ in 0..5 {
            ch.record_failure(0);
        }
        assert_eq!(ch.status, ChannelStatus::Degraded);
        for _ in 0..5 {
            ch.record_failure(0);
        }
        assert_eq!(ch.status, ChannelStatus::Unavailable);
    }

    #[test]
    fn success_does_not_leave_unavailable_without_recovery() {
        let mut ch = Channel::new("c1", "Chan 1", "openai", "https://api.openai.com");
        for _ in 0..10 {
            ch.record_failure(0);
        }
        assert_eq!(ch.status, ChannelStatus::Unavailable);
        ch.record_success(50, 1);
        assert_eq!(ch.status, ChannelStatus::Unavailable);
        ch.recover();
        assert_eq!(ch.status, ChannelStatus::Healthy);
    }

    #[test]
    fn degraded_success_clears_back_to_healthy() {
        let mut ch = Channel::new("c1", "Chan 1", "openai", "https://api.openai.com");
        for _ in 0..5 {
            ch.record_failure(0);
        }
        assert_eq!(ch.status, ChannelStatus::Degraded);
        ch.record_success(10, 1);
        assert_eq!(ch.status, ChannelStatus::Healthy);
        assert_eq!(ch.consecutive_failures.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn wildcard_pattern_shapes() {
        assert!(pattern_matches("*", "gpt-4"));
        assert!(pattern_matches("gpt-*", "gpt-4"));
        assert!(!pattern_matches("gpt-*", "gpt-"));
        assert!(pattern_matches("*-vision", "gpt-4-vision"));
        assert!(pattern_matches("*-mid-*", "a-mid-b"));
        assert!(pattern_matches("exact-model", "exact-model"));
        assert!(!pattern_matches("exact-model", "other-model"));
    }
}
