//! Retry controller: three configurable backoff strategies, wired to the
//! channel selector so a retry can land on a different channel entirely.

use crate::config::{RetryConfig, RetryStrategy};
use crate::error::GatewayError;
use rand::Rng;
use std::time::Duration;

/// One decision point: either retry (after `delay`, optionally excluding
/// `exclude_channel`) or give up.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    Retry { delay: Duration, exclude_channel: Option<String> },
    GiveUp,
}

pub struct RetryController {
    config: RetryConfig,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// `attempt` is zero-based (0 == first failure, about to retry for the
    /// first time). A `Retry-After` header value, if the upstream sent one,
    /// takes precedence over the computed backoff.
    pub fn decide(
        &self,
        attempt: u32,
        error: &GatewayError,
        retry_after: Option<Duration>,
        failing_channel: Option<String>,
    ) -> RetryDecision {
        if attempt >= self.config.max_retries {
            return RetryDecision::GiveUp;
        }
        if !self.should_retry(error) {
            return RetryDecision::GiveUp;
        }

        let delay = retry_after.unwrap_or_else(|| self.backoff_delay(attempt));
        RetryDecision::Retry {
            delay,
            exclude_channel: failing_channel,
        }
    }

    fn should_retry(&self, error: &GatewayError) -> bool {
        match error {
            GatewayError::UpstreamTransient(_) | GatewayError::RateLimitedLocal(_) => true,
            GatewayError::UpstreamFatal { status, .. } => self.config.is_retryable_status(*status),
            _ => false,
        }
    }

    /// Computes the base delay for `attempt` under the configured strategy,
    /// clamps to `max_delay_ms`, then applies symmetric jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = match self.config.strategy {
            RetryStrategy::Fixed => self.config.initial_delay_ms as f64,
            RetryStrategy::Linear => self.config.initial_delay_ms as f64 * (attempt as f64 + 1.0),
            RetryStrategy::Exponential => {
                self.config.initial_delay_ms as f64 * self.config.multiplier.powi(attempt as i32)
            }
        };
        let clamped = base_ms.min(self.config.max_delay_ms as f64);

        let jitter_fraction = self.config.jitter.clamp(0.0, 1.0);
        let jittered = if jitter_fraction == 0.0 {
            clamped
        } else {
            let spread = clamped * jitter_fraction;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (clamped + offset).max(0.0)
        };

        Duration::from_millis(jittered as u64)
    }
}
