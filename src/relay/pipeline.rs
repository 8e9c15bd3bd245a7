//! The relay pipeline, end to end: body capture, pre-debit, adapter
//! dispatch under the retry controller (with channel failover), streaming
//! fan-out through the SSE broadcaster, and post-flight settlement onto
//! the billing queue.

use super::body_cache::BodyCache;
use super::retry::{RetryController, RetryDecision};
use super::sse::{Broadcaster, SseFrame};
use crate::adapter::AdapterRegistry;
use crate::billing::{BillingJob, BillingQueue, Ledger, PricingTable, TokenCounter};
use crate::channel::{ChannelSelector, SelectionRequest};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{BillingRecord, CanonicalChatRequest, CanonicalChatResponse, Usage};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct RelayOutcome {
    pub response: CanonicalChatResponse,
    pub channel_id: String,
    pub predebit: BillingRecord,
}

pub struct RelayPipeline {
    pub channels: Arc<crate::channel::ChannelRegistry>,
    pub selector: Arc<ChannelSelector>,
    pub adapters: Arc<AdapterRegistry>,
    pub body_cache: Arc<BodyCache>,
    pub retry: RetryController,
    pub ledger: Arc<Ledger>,
    pub pricing: Arc<PricingTable>,
    pub tokens: Arc<TokenCounter>,
    pub billing_queue: Arc<BillingQueue>,
    pub broadcaster: Arc<Broadcaster>,
}

impl RelayPipeline {
    /// Wraps a terminal failure as `Exhausted`, carrying the last upstream
    /// status through if there was one. Used both when the retry
    /// controller gives up on an adapter error and when the selector
    /// itself comes back empty — a `NoCandidate` mid-retry is exhaustion,
    /// not a fresh "no channel at all" condition.
    fn to_exhausted(e: GatewayError) -> GatewayError {
        let last_status = match &e {
            GatewayError::UpstreamFatal { status, .. } => Some(*status),
            _ => None,
        };
        GatewayError::Exhausted { last_status, message: e.to_string() }
    }

    fn prompt_text(request: &CanonicalChatRequest) -> String {
        request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn estimate_amount(&self, request: &CanonicalChatRequest, group: &str) -> GatewayResult<(f64, crate::models::ModelPrice)> {
        let price = self
            .pricing
            .current(&request.model, group)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("price for model {} in group {group}", request.model)))?;
        let (prompt_tokens, _) = self.tokens.count(&request.model, &Self::prompt_text(request), "");
        let expected_completion = request.max_tokens.unwrap_or(256);
        let estimate = Usage {
            prompt_tokens,
            completion_tokens: expected_completion,
            total_tokens: prompt_tokens + expected_completion,
        };
        Ok((crate::billing::pricing::evaluate(&price, &estimate), price))
    }

    /// Non-streaming relay: select a channel, execute with retry/failover,
    /// settle billing, and release the body cache slot before returning.
    pub async fn relay_chat(
        &self,
        user_id: &str,
        group: &str,
        request_id: &str,
        request: CanonicalChatRequest,
    ) -> GatewayResult<RelayOutcome> {
        let body_bytes = Bytes::from(serde_json::to_vec(&request)?);
        let (cache_id, _size) = self.body_cache.put(body_bytes).await?;

        let (estimate_amount, price) = self.estimate_amount(&request, group).await?;
        let predebit = match self.ledger.pre_debit(user_id, request_id, &request.model, estimate_amount).await {
            Ok(record) => record,
            Err(e) => {
                self.body_cache.invalidate(&cache_id).await;
                return Err(e);
            }
        };

        let outcome = self.dispatch_with_retry(group, &cache_id).await;
        self.body_cache.invalidate(&cache_id).await;

        match outcome {
            Ok((response, channel_id)) => {
                let actual_amount = crate::billing::pricing::evaluate(&price, &response.usage);
                if !self.billing_queue.enqueue(BillingJob::Confirm {
                    request_id: request_id.to_string(),
                    actual_amount,
                }) {
                    warn!("billing queue full, confirming inline for {request_id}");
                    let _ = self.ledger.confirm(request_id, actual_amount).await;
                }
                Ok(RelayOutcome { response, channel_id, predebit })
            }
            Err(e) => {
                if !self.billing_queue.enqueue(BillingJob::Refund { request_id: request_id.to_string() }) {
                    let _ = self.ledger.refund(request_id).await;
                }
                Err(e)
            }
        }
    }

    /// Streaming relay: same selection/retry path, but the response body
    /// fans out frame-by-frame to `client_id` via the broadcaster, and a
    /// terminal `complete` event carries the accumulated usage once the
    /// upstream stream ends.
    pub async fn relay_chat_stream(
        &self,
        user_id: &str,
        group: &str,
        request_id: &str,
        client_id: &str,
        request: CanonicalChatRequest,
    ) -> GatewayResult<()> {
        let (estimate_amount, price) = self.estimate_amount(&request, group).await?;
        self.ledger.pre_debit(user_id, request_id, &request.model, estimate_amount).await?;

        let mut exclude = HashSet::new();
        let mut attempt = 0u32;
        let (mut stream, channel_id) = loop {
            let sel_req = SelectionRequest { model: request.model.clone(), group: group.to_string(), exclude: exclude.clone(), ..Default::default() };
            let slot = match self.selector.select(&sel_req).await {
                Ok(slot) => slot,
                Err(e) => {
                    let _ = self.ledger.refund(request_id).await;
                    return Err(if attempt > 0 { Self::to_exhausted(e) } else { e });
                }
            };
            let (provider, base_url, api_key, channel_id) = {
                let ch = slot.read().await;
                (ch.provider.clone(), ch.base_url.clone(), ch.api_keys.first().cloned().unwrap_or_default(), ch.id.clone())
            };
            let Some(adapter) = self.adapters.get(&provider) else {
                self.selector.release(&slot).await;
                let _ = self.ledger.refund(request_id).await;
                return Err(GatewayError::InternalInvariant(format!("no adapter for provider {provider}")));
            };

            match adapter.execute_stream(&base_url, &api_key, &request).await {
                Ok(stream) => {
                    self.selector.release(&slot).await;
                    break (stream, channel_id);
                }
                Err(e) => {
                    self.selector.release(&slot).await;
                    let now = chrono::Utc::now().timestamp();
                    slot.write().await.record_failure(now);
                    match self.retry.decide(attempt, &e, None, Some(channel_id)) {
                        RetryDecision::Retry { delay, exclude_channel } => {
                            attempt += 1;
                            if let Some(id) = exclude_channel {
                                exclude.insert(id);
                            }
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        RetryDecision::GiveUp => {
                            let _ = self.ledger.refund(request_id).await;
                            return Err(Self::to_exhausted(e));
                        }
                    }
                }
            }
        };

        let mut usage = Usage::default();
        let mut seq = 0u64;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    seq += 1;
                    if let Some(u) = &chunk.usage {
                        usage = u.clone();
                    } else {
                        usage.add_completion(chunk.delta.split_whitespace().count() as u32);
                    }
                    self.broadcaster.send(client_id, SseFrame::named("delta", serde_json::to_string(&chunk).unwrap_or_default()));
                }
                Err(e) => {
                    warn!("stream error mid-relay for {request_id} after {seq} chunks: {e}");
                    self.broadcaster.send(client_id, SseFrame::named("error", e.to_string()));
                    let _ = self.ledger.refund(request_id).await;
                    return Err(e);
                }
            }
        }

        let actual_amount = crate::billing::pricing::evaluate(&price, &usage);
        if !self.billing_queue.enqueue(BillingJob::Confirm { request_id: request_id.to_string(), actual_amount }) {
            let _ = self.ledger.confirm(request_id, actual_amount).await;
        }
        self.broadcaster.send(
            client_id,
            SseFrame::named("complete", serde_json::to_string(&usage).unwrap_or_default()),
        );
        info!("completed stream relay {request_id} on channel {channel_id} ({seq} chunks)");
        Ok(())
    }

    /// Replays the cached request body on every attempt rather than reusing
    /// one in-memory `CanonicalChatRequest`, so a retry sends byte-for-byte
    /// what the first attempt sent even if a later failover rebuilds the
    /// adapter request from scratch.
    async fn dispatch_with_retry(
        &self,
        group: &str,
        cache_id: &str,
    ) -> GatewayResult<(CanonicalChatResponse, String)> {
        let mut exclude = HashSet::new();
        let mut attempt = 0u32;
        loop {
            let handle = self.body_cache.open(cache_id).await?;
            let request: CanonicalChatRequest = serde_json::from_slice(&handle.bytes()?)?;

            let sel_req = SelectionRequest { model: request.model.clone(), group: group.to_string(), exclude: exclude.clone(), ..Default::default() };
            let slot = match self.selector.select(&sel_req).await {
                Ok(slot) => slot,
                Err(e) if attempt > 0 => return Err(Self::to_exhausted(e)),
                Err(e) => return Err(e),
            };
            let (provider, base_url, api_key, channel_id) = {
                let ch = slot.read().await;
                (ch.provider.clone(), ch.base_url.clone(), ch.api_keys.first().cloned().unwrap_or_default(), ch.id.clone())
            };
            let Some(adapter) = self.adapters.get(&provider) else {
                self.selector.release(&slot).await;
                return Err(GatewayError::InternalInvariant(format!("no adapter for provider {provider}")));
            };

            let started = std::time::Instant::now();
            let result = adapter.execute(&base_url, &api_key, &request).await;
            self.selector.release(&slot).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let now = chrono::Utc::now().timestamp();

            match result {
                Ok(response) => {
                    slot.write().await.record_success(elapsed_ms, now);
                    return Ok((response, channel_id));
                }
                Err(e) => {
                    slot.write().await.record_failure(now);
                    match self.retry.decide(attempt, &e, None, Some(channel_id)) {
                        RetryDecision::Retry { delay, exclude_channel } => {
                            attempt += 1;
                            if let Some(id) = exclude_channel {
                                exclude.insert(id);
                            }
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => return Err(Self::to_exhausted(e)),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterRegistry, ChunkStream};
    use crate::billing::CountMethod;
    use crate::channel::{ChannelRegistry, ChannelSelector};
    use crate::models::ModelPrice;
    use crate::config::{BillingConfig, BodyCacheConfig, RetryConfig, RetryStrategy, SelectorStrategy, SseConfig};
    use crate::models::{Channel, ChatMessage, PricingMode, Role};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A scriptable adapter: the Nth call to `execute` returns
    /// `outcomes[N]`, repeating the last entry once exhausted. Lets a test
    /// pin down exactly which channel fails and which one finally answers.
    struct ScriptedAdapter {
        outcomes: Vec<GatewayResult<CanonicalChatResponse>>,
        calls: AtomicU32,
    }

    impl ScriptedAdapter {
        fn new(outcomes: Vec<GatewayResult<CanonicalChatResponse>>) -> Self {
            Self { outcomes, calls: AtomicU32::new(0) }
        }

        fn clone_outcome(&self, idx: usize) -> GatewayResult<CanonicalChatResponse> {
            match &self.outcomes[idx.min(self.outcomes.len() - 1)] {
                Ok(resp) => Ok(resp.clone()),
                Err(GatewayError::UpstreamTransient(msg)) => Err(GatewayError::UpstreamTransient(msg.clone())),
                Err(other) => Err(GatewayError::UpstreamTransient(other.to_string())),
            }
        }
    }

    #[async_trait]
    impl crate::adapter::Adapter for ScriptedAdapter {
        fn provider_tag(&self) -> &'static str {
            "scripted"
        }

        fn translate_request(&self, _request: &CanonicalChatRequest) -> GatewayResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        async fn execute(
            &self,
            _base_url: &str,
            _api_key: &str,
            _request: &CanonicalChatRequest,
        ) -> GatewayResult<CanonicalChatResponse> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.clone_outcome(idx)
        }

        async fn execute_stream(
            &self,
            _base_url: &str,
            _api_key: &str,
            _request: &CanonicalChatRequest,
        ) -> GatewayResult<ChunkStream> {
            unimplemented!("not exercised by the non-streaming scenario tests")
        }

        fn default_probe_model(&self) -> &'static str {
            "scripted-probe"
        }
    }

    fn canned_response(channel: &str) -> CanonicalChatResponse {
        CanonicalChatResponse {
            id: "resp-1".to_string(),
            model: "gpt-4".to_string(),
            provider: channel.to_string(),
            message: ChatMessage { role: Role::Assistant, content: "hi".to_string(), name: None },
            finish_reason: Some("stop".to_string()),
            usage: Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 },
        }
    }

    fn request() -> CanonicalChatRequest {
        CanonicalChatRequest {
            model: "gpt-4".to_string(),
            messages: vec![ChatMessage { role: Role::User, content: "hello".to_string(), name: None }],
            temperature: None,
            top_p: None,
            max_tokens: Some(50),
            stream: false,
            stop: None,
            frequency_penalty: None,
            presence_penalty: None,
            user: None,
            tools: None,
            extra: Default::default(),
        }
    }

    async fn channel_with_id(id: &str) -> Channel {
        let mut ch = Channel::new(id, id, "scripted", "https://example.invalid");
        ch.models = vec!["gpt-4".to_string()];
        ch.api_keys = vec!["k".to_string()];
        ch
    }

    /// Builds a pipeline with one `ScriptedAdapter` behind the given
    /// channel ids and a fast, near-zero-delay retry policy so these tests
    /// don't actually wait out a real backoff.
    async fn pipeline_with(channel_ids: &[&str], outcomes: Vec<GatewayResult<CanonicalChatResponse>>) -> RelayPipeline {
        let channels = Arc::new(ChannelRegistry::new());
        for id in channel_ids {
            channels.upsert(channel_with_id(id).await).await;
        }
        let selector = Arc::new(ChannelSelector::new(channels.clone(), SelectorStrategy::RoundRobin));

        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(ScriptedAdapter::new(outcomes)));
        let adapters = Arc::new(adapters);

        let body_cache = Arc::new(BodyCache::new(BodyCacheConfig::default(), std::env::temp_dir().join("relay-pipeline-test")));

        let ledger = Arc::new(Ledger::new(std::time::Duration::from_secs(600)));
        ledger.set_quota(crate::models::UserQuota::new("u1", 1000.0)).await;

        let pricing = Arc::new(PricingTable::new(std::time::Duration::from_secs(30)));
        pricing
            .upsert(ModelPrice {
                model: "gpt-4".to_string(),
                group: "default".to_string(),
                input_price_per_1k: 1.0,
                output_price_per_1k: 2.0,
                min_price: None,
                pricing_mode: PricingMode::ByToken,
                group_multiplier: 1.0,
                version: 1,
            })
            .await;

        let tokens = Arc::new(TokenCounter::new(CountMethod::Approximate, std::time::Duration::from_secs(60)));

        let metrics = Arc::new(crate::metrics::GatewayMetrics::new());
        let (billing_queue, _handle) = BillingQueue::spawn(BillingConfig::default(), ledger.clone(), metrics.clone());
        let broadcaster = Arc::new(Broadcaster::new(SseConfig::default(), metrics));

        let retry_config = RetryConfig {
            max_retries: 2,
            strategy: RetryStrategy::Fixed,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 1.0,
            jitter: 0.0,
            retryable_statuses: vec![],
        };

        RelayPipeline {
            channels,
            selector,
            adapters,
            body_cache,
            retry: RetryController::new(retry_config),
            ledger,
            pricing,
            tokens,
            billing_queue: Arc::new(billing_queue),
            broadcaster,
        }
    }

    #[tokio::test]
    async fn single_channel_success_confirms_billing() {
        let pipeline = pipeline_with(&["a"], vec![Ok(canned_response("a"))]).await;
        let outcome = pipeline.relay_chat("u1", "default", "req-1", request()).await.unwrap();
        assert_eq!(outcome.channel_id, "a");
        assert_eq!(outcome.response.usage.completion_tokens, 5);

        // The request body's cache entry is released once dispatch finishes.
        assert_eq!(pipeline.body_cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn failover_to_second_channel_after_transient_failure() {
        let pipeline = pipeline_with(
            &["a", "b"],
            vec![Err(GatewayError::UpstreamTransient("a is down".to_string())), Ok(canned_response("b"))],
        )
        .await;
        let outcome = pipeline.relay_chat("u1", "default", "req-1", request()).await.unwrap();
        assert_eq!(outcome.response.provider, "b");

        let quota = pipeline.ledger.get_quota("u1").await.unwrap();
        assert_eq!(quota.frozen, 0.0, "settled quota should not leave anything frozen");
    }

    /// Regression test for routing a selector `NoCandidate` through the
    /// same `Exhausted` path as a `RetryDecision::GiveUp` once at least one
    /// attempt has already failed: a mid-retry selector miss (every
    /// channel now excluded) must surface as `Exhausted`, not a fresh
    /// "no channel at all" `NoCandidate`.
    #[tokio::test]
    async fn exhausting_every_channel_surfaces_as_exhausted_not_no_candidate() {
        let pipeline = pipeline_with(
            &["a", "b"],
            vec![
                Err(GatewayError::UpstreamTransient("a is down".to_string())),
                Err(GatewayError::UpstreamTransient("b is down".to_string())),
            ],
        )
        .await;

        let result = pipeline.relay_chat("u1", "default", "req-1", request()).await;
        assert!(matches!(result, Err(GatewayError::Exhausted { .. })), "expected Exhausted, got {result:?}");

        // The pre-debit was refunded, not left frozen, once dispatch gave up.
        let quota = pipeline.ledger.get_quota("u1").await.unwrap();
        assert_eq!(quota.frozen, 0.0);
    }
}
