//! The per-provider adapter contract: one object-safe `async_trait`, one
//! implementation per provider, registered in an `AdapterRegistry` keyed
//! by provider tag so the relay pipeline never special-cases a provider
//! by name.

pub mod anthropic;
pub mod azure;
pub mod google;
pub mod openai;
pub mod registry;

use crate::error::GatewayResult;
use crate::models::{CanonicalChatRequest, CanonicalChatResponse, StreamChunk};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

pub use registry::AdapterRegistry;

pub type ChunkStream = Pin<Box<dyn Stream<Item = GatewayResult<StreamChunk>> + Send>>;

/// The three operations every provider adapter must implement. Adapters
/// are stateless: all per-channel state (base URL, API key) is passed in
/// on every call so one adapter instance can serve every channel of its
/// provider type.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn provider_tag(&self) -> &'static str;

    /// `TranslateRequest(canonical) -> wire`, folded into `execute` since
    /// the wire body never needs to be inspected by the caller — exposed
    /// separately only for testability.
    fn translate_request(&self, request: &CanonicalChatRequest) -> GatewayResult<serde_json::Value>;

    /// `Execute(ctx, wire) -> response`, non-streaming path.
    async fn execute(
        &self,
        base_url: &str,
        api_key: &str,
        request: &CanonicalChatRequest,
    ) -> GatewayResult<CanonicalChatResponse>;

    /// `Execute(ctx, wire) -> stream`, streaming path.
    async fn execute_stream(
        &self,
        base_url: &str,
        api_key: &str,
        request: &CanonicalChatRequest,
    ) -> GatewayResult<ChunkStream>;

    /// Minimal probe used by the health checker: a 5-token completion.
    async fn health_probe(&self, base_url: &str, api_key: &str) -> GatewayResult<bool> {
        let probe = CanonicalChatRequest {
            model: self.default_probe_model().to_string(),
            messages: vec![crate::models::ChatMessage {
                role: crate::models::Role::User,
                content: "ping".to_string(),
                name: None,
            }],
            temperature: None,
            top_p: None,
            max_tokens: Some(5),
            stream: false,
            stop: None,
            frequency_penalty: None,
            presence_penalty: None,
            user: None,
            tools: None,
            extra: Default::default(),
        };
        match self.execute(base_url, api_key, &probe).await {
            Ok(_) => Ok(true),
            Err(e) if !e.is_retryable() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn default_probe_model(&self) -> &'static str;
}
