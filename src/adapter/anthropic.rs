//! Anthropic provider adapter (Messages API wire format).

use super::{Adapter, ChunkStream};
use crate::error::GatewayError;
use crate::models::{CanonicalChatRequest, CanonicalChatResponse, ChatMessage, Role, StreamChunk, Usage};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: Client,
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

/// Anthropic separates `system` out of the message list; this splits the
/// canonical messages accordingly.
fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system = None;
    let mut rest = Vec::new();
    for m in messages {
        match m.role {
            Role::System => system = Some(m.content.clone()),
            Role::Tool => rest.push(json!({"role": "user", "content": m.content})),
            Role::User => rest.push(json!({"role": "user", "content": m.content})),
            Role::Assistant => rest.push(json!({"role": "assistant", "content": m.content})),
        }
    }
    (system, rest)
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    fn provider_tag(&self) -> &'static str {
        "anthropic"
    }

    fn default_probe_model(&self) -> &'static str {
        "claude-3-haiku-20240307"
    }

    fn translate_request(&self, request: &CanonicalChatRequest) -> Result<Value, GatewayError> {
        let (system, messages) = split_system(&request.messages);
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(1024),
            "stream": request.stream,
        });
        let obj = body.as_object_mut().unwrap();
        if let Some(system) = system {
            obj.insert("system".into(), json!(system));
        }
        if let Some(t) = request.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(t) = request.top_p {
            obj.insert("top_p".into(), json!(t));
        }
        if let Some(s) = &request.stop {
            obj.insert("stop_sequences".into(), json!(s));
        }
        for (k, v) in &request.extra {
            obj.insert(k.clone(), v.clone());
        }
        Ok(body)
    }

    async fn execute(
        &self,
        base_url: &str,
        api_key: &str,
        request: &CanonicalChatRequest,
    ) -> Result<CanonicalChatResponse, GatewayError> {
        let mut wire = self.translate_request(request)?;
        wire["stream"] = json!(false);

        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&wire)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status_error(status.as_u16(), body));
        }

        let parsed: AnthropicResponse = resp.json().await.map_err(|e| GatewayError::UpstreamFatal {
            status: 502,
            body: format!("invalid anthropic response body: {e}"),
        })?;

        let text = parsed
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(CanonicalChatResponse {
            id: parsed.id,
            model: parsed.model,
            provider: "anthropic".to_string(),
            message: ChatMessage {
                role: Role::Assistant,
                content: text,
                name: None,
            },
            finish_reason: parsed.stop_reason,
            usage: Usage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
            },
        })
    }

    async fn execute_stream(
        &self,
        base_url: &str,
        api_key: &str,
        request: &CanonicalChatRequest,
    ) -> Result<ChunkStream, GatewayError> {
        let mut wire = self.translate_request(request)?;
        wire["stream"] = json!(true);

        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&wire)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status_error(status.as_u16(), body));
        }

        let mut seq: u64 = 0;
        let stream = resp.bytes_stream().eventsource().filter_map(move |event| {
            let result = match event {
                Ok(ev) => match serde_json::from_str::<Value>(&ev.data) {
                    Ok(v) => {
                        let event_type = v["type"].as_str().unwrap_or("");
                        match event_type {
                            "content_block_delta" => {
                                seq += 1;
                                let delta = v["delta"]["text"].as_str().unwrap_or("").to_string();
                                Some(Ok(StreamChunk {
                                    seq,
                                    delta,
                                    finish_reason: None,
                                    usage: None,
                                }))
                            }
                            "message_delta" => {
                                let finish_reason = v["delta"]["stop_reason"].as_str().map(str::to_string);
                                if finish_reason.is_some() {
                                    seq += 1;
                                    Some(Ok(StreamChunk {
                                        seq,
                                        delta: String::new(),
                                        finish_reason,
                                        usage: None,
                                    }))
                                } else {
                                    None
                                }
                            }
                            _ => None,
                        }
                    }
                    Err(e) => {
                        warn!("failed to parse anthropic sse chunk: {e}");
                        None
                    }
                },
                Err(e) => {
                    debug!("anthropic sse stream error: {e}");
                    Some(Err(GatewayError::UpstreamTransient(e.to_string())))
                }
            };
            futures::future::ready(result)
        });

        Ok(Box::pin(stream))
    }
}

fn map_status_error(status: u16, body: String) -> GatewayError {
    match status {
        408 | 429 | 500 | 502 | 503 | 504 => GatewayError::UpstreamTransient(format!("{status}: {body}")),
        _ => GatewayError::UpstreamFatal { status, body },
    }
}
