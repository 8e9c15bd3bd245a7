//! OpenAI provider adapter: Bearer auth, `/v1/chat/completions`, SSE
//! streaming terminated by a `data: [DONE]` sentinel.

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

pub struct OpenAIAdapter {
    client: Client,
}

impl OpenAIAdapter {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for OpenAIAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

#[derive(Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    id: String,
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: OpenAIUsage,
}

#[async_trait]
impl Adapter for OpenAIAdapter {
    fn provider_tag(&self) -> &'static str {
        "openai"
    }

    fn default_probe_model(&self) -> &'static str {
        "gpt-4o-mini"
    }

    fn translate_request(&self, request: &CanonicalChatRequest) -> Result<Value, GatewayError> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": role_str(m.role), "content": m.content}))
            .collect();
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });
        let obj = body.as_object_mut().unwrap();
        if let Some(t) = request.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(t) = request.top_p {
            obj.insert("top_p".into(), json!(t));
        }
        if let Some(t) = request.max_tokens {
            obj.insert("max_tokens".into(), json!(t));
        }
        if let Some(s) = &request.stop {
            obj.insert("stop".into(), json!(s));
        }
        if let Some(f) = request.frequency_penalty {
            obj.insert("frequency_penalty".into(), json!(f));
        }
        if let Some(p) = request.presence_penalty {
            obj.insert("presence_penalty".into(), json!(p));
        }
        if let Some(u) = &request.user {
            obj.insert("user".into(), json!(u));
        }
        if let Some(tools) = &request.tools {
            obj.insert("tools".into(), tools.clone());
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

        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&wire)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status_error(status.as_u16(), body));
        }

        let parsed: OpenAIResponse = resp.json().await.map_err(|e| {
            GatewayError::UpstreamFatal {
                status: 502,
                body: format!("invalid openai response body: {e}"),
            }
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::UpstreamFatal {
                status: 502,
                body: "openai response had no choices".to_string(),
            })?;

        Ok(CanonicalChatResponse {
            id: parsed.id,
            model: parsed.model,
            provider: "openai".to_string(),
            message: ChatMessage {
                role: Role::Assistant,
                content: choice.message.content.unwrap_or_default(),
                name: None,
            },
            finish_reason: choice.finish_reason,
            usage: Usage {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
                total_tokens: parsed.usage.total_tokens,
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

        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
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
                Ok(ev) => {
                    if ev.data == "[DONE]" {
                        None
                    } else {
                        match serde_json::from_str::<Value>(&ev.data) {
                            Ok(v) => {
                                seq += 1;
                                let delta = v["choices"][0]["delta"]["content"]
                                    .as_str()
                                    .unwrap_or("")
                                    .to_string();
                                let finish_reason = v["choices"][0]["finish_reason"]
                                    .as_str()
                                    .map(str::to_string);
                                Some(Ok(StreamChunk {
                                    seq,
                                    delta,
                                    finish_reason,
                                    usage: None,
                                }))
                            }
                            Err(e) => {
                                warn!("failed to parse openai sse chunk: {e}");
                                None
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("openai sse stream error: {e}");
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
