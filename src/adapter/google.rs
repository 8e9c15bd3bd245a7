//! Google (Gemini) provider adapter.

use super::{Adapter, ChunkStream};
use crate::error::GatewayError;
use crate::models::{CanonicalChatRequest, CanonicalChatResponse, ChatMessage, Role, StreamChunk, Usage};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

pub struct GoogleAdapter {
    client: Client,
}

impl GoogleAdapter {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for GoogleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::User | Role::System | Role::Tool => "user",
        Role::Assistant => "model",
    }
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Content,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
}

#[async_trait]
impl Adapter for GoogleAdapter {
    fn provider_tag(&self) -> &'static str {
        "google"
    }

    fn default_probe_model(&self) -> &'static str {
        "gemini-1.5-flash"
    }

    fn translate_request(&self, request: &CanonicalChatRequest) -> Result<Value, GatewayError> {
        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| json!({"role": gemini_role(m.role), "parts": [{"text": m.content}]}))
            .collect();

        let mut generation_config = serde_json::Map::new();
        if let Some(t) = request.temperature {
            generation_config.insert("temperature".into(), json!(t));
        }
        if let Some(t) = request.top_p {
            generation_config.insert("topP".into(), json!(t));
        }
        if let Some(t) = request.max_tokens {
            generation_config.insert("maxOutputTokens".into(), json!(t));
        }
        if let Some(s) = &request.stop {
            generation_config.insert("stopSequences".into(), json!(s));
        }

        let mut body = json!({ "contents": contents });
        let obj = body.as_object_mut().unwrap();
        if !generation_config.is_empty() {
            obj.insert("generationConfig".into(), Value::Object(generation_config));
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
        let wire = self.translate_request(request)?;
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            base_url.trim_end_matches('/'),
            request.model,
            api_key
        );
        let resp = self.client.post(&url).json(&wire).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status_error(status.as_u16(), body));
        }

        let parsed: GeminiResponse = resp.json().await.map_err(|e| GatewayError::UpstreamFatal {
            status: 502,
            body: format!("invalid google response body: {e}"),
        })?;

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::UpstreamFatal {
                status: 502,
                body: "google response had no candidates".to_string(),
            })?;

        let text = candidate
            .content
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");

        let usage = parsed.usage_metadata.unwrap_or(UsageMetadata {
            prompt_token_count: 0,
            candidates_token_count: 0,
        });

        Ok(CanonicalChatResponse {
            id: uuid::Uuid::new_v4().to_string(),
            model: request.model.clone(),
            provider: "google".to_string(),
            message: ChatMessage {
                role: Role::Assistant,
                content: text,
                name: None,
            },
            finish_reason: candidate.finish_reason,
            usage: Usage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
                total_tokens: usage.prompt_token_count + usage.candidates_token_count,
            },
        })
    }

    /// Google's streaming endpoint returns a JSON array over chunked
    /// transfer rather than SSE frames; this gateway normalizes it into
    /// the same `StreamChunk` shape by polling `streamGenerateContent`
    /// and slicing the accumulated text.
    async fn execute_stream(
        &self,
        base_url: &str,
        api_key: &str,
        request: &CanonicalChatRequest,
    ) -> Result<ChunkStream, GatewayError> {
        let wire = self.translate_request(request)?;
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            base_url.trim_end_matches('/'),
            request.model,
            api_key
        );
        let resp = self.client.post(&url).json(&wire).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status_error(status.as_u16(), body));
        }

        use eventsource_stream::Eventsource;
        let mut seq: u64 = 0;
        let stream = resp.bytes_stream().eventsource().filter_map(move |event| {
            let result = match event {
                Ok(ev) => match serde_json::from_str::<GeminiResponse>(&ev.data) {
                    Ok(parsed) => parsed.candidates.into_iter().next().map(|c| {
                        seq += 1;
                        let text = c
                            .content
                            .parts
                            .into_iter()
                            .filter_map(|p| p.text)
                            .collect::<Vec<_>>()
                            .join("");
                        Ok(StreamChunk {
                            seq,
                            delta: text,
                            finish_reason: c.finish_reason,
                            usage: None,
                        })
                    }),
                    Err(_) => None,
                },
                Err(e) => Some(Err(GatewayError::UpstreamTransient(e.to_string()))),
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
