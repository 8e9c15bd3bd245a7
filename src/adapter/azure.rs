//! Azure OpenAI adapter.
//!
//! Wire-compatible with OpenAI's chat completions payload, but addressed
//! by deployment name and authenticated with an `api-key` header instead
//! of `Authorization: Bearer`.

use super::{Adapter, ChunkStream};
use crate::error::GatewayError;
use crate::models::{CanonicalChatRequest, CanonicalChatResponse, ChatMessage, Role, StreamChunk, Usage};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

const API_VERSION: &str = "2024-02-15-preview";

pub struct AzureAdapter {
    client: Client,
}

impl AzureAdapter {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for AzureAdapter {
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
struct AzureUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Deserialize)]
struct AzureChoice {
    message: AzureMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct AzureMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct AzureResponse {
    id: String,
    model: String,
    choices: Vec<AzureChoice>,
    usage: AzureUsage,
}

/// `base_url` for Azure channels is the resource root
/// (`https://<resource>.openai.azure.com`); `request.model` carries the
/// deployment name, mirroring how the channel's model list maps 1:1 to
/// deployments in this gateway's `Channel` config.
fn deployment_url(base_url: &str, deployment: &str, path: &str) -> String {
    format!(
        "{}/openai/deployments/{}/{}?api-version={}",
        base_url.trim_end_matches('/'),
        deployment,
        path,
        API_VERSION
    )
}

#[async_trait]
impl Adapter for AzureAdapter {
    fn provider_tag(&self) -> &'static str {
        "azure"
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
        let mut body = json!({ "messages": messages, "stream": request.stream });
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

        let url = deployment_url(base_url, &request.model, "chat/completions");
        let resp = self
            .client
            .post(&url)
            .header("api-key", api_key)
            .json(&wire)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status_error(status.as_u16(), body));
        }

        let parsed: AzureResponse = resp.json().await.map_err(|e| GatewayError::UpstreamFatal {
            status: 502,
            body: format!("invalid azure response body: {e}"),
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::UpstreamFatal {
                status: 502,
                body: "azure response had no choices".to_string(),
            })?;

        Ok(CanonicalChatResponse {
            id: parsed.id,
            model: parsed.model,
            provider: "azure".to_string(),
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

        let url = deployment_url(base_url, &request.model, "chat/completions");
        let resp = self
            .client
            .post(&url)
            .header("api-key", api_key)
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
                        serde_json::from_str::<Value>(&ev.data).ok().map(|v| {
                            seq += 1;
                            let delta = v["choices"][0]["delta"]["content"]
                                .as_str()
                                .unwrap_or("")
                                .to_string();
                            let finish_reason =
                                v["choices"][0]["finish_reason"].as_str().map(str::to_string);
                            Ok(StreamChunk {
                                seq,
                                delta,
                                finish_reason,
                                usage: None,
                            })
                        })
                    }
                }
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
