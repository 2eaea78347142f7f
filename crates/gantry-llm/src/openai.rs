use async_trait::async_trait;
use gantry_config::ProviderConfig;
use gantry_core::{GatewayError, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::provider::*;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-4", "gpt-3.5-turbo"];

/// OpenAI-compatible API provider (works with OpenAI, Azure, Together, vLLM,
/// and other services speaking the same wire format).
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    provider_name: String,
    models: Vec<String>,
    default_model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.into(),
            provider_name: "openai".into(),
            models: DEFAULT_MODELS.iter().map(|s| s.to_string()).collect(),
            default_model: "gpt-4o".into(),
        }
    }

    /// Build from a `[providers.*]` config entry.
    pub fn from_config(name: &str, config: &ProviderConfig) -> Self {
        let mut provider = Self::new(config.api_key.clone().unwrap_or_default());
        provider.provider_name = name.to_string();
        if let Some(ref url) = config.base_url {
            provider.base_url = url.clone();
        }
        if !config.supported_models.is_empty() {
            provider.models = config.supported_models.clone();
        }
        if let Some(ref model) = config.default_model {
            provider.default_model = model.clone();
        }
        provider.client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        provider
    }

    fn build_request_body(&self, request: &ProviderRequest, stream: bool) -> serde_json::Value {
        // Incoming messages are already OpenAI-shaped; they pass through.
        let mut body = serde_json::json!({
            "model": &request.model,
            "messages": request.messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(n) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(n);
        }
        if let Some(ref tools) = request.tools {
            body["tools"] = serde_json::json!(tools);
        }
        if let Some(ref stop) = request.stop {
            body["stop"] = stop.clone();
        }
        if let Some(ref user) = request.user {
            body["user"] = serde_json::json!(user);
        }
        if stream {
            body["stream"] = serde_json::json!(true);
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(upstream_error(status.as_u16(), &text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.provider_name.clone(),
            family: "openai".into(),
            default_model: self.default_model.clone(),
            models: self.models.clone(),
        }
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn validate_config(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(GatewayError::Config(format!(
                "{} provider has no api_key",
                self.provider_name
            )));
        }
        if !self.base_url.starts_with("http") {
            return Err(GatewayError::Config(format!(
                "{} base_url is not a URL: {}",
                self.provider_name, self.base_url
            )));
        }
        Ok(())
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let body = self.build_request_body(request, false);
        debug!(model = %request.model, provider = %self.provider_name, "chat completion request");

        let data: serde_json::Value = self
            .send(&body)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        let choice = &data["choices"][0];
        let text = choice["message"]["content"].as_str().unwrap_or("").to_string();
        let tool_calls = choice["message"]["tool_calls"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let finish_reason = choice["finish_reason"].as_str().map(str::to_string);

        Ok(ProviderResponse {
            text,
            tool_calls,
            finish_reason,
            prompt_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<ProviderEvent>> {
        let body = self.build_request_body(request, true);
        debug!(model = %request.model, provider = %self.provider_name, "chat stream request");

        // Connect and check the status before handing back a stream so the
        // resilience layers see connection failures directly.
        let resp = self.send(&body).await?;

        let model = request.model.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = resp.bytes_stream();
            let mut buffer = String::new();
            let mut prompt_tokens = 0u32;
            let mut completion_tokens = 0u32;
            let mut finish_reason: Option<String> = None;

            while let Some(chunk_result) = stream.next().await {
                let bytes = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(ProviderEvent::Error {
                                code: "connection_error".into(),
                                message: e.to_string(),
                            })
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Process complete SSE lines.
                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].trim().to_string();
                    buffer = buffer[newline_pos + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data.trim() == "[DONE]" {
                        if prompt_tokens > 0 || completion_tokens > 0 {
                            let _ = tx
                                .send(ProviderEvent::Usage { prompt_tokens, completion_tokens })
                                .await;
                        }
                        let _ = tx.send(ProviderEvent::Done { finish_reason }).await;
                        return;
                    }
                    let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                        continue;
                    };

                    for provider_event in translate_event(
                        &event,
                        &model,
                        &mut finish_reason,
                        &mut prompt_tokens,
                        &mut completion_tokens,
                    ) {
                        if tx.send(provider_event).await.is_err() {
                            return;
                        }
                    }
                }
            }
            // Stream ended without [DONE].
            let _ = tx.send(ProviderEvent::Done { finish_reason }).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        self.validate_config()
    }
}

/// Translate one parsed stream event into provider events, folding the
/// finish reason and server-reported usage into the accumulators.
///
/// Chunk-shaped events are validated and repaired before use; events that
/// are not chunks at all go through generic text extraction — some
/// OpenAI-compatible upstreams emit bespoke shapes mid-stream.
fn translate_event(
    event: &serde_json::Value,
    model: &str,
    finish_reason: &mut Option<String>,
    prompt_tokens: &mut u32,
    completion_tokens: &mut u32,
) -> Vec<ProviderEvent> {
    let mut out = Vec::new();

    // Usage arrives in the final chunk with stream_options.
    if let Some(usage) = event.get("usage")
        && usage.is_object()
    {
        if let Some(pt) = usage["prompt_tokens"].as_u64() {
            *prompt_tokens = pt as u32;
        }
        if let Some(ct) = usage["completion_tokens"].as_u64() {
            *completion_tokens = ct as u32;
        }
    }

    if event.get("choices").is_some() {
        let chunk = crate::transform::repair_chunk(event, model);
        if let Some(choice) = chunk.choices.first() {
            if let Some(text) = choice.delta.content.as_deref()
                && !text.is_empty()
            {
                out.push(ProviderEvent::TextDelta(text.to_string()));
            }
            if let Some(ref calls) = choice.delta.tool_calls {
                for call in calls {
                    out.push(ProviderEvent::ToolCall(call.clone()));
                }
            }
            if let Some(ref reason) = choice.finish_reason {
                *finish_reason = Some(reason.clone());
            }
        }
    } else if let Ok(text) = crate::transform::extract_text(event)
        && !text.is_empty()
    {
        out.push(ProviderEvent::TextDelta(text));
    }

    out
}

/// Map a reqwest transport error to the matching gateway kind.
pub(crate) fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(e.to_string())
    } else {
        GatewayError::Network(e.to_string())
    }
}

/// Map a non-2xx upstream response. The body's `error.message` is preferred
/// over the raw text; retryability follows the status.
pub(crate) fn upstream_error(status: u16, body: &str) -> GatewayError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    GatewayError::from_upstream_status(status, message)
}
