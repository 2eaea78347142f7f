use async_trait::async_trait;
use gantry_config::ProviderConfig;
use gantry_core::{GatewayError, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::openai::{transport_error, upstream_error};
use crate::provider::*;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2024-10-22";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_MODELS: &[&str] = &[
    "claude-opus-4-20250514",
    "claude-sonnet-4-20250514",
    "claude-haiku-3-5",
];

/// Anthropic Messages API provider. Translates the gateway's OpenAI-shaped
/// requests into the Anthropic wire format and normalizes its event stream.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    models: Vec<String>,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.into(),
            models: DEFAULT_MODELS.iter().map(|s| s.to_string()).collect(),
            default_model: "claude-sonnet-4-20250514".into(),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        let mut provider = Self::new(config.api_key.clone().unwrap_or_default());
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

    /// Translate the OpenAI-shaped request into an Anthropic messages body.
    /// System messages move to the top-level `system` field; tool messages
    /// become `tool_result` content blocks on a user turn.
    fn build_request_body(&self, request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut messages: Vec<serde_json::Value> = Vec::new();

        for msg in &request.messages {
            let content = msg.content.as_deref().unwrap_or("");
            match msg.role.as_str() {
                "system" => system_parts.push(content),
                "tool" => {
                    messages.push(serde_json::json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                            "content": content,
                        }],
                    }));
                }
                "assistant" => {
                    if let Some(ref calls) = msg.tool_calls {
                        let mut blocks: Vec<serde_json::Value> = Vec::new();
                        if !content.is_empty() {
                            blocks.push(serde_json::json!({ "type": "text", "text": content }));
                        }
                        for call in calls {
                            let arguments: serde_json::Value = call["function"]["arguments"]
                                .as_str()
                                .and_then(|s| serde_json::from_str(s).ok())
                                .unwrap_or_default();
                            blocks.push(serde_json::json!({
                                "type": "tool_use",
                                "id": call["id"],
                                "name": call["function"]["name"],
                                "input": arguments,
                            }));
                        }
                        messages.push(serde_json::json!({ "role": "assistant", "content": blocks }));
                    } else {
                        messages.push(serde_json::json!({ "role": "assistant", "content": content }));
                    }
                }
                _ => {
                    messages.push(serde_json::json!({ "role": "user", "content": content }));
                }
            }
        }

        let mut body = serde_json::json!({
            "model": &request.model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        if !system_parts.is_empty() {
            body["system"] = serde_json::json!(system_parts.join("\n\n"));
        }
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(ref tools) = request.tools {
            let converted: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t["function"]["name"],
                        "description": t["function"]["description"],
                        "input_schema": t["function"]["parameters"],
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(converted);
        }
        if stream {
            body["stream"] = serde_json::json!(true);
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
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
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "anthropic".into(),
            family: "anthropic".into(),
            default_model: self.default_model.clone(),
            models: self.models.clone(),
        }
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn validate_config(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(GatewayError::Config("anthropic provider has no api_key".into()));
        }
        Ok(())
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let body = self.build_request_body(request, false);
        debug!(model = %request.model, "anthropic completion request");

        let data: serde_json::Value = self
            .send(&body)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        let text = data["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| {
                        if b["type"] == "text" {
                            b["text"].as_str()
                        } else {
                            None
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let tool_calls: Vec<serde_json::Value> = data["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "tool_use")
                    .map(openai_tool_call)
                    .collect()
            })
            .unwrap_or_default();

        Ok(ProviderResponse {
            text,
            tool_calls,
            finish_reason: data["stop_reason"].as_str().map(str::to_string),
            prompt_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<ProviderEvent>> {
        let body = self.build_request_body(request, true);
        debug!(model = %request.model, "anthropic stream request");

        let resp = self.send(&body).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(256);
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = resp.bytes_stream();
            let mut buffer = String::new();
            let mut current_tool_id = String::new();
            let mut current_tool_name = String::new();
            let mut current_tool_input = String::new();
            let mut in_tool_input = false;
            let mut prompt_tokens = 0u32;
            let mut completion_tokens = 0u32;
            let mut stop_reason: Option<String> = None;

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

                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].trim().to_string();
                    buffer = buffer[newline_pos + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        // "event: ..." lines are redundant with the type field.
                        continue;
                    };
                    let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                        continue;
                    };

                    match event["type"].as_str() {
                        Some("message_start") => {
                            if let Some(it) =
                                event["message"]["usage"]["input_tokens"].as_u64()
                            {
                                prompt_tokens = it as u32;
                            }
                        }
                        Some("content_block_start") => {
                            let block = &event["content_block"];
                            if block["type"].as_str() == Some("tool_use") {
                                current_tool_id = block["id"].as_str().unwrap_or("").to_string();
                                current_tool_name =
                                    block["name"].as_str().unwrap_or("").to_string();
                                current_tool_input.clear();
                                in_tool_input = true;
                            }
                        }
                        Some("content_block_delta") => match event["delta"]["type"].as_str() {
                            Some("text_delta") => {
                                if let Some(text) = event["delta"]["text"].as_str()
                                    && tx
                                        .send(ProviderEvent::TextDelta(text.to_string()))
                                        .await
                                        .is_err()
                                {
                                    return;
                                }
                            }
                            Some("input_json_delta") => {
                                if let Some(partial) = event["delta"]["partial_json"].as_str() {
                                    current_tool_input.push_str(partial);
                                }
                            }
                            _ => {}
                        },
                        Some("content_block_stop") => {
                            if in_tool_input {
                                in_tool_input = false;
                                let call = serde_json::json!({
                                    "id": current_tool_id.clone(),
                                    "type": "function",
                                    "function": {
                                        "name": current_tool_name.clone(),
                                        "arguments": current_tool_input.clone(),
                                    },
                                });
                                if tx.send(ProviderEvent::ToolCall(call)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some("message_delta") => {
                            if let Some(sr) = event["delta"]["stop_reason"].as_str() {
                                stop_reason = Some(sr.to_string());
                            }
                            if let Some(ot) = event["usage"]["output_tokens"].as_u64() {
                                completion_tokens = ot as u32;
                            }
                        }
                        Some("message_stop") => {
                            let _ = tx
                                .send(ProviderEvent::Usage { prompt_tokens, completion_tokens })
                                .await;
                            let _ = tx
                                .send(ProviderEvent::Done { finish_reason: stop_reason })
                                .await;
                            return;
                        }
                        Some("error") => {
                            let _ = tx
                                .send(ProviderEvent::Error {
                                    code: event["error"]["type"]
                                        .as_str()
                                        .unwrap_or("unknown")
                                        .to_string(),
                                    message: event["error"]["message"]
                                        .as_str()
                                        .unwrap_or("unknown error")
                                        .to_string(),
                                })
                                .await;
                            return;
                        }
                        _ => {}
                    }
                }
            }
            // Stream ended without message_stop.
            let _ = tx.send(ProviderEvent::Done { finish_reason: stop_reason }).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        self.validate_config()
    }
}

/// Render an Anthropic tool_use block as an OpenAI-shaped tool call value.
fn openai_tool_call(block: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "id": block["id"],
        "type": "function",
        "function": {
            "name": block["name"],
            "arguments": block["input"].to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::ChatMessage;

    #[test]
    fn system_messages_move_to_top_level() {
        let provider = AnthropicProvider::new("sk-ant-test1234".into());
        let request = ProviderRequest {
            model: "claude-sonnet-4-20250514".into(),
            messages: vec![
                ChatMessage::new("system", "be terse"),
                ChatMessage::new("user", "hi"),
            ],
            temperature: None,
            max_tokens: None,
            tools: None,
            stop: None,
            user: None,
        };
        let body = provider.build_request_body(&request, false);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn openai_tools_convert_to_input_schema() {
        let provider = AnthropicProvider::new("sk-ant-test1234".into());
        let request = ProviderRequest {
            model: "claude-sonnet-4-20250514".into(),
            messages: vec![ChatMessage::new("user", "weather?")],
            temperature: None,
            max_tokens: Some(100),
            tools: Some(vec![serde_json::json!({
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Look up weather",
                    "parameters": { "type": "object" }
                }
            })]),
            stop: None,
            user: None,
        };
        let body = provider.build_request_body(&request, true);
        assert_eq!(body["tools"][0]["name"], "get_weather");
        assert!(body["tools"][0]["input_schema"].is_object());
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn tool_use_block_becomes_openai_call() {
        let block = serde_json::json!({
            "type": "tool_use",
            "id": "toolu_1",
            "name": "get_weather",
            "input": { "city": "Oslo" }
        });
        let call = openai_tool_call(&block);
        assert_eq!(call["id"], "toolu_1");
        assert_eq!(call["function"]["name"], "get_weather");
        assert_eq!(call["function"]["arguments"], r#"{"city":"Oslo"}"#);
    }
}
