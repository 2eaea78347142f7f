//! Mock chat provider for deterministic testing and for mock mode — the
//! gateway serves requests itself when no upstream provider is configured.
//!
//! Returns pre-configured responses without making any HTTP calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::provider::*;
use gantry_core::{GatewayError, Result};

/// A pre-configured response from the mock provider.
#[derive(Clone)]
pub struct MockResponse {
    pub text: String,
    pub finish_reason: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// If set, the provider fails with this error kind instead.
    pub error: Option<MockFailure>,
}

/// Error kinds the mock can inject, matching the resilience layer's view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockFailure {
    Timeout,
    Overloaded,
    RateLimited,
    InvalidRequest,
}

impl MockFailure {
    fn to_error(self) -> GatewayError {
        match self {
            Self::Timeout => GatewayError::Timeout("mock timeout".into()),
            Self::Overloaded => GatewayError::Overloaded("mock overloaded".into()),
            Self::RateLimited => GatewayError::RateLimited {
                reason: "mock rate limit".into(),
                retry_after_secs: 1,
            },
            Self::InvalidRequest => GatewayError::Validation("mock bad request".into()),
        }
    }
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            text: "This is a mock response from the gateway. Configure a provider API key \
                   to reach a real model."
                .into(),
            finish_reason: "stop".into(),
            prompt_tokens: 10,
            completion_tokens: 18,
            error: None,
        }
    }
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }
}

/// Mock provider: pops queued responses in order, falling back to the
/// deterministic default when the queue is empty.
pub struct MockChatProvider {
    name: String,
    responses: Arc<Mutex<Vec<MockResponse>>>,
    /// Requests received, for assertions in tests.
    pub requests: Arc<Mutex<Vec<ProviderRequest>>>,
}

impl MockChatProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: Arc::new(Mutex::new(vec![])),
            requests: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().push(MockResponse::text(text));
        self
    }

    /// Queue a failure.
    pub fn with_failure(self, failure: MockFailure) -> Self {
        self.responses.lock().push(MockResponse {
            error: Some(failure),
            ..Default::default()
        });
        self
    }

    /// Queue a fully custom response.
    pub fn with_mock_response(self, resp: MockResponse) -> Self {
        self.responses.lock().push(resp);
        self
    }

    fn next_response(&self) -> MockResponse {
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            MockResponse::default()
        } else {
            responses.remove(0)
        }
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            family: "mock".into(),
            default_model: "mock-model".into(),
            models: vec!["mock-model".into()],
        }
    }

    fn models(&self) -> Vec<String> {
        vec!["mock-model".into()]
    }

    fn supports(&self, _model: &str) -> bool {
        // Mock mode serves whatever model was asked for.
        true
    }

    fn validate_config(&self) -> Result<()> {
        Ok(())
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        self.requests.lock().push(request.clone());
        let resp = self.next_response();
        if let Some(failure) = resp.error {
            return Err(failure.to_error());
        }
        Ok(ProviderResponse {
            text: resp.text,
            tool_calls: vec![],
            finish_reason: Some(resp.finish_reason),
            prompt_tokens: resp.prompt_tokens,
            completion_tokens: resp.completion_tokens,
        })
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<ProviderEvent>> {
        self.requests.lock().push(request.clone());
        let resp = self.next_response();
        if let Some(failure) = resp.error {
            return Err(failure.to_error());
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            // Word-by-word deltas keep stream consumers honest about ordering.
            for word in split_into_deltas(&resp.text) {
                if tx.send(ProviderEvent::TextDelta(word)).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(ProviderEvent::Usage {
                    prompt_tokens: resp.prompt_tokens,
                    completion_tokens: resp.completion_tokens,
                })
                .await;
            let _ = tx
                .send(ProviderEvent::Done {
                    finish_reason: Some(resp.finish_reason),
                })
                .await;
        });
        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

fn split_into_deltas(text: &str) -> Vec<String> {
    let mut deltas = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch == ' ' {
            deltas.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        deltas.push(current);
    }
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::ChatMessage;

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "mock-model".into(),
            messages: vec![ChatMessage::new("user", "hello")],
            temperature: None,
            max_tokens: None,
            tools: None,
            stop: None,
            user: None,
        }
    }

    #[tokio::test]
    async fn queued_responses_pop_in_order() {
        let mock = MockChatProvider::new("mock")
            .with_response("first")
            .with_response("second");
        assert_eq!(mock.complete(&request()).await.unwrap().text, "first");
        assert_eq!(mock.complete(&request()).await.unwrap().text, "second");
        // Queue exhausted — default response.
        assert!(mock.complete(&request()).await.unwrap().text.contains("mock response"));
    }

    #[tokio::test]
    async fn stream_preserves_text_order() {
        let mock = MockChatProvider::new("mock").with_response("a b c");
        let mut rx = mock.stream(&request()).await.unwrap();

        let mut text = String::new();
        let mut saw_done = false;
        while let Some(event) = rx.recv().await {
            match event {
                ProviderEvent::TextDelta(t) => text.push_str(&t),
                ProviderEvent::Done { finish_reason } => {
                    assert_eq!(finish_reason.as_deref(), Some("stop"));
                    saw_done = true;
                }
                _ => {}
            }
        }
        assert_eq!(text, "a b c");
        assert!(saw_done);
    }

    #[tokio::test]
    async fn injected_failure_surfaces_as_error() {
        let mock = MockChatProvider::new("mock").with_failure(MockFailure::Timeout);
        let err = mock.stream(&request()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn requests_are_recorded() {
        let mock = MockChatProvider::new("mock");
        let _ = mock.complete(&request()).await;
        assert_eq!(mock.requests.lock().len(), 1);
    }
}
