//! The streaming relay: drives one provider stream through the resilience
//! stack, translates events into unified chunks, accumulates usage, and
//! emits the SSE frame sequence ending in `data: [DONE]`.

use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;
use gantry_core::{
    ChatCompletionRequest, ErrorEnvelope, GatewayError, UnifiedChunk, UsageReport,
};
use gantry_llm::provider::{ProviderEvent, ProviderRequest};
use gantry_llm::{tokens, transform};
use gantry_routing::RouteDecision;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::AppState;
use crate::ratelimit::SlotGuard;

/// The stream terminator token, sent as its own `data:` frame.
pub const DONE_FRAME: &str = "[DONE]";

/// Full SSE response for a streaming chat completion: headers first, then
/// the unified frame sequence. The slot guard rides inside the stream, so
/// the concurrent slot is released exactly once when the stream finishes
/// or the client disconnects.
pub fn handle_stream(
    state: Arc<AppState>,
    request: ChatCompletionRequest,
    decision: RouteDecision,
    request_id: String,
    slot: SlotGuard,
) -> Response {
    let frames = frame_stream(state, request, decision, request_id, slot);
    let sse = Sse::new(futures::StreamExt::map(frames, |data| {
        Ok::<_, std::convert::Infallible>(SseEvent::default().data(data))
    }));
    (
        [(axum::http::header::CACHE_CONTROL, "no-cache")],
        sse,
    )
        .into_response()
}

/// The unified frame sequence as raw `data:` payloads. Separated from the
/// SSE wrapper so tests can assert on the exact frames.
pub(crate) fn frame_stream(
    state: Arc<AppState>,
    request: ChatCompletionRequest,
    decision: RouteDecision,
    request_id: String,
    slot: SlotGuard,
) -> impl Stream<Item = String> {
    async_stream::stream! {
        // Held for the life of the stream; dropping the stream releases it.
        let _slot = slot;

        let chat_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
        let model = decision.model.clone();
        let prompt_estimate = tokens::estimate_prompt_tokens(&request.messages, &model);
        let mut completion_estimate: u32 = 0;
        let mut server_usage: Option<(u32, u32)> = None;

        state.telemetry.emit_meta(
            "stream.start",
            serde_json::json!({
                "request_id": request_id,
                "provider": decision.provider,
                "model": model,
            }),
        );

        // Open the provider stream through failover + breaker + retry.
        let registry = state.registry.clone();
        let chat_request = request.clone();
        let route_provider = decision.provider.clone();
        let route_model = decision.model.clone();
        let opened = state
            .failover
            .with_failover_from(Some(&decision.provider), move |name| {
                let registry = registry.clone();
                let chat_request = chat_request.clone();
                let route_provider = route_provider.clone();
                let route_model = route_model.clone();
                async move {
                    let provider = registry.expect(&name)?;
                    // A fallback provider may not serve the routed model.
                    let model = if name == route_provider || provider.supports(&route_model) {
                        route_model
                    } else {
                        provider.default_model()
                    };
                    provider.stream(&ProviderRequest::from_chat(&chat_request, model)).await
                }
            })
            .await;

        let mut rx = match opened {
            Ok(rx) => rx,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "failed to open provider stream");
                if matches!(e, GatewayError::CircuitOpen { .. }) {
                    state.metrics.inc_circuit_open();
                }
                state.metrics.inc_http_errors();
                state.telemetry.emit_meta(
                    "stream.error",
                    serde_json::json!({ "request_id": request_id, "error": e.code() }),
                );
                yield envelope_frame(&e, &request_id);
                yield DONE_FRAME.to_string();
                return;
            }
        };

        // Opening chunk: assistant role, empty content.
        yield chunk_frame(&UnifiedChunk::role(&chat_id, &model));

        let deadline = (state.config.server.request_timeout_secs > 0).then(|| {
            tokio::time::Instant::now()
                + Duration::from_secs(state.config.server.request_timeout_secs)
        });

        loop {
            let event = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        let e = GatewayError::Timeout("request deadline exceeded".into());
                        state.metrics.inc_http_errors();
                        state.telemetry.emit_meta(
                            "stream.error",
                            serde_json::json!({ "request_id": request_id, "error": "timeout" }),
                        );
                        yield envelope_frame(&e, &request_id);
                        yield DONE_FRAME.to_string();
                        return;
                    }
                },
                None => rx.recv().await,
            };

            match event {
                Some(ProviderEvent::TextDelta(text)) => {
                    completion_estimate += tokens::estimate_text_tokens(&text, &model);
                    yield chunk_frame(&UnifiedChunk::content(&chat_id, &model, text));
                }
                Some(ProviderEvent::ToolCall(call)) => {
                    yield chunk_frame(&UnifiedChunk::tool_calls(&chat_id, &model, vec![call]));
                }
                Some(ProviderEvent::Usage { prompt_tokens, completion_tokens }) => {
                    server_usage = Some((prompt_tokens, completion_tokens));
                }
                Some(ProviderEvent::Done { finish_reason }) => {
                    let usage = final_usage(
                        &state,
                        &decision,
                        &request_id,
                        prompt_estimate,
                        completion_estimate,
                        server_usage,
                    );
                    let reason = transform::unify_finish_reason(finish_reason.as_deref())
                        .unwrap_or_else(|| "stop".into());
                    state.metrics.record_usage(
                        usage.prompt_tokens,
                        usage.completion_tokens,
                        usage.estimated_cost,
                    );
                    state.telemetry.emit(
                        "stream.stop",
                        std::collections::HashMap::from([
                            ("prompt_tokens".to_string(), usage.prompt_tokens as f64),
                            ("completion_tokens".to_string(), usage.completion_tokens as f64),
                        ]),
                        serde_json::json!({
                            "request_id": request_id,
                            "provider": decision.provider,
                            "finish_reason": reason,
                        }),
                    );
                    debug!(request_id = %request_id, %reason, total_tokens = usage.total_tokens, "stream complete");
                    yield chunk_frame(&UnifiedChunk::done(&chat_id, &model, &reason, Some(usage)));
                    yield DONE_FRAME.to_string();
                    return;
                }
                Some(ProviderEvent::Error { code, message }) => {
                    let e = GatewayError::from_provider_type(&code, message);
                    state.metrics.inc_http_errors();
                    state.telemetry.emit_meta(
                        "stream.error",
                        serde_json::json!({ "request_id": request_id, "error": e.code() }),
                    );
                    yield envelope_frame(&e, &request_id);
                    yield DONE_FRAME.to_string();
                    return;
                }
                None => {
                    // Provider hung up without a Done event — close out with
                    // what we have.
                    let usage = final_usage(
                        &state,
                        &decision,
                        &request_id,
                        prompt_estimate,
                        completion_estimate,
                        server_usage,
                    );
                    state.metrics.record_usage(
                        usage.prompt_tokens,
                        usage.completion_tokens,
                        usage.estimated_cost,
                    );
                    warn!(request_id = %request_id, provider = %decision.provider, "provider stream ended without a done event");
                    state.telemetry.emit(
                        "stream.error",
                        std::collections::HashMap::from([
                            ("prompt_tokens".to_string(), usage.prompt_tokens as f64),
                            ("completion_tokens".to_string(), usage.completion_tokens as f64),
                        ]),
                        serde_json::json!({
                            "request_id": request_id,
                            "provider": decision.provider,
                            "error": "stream_ended_early",
                        }),
                    );
                    yield chunk_frame(&UnifiedChunk::done(&chat_id, &model, "stop", Some(usage)));
                    yield DONE_FRAME.to_string();
                    return;
                }
            }
        }
    }
}

/// Server-reported token counts win over the estimates, per field.
fn final_usage(
    state: &AppState,
    decision: &RouteDecision,
    request_id: &str,
    prompt_estimate: u32,
    completion_estimate: u32,
    server_usage: Option<(u32, u32)>,
) -> UsageReport {
    let (server_prompt, server_completion) = server_usage.unwrap_or((0, 0));
    let prompt = if server_prompt > 0 { server_prompt } else { prompt_estimate };
    let completion = if server_completion > 0 {
        server_completion
    } else {
        completion_estimate
    };
    let usage = UsageReport::new(prompt, completion);
    let cost = state.cost.estimate_cost(&decision.provider, &decision.model, &usage);
    usage.with_cost(cost).with_request_id(request_id)
}

fn chunk_frame(chunk: &UnifiedChunk) -> String {
    serde_json::to_string(chunk).unwrap_or_default()
}

fn envelope_frame(err: &GatewayError, request_id: &str) -> String {
    let envelope = ErrorEnvelope::new(err, Some(request_id.to_string()));
    serde_json::to_string(&envelope).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppState;
    use async_trait::async_trait;
    use futures::StreamExt;
    use gantry_config::GantryConfig;
    use gantry_core::ChatMessage;
    use gantry_llm::provider::{ChatProvider, ProviderInfo, ProviderResponse};
    use gantry_llm::{MockChatProvider, MockFailure, ProviderRegistry};

    /// Provider that replays a fixed event script — stands in for an
    /// upstream emitting Anthropic-shaped events already normalized.
    struct ScriptedProvider {
        events: Vec<ProviderEvent>,
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                name: "scripted".into(),
                family: "anthropic".into(),
                default_model: "claude-sonnet-4-20250514".into(),
                models: vec!["claude-sonnet-4-20250514".into()],
            }
        }

        fn models(&self) -> Vec<String> {
            vec!["claude-sonnet-4-20250514".into()]
        }

        fn supports(&self, _model: &str) -> bool {
            true
        }

        fn validate_config(&self) -> gantry_core::Result<()> {
            Ok(())
        }

        async fn complete(&self, _request: &ProviderRequest) -> gantry_core::Result<ProviderResponse> {
            unimplemented!("streaming only")
        }

        async fn stream(
            &self,
            _request: &ProviderRequest,
        ) -> gantry_core::Result<tokio::sync::mpsc::Receiver<ProviderEvent>> {
            let (tx, rx) = tokio::sync::mpsc::channel(16);
            let events = self.events.clone();
            tokio::spawn(async move {
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }

        async fn health_check(&self) -> gantry_core::Result<()> {
            Ok(())
        }
    }

    fn state_with(registry: ProviderRegistry) -> Arc<AppState> {
        AppState::build(GantryConfig::default(), registry)
    }

    fn chat_request(content: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: Some("claude-sonnet-4-20250514".into()),
            messages: vec![ChatMessage::new("user", content)],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: true,
            stop: None,
            tools: None,
            user: None,
            provider: None,
        }
    }

    fn decision(provider: &str, model: &str) -> RouteDecision {
        RouteDecision {
            provider: provider.into(),
            model: model.into(),
            mock_mode: provider == "mock",
        }
    }

    async fn collect_frames(state: Arc<AppState>, request: ChatCompletionRequest, d: RouteDecision) -> Vec<String> {
        let slot = state.limiter.acquire_slot("key_test");
        frame_stream(state, request, d, "req_test".into(), slot)
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn anthropic_event_script_produces_unified_sequence() {
        // message_start / "Hel" / "lo" / message_stop(end_turn) as the
        // provider adapter reports them.
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider {
            events: vec![
                ProviderEvent::TextDelta("Hel".into()),
                ProviderEvent::TextDelta("lo".into()),
                ProviderEvent::Usage { prompt_tokens: 4, completion_tokens: 2 },
                ProviderEvent::Done { finish_reason: Some("end_turn".into()) },
            ],
        }));
        let state = state_with(registry);

        let frames = collect_frames(
            Arc::clone(&state),
            chat_request("Say hello"),
            decision("scripted", "claude-sonnet-4-20250514"),
        )
        .await;

        assert_eq!(frames.len(), 5);

        let role: UnifiedChunk = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(role.choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(role.choices[0].delta.content.as_deref(), Some(""));

        let first: UnifiedChunk = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(first.choices[0].delta.content.as_deref(), Some("Hel"));
        let second: UnifiedChunk = serde_json::from_str(&frames[2]).unwrap();
        assert_eq!(second.choices[0].delta.content.as_deref(), Some("lo"));

        let fin: UnifiedChunk = serde_json::from_str(&frames[3]).unwrap();
        assert_eq!(fin.choices[0].finish_reason.as_deref(), Some("stop"));
        let usage = fin.usage.clone().unwrap();
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 6);

        assert_eq!(frames[4], DONE_FRAME);
    }

    #[tokio::test]
    async fn chunk_order_matches_delta_order() {
        let deltas: Vec<String> = (0..20).map(|i| format!("d{i} ")).collect();
        let mut events: Vec<ProviderEvent> =
            deltas.iter().cloned().map(ProviderEvent::TextDelta).collect();
        events.push(ProviderEvent::Done { finish_reason: Some("stop".into()) });

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider { events }));
        let state = state_with(registry);

        let frames = collect_frames(
            Arc::clone(&state),
            chat_request("count"),
            decision("scripted", "claude-sonnet-4-20250514"),
        )
        .await;

        let received: Vec<String> = frames[1..frames.len() - 2]
            .iter()
            .map(|f| {
                let chunk: UnifiedChunk = serde_json::from_str(f).unwrap();
                chunk.choices[0].delta.content.clone().unwrap()
            })
            .collect();
        assert_eq!(received, deltas);
    }

    #[tokio::test]
    async fn estimates_fill_in_when_server_reports_nothing() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider {
            events: vec![
                ProviderEvent::TextDelta("four char".into()),
                ProviderEvent::Done { finish_reason: None },
            ],
        }));
        let state = state_with(registry);

        let frames = collect_frames(
            Arc::clone(&state),
            chat_request("hello there"),
            decision("scripted", "claude-sonnet-4-20250514"),
        )
        .await;

        let fin: UnifiedChunk = serde_json::from_str(&frames[frames.len() - 2]).unwrap();
        let usage = fin.usage.clone().unwrap();
        assert!(usage.prompt_tokens > 0);
        assert!(usage.completion_tokens > 0);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
        // No native finish reason — the stream still closes with "stop".
        assert_eq!(fin.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn provider_error_event_ends_with_envelope_then_done() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider {
            events: vec![
                ProviderEvent::TextDelta("par".into()),
                ProviderEvent::Error {
                    code: "overloaded_error".into(),
                    message: "try later".into(),
                },
            ],
        }));
        let state = state_with(registry);

        let frames = collect_frames(
            Arc::clone(&state),
            chat_request("hi"),
            decision("scripted", "claude-sonnet-4-20250514"),
        )
        .await;

        let envelope: ErrorEnvelope =
            serde_json::from_str(&frames[frames.len() - 2]).unwrap();
        assert_eq!(envelope.error.code, "overloaded");
        assert_eq!(envelope.request_id.as_deref(), Some("req_test"));
        assert_eq!(frames.last().unwrap(), DONE_FRAME);
    }

    #[tokio::test]
    async fn silent_hangup_still_finalizes_and_emits_telemetry() {
        // No Done event — the provider just drops the channel.
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider {
            events: vec![ProviderEvent::TextDelta("cut ".into())],
        }));
        let state = state_with(registry);
        let mut telemetry_rx = state.telemetry.subscribe();

        let frames = collect_frames(
            Arc::clone(&state),
            chat_request("hi"),
            decision("scripted", "claude-sonnet-4-20250514"),
        )
        .await;

        // The stream still closes out: final chunk with usage, then [DONE].
        let fin: UnifiedChunk = serde_json::from_str(&frames[frames.len() - 2]).unwrap();
        assert_eq!(fin.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(fin.usage.is_some());
        assert_eq!(frames.last().unwrap(), DONE_FRAME);

        // The abnormal exit is visible on the bus.
        let mut saw_error = false;
        while let Ok(event) = telemetry_rx.try_recv() {
            if event.name == "stream.error" {
                assert_eq!(event.metadata["error"], "stream_ended_early");
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn failed_open_emits_error_and_done_only() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(
            MockChatProvider::new("mock").with_failure(MockFailure::InvalidRequest),
        ));
        let state = state_with(registry);

        let frames = collect_frames(
            Arc::clone(&state),
            chat_request("hi"),
            decision("mock", "mock-model"),
        )
        .await;

        assert_eq!(frames.len(), 2);
        let envelope: ErrorEnvelope = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(envelope.error.status, 400);
        assert_eq!(frames[1], DONE_FRAME);
    }

    #[tokio::test]
    async fn slot_released_exactly_once_on_all_paths() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockChatProvider::new("mock").with_response("ok")));
        let state = state_with(registry);
        let policy = crate::ratelimit::RateLimitPolicy { rpm: 100, rph: 1000, concurrent: 1 };

        // Normal completion.
        let frames = collect_frames(
            Arc::clone(&state),
            chat_request("hi"),
            decision("mock", "mock-model"),
        )
        .await;
        assert_eq!(frames.last().unwrap(), DONE_FRAME);
        assert_eq!(state.limiter.status("key_test", &policy).concurrent.used, 0);

        // Client disconnect: drop the stream after the first frame.
        let slot = state.limiter.acquire_slot("key_test");
        let mut stream = Box::pin(frame_stream(
            Arc::clone(&state),
            chat_request("hi"),
            decision("mock", "mock-model"),
            "req_test2".into(),
            slot,
        ));
        let _first = stream.next().await;
        drop(stream);
        assert_eq!(state.limiter.status("key_test", &policy).concurrent.used, 0);
    }
}
