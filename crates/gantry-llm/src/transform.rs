//! Normalization of provider responses into the unified OpenAI chunk shape:
//! finish-reason mapping, repair of malformed OpenAI chunks, and text
//! extraction from generic response shapes.

use chrono::Utc;
use gantry_core::{GatewayError, Result, UnifiedChunk};
use serde_json::Value;

/// Map a provider-native finish reason onto the unified (OpenAI) vocabulary.
///
/// `None` means the stream is still in progress and stays `None`. The map is
/// idempotent: unified values map to themselves.
pub fn unify_finish_reason(reason: Option<&str>) -> Option<String> {
    let reason = reason?;
    let unified = match reason {
        // OpenAI values pass through unchanged.
        "stop" | "length" | "tool_calls" | "function_call" | "content_filter" => reason,
        // Anthropic
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        // Cohere
        "COMPLETE" | "ERROR" => "stop",
        "MAX_TOKENS" => "length",
        // Google
        "STOP" => "stop",
        "SAFETY" | "RECITATION" => "content_filter",
        // Anything unrecognized ends the turn.
        _ => "stop",
    };
    Some(unified.to_string())
}

/// Validate an OpenAI-shaped streaming chunk, repairing missing required
/// fields with defaults. Delta content passes through unchanged.
pub fn repair_chunk(value: &Value, fallback_model: &str) -> UnifiedChunk {
    // A well-formed chunk deserializes directly.
    if let Ok(chunk) = serde_json::from_value::<UnifiedChunk>(value.clone())
        && !chunk.id.is_empty()
        && !chunk.choices.is_empty()
    {
        return chunk;
    }

    let id = value["id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()));
    let model = value["model"]
        .as_str()
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback_model);
    let created = value["created"].as_i64().unwrap_or_else(|| Utc::now().timestamp());

    let mut chunk = if let Some(text) = value["choices"][0]["delta"]["content"].as_str() {
        UnifiedChunk::content(&id, model, text)
    } else {
        UnifiedChunk::content(&id, model, "")
    };
    chunk.created = created;
    if let Some(reason) = value["choices"][0]["finish_reason"].as_str() {
        chunk.choices[0].finish_reason = unify_finish_reason(Some(reason));
    }
    chunk
}

/// Extract the text payload from a documented set of response shapes:
/// `{choices[].delta.content}`, `{content[].text}`, `{text}`, `{content}`.
pub fn extract_text(value: &Value) -> Result<String> {
    if let Some(text) = value["choices"][0]["delta"]["content"].as_str() {
        return Ok(text.to_string());
    }
    if let Some(blocks) = value["content"].as_array() {
        let joined: String = blocks
            .iter()
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        if !joined.is_empty() {
            return Ok(joined);
        }
    }
    if let Some(text) = value["text"].as_str() {
        return Ok(text.to_string());
    }
    if let Some(text) = value["content"].as_str() {
        return Ok(text.to_string());
    }
    Err(GatewayError::Provider(format!(
        "no text found in response shape: {}",
        truncate_for_log(value)
    )))
}

fn truncate_for_log(value: &Value) -> String {
    let s = value.to_string();
    if s.chars().count() > 200 {
        let truncated: String = s.chars().take(200).collect();
        format!("{truncated}…")
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finish_reason_table() {
        assert_eq!(unify_finish_reason(Some("stop")).as_deref(), Some("stop"));
        assert_eq!(unify_finish_reason(Some("length")).as_deref(), Some("length"));
        assert_eq!(unify_finish_reason(Some("tool_calls")).as_deref(), Some("tool_calls"));
        assert_eq!(unify_finish_reason(Some("end_turn")).as_deref(), Some("stop"));
        assert_eq!(unify_finish_reason(Some("stop_sequence")).as_deref(), Some("stop"));
        assert_eq!(unify_finish_reason(Some("max_tokens")).as_deref(), Some("length"));
        assert_eq!(unify_finish_reason(Some("tool_use")).as_deref(), Some("tool_calls"));
        assert_eq!(unify_finish_reason(Some("COMPLETE")).as_deref(), Some("stop"));
        assert_eq!(unify_finish_reason(Some("MAX_TOKENS")).as_deref(), Some("length"));
        assert_eq!(unify_finish_reason(Some("ERROR")).as_deref(), Some("stop"));
        assert_eq!(unify_finish_reason(Some("STOP")).as_deref(), Some("stop"));
        assert_eq!(unify_finish_reason(Some("SAFETY")).as_deref(), Some("content_filter"));
        assert_eq!(unify_finish_reason(Some("RECITATION")).as_deref(), Some("content_filter"));
        assert_eq!(unify_finish_reason(Some("whatever")).as_deref(), Some("stop"));
        assert_eq!(unify_finish_reason(None), None);
    }

    #[test]
    fn finish_reason_mapping_is_idempotent() {
        for native in [
            "stop", "length", "tool_calls", "content_filter", "end_turn", "max_tokens",
            "tool_use", "COMPLETE", "MAX_TOKENS", "STOP", "SAFETY", "anything",
        ] {
            let once = unify_finish_reason(Some(native));
            let twice = unify_finish_reason(once.as_deref());
            assert_eq!(once, twice, "not idempotent for {native:?}");
        }
    }

    #[test]
    fn well_formed_chunk_passes_through() {
        let chunk = UnifiedChunk::content("chatcmpl-abc", "gpt-4o", "hi");
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(repair_chunk(&value, "other-model"), chunk);
    }

    #[test]
    fn missing_fields_are_repaired() {
        let value = json!({
            "choices": [{ "index": 0, "delta": { "content": "hello" } }]
        });
        let chunk = repair_chunk(&value, "gpt-4o");
        assert!(chunk.id.starts_with("chatcmpl-"));
        assert_eq!(chunk.object, "chat.completion.chunk");
        assert_eq!(chunk.model, "gpt-4o");
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hello"));
    }

    #[test]
    fn extract_text_shapes() {
        assert_eq!(
            extract_text(&json!({"choices": [{"delta": {"content": "a"}}]})).unwrap(),
            "a"
        );
        assert_eq!(
            extract_text(&json!({"content": [{"type": "text", "text": "b"}]})).unwrap(),
            "b"
        );
        assert_eq!(extract_text(&json!({"text": "c"})).unwrap(), "c");
        assert_eq!(extract_text(&json!({"content": "d"})).unwrap(), "d");
        assert!(extract_text(&json!({"foo": "bar"})).is_err());
    }
}
