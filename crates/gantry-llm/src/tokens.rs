use gantry_core::ChatMessage;

/// Formatting overhead added per message when estimating prompt tokens.
const PER_MESSAGE_OVERHEAD: u32 = 3;

/// Approximate characters-per-token ratio for a model family.
///
/// These are documented approximations, not tokenizer output:
/// GPT-4 family ≈ 3.5, GPT-3.5 family ≈ 4.0, Claude family ≈ 3.8,
/// everything else 4.0.
pub fn chars_per_token(model: &str) -> f64 {
    let m = model.to_lowercase();
    if m.contains("gpt-4") || m.starts_with("o1") || m.starts_with("o3") {
        3.5
    } else if m.contains("gpt-3.5") {
        4.0
    } else if m.contains("claude") {
        3.8
    } else {
        4.0
    }
}

/// Estimate the token count of a piece of text for the given model.
pub fn estimate_text_tokens(text: &str, model: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() as f64 / chars_per_token(model)).ceil() as u32
}

/// Estimate prompt tokens over a message list: per-message content estimate
/// plus a fixed formatting overhead per message.
pub fn estimate_prompt_tokens(messages: &[ChatMessage], model: &str) -> u32 {
    messages
        .iter()
        .map(|m| {
            let content = m.content.as_deref().unwrap_or("");
            estimate_text_tokens(content, model) + PER_MESSAGE_OVERHEAD
        })
        .sum()
}
