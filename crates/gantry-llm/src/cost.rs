use gantry_config::{CostRates, ProviderConfig};
use gantry_core::UsageReport;
use std::collections::HashMap;

/// Static metadata for one model: dollar rates per 1k tokens, declared
/// capabilities, and the context ceiling advertised by `/v1/models`.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub provider: &'static str,
    /// Matched by prefix against concrete model names.
    pub model_prefix: &'static str,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub capabilities: &'static [&'static str],
    pub max_tokens: u32,
}

const CHAT: &[&str] = &["chat", "streaming"];
const CHAT_TOOLS: &[&str] = &["chat", "streaming", "tool_use"];

/// Built-in rate table. Longest matching prefix wins, so the more specific
/// entries must come before their generic fallbacks.
const BUILTIN: &[ModelMeta] = &[
    ModelMeta { provider: "openai", model_prefix: "gpt-4o-mini", input_per_1k: 0.000_15, output_per_1k: 0.000_6, capabilities: CHAT_TOOLS, max_tokens: 128_000 },
    ModelMeta { provider: "openai", model_prefix: "gpt-4o", input_per_1k: 0.002_5, output_per_1k: 0.01, capabilities: CHAT_TOOLS, max_tokens: 128_000 },
    ModelMeta { provider: "openai", model_prefix: "gpt-4-turbo", input_per_1k: 0.01, output_per_1k: 0.03, capabilities: CHAT_TOOLS, max_tokens: 128_000 },
    ModelMeta { provider: "openai", model_prefix: "gpt-4", input_per_1k: 0.03, output_per_1k: 0.06, capabilities: CHAT_TOOLS, max_tokens: 8_192 },
    ModelMeta { provider: "openai", model_prefix: "gpt-3.5-turbo", input_per_1k: 0.000_5, output_per_1k: 0.001_5, capabilities: CHAT, max_tokens: 16_385 },
    ModelMeta { provider: "anthropic", model_prefix: "claude-opus", input_per_1k: 0.015, output_per_1k: 0.075, capabilities: CHAT_TOOLS, max_tokens: 200_000 },
    ModelMeta { provider: "anthropic", model_prefix: "claude-sonnet", input_per_1k: 0.003, output_per_1k: 0.015, capabilities: CHAT_TOOLS, max_tokens: 200_000 },
    ModelMeta { provider: "anthropic", model_prefix: "claude-haiku", input_per_1k: 0.000_8, output_per_1k: 0.004, capabilities: CHAT_TOOLS, max_tokens: 200_000 },
];

/// Rate lookup for cost estimation and model metadata.
///
/// Built-in rates can be overridden per provider via `[providers.*]`
/// `cost_per_1k` in the config.
#[derive(Debug, Clone, Default)]
pub struct CostTable {
    overrides: HashMap<String, CostRates>,
}

impl CostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply provider-level rate overrides from the config.
    pub fn with_overrides(providers: &HashMap<String, ProviderConfig>) -> Self {
        let overrides = providers
            .iter()
            .filter_map(|(name, p)| p.cost_per_1k.map(|rates| (name.clone(), rates)))
            .collect();
        Self { overrides }
    }

    /// Dollar rates per 1k tokens for the given provider + model, when known.
    pub fn rates_for(&self, provider: &str, model: &str) -> Option<CostRates> {
        if let Some(rates) = self.overrides.get(provider) {
            return Some(*rates);
        }
        BUILTIN
            .iter()
            .filter(|m| m.provider == provider && model.starts_with(m.model_prefix))
            .max_by_key(|m| m.model_prefix.len())
            .map(|m| CostRates {
                input: m.input_per_1k,
                output: m.output_per_1k,
            })
    }

    /// Estimated dollar cost of the given usage; `None` when no rates are
    /// known (callers omit cost fields in that case).
    pub fn estimate_cost(&self, provider: &str, model: &str, usage: &UsageReport) -> Option<f64> {
        let rates = self.rates_for(provider, model)?;
        Some(
            (usage.prompt_tokens as f64 * rates.input
                + usage.completion_tokens as f64 * rates.output)
                / 1000.0,
        )
    }

    /// Static metadata entry for a concrete model name, when known.
    pub fn meta_for(&self, provider: &str, model: &str) -> Option<&'static ModelMeta> {
        BUILTIN
            .iter()
            .filter(|m| m.provider == provider && model.starts_with(m.model_prefix))
            .max_by_key(|m| m.model_prefix.len())
    }
}
