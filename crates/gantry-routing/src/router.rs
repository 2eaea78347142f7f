use gantry_config::GantryConfig;
use gantry_core::{GatewayError, Result, TelemetryBus};
use gantry_llm::{CostTable, ProviderRegistry};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::breaker::CircuitBreakerRegistry;
use crate::failover::StatsBook;

/// Routing policy, selected by `router.policy` / `ROUTER_POLICY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePolicy {
    Default,
    Cost,
    Health,
    Enhanced,
}

impl RoutePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Self::Default),
            "cost" => Some(Self::Cost),
            "health" => Some(Self::Health),
            "enhanced" => Some(Self::Enhanced),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Cost => "cost",
            Self::Health => "health",
            Self::Enhanced => "enhanced",
        }
    }
}

/// Hard requirements a cost-routed request may declare.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Requirements {
    pub model_family: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub max_cost_per_token: Option<f64>,
}

/// What the router needs to know about a request.
#[derive(Debug, Clone, Default)]
pub struct RouteQuery {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub request_id: String,
    pub requirements: Option<Requirements>,
}

/// The routing outcome: a concrete provider + model tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub provider: String,
    pub model: String,
    pub mock_mode: bool,
}

/// Resolves an incoming logical model to a concrete provider + model.
///
/// Holds no mutable state of its own — it reads the registry, breaker
/// availability, stats, and cost table, all owned elsewhere.
pub struct Router {
    registry: ProviderRegistry,
    breakers: Arc<CircuitBreakerRegistry>,
    stats: Arc<StatsBook>,
    cost: CostTable,
    policy: RoutePolicy,
    default_provider: Option<String>,
    priorities: HashMap<String, u32>,
    health_threshold: f64,
    telemetry: TelemetryBus,
}

impl Router {
    pub fn new(
        config: &GantryConfig,
        registry: ProviderRegistry,
        breakers: Arc<CircuitBreakerRegistry>,
        stats: Arc<StatsBook>,
        cost: CostTable,
        telemetry: TelemetryBus,
    ) -> Self {
        Self {
            registry,
            breakers,
            stats,
            cost,
            policy: RoutePolicy::parse(&config.router.policy).unwrap_or(RoutePolicy::Default),
            default_provider: config.router.default_provider.clone(),
            priorities: config.providers.iter().map(|(n, p)| (n.clone(), p.priority)).collect(),
            health_threshold: config.failover.health_threshold,
            telemetry,
        }
    }

    pub fn policy(&self) -> RoutePolicy {
        self.policy
    }

    /// Route a request. Every decision emits `router.decide`.
    pub fn route(&self, query: &RouteQuery) -> Result<RouteDecision> {
        if self.registry.is_empty() || self.registry.is_mock_mode() {
            return Ok(self.decide(query, "mock", mock_decision(query)));
        }

        let decision = match self.policy {
            RoutePolicy::Default => self.route_default(query)?,
            RoutePolicy::Cost => self.route_cost(query)?,
            RoutePolicy::Health => self.route_health(query)?,
            RoutePolicy::Enhanced => self.route_enhanced(query)?,
        };
        Ok(decision)
    }

    fn decide(&self, query: &RouteQuery, strategy: &str, decision: RouteDecision) -> RouteDecision {
        debug!(
            provider = %decision.provider,
            model = %decision.model,
            policy = self.policy.as_str(),
            strategy,
            "routing decision"
        );
        self.telemetry.emit_meta(
            "router.decide",
            serde_json::json!({
                "provider": decision.provider,
                "policy": self.policy.as_str(),
                "request_id": query.request_id,
                "strategy": strategy,
            }),
        );
        decision
    }

    // Decision order: explicit tuple > provider default > model match >
    // configured default provider + its default model.
    fn route_default(&self, query: &RouteQuery) -> Result<RouteDecision> {
        if let Some(ref name) = query.provider {
            let provider = self.registry.expect(name)?;
            if let Some(ref model) = query.model
                && provider.supports(model)
            {
                return Ok(self.decide(query, "explicit", real(name, model)));
            }
            if query.model.is_none() {
                let model = provider.default_model();
                return Ok(self.decide(query, "provider_default", real(name, &model)));
            }
            // Provider pinned but the model is unknown to it — pass the
            // model through; the upstream is the authority on support.
            let model = query.model.clone().unwrap_or_default();
            return Ok(self.decide(query, "explicit_passthrough", real(name, &model)));
        }

        if let Some(ref model) = query.model {
            if let Some(provider) = self.registry.find_for_model(model) {
                return Ok(self.decide(query, "model_match", real(provider.name(), model)));
            }
            // Unknown model — send it to the default provider unchanged.
            let provider = self.default_provider()?;
            return Ok(self.decide(query, "model_passthrough", real(provider.name(), model)));
        }

        let provider = self.default_provider()?;
        let model = provider.default_model();
        Ok(self.decide(query, "default", real(provider.name(), &model)))
    }

    // Filter by requirements, rank ascending by cost per 1k tokens; ties by
    // declared priority, then name.
    fn route_cost(&self, query: &RouteQuery) -> Result<RouteDecision> {
        let requirements = query.requirements.clone().unwrap_or_default();
        let mut candidates: Vec<(String, String, f64)> = Vec::new();

        for provider in self.registry.iter() {
            let model = match query.model {
                Some(ref m) if provider.supports(m) => m.clone(),
                _ => provider.default_model(),
            };
            if let Some(ref family) = requirements.model_family
                && !model.contains(family.as_str())
            {
                continue;
            }
            let meta = self.cost.meta_for(provider.name(), &model);
            if !requirements.capabilities.is_empty() {
                let Some(meta) = meta else { continue };
                if !requirements
                    .capabilities
                    .iter()
                    .all(|c| meta.capabilities.contains(&c.as_str()))
                {
                    continue;
                }
            }
            let rates = self.cost.rates_for(provider.name(), &model);
            if let Some(max) = requirements.max_cost_per_token {
                let Some(rates) = rates else { continue };
                if rates.input / 1000.0 > max {
                    continue;
                }
            }
            let cost = rates.map(|r| r.input + r.output).unwrap_or(f64::INFINITY);
            candidates.push((provider.name().to_string(), model, cost));
        }

        candidates.sort_by(|a, b| {
            a.2.partial_cmp(&b.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.priority_of(&a.0).cmp(&self.priority_of(&b.0)))
                .then_with(|| a.0.cmp(&b.0))
        });

        match candidates.into_iter().next() {
            Some((provider, model, _)) => Ok(self.decide(query, "cheapest", real(&provider, &model))),
            // Nothing satisfied the requirements — degrade to default order.
            None => self.route_default(query),
        }
    }

    // Only providers with an admitting circuit and a healthy score; prefer
    // the requested provider, else first by priority.
    fn route_health(&self, query: &RouteQuery) -> Result<RouteDecision> {
        let eligible: Vec<String> = self
            .registry
            .iter()
            .map(|p| p.name().to_string())
            .filter(|name| {
                self.breakers.is_available(name)
                    && self.stats.health_score(name) >= self.health_threshold
            })
            .collect();

        if eligible.is_empty() {
            // Everything is unhealthy — fall back so the failover layer can
            // still try (and report) the least-bad option.
            return self.route_default(query);
        }

        let chosen = query
            .provider
            .as_ref()
            .filter(|p| eligible.iter().any(|e| e == *p))
            .cloned()
            .unwrap_or_else(|| {
                let mut sorted = eligible.clone();
                sorted.sort_by_key(|name| (self.priority_of(name), name.clone()));
                sorted[0].clone()
            });

        let provider = self.registry.expect(&chosen)?;
        let model = match query.model {
            Some(ref m) if provider.supports(m) => m.clone(),
            _ => provider.default_model(),
        };
        Ok(self.decide(query, "healthiest", real(&chosen, &model)))
    }

    // score = 100 + 50·health + 30 if model supported + 40 if requested
    // provider. Highest wins; ties go to the lexically smaller name.
    fn route_enhanced(&self, query: &RouteQuery) -> Result<RouteDecision> {
        let mut best: Option<(f64, String)> = None;
        for provider in self.registry.iter() {
            let name = provider.name().to_string();
            let mut score = 100.0 + 50.0 * self.stats.health_score(&name);
            if let Some(ref model) = query.model
                && provider.supports(model)
            {
                score += 30.0;
            }
            if query.provider.as_deref() == Some(name.as_str()) {
                score += 40.0;
            }
            let better = match best {
                None => true,
                Some((best_score, ref best_name)) => {
                    score > best_score || (score == best_score && name < *best_name)
                }
            };
            if better {
                best = Some((score, name));
            }
        }

        let (_, chosen) = best.ok_or_else(|| {
            GatewayError::NotFound("no providers registered".into())
        })?;
        let provider = self.registry.expect(&chosen)?;
        let model = match query.model {
            Some(ref m) if provider.supports(m) => m.clone(),
            _ => provider.default_model(),
        };
        Ok(self.decide(query, "highest_score", real(&chosen, &model)))
    }

    fn default_provider(&self) -> Result<Arc<dyn gantry_llm::ChatProvider>> {
        if let Some(ref name) = self.default_provider {
            return self.registry.expect(name);
        }
        self.registry
            .first()
            .ok_or_else(|| GatewayError::NotFound("no providers registered".into()))
    }

    fn priority_of(&self, name: &str) -> u32 {
        self.priorities.get(name).copied().unwrap_or(u32::MAX)
    }
}

fn real(provider: &str, model: &str) -> RouteDecision {
    RouteDecision {
        provider: provider.to_string(),
        model: model.to_string(),
        mock_mode: false,
    }
}

fn mock_decision(query: &RouteQuery) -> RouteDecision {
    RouteDecision {
        provider: "mock".into(),
        model: query.model.clone().unwrap_or_else(|| "mock-model".into()),
        mock_mode: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use gantry_llm::MockChatProvider;

    /// A registry of two named mock providers. Mock providers accept any
    /// model, which keeps the decision-order tests focused on the policy.
    fn two_provider_registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockChatProvider::new("openai")));
        registry.register(Arc::new(MockChatProvider::new("anthropic")));
        registry
    }

    fn router_with(policy: &str, registry: ProviderRegistry) -> Router {
        let mut config = GantryConfig::default();
        config.router.policy = policy.into();
        Router::new(
            &config,
            registry,
            Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
            Arc::new(StatsBook::new()),
            CostTable::new(),
            TelemetryBus::new(16),
        )
    }

    fn query(provider: Option<&str>, model: Option<&str>) -> RouteQuery {
        RouteQuery {
            provider: provider.map(str::to_string),
            model: model.map(str::to_string),
            request_id: "req_test".into(),
            requirements: None,
        }
    }

    #[test]
    fn explicit_tuple_wins() {
        let router = router_with("default", two_provider_registry());
        let decision = router.route(&query(Some("anthropic"), Some("claude-haiku-3-5"))).unwrap();
        assert_eq!(decision.provider, "anthropic");
        assert_eq!(decision.model, "claude-haiku-3-5");
        assert!(!decision.mock_mode);
    }

    #[test]
    fn provider_only_uses_its_default_model() {
        let router = router_with("default", two_provider_registry());
        let decision = router.route(&query(Some("openai"), None)).unwrap();
        assert_eq!(decision.provider, "openai");
        assert_eq!(decision.model, "mock-model");
    }

    #[test]
    fn model_only_finds_first_supporting_provider() {
        let router = router_with("default", two_provider_registry());
        let decision = router.route(&query(None, Some("gpt-4o"))).unwrap();
        assert_eq!(decision.provider, "openai");
        assert_eq!(decision.model, "gpt-4o");
    }

    #[test]
    fn bare_request_gets_default_tuple() {
        let router = router_with("default", two_provider_registry());
        let decision = router.route(&query(None, None)).unwrap();
        assert_eq!(decision.provider, "openai");
        assert_eq!(decision.model, "mock-model");
    }

    #[test]
    fn unknown_provider_is_not_found() {
        let router = router_with("default", two_provider_registry());
        let err = router.route(&query(Some("groq"), None)).unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn empty_registry_routes_to_mock() {
        let router = router_with("default", ProviderRegistry::new());
        let decision = router.route(&query(None, Some("gpt-4o"))).unwrap();
        assert!(decision.mock_mode);
        assert_eq!(decision.provider, "mock");
        assert_eq!(decision.model, "gpt-4o");
    }

    #[test]
    fn cost_policy_prefers_provider_with_known_rates() {
        let router = router_with("cost", two_provider_registry());
        // Both mocks accept the model; only anthropic has rates for it, and
        // unknown rates sort last.
        let decision = router.route(&query(None, Some("claude-haiku-3-5"))).unwrap();
        assert_eq!(decision.provider, "anthropic");
        assert_eq!(decision.model, "claude-haiku-3-5");
    }

    #[test]
    fn cost_policy_requirements_filter_falls_back() {
        let router = router_with("cost", two_provider_registry());
        let q = RouteQuery {
            provider: None,
            model: Some("claude-haiku-3-5".into()),
            request_id: "req_test".into(),
            requirements: Some(Requirements {
                model_family: None,
                capabilities: vec![],
                // Cheaper than any real rate — nothing qualifies.
                max_cost_per_token: Some(1e-12),
            }),
        };
        // No candidate satisfies the cap, so the default order decides.
        let decision = router.route(&q).unwrap();
        assert_eq!(decision.provider, "openai");
    }

    #[test]
    fn health_policy_avoids_unhealthy_provider() {
        let registry = two_provider_registry();
        let mut config = GantryConfig::default();
        config.router.policy = "health".into();
        let stats = Arc::new(StatsBook::new());
        // openai: 10% success rate, below the 0.5 threshold.
        stats.record("openai", true);
        for _ in 0..9 {
            stats.record("openai", false);
        }
        let router = Router::new(
            &config,
            registry,
            Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
            stats,
            CostTable::new(),
            TelemetryBus::new(16),
        );
        let decision = router.route(&query(None, None)).unwrap();
        assert_eq!(decision.provider, "anthropic");
    }

    #[test]
    fn enhanced_policy_prefers_requested_provider() {
        let router = router_with("enhanced", two_provider_registry());
        let decision = router.route(&query(Some("anthropic"), None)).unwrap();
        assert_eq!(decision.provider, "anthropic");
    }

    #[test]
    fn enhanced_ties_break_lexically() {
        let router = router_with("enhanced", two_provider_registry());
        // No requested provider, equal health — "anthropic" < "openai".
        let decision = router.route(&query(None, None)).unwrap();
        assert_eq!(decision.provider, "anthropic");
    }

    #[test]
    fn routing_emits_telemetry() {
        let registry = two_provider_registry();
        let config = GantryConfig::default();
        let bus = TelemetryBus::new(16);
        let mut rx = bus.subscribe();
        let router = Router::new(
            &config,
            registry,
            Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
            Arc::new(StatsBook::new()),
            CostTable::new(),
            bus,
        );
        router.route(&query(None, None)).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, "router.decide");
        assert_eq!(event.metadata["policy"], "default");
        assert_eq!(event.metadata["request_id"], "req_test");
    }
}
