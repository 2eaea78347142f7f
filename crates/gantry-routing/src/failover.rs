use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gantry_config::{FailoverSettings, GantryConfig};
use gantry_core::{GatewayError, Result};
use gantry_llm::CostTable;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::retry::RetryPolicy;

/// Observed per-provider counters, shared between the failover manager and
/// the router's health-aware policies.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl ProviderStats {
    pub fn health_score(&self) -> f64 {
        if self.total_requests == 0 {
            // No data yet — assume healthy so new providers get traffic.
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

/// Concurrent book of provider stats.
#[derive(Default)]
pub struct StatsBook {
    stats: DashMap<String, ProviderStats>,
}

impl StatsBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, provider: &str, ok: bool) {
        let mut entry = self.stats.entry(provider.to_string()).or_default();
        entry.total_requests += 1;
        if ok {
            entry.successful_requests += 1;
        }
        entry.last_used = Some(Utc::now());
    }

    pub fn health_score(&self, provider: &str) -> f64 {
        self.stats.get(provider).map(|s| s.health_score()).unwrap_or(1.0)
    }

    pub fn get(&self, provider: &str) -> ProviderStats {
        self.stats.get(provider).map(|s| s.clone()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> std::collections::HashMap<String, ProviderStats> {
        self.stats
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverStrategy {
    Priority,
    RoundRobin,
    HealthAware,
    CostOptimized,
}

impl FailoverStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "priority" => Some(Self::Priority),
            "round_robin" => Some(Self::RoundRobin),
            "health_aware" => Some(Self::HealthAware),
            "cost_optimized" => Some(Self::CostOptimized),
            _ => None,
        }
    }
}

/// One provider's place in the failover group.
#[derive(Debug, Clone)]
pub struct ProviderSlot {
    pub name: String,
    pub priority: u32,
    pub weight: u32,
    /// Dollar cost per 1k tokens of the provider's default model, used by
    /// the cost_optimized strategy. Unknown rates sort last.
    pub cost_per_1k: Option<f64>,
}

/// Iterates a service's providers by strategy, wrapping each attempt in the
/// provider's circuit breaker and the retry policy.
pub struct FailoverManager {
    service: String,
    strategy: FailoverStrategy,
    max_attempts: usize,
    health_threshold: f64,
    slots: Vec<ProviderSlot>,
    cursor: AtomicUsize,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    stats: Arc<StatsBook>,
}

impl FailoverManager {
    pub fn new(
        service: impl Into<String>,
        settings: &FailoverSettings,
        slots: Vec<ProviderSlot>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryPolicy,
        stats: Arc<StatsBook>,
    ) -> Self {
        Self {
            service: service.into(),
            strategy: FailoverStrategy::parse(&settings.strategy).unwrap_or(FailoverStrategy::Priority),
            max_attempts: settings.max_attempts.max(1) as usize,
            health_threshold: settings.health_threshold,
            slots,
            cursor: AtomicUsize::new(0),
            breakers,
            retry,
            stats,
        }
    }

    /// Build the chat-service group from the registered provider configs.
    pub fn from_config(
        config: &GantryConfig,
        registered: &[String],
        cost: &CostTable,
        breakers: Arc<CircuitBreakerRegistry>,
        stats: Arc<StatsBook>,
    ) -> Self {
        let mut slots: Vec<ProviderSlot> = registered
            .iter()
            .map(|name| {
                let provider_config = config.providers.get(name);
                let default_model = provider_config
                    .and_then(|p| p.default_model.clone())
                    .unwrap_or_default();
                ProviderSlot {
                    name: name.clone(),
                    priority: provider_config.map(|p| p.priority).unwrap_or(u32::MAX),
                    weight: provider_config.map(|p| p.weight).unwrap_or(1),
                    cost_per_1k: cost
                        .rates_for(name, &default_model)
                        .map(|r| r.input + r.output),
                }
            })
            .collect();
        slots.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));

        Self::new(
            "chat",
            &config.failover,
            slots,
            breakers,
            RetryPolicy::from(&config.retry),
            stats,
        )
    }

    pub fn providers(&self) -> &[ProviderSlot] {
        &self.slots
    }

    pub fn stats(&self) -> &StatsBook {
        &self.stats
    }

    /// Candidate order for the next request, by strategy.
    fn candidates(&self) -> Vec<String> {
        let mut slots: Vec<&ProviderSlot> = self.slots.iter().collect();
        match self.strategy {
            FailoverStrategy::Priority => {
                slots.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
            }
            FailoverStrategy::RoundRobin => {
                if !slots.is_empty() {
                    let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % slots.len();
                    slots.rotate_left(offset);
                }
            }
            FailoverStrategy::HealthAware => {
                slots.retain(|s| self.stats.health_score(&s.name) >= self.health_threshold);
                slots.sort_by(|a, b| {
                    let ha = self.stats.health_score(&a.name);
                    let hb = self.stats.health_score(&b.name);
                    hb.partial_cmp(&ha)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.name.cmp(&b.name))
                });
            }
            FailoverStrategy::CostOptimized => {
                slots.sort_by(|a, b| {
                    let ca = a.cost_per_1k.unwrap_or(f64::INFINITY);
                    let cb = b.cost_per_1k.unwrap_or(f64::INFINITY);
                    ca.partial_cmp(&cb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.name.cmp(&b.name))
                });
            }
        }
        slots.into_iter().map(|s| s.name.clone()).take(self.max_attempts).collect()
    }

    /// Call `op` against each candidate provider in turn until one succeeds.
    ///
    /// A circuit-open rejection or retryable error moves to the next
    /// candidate; non-retryable client errors (400-class except 429) surface
    /// immediately. The last error is returned when every candidate fails.
    pub async fn with_failover<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_failover_from(None, op).await
    }

    /// Like [`with_failover`](Self::with_failover), but the router's chosen
    /// provider goes first; the strategy order supplies the fallbacks.
    pub async fn with_failover_from<T, F, Fut>(&self, preferred: Option<&str>, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut candidates = self.candidates();
        if let Some(preferred) = preferred {
            candidates.retain(|name| name != preferred);
            candidates.insert(0, preferred.to_string());
            candidates.truncate(self.max_attempts);
        }
        if candidates.is_empty() {
            return Err(GatewayError::NotFound(format!(
                "no providers configured for service {}",
                self.service
            )));
        }

        let mut last_err: Option<GatewayError> = None;
        for name in candidates {
            let result = self
                .breakers
                .call(&name, || self.retry.run(|_| op(name.clone())))
                .await;

            match result {
                Ok(value) => {
                    self.stats.record(&name, true);
                    return Ok(value);
                }
                Err(GatewayError::CircuitOpen { provider }) => {
                    // No request actually reached the provider — skip ahead
                    // without touching its stats.
                    debug!(service = %self.service, provider = %provider, "circuit open, trying next provider");
                    last_err = Some(GatewayError::CircuitOpen { provider });
                }
                Err(e) => {
                    self.stats.record(&name, false);
                    let status = e.status();
                    if (400..500).contains(&status) && status != 429 {
                        return Err(e);
                    }
                    warn!(
                        service = %self.service,
                        provider = %name,
                        error = %e,
                        "provider failed, trying next"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            GatewayError::Overloaded(format!("all providers failed for service {}", self.service))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use gantry_config::RetrySettings;
    use std::sync::atomic::AtomicU32;

    fn slot(name: &str, priority: u32, cost: Option<f64>) -> ProviderSlot {
        ProviderSlot {
            name: name.into(),
            priority,
            weight: 1,
            cost_per_1k: cost,
        }
    }

    fn manager(strategy: &str, slots: Vec<ProviderSlot>) -> FailoverManager {
        let settings = FailoverSettings {
            strategy: strategy.into(),
            max_attempts: 3,
            health_threshold: 0.5,
        };
        let retry = RetryPolicy::from(&RetrySettings {
            max_attempts: 1,
            ..Default::default()
        });
        FailoverManager::new(
            "chat",
            &settings,
            slots,
            Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
            retry,
            Arc::new(StatsBook::new()),
        )
    }

    #[tokio::test]
    async fn priority_order_is_ascending() {
        let m = manager("priority", vec![slot("b", 2, None), slot("a", 1, None)]);
        assert_eq!(m.candidates(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn round_robin_advances_cursor() {
        let m = manager("round_robin", vec![slot("a", 1, None), slot("b", 2, None)]);
        assert_eq!(m.candidates()[0], "a");
        assert_eq!(m.candidates()[0], "b");
        assert_eq!(m.candidates()[0], "a");
    }

    #[tokio::test]
    async fn cost_optimized_prefers_cheap() {
        let m = manager(
            "cost_optimized",
            vec![slot("pricey", 1, Some(0.09)), slot("cheap", 2, Some(0.001)), slot("unknown", 0, None)],
        );
        assert_eq!(m.candidates(), vec!["cheap", "pricey", "unknown"]);
    }

    #[tokio::test]
    async fn health_aware_excludes_below_threshold() {
        let m = manager("health_aware", vec![slot("a", 1, None), slot("b", 2, None)]);
        // Tank a's health: 1 success, 9 failures.
        m.stats.record("a", true);
        for _ in 0..9 {
            m.stats.record("a", false);
        }
        assert_eq!(m.candidates(), vec!["b"]);
    }

    #[tokio::test]
    async fn failover_moves_to_next_on_retryable_error() {
        let m = manager("priority", vec![slot("a", 1, None), slot("b", 2, None)]);
        let result = m
            .with_failover(|name| async move {
                if name == "a" {
                    Err(GatewayError::Timeout("a is slow".into()))
                } else {
                    Ok(name)
                }
            })
            .await;
        assert_eq!(result.unwrap(), "b");
        assert_eq!(m.stats.get("a").total_requests, 1);
        assert_eq!(m.stats.get("a").successful_requests, 0);
        assert_eq!(m.stats.get("b").successful_requests, 1);
    }

    #[tokio::test]
    async fn client_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let m = manager("priority", vec![slot("a", 1, None), slot("b", 2, None)]);
        let result: Result<()> = m
            .with_failover(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Validation("bad body".into())) }
            })
            .await;
        assert_eq!(result.unwrap_err().status(), 400);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_failed_returns_last_error() {
        let m = manager("priority", vec![slot("a", 1, None), slot("b", 2, None)]);
        let result: Result<()> = m
            .with_failover(|name| async move {
                if name == "a" {
                    Err(GatewayError::Overloaded("a down".into()))
                } else {
                    Err(GatewayError::Timeout("b timed out".into()))
                }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.status(), 504);
        assert!(err.to_string().contains("b timed out"));
    }

    #[tokio::test]
    async fn open_circuit_skips_to_next_provider() {
        let m = manager("priority", vec![slot("a", 1, None), slot("b", 2, None)]);
        // Trip a's breaker.
        for _ in 0..BreakerConfig::default().failure_threshold {
            let _ = m
                .breakers
                .call("a", || async { Err::<(), _>(GatewayError::Timeout("x".into())) })
                .await;
        }
        let result = m.with_failover(|name| async move { Ok(name) }).await;
        assert_eq!(result.unwrap(), "b");
        // The open circuit never reached provider a's stats.
        assert_eq!(m.stats.get("a").total_requests, 0);
    }
}
