use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration — maps to `gantry.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GantryConfig {
    pub server: ServerConfig,
    pub router: RouterConfig,
    pub providers: HashMap<String, ProviderConfig>,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub failover: FailoverSettings,
    pub rate_limit: RateLimitSettings,
    pub queue: QueueSettings,
    pub logging: LoggingConfig,
    /// Path to the alias file. Watched for hot reload when set.
    pub aliases_path: Option<PathBuf>,
}

impl Default for GantryConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            router: RouterConfig::default(),
            providers: default_providers(),
            circuit_breaker: CircuitBreakerSettings::default(),
            retry: RetrySettings::default(),
            failover: FailoverSettings::default(),
            rate_limit: RateLimitSettings::default(),
            queue: QueueSettings::default(),
            logging: LoggingConfig::default(),
            aliases_path: None,
        }
    }
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the main API listener.
    pub host: String,
    pub port: u16,
    /// Optional second listener serving only the health routes.
    pub health_port: Option<u16>,
    pub cors: bool,
    /// Wall-clock deadline per request, seconds. 0 disables the deadline.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 4000,
            health_port: None,
            cors: true,
            request_timeout_secs: 300,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Router ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Routing policy: "default", "cost", "health", or "enhanced".
    pub policy: String,
    /// Provider used when the request names neither provider nor model.
    pub default_provider: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            policy: "default".into(),
            default_provider: None,
        }
    }
}

// ── Providers ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Connect + read timeout for upstream calls, seconds.
    pub timeout_secs: u64,
    /// Per-provider override of retry.max_attempts.
    pub retry_attempts: Option<u32>,
    pub circuit_breaker: bool,
    pub telemetry: bool,
    pub default_model: Option<String>,
    pub supported_models: Vec<String>,
    /// Override of the static cost table, $ per 1k tokens.
    pub cost_per_1k: Option<CostRates>,
    /// Failover ordering — lower goes first.
    pub priority: u32,
    pub weight: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            timeout_secs: 120,
            retry_attempts: None,
            circuit_breaker: true,
            telemetry: true,
            default_model: None,
            supported_models: vec![],
            cost_per_1k: None,
            priority: 10,
            weight: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CostRates {
    pub input: f64,
    pub output: f64,
}

fn default_providers() -> HashMap<String, ProviderConfig> {
    let mut providers = HashMap::new();
    providers.insert(
        "openai".to_string(),
        ProviderConfig {
            default_model: Some("gpt-4o".into()),
            priority: 1,
            ..Default::default()
        },
    );
    providers.insert(
        "anthropic".to_string(),
        ProviderConfig {
            default_model: Some("claude-sonnet-4-20250514".into()),
            priority: 2,
            ..Default::default()
        },
    );
    providers
}

// ── Resilience ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before probing.
    pub recovery_timeout_secs: u64,
    /// Successful probes required to close again.
    pub success_threshold: u32,
    /// Concurrent probes admitted while half-open.
    pub half_open_limit: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            success_threshold: 2,
            half_open_limit: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter: bool,
    /// Error codes eligible for retry (see GatewayError::code).
    pub retryable_errors: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter: true,
            retryable_errors: vec![
                "timeout".into(),
                "connection_error".into(),
                "rate_limit".into(),
                "server_error".into(),
                "overloaded".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverSettings {
    /// "priority", "round_robin", "health_aware", or "cost_optimized".
    pub strategy: String,
    /// Maximum providers tried per request.
    pub max_attempts: u32,
    /// Providers below this health score are skipped by health_aware.
    pub health_threshold: f64,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            strategy: "priority".into(),
            max_attempts: 3,
            health_threshold: 0.5,
        }
    }
}

// ── Rate limiting ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub rpm: u32,
    pub rph: u32,
    pub concurrent: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            rpm: 60,
            rph: 3600,
            concurrent: 10,
        }
    }
}

// ── Overflow queue ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// SQLite file backing the overflow queue.
    pub path: PathBuf,
    /// Message contents longer than this are truncated before persistence.
    pub redact_over_chars: usize,
    /// Window in which a duplicate request_id is refused.
    pub idempotency_window_secs: u64,
    /// Replay attempts before a job is marked failed.
    pub max_attempts: u32,
    pub drain_interval_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gantry-queue.db"),
            redact_over_chars: 2000,
            idempotency_window_secs: 600,
            max_attempts: 3,
            drain_interval_secs: 30,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

const ROUTER_POLICIES: &[&str] = &["default", "cost", "health", "enhanced"];
const FAILOVER_STRATEGIES: &[&str] = &["priority", "round_robin", "health_aware", "cost_optimized"];

impl GantryConfig {
    /// Validate the config. Returns warnings for degraded-but-usable setups,
    /// an error for unusable ones.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if !ROUTER_POLICIES.contains(&self.router.policy.as_str()) {
            return Err(format!(
                "router.policy must be one of {ROUTER_POLICIES:?}, got {:?}",
                self.router.policy
            ));
        }
        if !FAILOVER_STRATEGIES.contains(&self.failover.strategy.as_str()) {
            return Err(format!(
                "failover.strategy must be one of {FAILOVER_STRATEGIES:?}, got {:?}",
                self.failover.strategy
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err("circuit_breaker.failure_threshold must be at least 1".into());
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err("circuit_breaker.success_threshold must be at least 1".into());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".into());
        }
        if self.retry.backoff_factor < 1.0 {
            warnings.push("retry.backoff_factor < 1.0 — delays will shrink between attempts".into());
        }
        if let Some(ref default) = self.router.default_provider
            && !self.providers.contains_key(default)
        {
            return Err(format!(
                "router.default_provider {default:?} has no [providers.{default}] entry"
            ));
        }
        if !self.providers.values().any(|p| p.api_key.is_some()) {
            warnings.push(
                "no provider has an api_key — requests will be served by the mock provider".into(),
            );
        }

        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_with_mock_warning() {
        let config = GantryConfig::default();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.contains("mock provider")));
    }

    #[test]
    fn bad_policy_rejected() {
        let config = GantryConfig {
            router: RouterConfig {
                policy: "cheapest".into(),
                default_provider: None,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_default_provider_rejected() {
        let config = GantryConfig {
            router: RouterConfig {
                policy: "default".into(),
                default_provider: Some("groq".into()),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let raw = r#"
            [server]
            port = 9000

            [providers.openai]
            api_key = "sk-test-1234567890"
            default_model = "gpt-4o-mini"
        "#;
        let config: GantryConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(
            config.providers["openai"].default_model.as_deref(),
            Some("gpt-4o-mini")
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.rate_limit.rpm, 60);
    }
}
