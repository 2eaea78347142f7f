use gantry_config::CircuitBreakerSettings;
use gantry_core::{GatewayError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Successful probes required to close a half-open circuit.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub reset_timeout: Duration,
    /// Concurrent probes admitted while half-open.
    pub half_open_limit: u32,
}

impl From<&CircuitBreakerSettings> for BreakerConfig {
    fn from(s: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold,
            success_threshold: s.success_threshold,
            reset_timeout: Duration::from_secs(s.recovery_timeout_secs),
            half_open_limit: s.half_open_limit.max(1),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    /// Normal operation — requests flow through.
    Closed,
    /// Provider is failing — reject requests immediately.
    Open { since: Instant },
    /// A bounded number of probe requests test whether it recovered.
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    probes_in_flight: u32,
    last_failure_at: Option<Instant>,
    last_transition_at: Instant,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            probes_in_flight: 0,
            last_failure_at: None,
            last_transition_at: Instant::now(),
        }
    }

    /// Whether a request may pass right now. Returns `probe = true` when the
    /// caller is one of the half-open probes and must report its outcome.
    fn try_acquire(&mut self, config: &BreakerConfig) -> Option<bool> {
        match self.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open { since } => {
                if since.elapsed() >= config.reset_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.last_transition_at = Instant::now();
                    self.success_count = 0;
                    self.probes_in_flight = 1;
                    Some(true)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if self.probes_in_flight < config.half_open_limit {
                    self.probes_in_flight += 1;
                    Some(true)
                } else {
                    None
                }
            }
        }
    }

    /// Record an outcome. Counters update against whatever state the
    /// breaker is in when the in-flight request lands.
    fn record(&mut self, ok: bool, probe: bool, config: &BreakerConfig) {
        if probe {
            self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
        }
        match self.state {
            CircuitState::Closed => {
                if ok {
                    self.failure_count = 0;
                } else {
                    self.failure_count += 1;
                    self.last_failure_at = Some(Instant::now());
                    if self.failure_count >= config.failure_threshold {
                        self.state = CircuitState::Open { since: Instant::now() };
                        self.last_transition_at = Instant::now();
                    }
                }
            }
            CircuitState::HalfOpen => {
                if ok {
                    self.success_count += 1;
                    if self.success_count >= config.success_threshold {
                        self.state = CircuitState::Closed;
                        self.last_transition_at = Instant::now();
                        self.failure_count = 0;
                        self.success_count = 0;
                    }
                } else {
                    self.last_failure_at = Some(Instant::now());
                    self.state = CircuitState::Open { since: Instant::now() };
                    self.last_transition_at = Instant::now();
                }
            }
            CircuitState::Open { .. } => {
                // A request admitted before the transition landed here; the
                // open circuit only cares about failures for bookkeeping.
                if !ok {
                    self.last_failure_at = Some(Instant::now());
                }
            }
        }
    }

    fn is_available(&self, config: &BreakerConfig) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open { since } => since.elapsed() >= config.reset_timeout,
        }
    }
}

/// Reported breaker state for health endpoints.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
}

/// Per-provider circuit breakers behind one lock — state transitions are
/// atomic with respect to concurrent callers.
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Run `op` guarded by the named provider's breaker. An open circuit
    /// rejects immediately with `CircuitOpen` without polling the future.
    pub async fn call<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let probe = {
            let mut breakers = self.breakers.lock();
            let breaker = breakers.entry(name.to_string()).or_insert_with(Breaker::new);
            match breaker.try_acquire(&self.config) {
                Some(probe) => probe,
                None => {
                    return Err(GatewayError::CircuitOpen {
                        provider: name.to_string(),
                    });
                }
            }
        };

        let result = op().await;
        let ok = result.is_ok();

        {
            let mut breakers = self.breakers.lock();
            if let Some(breaker) = breakers.get_mut(name) {
                let was_open = matches!(breaker.state, CircuitState::Open { .. });
                breaker.record(ok, probe, &self.config);
                let is_open = matches!(breaker.state, CircuitState::Open { .. });
                if !was_open && is_open {
                    warn!(
                        provider = name,
                        failures = breaker.failure_count,
                        "circuit breaker OPEN — provider disabled for {}s",
                        self.config.reset_timeout.as_secs()
                    );
                }
            }
        }

        result
    }

    /// Whether the named provider currently admits requests
    /// (closed, half-open, or an open circuit past its reset timeout).
    pub fn is_available(&self, name: &str) -> bool {
        let breakers = self.breakers.lock();
        breakers
            .get(name)
            .map(|b| b.is_available(&self.config))
            .unwrap_or(true)
    }

    /// Force the named breaker closed.
    pub fn reset(&self, name: &str) {
        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get_mut(name) {
            info!(provider = name, "circuit breaker manually reset");
            *breaker = Breaker::new();
        }
    }

    /// Drop entries whose last transition is older than the cutoff.
    pub fn sweep(&self, cutoff: Duration) {
        let mut breakers = self.breakers.lock();
        breakers.retain(|_, b| b.last_transition_at.elapsed() < cutoff);
    }

    pub fn snapshot(&self, name: &str) -> Option<BreakerSnapshot> {
        let breakers = self.breakers.lock();
        breakers.get(name).map(|b| BreakerSnapshot {
            state: match b.state {
                CircuitState::Closed => BreakerState::Closed,
                CircuitState::Open { .. } => BreakerState::Open,
                CircuitState::HalfOpen => BreakerState::HalfOpen,
            },
            failure_count: b.failure_count,
            success_count: b.success_count,
        })
    }

    pub fn snapshots(&self) -> HashMap<String, BreakerSnapshot> {
        let breakers = self.breakers.lock();
        breakers
            .iter()
            .map(|(name, b)| {
                (
                    name.clone(),
                    BreakerSnapshot {
                        state: match b.state {
                            CircuitState::Closed => BreakerState::Closed,
                            CircuitState::Open { .. } => BreakerState::Open,
                            CircuitState::HalfOpen => BreakerState::HalfOpen,
                        },
                        failure_count: b.failure_count,
                        success_count: b.success_count,
                    },
                )
            })
            .collect()
    }
}
