use gantry_config::RetrySettings;
use gantry_core::{GatewayError, Result};
use rand::RngExt;
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff with jitter over a configured set of retryable
/// error codes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    factor: f64,
    jitter: bool,
    retryable: HashSet<String>,
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            factor: s.backoff_factor,
            jitter: s.jitter,
            retryable: s.retryable_errors.iter().cloned().collect(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// A policy that never retries (single attempt).
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn should_retry(&self, err: &GatewayError) -> bool {
        // The breaker short-circuits before us; never hammer an open circuit.
        if matches!(err, GatewayError::CircuitOpen { .. }) {
            return false;
        }
        err.is_retryable() && self.retryable.contains(err.code())
    }

    /// Backoff before attempt `n + 1` (n is 1-based): capped exponential,
    /// optionally jittered ±25%.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * self.factor.powi(attempt as i32 - 1);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jittered = if self.jitter {
            capped * rand::rng().random_range(0.75..=1.25)
        } else {
            capped
        };
        Duration::from_millis(jittered as u64)
    }

    /// Run `op` with retries. The closure receives the 1-based attempt
    /// number; the final outcome carries the last error.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(&e) && attempt < self.max_attempts => {
                    // An upstream Retry-After hint overrides the backoff curve.
                    let delay = e
                        .retry_after_hint()
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| self.delay_for(attempt));
                    warn!(
                        attempt,
                        max = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from(&RetrySettings {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            backoff_factor: 2.0,
            jitter: false,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let policy = fast_policy(3);
        let calls = Arc::new(AtomicU32::new(0));
        let result = policy
            .run(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(GatewayError::Timeout("slow".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let policy = fast_policy(2);
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = policy
            .run(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::Overloaded("busy".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let policy = fast_policy(5);
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = policy
            .run(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::Validation("bad".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuit_open_is_never_retried() {
        let policy = fast_policy(5);
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = policy
            .run(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::CircuitOpen {
                        provider: "openai".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn configured_set_gates_retry() {
        // rate_limit removed from the retryable set.
        let policy = RetryPolicy::from(&RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            jitter: false,
            retryable_errors: vec!["timeout".into()],
            ..Default::default()
        });
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = policy
            .run(|_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::RateLimited {
                        reason: "upstream".into(),
                        retry_after_secs: 0,
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::from(&RetrySettings {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 400,
            backoff_factor: 2.0,
            jitter: false,
            ..Default::default()
        });
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(6), Duration::from_millis(400));
    }
}
