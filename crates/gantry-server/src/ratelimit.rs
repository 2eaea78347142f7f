//! Per-key rate limiting: two sliding windows (minute, hour) plus a
//! concurrent-request count.
//!
//! Check-and-increment happens under a single map-entry lock, so two racing
//! requests can never both pass on the last remaining slot.

use dashmap::DashMap;
use gantry_config::RateLimitSettings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

const MINUTE: u64 = 60;
const HOUR: u64 = 3600;
/// Entries idle longer than this are swept (2x the large window).
const RETENTION_SECS: u64 = 2 * HOUR;

/// A fully normalized rate-limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitPolicy {
    pub rpm: u32,
    pub rph: u32,
    pub concurrent: u32,
}

impl From<&RateLimitSettings> for RateLimitPolicy {
    fn from(s: &RateLimitSettings) -> Self {
        Self {
            rpm: s.rpm,
            rph: s.rph,
            concurrent: s.concurrent,
        }
    }
}

/// Policy as stored on a key: a bare integer rpm or a partial map, each
/// normalized against the configured defaults before use.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RateLimitSpec {
    Rpm(u32),
    Partial {
        #[serde(skip_serializing_if = "Option::is_none")]
        rpm: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rph: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        concurrent: Option<u32>,
    },
}

impl RateLimitSpec {
    /// Normalize: a bare rpm implies `rph = 60 * rpm` and the default
    /// concurrency; a partial map merges over the defaults.
    pub fn normalize(&self, defaults: &RateLimitSettings) -> RateLimitPolicy {
        match *self {
            Self::Rpm(rpm) => RateLimitPolicy {
                rpm,
                rph: rpm.saturating_mul(60),
                concurrent: defaults.concurrent,
            },
            Self::Partial { rpm, rph, concurrent } => RateLimitPolicy {
                rpm: rpm.unwrap_or(defaults.rpm),
                rph: rph.unwrap_or(defaults.rph),
                concurrent: concurrent.unwrap_or(defaults.concurrent),
            },
        }
    }
}

/// Why a check failed, plus everything the 429 response headers need.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRejection {
    pub reason: &'static str,
    pub limit: u32,
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowBucket {
    count: u32,
    window_start: u64,
}

impl WindowBucket {
    fn expired(&self, now: u64, size: u64) -> bool {
        now.saturating_sub(self.window_start) >= size
    }

    fn increment(&mut self, now: u64, size: u64) {
        if self.expired(now, size) {
            self.window_start = now;
            self.count = 1;
        } else {
            self.count += 1;
        }
    }

    fn used(&self, now: u64, size: u64) -> u32 {
        if self.expired(now, size) { 0 } else { self.count }
    }

    fn reset_at(&self, now: u64, size: u64) -> u64 {
        if self.expired(now, size) {
            now + size
        } else {
            self.window_start + size
        }
    }
}

#[derive(Debug, Default)]
struct KeyUsage {
    minute: WindowBucket,
    hour: WindowBucket,
    concurrent: u32,
    last_seen: u64,
}

/// Status report for one key, shaped for the `X-RateLimit-*` headers and
/// admin inspection.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub per_minute: WindowStatus,
    pub per_hour: WindowStatus,
    pub concurrent: ConcurrentStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowStatus {
    pub limit: u32,
    pub used: u32,
    pub reset_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConcurrentStatus {
    pub limit: u32,
    pub used: u32,
}

/// Shared per-key limiter state.
#[derive(Clone, Default)]
pub struct RateLimiter {
    usage: Arc<DashMap<String, KeyUsage>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Check both windows and the concurrent count; on success, take one
    /// unit from each window. The concurrent slot is NOT taken here — that
    /// happens in [`acquire_slot`](Self::acquire_slot) around the stream.
    pub fn check(&self, key: &str, policy: &RateLimitPolicy) -> Result<(), RateLimitRejection> {
        self.check_at(key, policy, Self::now())
    }

    fn check_at(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<(), RateLimitRejection> {
        let mut entry = self.usage.entry(key.to_string()).or_default();
        entry.last_seen = now;

        if !entry.minute.expired(now, MINUTE) && entry.minute.count >= policy.rpm {
            return Err(RateLimitRejection {
                reason: "minute_limit_exceeded",
                limit: policy.rpm,
                retry_after_secs: entry.minute.reset_at(now, MINUTE).saturating_sub(now).max(1),
            });
        }
        if !entry.hour.expired(now, HOUR) && entry.hour.count >= policy.rph {
            return Err(RateLimitRejection {
                reason: "hour_limit_exceeded",
                limit: policy.rph,
                retry_after_secs: entry.hour.reset_at(now, HOUR).saturating_sub(now).max(1),
            });
        }
        if entry.concurrent >= policy.concurrent {
            return Err(RateLimitRejection {
                reason: "concurrent_limit_exceeded",
                limit: policy.concurrent,
                retry_after_secs: 1,
            });
        }

        entry.minute.increment(now, MINUTE);
        entry.hour.increment(now, HOUR);
        Ok(())
    }

    /// Take a concurrent slot for the duration of a served request. The
    /// returned guard releases it exactly once, whatever the exit path.
    pub fn acquire_slot(&self, key: &str) -> SlotGuard {
        self.start_request(key);
        SlotGuard {
            limiter: self.clone(),
            key: key.to_string(),
        }
    }

    fn start_request(&self, key: &str) {
        let mut entry = self.usage.entry(key.to_string()).or_default();
        entry.concurrent += 1;
        entry.last_seen = Self::now();
    }

    fn finish_request(&self, key: &str) {
        if let Some(mut entry) = self.usage.get_mut(key) {
            if entry.concurrent == 0 {
                warn!(key_hint = key.len(), "concurrent count underflow prevented");
            }
            entry.concurrent = entry.concurrent.saturating_sub(1);
        }
    }

    /// Current usage for a key under the given policy.
    pub fn status(&self, key: &str, policy: &RateLimitPolicy) -> RateLimitStatus {
        let now = Self::now();
        let entry = self.usage.get(key);
        let (minute, hour, concurrent) = entry
            .map(|e| (e.minute, e.hour, e.concurrent))
            .unwrap_or_default();
        RateLimitStatus {
            per_minute: WindowStatus {
                limit: policy.rpm,
                used: minute.used(now, MINUTE),
                reset_at: minute.reset_at(now, MINUTE),
            },
            per_hour: WindowStatus {
                limit: policy.rph,
                used: hour.used(now, HOUR),
                reset_at: hour.reset_at(now, HOUR),
            },
            concurrent: ConcurrentStatus {
                limit: policy.concurrent,
                used: concurrent,
            },
        }
    }

    /// Sweep entries idle beyond the retention window. Call periodically
    /// from a background task.
    pub fn cleanup(&self) {
        let cutoff = Self::now().saturating_sub(RETENTION_SECS);
        self.usage
            .retain(|_key, usage| usage.last_seen >= cutoff || usage.concurrent > 0);
    }

    #[cfg(test)]
    fn entries(&self) -> usize {
        self.usage.len()
    }
}

/// RAII handle on a concurrent slot. Dropping it releases the slot; the
/// release happens exactly once on every exit path, including client
/// disconnect dropping the response stream.
pub struct SlotGuard {
    limiter: RateLimiter,
    key: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.limiter.finish_request(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(rpm: u32, rph: u32, concurrent: u32) -> RateLimitPolicy {
        RateLimitPolicy { rpm, rph, concurrent }
    }

    #[test]
    fn fourth_check_in_a_minute_is_rejected() {
        let limiter = RateLimiter::new();
        let policy = policy(3, 100, 2);
        let now = 1_000_000;

        assert!(limiter.check_at("key", &policy, now).is_ok());
        assert!(limiter.check_at("key", &policy, now).is_ok());
        assert!(limiter.check_at("key", &policy, now + 1).is_ok());
        let rejection = limiter.check_at("key", &policy, now + 1).unwrap_err();
        assert_eq!(rejection.reason, "minute_limit_exceeded");
        assert_eq!(rejection.limit, 3);
    }

    #[test]
    fn window_resets_after_expiry() {
        let limiter = RateLimiter::new();
        let policy = policy(2, 100, 2);
        let now = 1_000_000;

        assert!(limiter.check_at("key", &policy, now).is_ok());
        assert!(limiter.check_at("key", &policy, now).is_ok());
        assert!(limiter.check_at("key", &policy, now + 1).is_err());
        // One minute later the window is fresh.
        assert!(limiter.check_at("key", &policy, now + 60).is_ok());
    }

    #[test]
    fn hour_limit_outlives_minute_resets() {
        let limiter = RateLimiter::new();
        let policy = policy(100, 3, 2);
        let now = 1_000_000;

        assert!(limiter.check_at("key", &policy, now).is_ok());
        assert!(limiter.check_at("key", &policy, now + 61).is_ok());
        assert!(limiter.check_at("key", &policy, now + 122).is_ok());
        let rejection = limiter.check_at("key", &policy, now + 183).unwrap_err();
        assert_eq!(rejection.reason, "hour_limit_exceeded");
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        let policy = policy(1, 100, 2);
        let now = 1_000_000;

        assert!(limiter.check_at("a", &policy, now).is_ok());
        assert!(limiter.check_at("a", &policy, now).is_err());
        assert!(limiter.check_at("b", &policy, now).is_ok());
    }

    #[test]
    fn concurrent_limit_blocks_check() {
        let limiter = RateLimiter::new();
        let policy = policy(100, 1000, 2);

        let _a = limiter.acquire_slot("key");
        let _b = limiter.acquire_slot("key");
        let rejection = limiter.check("key", &policy).unwrap_err();
        assert_eq!(rejection.reason, "concurrent_limit_exceeded");
    }

    #[test]
    fn slot_guard_releases_on_drop() {
        let limiter = RateLimiter::new();
        let policy = policy(100, 1000, 1);

        {
            let _guard = limiter.acquire_slot("key");
            assert!(limiter.check("key", &policy).is_err());
        }
        // Guard dropped — slot free again.
        assert!(limiter.check("key", &policy).is_ok());
        assert_eq!(limiter.status("key", &policy).concurrent.used, 0);
    }

    #[test]
    fn release_is_idempotent_under_underflow() {
        let limiter = RateLimiter::new();
        let guard = limiter.acquire_slot("key");
        drop(guard);
        // A stray second release must not wrap below zero.
        limiter.finish_request("key");
        assert_eq!(
            limiter.status("key", &policy(10, 100, 5)).concurrent.used,
            0
        );
    }

    #[test]
    fn status_reports_windows() {
        let limiter = RateLimiter::new();
        let p = policy(10, 100, 5);
        limiter.check("key", &p).unwrap();
        let status = limiter.status("key", &p);
        assert_eq!(status.per_minute.used, 1);
        assert_eq!(status.per_minute.limit, 10);
        assert_eq!(status.per_hour.used, 1);
        assert!(status.per_minute.reset_at > 0);
    }

    #[test]
    fn cleanup_keeps_active_keys() {
        let limiter = RateLimiter::new();
        let p = policy(10, 100, 5);
        limiter.check("key", &p).unwrap();
        limiter.cleanup();
        // Recently seen — survives the sweep.
        assert_eq!(limiter.entries(), 1);
    }

    #[test]
    fn bare_rpm_normalizes_to_full_policy() {
        let defaults = RateLimitSettings::default();
        let policy = RateLimitSpec::Rpm(5).normalize(&defaults);
        assert_eq!(policy.rpm, 5);
        assert_eq!(policy.rph, 300);
        assert_eq!(policy.concurrent, defaults.concurrent);
    }

    #[test]
    fn partial_spec_merges_with_defaults() {
        let defaults = RateLimitSettings::default();
        let policy = RateLimitSpec::Partial {
            rpm: Some(7),
            rph: None,
            concurrent: Some(2),
        }
        .normalize(&defaults);
        assert_eq!(policy.rpm, 7);
        assert_eq!(policy.rph, defaults.rph);
        assert_eq!(policy.concurrent, 2);
    }

    #[test]
    fn spec_deserializes_from_int_or_map() {
        let from_int: RateLimitSpec = serde_json::from_str("5").unwrap();
        assert!(matches!(from_int, RateLimitSpec::Rpm(5)));
        let from_map: RateLimitSpec = serde_json::from_str(r#"{"rpm": 9}"#).unwrap();
        let policy = from_map.normalize(&RateLimitSettings::default());
        assert_eq!(policy.rpm, 9);
    }
}
