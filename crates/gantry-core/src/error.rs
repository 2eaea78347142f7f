use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the entire gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    // ── Client errors ──────────────────────────────────────────
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {reason}")]
    RateLimited { reason: String, retry_after_secs: u64 },

    // ── Upstream / transport errors ────────────────────────────
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("provider overloaded: {0}")]
    Overloaded(String),

    #[error("upstream HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("provider error: {0}")]
    Provider(String),

    // ── Resilience layer ───────────────────────────────────────
    #[error("circuit open for provider {provider}")]
    CircuitOpen { provider: String },

    // ── Infrastructure ─────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("queue error: {0}")]
    Queue(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Classify an upstream HTTP status into the matching error kind.
    pub fn from_upstream_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => Self::Validation(message),
            401 => Self::Authentication(message),
            403 => Self::Permission(message),
            404 => Self::NotFound(message),
            408 | 504 => Self::Timeout(message),
            429 => Self::RateLimited {
                reason: message,
                retry_after_secs: 30,
            },
            503 | 529 => Self::Overloaded(message),
            _ => Self::Upstream { status, message },
        }
    }

    /// Map a provider-reported error type string ("rate_limit", "auth_failed", ...)
    /// into the matching kind. Unknown types become a generic provider error.
    pub fn from_provider_type(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "rate_limit" | "rate_limit_error" => Self::RateLimited {
                reason: message,
                retry_after_secs: 30,
            },
            "invalid_request" | "invalid_request_error" => Self::Validation(message),
            "auth_failed" | "authentication_error" => Self::Authentication(message),
            "permission_denied" | "permission_error" => Self::Permission(message),
            "not_found" | "not_found_error" => Self::NotFound(message),
            "timeout" | "timeout_error" => Self::Timeout(message),
            "server_error" | "api_error" | "internal_server_error" => Self::Upstream {
                status: 500,
                message,
            },
            "overloaded" | "overloaded_error" => Self::Overloaded(message),
            _ => Self::Provider(message),
        }
    }

    /// Stable machine-readable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request",
            Self::Authentication(_) => "invalid_api_key",
            Self::Permission(_) => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::RateLimited { .. } => "rate_limit",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "connection_error",
            Self::Overloaded(_) => "overloaded",
            Self::Upstream { status, .. } if *status >= 500 => "server_error",
            Self::Upstream { .. } => "upstream_error",
            Self::Provider(_) => "provider_error",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Config(_) => "config_error",
            Self::Queue(_) => "queue_error",
            Self::Io(_) | Self::Serialization(_) | Self::Other(_) => "unknown_error",
        }
    }

    /// OpenAI-style error type for the HTTP envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request_error",
            Self::Authentication(_) => "authentication_error",
            Self::Permission(_) => "permission_error",
            Self::NotFound(_) => "not_found_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::Timeout(_) | Self::Network(_) => "connection_error",
            _ => "api_error",
        }
    }

    /// HTTP status for responses rendered from this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Authentication(_) => 401,
            Self::Permission(_) => 403,
            Self::NotFound(_) => 404,
            Self::RateLimited { .. } => 429,
            Self::Timeout(_) => 504,
            Self::Network(_) => 503,
            Self::Overloaded(_) => 503,
            Self::Upstream { status, .. } => *status,
            // Circuit-open is only surfaced past the failover layer when no
            // provider succeeded, at which point the gateway is unavailable.
            Self::CircuitOpen { .. } => 503,
            _ => 500,
        }
    }

    /// Whether the retry / failover layers may attempt this again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::Timeout(_)
            | Self::Network(_)
            | Self::Overloaded(_) => true,
            Self::Upstream { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// Retry-After hint in seconds, when the error carries one.
    pub fn retry_after_hint(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// The unified error envelope rendered on every non-2xx response and
/// in-stream error event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub param: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub retryable: bool,
    pub status: u16,
}

impl ErrorEnvelope {
    pub fn new(err: &GatewayError, request_id: Option<String>) -> Self {
        let provider = match err {
            GatewayError::CircuitOpen { provider } => Some(provider.clone()),
            _ => None,
        };
        Self {
            error: ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
                error_type: err.error_type().to_string(),
                param: None,
                provider,
                details: None,
                retryable: err.is_retryable(),
                status: err.status(),
            },
            request_id,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    /// Normalize an arbitrary JSON error value. An already-normalized
    /// envelope passes through unchanged, which makes this idempotent.
    pub fn from_json(value: &serde_json::Value, request_id: Option<String>) -> Self {
        if let Ok(envelope) = serde_json::from_value::<ErrorEnvelope>(value.clone()) {
            return envelope;
        }
        let message = value["error"]["message"]
            .as_str()
            .or_else(|| value["message"].as_str())
            .unwrap_or("unknown error")
            .to_string();
        let kind = value["error"]["type"]
            .as_str()
            .or_else(|| value["type"].as_str())
            .unwrap_or("unknown");
        Self::new(&GatewayError::from_provider_type(kind, message), request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_classification() {
        assert!(GatewayError::from_upstream_status(429, "slow down").is_retryable());
        assert!(GatewayError::from_upstream_status(500, "boom").is_retryable());
        assert!(GatewayError::from_upstream_status(502, "bad gateway").is_retryable());
        assert!(GatewayError::from_upstream_status(503, "busy").is_retryable());
        assert!(GatewayError::from_upstream_status(504, "late").is_retryable());
        assert!(!GatewayError::from_upstream_status(400, "bad").is_retryable());
        assert!(!GatewayError::from_upstream_status(401, "nope").is_retryable());
    }

    #[test]
    fn status_derived_from_kind() {
        assert_eq!(GatewayError::from_provider_type("rate_limit", "x").status(), 429);
        assert_eq!(GatewayError::from_provider_type("auth_failed", "x").status(), 401);
        assert_eq!(
            GatewayError::from_provider_type("permission_denied", "x").status(),
            403
        );
        assert_eq!(GatewayError::from_provider_type("not_found", "x").status(), 404);
        assert_eq!(GatewayError::from_provider_type("timeout", "x").status(), 504);
        assert_eq!(GatewayError::from_provider_type("server_error", "x").status(), 500);
        assert_eq!(GatewayError::from_provider_type("overloaded", "x").status(), 503);
    }

    #[test]
    fn unknown_provider_type_is_non_retryable_500() {
        let err = GatewayError::from_provider_type("weird_thing", "??");
        assert!(!err.is_retryable());
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn circuit_open_is_not_retryable() {
        let err = GatewayError::CircuitOpen {
            provider: "openai".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.status(), 503);
    }

    #[test]
    fn invalid_key_has_stable_code() {
        let err = GatewayError::Authentication("bad key".into());
        assert_eq!(err.code(), "invalid_api_key");
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn envelope_normalization_is_idempotent() {
        let err = GatewayError::RateLimited {
            reason: "minute_limit_exceeded".into(),
            retry_after_secs: 12,
        };
        let envelope = ErrorEnvelope::new(&err, Some("req_1".into()));
        let value = serde_json::to_value(&envelope).unwrap();
        let again = ErrorEnvelope::from_json(&value, None);
        assert_eq!(envelope, again);
    }

    #[test]
    fn envelope_from_provider_shape() {
        let raw = serde_json::json!({
            "error": { "type": "overloaded_error", "message": "try later" }
        });
        let envelope = ErrorEnvelope::from_json(&raw, Some("req_2".into()));
        assert_eq!(envelope.error.code, "overloaded");
        assert_eq!(envelope.error.status, 503);
        assert!(envelope.error.retryable);
        assert_eq!(envelope.request_id.as_deref(), Some("req_2"));
    }
}
