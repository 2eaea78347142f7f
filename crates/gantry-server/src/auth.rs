//! API-key authentication: header extraction, key format validation, the
//! key store, and the axum middleware.
//!
//! Keys never reach telemetry or logs unmasked — only the
//! `prefix7…suffix4` form from [`gantry_core::mask_key`].

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gantry_config::RateLimitSettings;
use gantry_core::{ErrorEnvelope, GatewayError, mask_key};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::ratelimit::{RateLimitPolicy, RateLimitSpec};

/// Paths served without authentication.
const AUTH_EXEMPT: &[&str] = &["/health", "/health/live", "/health/ready"];

/// Metadata for one issued API key. The raw key string is only ever used
/// as the store's lookup index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyInfo {
    pub id: String,
    pub name: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            active: true,
            rate_limit: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_rate_limit(mut self, spec: RateLimitSpec) -> Self {
        self.rate_limit = Some(spec);
        self
    }
}

/// In-memory key store. When empty, any well-formed key is admitted with
/// the default rate-limit policy (single-tenant deployments that front the
/// gateway with their own auth).
#[derive(Clone, Default)]
pub struct ApiKeyStore {
    keys: Arc<DashMap<String, ApiKeyInfo>>,
}

impl ApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, info: ApiKeyInfo) {
        self.keys.insert(key.into(), info);
    }

    pub fn lookup(&self, key: &str) -> Option<ApiKeyInfo> {
        self.keys.get(key).map(|e| e.clone())
    }

    pub fn deactivate(&self, key: &str) -> bool {
        match self.keys.get_mut(key) {
            Some(mut entry) => {
                entry.active = false;
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

/// The authenticated identity attached to a request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Stable key id used by the rate limiter.
    pub key_id: String,
    /// Masked form for telemetry and logs.
    pub masked: String,
    pub policy: RateLimitPolicy,
}

/// Pull the key out of the Authorization header. Accepts `Bearer <key>`,
/// `bearer <key>`, or the raw key.
pub fn extract_key(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?.trim();
    let key = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value);
    if key.is_empty() { None } else { Some(key.to_string()) }
}

/// Key format: `sk-` followed by `[A-Za-z0-9_-]`, total length 10–200.
pub fn valid_key_format(key: &str) -> bool {
    if !(10..=200).contains(&key.len()) {
        return false;
    }
    let Some(rest) = key.strip_prefix("sk-") else {
        return false;
    };
    rest.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Resolve a key string to an [`AuthContext`] against the store.
pub fn authenticate(
    store: &ApiKeyStore,
    defaults: &RateLimitSettings,
    key: &str,
) -> Result<AuthContext, GatewayError> {
    if !valid_key_format(key) {
        return Err(GatewayError::Authentication("malformed API key".into()));
    }
    let masked = mask_key(key);

    if store.is_empty() {
        return Ok(AuthContext {
            key_id: masked.clone(),
            masked,
            policy: RateLimitPolicy::from(defaults),
        });
    }

    let info = store
        .lookup(key)
        .ok_or_else(|| GatewayError::Authentication("unknown API key".into()))?;
    if !info.active {
        return Err(GatewayError::Authentication("API key is disabled".into()));
    }
    let policy = info
        .rate_limit
        .as_ref()
        .map(|spec| spec.normalize(defaults))
        .unwrap_or_else(|| RateLimitPolicy::from(defaults));
    Ok(AuthContext {
        key_id: info.id,
        masked,
        policy,
    })
}

/// Axum middleware enforcing authentication on everything except the
/// health endpoints. On success the [`AuthContext`] lands in the request
/// extensions.
pub async fn auth_middleware(
    axum::extract::Extension(store): axum::extract::Extension<ApiKeyStore>,
    axum::extract::Extension(defaults): axum::extract::Extension<RateLimitSettings>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if AUTH_EXEMPT.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let Some(key) = extract_key(request.headers()) else {
        return unauthorized("missing Authorization header");
    };

    match authenticate(&store, &defaults, &key) {
        Ok(ctx) => {
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(e) => {
            warn!(key = %mask_key(&key), error = %e, "request rejected");
            unauthorized(&e.to_string())
        }
    }
}

fn unauthorized(message: &str) -> Response {
    let envelope = ErrorEnvelope::new(&GatewayError::Authentication(message.to_string()), None);
    (StatusCode::UNAUTHORIZED, axum::Json(envelope)).into_response()
}
