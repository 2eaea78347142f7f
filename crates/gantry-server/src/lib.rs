//! # gantry-server
//!
//! The OpenAI-compatible HTTP surface of the gateway:
//!
//! - `POST /v1/chat/completions` — streaming (SSE) and non-streaming
//! - `POST /v1/completions` — legacy, converted to chat internally
//! - `GET /v1/models`, `GET /v1/models/{id}`
//! - `POST /v1/embeddings`
//! - `GET /health`, `/health/live`, `/health/ready` (auth-bypassed), `GET /metrics`

pub mod auth;
pub mod metrics;
pub mod queue;
pub mod ratelimit;
pub mod relay;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use gantry_config::{AliasStore, GantryConfig, split_spec};
use gantry_core::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, CompletionRequest, EmbeddingRequest,
    ErrorEnvelope, GatewayError, ModelList, ModelObject, PromptInput, TelemetryBus, UsageReport,
    new_request_id,
};
use gantry_llm::provider::ProviderRequest;
use gantry_llm::{
    CostTable, EmbeddingProvider, MockEmbedding, OpenAiEmbedding, ProviderRegistry, tokens,
    transform,
};
use gantry_routing::{
    BreakerConfig, CircuitBreakerRegistry, FailoverManager, RouteQuery, Router as RequestRouter,
    StatsBook,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::auth::{ApiKeyStore, AuthContext};
use crate::metrics::Metrics;
use crate::queue::OverflowQueue;
use crate::ratelimit::{RateLimitRejection, RateLimiter};

/// Shared server state. All mutable pieces sit behind their own
/// serialization boundary; handlers only read.
pub struct AppState {
    pub config: GantryConfig,
    pub registry: ProviderRegistry,
    pub router: RequestRouter,
    pub failover: Arc<FailoverManager>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub stats: Arc<StatsBook>,
    pub limiter: RateLimiter,
    pub keys: ApiKeyStore,
    pub aliases: Arc<AliasStore>,
    pub cost: CostTable,
    pub telemetry: TelemetryBus,
    pub metrics: Metrics,
    pub queue: Option<OverflowQueue>,
}

impl AppState {
    pub fn build(config: GantryConfig, registry: ProviderRegistry) -> Arc<Self> {
        Self::build_full(config, registry, None)
    }

    pub fn build_full(
        config: GantryConfig,
        registry: ProviderRegistry,
        queue: Option<OverflowQueue>,
    ) -> Arc<Self> {
        let telemetry = TelemetryBus::default();
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::from(
            &config.circuit_breaker,
        )));
        let stats = Arc::new(StatsBook::new());
        let cost = CostTable::with_overrides(&config.providers);
        let failover = Arc::new(FailoverManager::from_config(
            &config,
            &registry.names(),
            &cost,
            Arc::clone(&breakers),
            Arc::clone(&stats),
        ));
        let router = RequestRouter::new(
            &config,
            registry.clone(),
            Arc::clone(&breakers),
            Arc::clone(&stats),
            cost.clone(),
            telemetry.clone(),
        );
        let aliases = Arc::new(match config.aliases_path {
            Some(ref path) => AliasStore::open(path),
            None => AliasStore::empty(),
        });

        Arc::new(Self {
            config,
            registry,
            router,
            failover,
            breakers,
            stats,
            limiter: RateLimiter::new(),
            keys: ApiKeyStore::new(),
            aliases,
            cost,
            telemetry,
            metrics: Metrics::new(),
            queue,
        })
    }
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/completions", post(completions_handler))
        .route("/v1/models", get(models_handler))
        .route("/v1/models/{id}", get(model_get_handler))
        .route("/v1/embeddings", post(embeddings_handler))
        // Layers run outermost-first: the Extensions must wrap the auth
        // middleware so it finds the store in the request extensions.
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(axum::Extension(state.keys.clone()))
        .layer(axum::Extension(state.config.rate_limit));

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(live_handler))
        .route("/health/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .merge(api_routes)
        .with_state(Arc::clone(&state));

    if state.config.server.cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
}

/// Router serving only the health routes, for the optional second listener.
fn health_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(live_handler))
        .route("/health/ready", get(ready_handler))
        .with_state(state)
}

// ── Model / alias resolution ───────────────────────────────────

/// Resolve the request's logical model through the alias store and the
/// `provider:model` spec syntax into router inputs.
fn resolve_target(
    state: &AppState,
    provider_field: Option<&str>,
    model_field: Option<&str>,
) -> (Option<String>, Option<String>) {
    let mut provider = provider_field.map(str::to_string);
    let mut model = model_field.map(str::to_string);

    if let Some(ref m) = model.clone() {
        let spec = state.aliases.resolve(m).unwrap_or_else(|| m.clone());
        if let Some((p, concrete)) = split_spec(&spec) {
            if provider.is_none() {
                provider = Some(p.to_string());
            }
            model = Some(concrete.to_string());
        } else {
            model = Some(spec);
        }
    }

    (provider, model)
}

// ── Chat completions ───────────────────────────────────────────

async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    axum::Extension(ctx): axum::Extension<AuthContext>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    state.metrics.inc_http_requests();
    let request_id = new_request_id();

    if request.messages.is_empty() {
        return error_response(
            &state,
            GatewayError::Validation("messages must not be empty".into()),
            &request_id,
        );
    }

    if let Err(rejection) = state.limiter.check(&ctx.key_id, &ctx.policy) {
        return rate_limited_response(&state, &ctx, &request_id, rejection, Some(&request));
    }

    let (provider, model) =
        resolve_target(&state, request.provider.as_deref(), request.model.as_deref());
    let query = RouteQuery {
        provider,
        model,
        request_id: request_id.clone(),
        requirements: None,
    };
    let decision = match state.router.route(&query) {
        Ok(decision) => decision,
        Err(e) => return error_response(&state, e, &request_id),
    };

    let slot = state.limiter.acquire_slot(&ctx.key_id);

    if request.stream {
        state.metrics.inc_chat_streams();
        return relay::handle_stream(state, request, decision, request_id, slot);
    }

    state.metrics.inc_chat_completions();
    let result = complete_chat(&state, &request, &decision, &request_id).await;
    drop(slot);
    match result {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&state, e, &request_id),
    }
}

/// Non-streaming completion through the same resilience stack as the relay.
async fn complete_chat(
    state: &AppState,
    request: &ChatCompletionRequest,
    decision: &gantry_routing::RouteDecision,
    request_id: &str,
) -> gantry_core::Result<ChatCompletionResponse> {
    let registry = state.registry.clone();
    let chat_request = request.clone();
    let route_provider = decision.provider.clone();
    let route_model = decision.model.clone();

    let deadline = state.config.server.request_timeout_secs;
    let call = state
        .failover
        .with_failover_from(Some(&decision.provider), move |name| {
            let registry = registry.clone();
            let chat_request = chat_request.clone();
            let route_provider = route_provider.clone();
            let route_model = route_model.clone();
            async move {
                let provider = registry.expect(&name)?;
                let model = if name == route_provider || provider.supports(&route_model) {
                    route_model
                } else {
                    provider.default_model()
                };
                provider
                    .complete(&ProviderRequest::from_chat(&chat_request, model))
                    .await
            }
        });
    let provider_response = if deadline > 0 {
        match tokio::time::timeout(Duration::from_secs(deadline), call).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GatewayError::Timeout("request deadline exceeded".into()));
            }
        }
    } else {
        call.await?
    };

    let prompt = if provider_response.prompt_tokens > 0 {
        provider_response.prompt_tokens
    } else {
        tokens::estimate_prompt_tokens(&request.messages, &decision.model)
    };
    let completion = if provider_response.completion_tokens > 0 {
        provider_response.completion_tokens
    } else {
        tokens::estimate_text_tokens(&provider_response.text, &decision.model)
    };
    let usage = UsageReport::new(prompt, completion)
        .with_request_id(request_id)
        .with_cost(state.cost.estimate_cost(
            &decision.provider,
            &decision.model,
            &UsageReport::new(prompt, completion),
        ));
    state
        .metrics
        .record_usage(usage.prompt_tokens, usage.completion_tokens, usage.estimated_cost);

    let finish_reason = transform::unify_finish_reason(provider_response.finish_reason.as_deref())
        .unwrap_or_else(|| "stop".into());
    let mut response = ChatCompletionResponse::assistant(
        &format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        &decision.model,
        provider_response.text,
        &finish_reason,
        usage,
    );
    if !provider_response.tool_calls.is_empty() {
        response.choices[0].message.tool_calls = Some(provider_response.tool_calls);
    }
    Ok(response)
}

// ── Legacy completions ─────────────────────────────────────────

async fn completions_handler(
    State(state): State<Arc<AppState>>,
    axum::Extension(ctx): axum::Extension<AuthContext>,
    Json(request): Json<CompletionRequest>,
) -> Response {
    state.metrics.inc_http_requests();
    let request_id = new_request_id();

    // Converted to the chat shape internally.
    let chat_request = ChatCompletionRequest {
        model: request.model.clone(),
        messages: vec![ChatMessage::new("user", request.prompt.first())],
        temperature: request.temperature,
        top_p: None,
        max_tokens: request.max_tokens,
        stream: request.stream,
        stop: None,
        tools: None,
        user: request.user.clone(),
        provider: None,
    };

    if let Err(rejection) = state.limiter.check(&ctx.key_id, &ctx.policy) {
        return rate_limited_response(&state, &ctx, &request_id, rejection, Some(&chat_request));
    }

    let (provider, model) = resolve_target(&state, None, chat_request.model.as_deref());
    let query = RouteQuery {
        provider,
        model,
        request_id: request_id.clone(),
        requirements: None,
    };
    let decision = match state.router.route(&query) {
        Ok(decision) => decision,
        Err(e) => return error_response(&state, e, &request_id),
    };

    let slot = state.limiter.acquire_slot(&ctx.key_id);

    if chat_request.stream {
        state.metrics.inc_chat_streams();
        return relay::handle_stream(state, chat_request, decision, request_id, slot);
    }

    state.metrics.inc_chat_completions();
    let result = complete_chat(&state, &chat_request, &decision, &request_id).await;
    drop(slot);
    match result {
        Ok(chat) => {
            let text = chat.choices[0].message.content.clone().unwrap_or_default();
            let body = serde_json::json!({
                "id": chat.id.replace("chatcmpl-", "cmpl-"),
                "object": "text_completion",
                "created": chat.created,
                "model": chat.model,
                "choices": [{
                    "text": text,
                    "index": 0,
                    "logprobs": null,
                    "finish_reason": chat.choices[0].finish_reason,
                }],
                "usage": chat.usage,
            });
            Json(body).into_response()
        }
        Err(e) => error_response(&state, e, &request_id),
    }
}

// ── Models ─────────────────────────────────────────────────────

fn model_objects(state: &AppState) -> Vec<ModelObject> {
    let created = Utc::now().timestamp();
    let mut models = Vec::new();
    for provider in state.registry.iter() {
        for model in provider.models() {
            let meta = state.cost.meta_for(provider.name(), &model);
            models.push(ModelObject {
                id: model.clone(),
                object: "model".into(),
                created,
                owned_by: provider.name().to_string(),
                capabilities: meta
                    .map(|m| m.capabilities.iter().map(|c| c.to_string()).collect())
                    .unwrap_or_else(|| vec!["chat".into(), "streaming".into()]),
                max_tokens: meta.map(|m| m.max_tokens),
            });
        }
    }
    models
}

async fn models_handler(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    state.metrics.inc_http_requests();
    Json(ModelList {
        object: "list".into(),
        data: model_objects(&state),
    })
}

async fn model_get_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    state.metrics.inc_http_requests();
    match model_objects(&state).into_iter().find(|m| m.id == id) {
        Some(model) => Json(model).into_response(),
        None => error_response(
            &state,
            GatewayError::NotFound(format!("model {id} not found")),
            &new_request_id(),
        ),
    }
}

// ── Embeddings ─────────────────────────────────────────────────

async fn embeddings_handler(
    State(state): State<Arc<AppState>>,
    axum::Extension(ctx): axum::Extension<AuthContext>,
    Json(request): Json<EmbeddingRequest>,
) -> Response {
    state.metrics.inc_http_requests();
    state.metrics.inc_embeddings();
    let request_id = new_request_id();

    if let Err(rejection) = state.limiter.check(&ctx.key_id, &ctx.policy) {
        return rate_limited_response(&state, &ctx, &request_id, rejection, None);
    }

    let texts: Vec<String> = match request.input {
        PromptInput::Text(ref s) => vec![s.clone()],
        PromptInput::Batch(ref v) => v.clone(),
    };
    if texts.is_empty() {
        return error_response(
            &state,
            GatewayError::Validation("input must not be empty".into()),
            &request_id,
        );
    }

    // Real upstream only when an OpenAI key is configured; otherwise the
    // deterministic mock embedder serves the request.
    let openai_key = state
        .config
        .providers
        .get("openai")
        .and_then(|p| p.api_key.clone());
    let embedder: Box<dyn EmbeddingProvider> = match openai_key {
        Some(key) => {
            let mut provider = OpenAiEmbedding::new(key);
            if let Some(url) = state
                .config
                .providers
                .get("openai")
                .and_then(|p| p.base_url.clone())
            {
                provider = provider.with_base_url(url);
            }
            if let Some(ref model) = request.model
                && model.contains("large")
            {
                provider = provider.with_model(model.clone(), 3072);
            }
            Box::new(provider)
        }
        None => Box::new(MockEmbedding::new()),
    };

    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    match embedder.embed(&refs).await {
        Ok(vectors) => {
            let prompt_tokens: u32 = texts
                .iter()
                .map(|t| tokens::estimate_text_tokens(t, "default"))
                .sum();
            let data: Vec<serde_json::Value> = vectors
                .into_iter()
                .enumerate()
                .map(|(index, embedding)| {
                    serde_json::json!({
                        "object": "embedding",
                        "index": index,
                        "embedding": embedding,
                    })
                })
                .collect();
            let body = serde_json::json!({
                "object": "list",
                "data": data,
                "model": request.model.clone().unwrap_or_else(|| "text-embedding-3-small".into()),
                "usage": {
                    "prompt_tokens": prompt_tokens,
                    "total_tokens": prompt_tokens,
                },
            });
            Json(body).into_response()
        }
        Err(e) => error_response(&state, e, &request_id),
    }
}

// ── Health & metrics ───────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let queue_depth = state.queue.as_ref().and_then(|q| q.depth().ok());
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.metrics.uptime_secs(),
        "mock_mode": state.registry.is_mock_mode(),
        "providers": state.registry.names(),
        "circuit_breakers": state.breakers.snapshots(),
        "queue_depth": queue_depth,
    }))
}

async fn live_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> Response {
    if state.registry.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "no providers registered" })),
        )
            .into_response();
    }
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

// ── Error rendering ────────────────────────────────────────────

fn error_response(state: &AppState, err: GatewayError, request_id: &str) -> Response {
    state.metrics.inc_http_errors();
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let envelope = ErrorEnvelope::new(&err, Some(request_id.to_string()));
    (status, Json(envelope)).into_response()
}

fn rate_limited_response(
    state: &AppState,
    ctx: &AuthContext,
    request_id: &str,
    rejection: RateLimitRejection,
    request: Option<&ChatCompletionRequest>,
) -> Response {
    state.metrics.inc_rate_limit_rejections();
    state.metrics.inc_http_errors();
    warn!(key = %ctx.masked, reason = rejection.reason, "rate limited");

    // Overflow: persist the rejected request for the drainer.
    let job_id = request.and_then(|r| {
        state.queue.as_ref().and_then(|q| match q.enqueue(request_id, r) {
            Ok(job_id) => {
                state.metrics.inc_queue_jobs();
                Some(job_id)
            }
            Err(e) => {
                warn!(error = %e, "overflow enqueue failed");
                None
            }
        })
    });

    let err = GatewayError::RateLimited {
        reason: rejection.reason.to_string(),
        retry_after_secs: rejection.retry_after_secs,
    };
    let envelope = ErrorEnvelope::new(&err, Some(request_id.to_string())).with_details(
        serde_json::json!({
            "reason": rejection.reason,
            "limit": rejection.limit,
            "job_id": job_id,
        }),
    );

    let status = state.limiter.status(&ctx.key_id, &ctx.policy);
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(envelope)).into_response();
    let headers = response.headers_mut();
    let mut put = |name: &'static str, value: String| {
        if let Ok(value) = value.parse() {
            headers.insert(name, value);
        }
    };
    put("retry-after", rejection.retry_after_secs.to_string());
    put("x-ratelimit-limit", rejection.limit.to_string());
    put(
        "x-ratelimit-remaining",
        status
            .per_minute
            .limit
            .saturating_sub(status.per_minute.used)
            .to_string(),
    );
    put("x-ratelimit-reset", status.per_minute.reset_at.to_string());
    response
}

// ── Overflow drain ─────────────────────────────────────────────

/// Replay queued jobs through the normal router + resilience stack,
/// awaiting stream completion (the non-streaming path) per job.
pub fn spawn_queue_drainer(state: Arc<AppState>) {
    if state.queue.is_none() {
        return;
    }
    let interval = Duration::from_secs(state.config.queue.drain_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(ref queue) = state.queue else { return };
            let jobs = match queue.next_batch(10) {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(error = %e, "queue drain failed");
                    continue;
                }
            };
            for job in jobs {
                let (provider, model) = resolve_target(
                    &state,
                    job.request.provider.as_deref(),
                    job.request.model.as_deref(),
                );
                let query = RouteQuery {
                    provider,
                    model,
                    request_id: job.request_id.clone(),
                    requirements: None,
                };
                let outcome = match state.router.route(&query) {
                    Ok(decision) => {
                        complete_chat(&state, &job.request, &decision, &job.request_id).await.map(|_| ())
                    }
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(()) => {
                        info!(job_id = %job.job_id, "queued request replayed");
                        let _ = queue.mark_done(&job.job_id);
                    }
                    Err(e) => {
                        warn!(job_id = %job.job_id, error = %e, "queued replay failed");
                        let _ = queue.record_failure(&job.job_id);
                    }
                }
            }
        }
    });
}

// ── Server startup ─────────────────────────────────────────────

/// Start the gateway: main listener, optional health listener, background
/// sweepers, and the overflow drainer.
pub async fn serve(config: GantryConfig) -> gantry_core::Result<()> {
    let registry = ProviderRegistry::from_config(&config);
    let queue = match OverflowQueue::open(&config.queue.path, config.queue.clone()) {
        Ok(queue) => Some(queue),
        Err(e) => {
            warn!(error = %e, "overflow queue disabled");
            None
        }
    };
    let state = AppState::build_full(config, registry, queue);
    state.telemetry.spawn_log_observer();

    // Keep the alias watcher alive for the life of the server.
    let _alias_watcher = match state.aliases.watch() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            info!(reason = %e, "alias hot reload inactive");
            None
        }
    };

    // Periodic sweeps: stale rate-limit entries and expired breakers.
    tokio::spawn({
        let state = Arc::clone(&state);
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(300)).await;
                state.limiter.cleanup();
                state.breakers.sweep(Duration::from_secs(24 * 3600));
            }
        }
    });

    spawn_queue_drainer(Arc::clone(&state));

    if let Some(health_port) = state.config.server.health_port {
        let addr = format!("{}:{}", state.config.server.host, health_port);
        let router = health_router(Arc::clone(&state));
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!(listen = %addr, "health listener started");
                    if let Err(e) = axum::serve(listener, router).await {
                        warn!(error = %e, "health listener stopped");
                    }
                }
                Err(e) => warn!(error = %e, listen = %addr, "health listener failed to bind"),
            }
        });
    }

    let listen = state.config.server.listen_addr();
    let router = build_router(Arc::clone(&state));

    info!(listen = %listen, mock_mode = state.registry.is_mock_mode(), "starting gateway");

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|e| GatewayError::Config(format!("failed to bind {listen}: {e}")))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| GatewayError::Config(format!("server error: {e}")))?;

    Ok(())
}
