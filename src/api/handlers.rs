//! HTTP request handlers and router assembly for the gateway API.
//!
//! All caller-facing functionality goes through `POST /api/v1` (dispatched
//! on the body's `action` field) and `GET /api/v1?action=...`. Every
//! handler, including every failure path, renders the same response
//! envelope; extractor rejections are mapped into it too so no framework
//! default body ever reaches a caller.

use crate::api::models::*;
use crate::core::config::AppConfig;
use crate::core::error::{GatewayError, Result};
use crate::core::logging::IDENTITY_CONTEXT;
use crate::core::middleware::{origin_guard, request_context, track_metrics, ActionName};
use crate::services::gateway::{CompletionKind, CompletionRequest, Gateway};
use crate::services::key_registry::AuthContext;
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Actions the gateway dispatches, advertised by `?action=info`.
const ACTIONS: &[&str] = &["optimize", "chat", "wallet", "analytics", "providers", "info"];

/// Shared application state.
pub struct AppState {
    pub config: AppConfig,
    pub gateway: Arc<Gateway>,
    pub started_at: Instant,
}

/// OpenAPI documentation for the gateway API.
#[derive(OpenApi)]
#[openapi(
    paths(api_post, api_get, health),
    components(
        schemas(
            ApiEnvelope,
            ActionRequest,
            OptimizeRequest,
            ChatRequest,
            WalletRequest,
            OptimizeData,
            ChatData,
            WalletData,
            QuotaData,
            RecentUsage,
            AnalyticsData,
            ProviderSummary,
            ProvidersData,
            InfoData,
            HealthResponse,
        )
    ),
    tags(
        (name = "gateway", description = "Cost-optimized provider access"),
        (name = "ops", description = "Liveness and metrics endpoints")
    ),
    info(
        title = "OnChain Gateway API",
        description = "Request gateway with prompt optimization, response caching, provider fallback, and usage-based settlement.",
        license(name = "MIT")
    ),
    security(
        ("api_key" = [])
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "api_key",
                utoipa::openapi::security::SecurityScheme::ApiKey(
                    utoipa::openapi::security::ApiKey::Header(
                        utoipa::openapi::security::ApiKeyValue::new("X-API-Key"),
                    ),
                ),
            );
        }
    }
}

/// Handle `POST /api/v1` action requests.
#[utoipa::path(
    post,
    path = "/api/v1",
    tag = "gateway",
    request_body = ActionRequest,
    responses(
        (status = 200, description = "Action served", body = ApiEnvelope),
        (status = 400, description = "Malformed body or validation failure", body = ApiEnvelope),
        (status = 401, description = "Authentication failed", body = ApiEnvelope),
        (status = 403, description = "Action not permitted for this identity", body = ApiEnvelope),
        (status = 413, description = "Payload too large", body = ApiEnvelope),
        (status = 429, description = "Quota exceeded, retry-after header set", body = ApiEnvelope),
        (status = 503, description = "All providers failed", body = ApiEnvelope)
    )
)]
pub async fn api_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ActionRequest>, JsonRejection>,
) -> Response {
    let request = match parse_body(payload, &state.config) {
        Ok(request) => request,
        Err(err) => return respond("invalid", Err(err)),
    };

    let action = match &request {
        ActionRequest::Optimize(_) => "optimize",
        ActionRequest::Chat(_) => "chat",
        ActionRequest::Wallet(_) => "wallet",
    };
    let result = dispatch_post(&state, &headers, request).await;
    respond(action, result)
}

/// Handle `GET /api/v1` query actions.
#[utoipa::path(
    get,
    path = "/api/v1",
    tag = "gateway",
    params(
        ("action" = String, Query, description = "One of analytics, providers, info")
    ),
    responses(
        (status = 200, description = "Action served", body = ApiEnvelope),
        (status = 400, description = "Unknown or missing action", body = ApiEnvelope),
        (status = 401, description = "Authentication failed", body = ApiEnvelope),
        (status = 403, description = "Action not permitted for this identity", body = ApiEnvelope)
    )
)]
pub async fn api_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    query: std::result::Result<Query<QueryAction>, QueryRejection>,
) -> Response {
    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => {
            return respond(
                "invalid",
                Err(GatewayError::Validation(rejection.body_text())),
            )
        }
    };

    let action = match query.action.as_str() {
        known @ ("analytics" | "providers" | "info") => known,
        _ => "invalid",
    };
    let result = dispatch_get(&state, &headers, &query).await;
    respond(action, result)
}

/// Render the dispatch result as an envelope and tag the response with the
/// action name for the metrics middleware.
fn respond(action: &str, result: Result<ApiEnvelope>) -> Response {
    let mut response = match result {
        Ok(envelope) => Json(envelope).into_response(),
        Err(err) => err.into_response(),
    };
    response
        .extensions_mut()
        .insert(ActionName(action.to_string()));
    response
}

fn parse_body(
    payload: std::result::Result<Json<ActionRequest>, JsonRejection>,
    config: &AppConfig,
) -> Result<ActionRequest> {
    let rejection = match payload {
        Ok(Json(request)) => return Ok(request),
        Err(rejection) => rejection,
    };

    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return Err(GatewayError::PayloadTooLarge {
            limit_bytes: config.server.max_payload_bytes,
        });
    }
    match rejection {
        // Unknown action names land here as serde data errors
        JsonRejection::JsonDataError(err) => Err(GatewayError::Validation(err.body_text())),
        JsonRejection::JsonSyntaxError(_) => Err(GatewayError::Validation(
            "Request body is not valid JSON".to_string(),
        )),
        JsonRejection::MissingJsonContentType(_) => Err(GatewayError::Validation(
            "Expected a JSON body with Content-Type: application/json".to_string(),
        )),
        other => Err(GatewayError::Validation(other.body_text())),
    }
}

async fn dispatch_post(
    state: &AppState,
    headers: &HeaderMap,
    request: ActionRequest,
) -> Result<ApiEnvelope> {
    let ctx = authenticate(state, headers)?;
    let identity = ctx.identity.clone();

    IDENTITY_CONTEXT
        .scope(identity, async move {
            match request {
                ActionRequest::Optimize(optimize) => handle_optimize(state, &ctx, optimize).await,
                ActionRequest::Chat(chat) => handle_chat(state, &ctx, chat).await,
                ActionRequest::Wallet(wallet) => handle_wallet(state, &ctx, wallet),
            }
        })
        .await
}

async fn dispatch_get(
    state: &AppState,
    headers: &HeaderMap,
    query: &QueryAction,
) -> Result<ApiEnvelope> {
    match query.action.as_str() {
        // The one unauthenticated action
        "info" => info_data(),
        "providers" => {
            let ctx = authenticate(state, headers)?;
            require(&ctx, "providers")?;
            providers_data(state)
        }
        "analytics" => {
            let ctx = authenticate(state, headers)?;
            require(&ctx, "analytics")?;
            let identity = ctx.identity.clone();
            IDENTITY_CONTEXT
                .scope(identity, async move { analytics_data(state, &ctx) })
                .await
        }
        other => Err(GatewayError::Validation(format!("Unknown action: {}", other))),
    }
}

async fn handle_optimize(
    state: &AppState,
    ctx: &AuthContext,
    request: OptimizeRequest,
) -> Result<ApiEnvelope> {
    bind_wallet_hint(state, ctx, request.wallet_address.as_deref())?;
    let outcome = state
        .gateway
        .complete(
            ctx,
            CompletionRequest {
                kind: CompletionKind::Optimize,
                prompt: request.prompt.clone(),
                provider: request.provider,
                max_cost_micros: budget_micros(request.max_cost)?,
            },
        )
        .await?;
    ApiEnvelope::ok(OptimizeData::from_outcome(&outcome, &request.prompt))
}

async fn handle_chat(
    state: &AppState,
    ctx: &AuthContext,
    request: ChatRequest,
) -> Result<ApiEnvelope> {
    bind_wallet_hint(state, ctx, request.wallet_address.as_deref())?;
    let outcome = state
        .gateway
        .complete(
            ctx,
            CompletionRequest {
                kind: CompletionKind::Chat,
                prompt: request.message,
                provider: request.provider,
                max_cost_micros: budget_micros(request.max_cost)?,
            },
        )
        .await?;
    ApiEnvelope::ok(ChatData::from_outcome(&outcome))
}

fn handle_wallet(
    state: &AppState,
    ctx: &AuthContext,
    request: WalletRequest,
) -> Result<ApiEnvelope> {
    state.gateway.link_wallet(ctx, &request.wallet_address)?;
    ApiEnvelope::ok(WalletData {
        connected: true,
        address: request.wallet_address,
    })
}

/// A wallet address on a billable call updates the settlement binding
/// before the pipeline runs, so the spawned settlement sees it. Format
/// errors reject the whole request.
fn bind_wallet_hint(state: &AppState, ctx: &AuthContext, wallet: Option<&str>) -> Result<()> {
    match wallet {
        Some(address) => state.gateway.wallets.link(&ctx.identity, address),
        None => Ok(()),
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext> {
    let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    state.gateway.authenticate(presented)
}

fn require(ctx: &AuthContext, action: &str) -> Result<()> {
    if ctx.allows(action) {
        Ok(())
    } else {
        Err(GatewayError::Forbidden(format!(
            "Identity is not permitted to call {}",
            action
        )))
    }
}

fn budget_micros(max_cost: Option<f64>) -> Result<Option<u64>> {
    match max_cost {
        None => Ok(None),
        Some(usd) => usd_to_micros(usd).map(Some).ok_or_else(|| {
            GatewayError::Validation("maxCost must be a non-negative number".to_string())
        }),
    }
}

fn info_data() -> Result<ApiEnvelope> {
    ApiEnvelope::ok(InfoData {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        actions: ACTIONS.iter().map(|s| s.to_string()).collect(),
    })
}

fn providers_data(state: &AppState) -> Result<ApiEnvelope> {
    // Catalog comes from configuration, availability from the live router
    let routable = state.gateway.router.provider_names();
    let providers = state
        .config
        .providers
        .iter()
        .map(|p| ProviderSummary {
            name: p.name.clone(),
            model: p.model.clone(),
            priority: p.priority,
            available: routable.iter().any(|name| name == &p.name),
        })
        .collect();
    ApiEnvelope::ok(ProvidersData { providers })
}

fn analytics_data(state: &AppState, ctx: &AuthContext) -> Result<ApiEnvelope> {
    let gateway = &state.gateway;
    let usage = gateway.recorder.identity_usage(&ctx.identity);
    let quota = gateway.quotas.peek(&ctx.identity, &ctx.tier)?;
    let recent = gateway
        .recorder
        .recent(Some(&ctx.identity))
        .iter()
        .map(RecentUsage::from)
        .collect();

    ApiEnvelope::ok(AnalyticsData {
        identity: ctx.identity.clone(),
        requests: usage.requests,
        cache_hits: usage.cache_hits,
        total_cost: micros_to_usd(usage.cost_micros),
        total_saved: micros_to_usd(usage.savings_micros),
        total_fees: micros_to_usd(usage.fee_micros),
        quota: quota.into(),
        recent,
    })
}

/// Basic health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "ops",
    responses(
        (status = 200, description = "Gateway is live", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stats = state.gateway.cache.stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        providers: state.gateway.router.provider_names().len(),
        tracked_identities: state.gateway.quotas.tracked_identities(),
        cache_hit_rate: stats.hit_rate,
    })
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler() -> Result<Response> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(buffer.into())
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

/// Assemble the full application router with all layers attached.
///
/// Integration tests drive this exact router, so the envelope shape,
/// security headers, and middleware behavior they observe match production.
pub fn build_router(state: Arc<AppState>) -> Router {
    let max_payload = state.config.server.max_payload_bytes;

    let api = Router::new()
        .route("/api/v1", post(api_post).get(api_get))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            origin_guard,
        ))
        .layer(DefaultBodyLimit::max(max_payload));

    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api)
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(track_metrics))
        .layer(middleware::from_fn(request_context))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
