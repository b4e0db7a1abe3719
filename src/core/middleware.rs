//! HTTP middleware for request context, metric tracking, and the
//! per-origin admission guard.

use crate::api::handlers::AppState;
use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::core::metrics::try_get_metrics;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

/// Extension type naming the dispatched action, set on responses by the
/// API handlers so metrics label by action instead of raw path.
#[derive(Clone, Debug)]
pub struct ActionName(pub String);

/// Generate a request id, scope all downstream work to it, and echo it in
/// the `X-Request-Id` response header.
pub async fn request_context(request: Request, next: Next) -> Response {
    let request_id = generate_request_id();
    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Track request count, duration, and in-flight gauge.
pub async fn track_metrics(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    // Skip the metrics endpoint itself to avoid recursion
    if path == "/metrics" {
        return next.run(request).await;
    }
    let Some(metrics) = try_get_metrics() else {
        return next.run(request).await;
    };

    let route = route_label(&path);
    metrics.active_requests.with_label_values(&[route]).inc();
    let start = Instant::now();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    // The action is only known after dispatch; handlers report it back
    // through a response extension
    let action = response
        .extensions()
        .get::<ActionName>()
        .map(|a| a.0.as_str())
        .unwrap_or(route);

    metrics
        .request_count
        .with_label_values(&[action, &status])
        .inc();
    metrics
        .request_duration
        .with_label_values(&[action])
        .observe(duration);
    metrics.active_requests.with_label_values(&[route]).dec();

    tracing::info!(
        "{} {} - action={} status={} duration={:.3}s",
        method,
        path,
        action,
        status,
        duration
    );

    response
}

/// Coarse pre-admission check on the caller's network origin. Runs before
/// authentication so flooding with bogus credentials still costs nothing
/// to verify.
pub async fn origin_guard(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    match client_ip(&request) {
        Some(addr) => {
            if let Err(err) = state.gateway.quotas.check_origin(addr) {
                return err.into_response();
            }
            next.run(request).await
        }
        // No resolvable peer address; the identity quota still applies
        None => next.run(request).await,
    }
}

/// First `X-Forwarded-For` entry when present, otherwise the socket peer.
fn client_ip(request: &Request) -> Option<IpAddr> {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok());

    forwarded.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip())
    })
}

fn route_label(path: &str) -> &'static str {
    match path {
        "/api/v1" => "api",
        "/health" => "health",
        p if p.starts_with("/docs") || p.starts_with("/api-docs") => "docs",
        _ => "other",
    }
}
