//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`GatewayError`] covering every
//! failure class the pipeline can produce, and converts each one into the
//! stable response envelope with the right HTTP status.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Why an authentication attempt failed.
///
/// Sub-reasons are logged and counted server-side only. The HTTP layer maps
/// every one of them to the same 401 body so a caller cannot probe which
/// keys exist or have been revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReason {
    /// No credential header present
    Missing,
    /// Credential failed format validation (prefix, length, charset)
    Malformed,
    /// Credential hash not found in the registry
    Unknown,
    /// Credential exists but has been revoked
    Revoked,
    /// Credential exists but is past its expiry
    Expired,
}

impl AuthReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Malformed => "malformed",
            Self::Unknown => "unknown",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        }
    }
}

/// Which admission check rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    /// Per-IP pre-check, before any identity work
    Origin,
    /// Per-identity window counter
    Identity,
}

impl QuotaScope {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Origin => "origin",
            Self::Identity => "identity",
        }
    }
}

/// Main error type for the gateway.
///
/// All errors in the pipeline should be converted to this type for consistent
/// envelope rendering.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Client provided invalid data
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authentication failure; the reason never reaches the caller
    #[error("Authentication failed ({})", .0.as_str())]
    Auth(AuthReason),

    /// Authenticated but the identity lacks permission for the action
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Request body exceeds the configured limit
    #[error("Payload exceeds {limit_bytes} byte limit")]
    PayloadTooLarge { limit_bytes: usize },

    /// Origin or identity quota exhausted
    #[error("Quota exceeded ({})", .scope.as_str())]
    QuotaExceeded {
        scope: QuotaScope,
        retry_after: Duration,
    },

    /// Every provider in the fallback chain failed
    #[error("All {attempted} providers failed")]
    Upstream { attempted: usize },

    /// Overall request deadline exceeded
    #[error("Request deadline exceeded")]
    Timeout,

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status this error renders as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Serialization(_) | Self::Internal(_) | Self::Timeout => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Caller-facing message. Internal detail stays in the logs.
    fn public_message(&self) -> String {
        match self {
            Self::Config(e) => {
                tracing::error!(error = %e, "Configuration error while handling request");
                "Internal server error".to_string()
            }
            Self::Serialization(e) => {
                tracing::error!(error = %e, "Serialization failure while handling request");
                "Internal server error".to_string()
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Unhandled internal error");
                "Internal server error".to_string()
            }
            Self::Validation(msg) => msg.clone(),
            Self::Auth(reason) => {
                tracing::debug!(reason = reason.as_str(), "Authentication rejected");
                "Invalid API key".to_string()
            }
            Self::Forbidden(msg) => msg.clone(),
            Self::PayloadTooLarge { limit_bytes } => {
                format!("Request payload exceeds the {} byte limit", limit_bytes)
            }
            Self::QuotaExceeded { retry_after, .. } => format!(
                "Quota exceeded, retry in {} seconds",
                retry_after_secs(*retry_after)
            ),
            Self::Upstream { .. } => "All AI providers are currently unavailable".to_string(),
            Self::Timeout => "Request deadline exceeded".to_string(),
        }
    }
}

/// Seconds for the retry-after header, rounded up so a positive duration
/// never becomes a zero hint.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let retry_after = match &self {
            GatewayError::QuotaExceeded { retry_after, .. } => Some(retry_after_secs(*retry_after)),
            _ => None,
        };

        let status = self.status_code();
        let body = Json(json!({
            "success": false,
            "data": null,
            "error": self.public_message(),
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "version": env!("CARGO_PKG_VERSION"),
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Convenience type alias for Results using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;
