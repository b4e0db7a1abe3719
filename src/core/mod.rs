//! Core functionality for the gateway.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Metrics collection
//! - HTTP middleware
//! - Task-local request context

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod tokens;

// Re-export commonly used types
pub use config::{AppConfig, ProviderConfig, ServerConfig};
pub use error::{GatewayError, Result};
pub use logging::{get_identity_context, get_request_id, IDENTITY_CONTEXT, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, try_get_metrics, Metrics};
pub use middleware::ActionName;
pub use tokens::estimate_tokens;
