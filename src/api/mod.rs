//! API layer for the gateway.
//!
//! This module contains the HTTP handlers, request/response models, and the
//! router assembly with all middleware layers attached.

pub mod handlers;
pub mod models;

// Re-export commonly used types
pub use handlers::{build_router, health, metrics_handler, ApiDoc, AppState};
pub use models::{
    ActionRequest, AnalyticsData, ApiEnvelope, ChatData, ChatRequest, HealthResponse, InfoData,
    OptimizeData, OptimizeRequest, ProvidersData, WalletData, WalletRequest,
};
