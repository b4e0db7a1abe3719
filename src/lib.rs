//! OnChain Gateway - a request gateway for cost-optimized AI provider access
//!
//! This library provides a production-ready gateway in front of multiple LLM
//! providers with features including:
//!
//! - **Hashed Key Authentication**: SHA-256 credential registry with a uniform
//!   rejection body and per-identity permission sets
//! - **Atomic Quota Admission**: fixed-window per-identity limits plus a coarse
//!   per-origin guard, checked before any billable work
//! - **Two-Tier Response Cache**: fast in-memory tier over an optional durable
//!   Postgres tier, with scoped visibility and a sensitivity denylist
//! - **Prompt Optimization**: pluggable strategies that shrink prompts before
//!   routing; savings fund the platform fee
//! - **Provider Fallback Routing**: priority-ordered provider chain with
//!   per-attempt timeouts and budget-aware skipping
//! - **Usage Ledger & Settlement**: append-only usage records with atomic
//!   aggregates and fire-and-forget fee settlement
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//!
//! # Architecture
//!
//! The codebase is organized into four main layers:
//!
//! - [`core`]: Core functionality (config, database, errors, metrics, middleware)
//! - [`api`]: HTTP handlers, router assembly, and request/response models
//! - [`cache`]: Response cache tiers, key derivation, and the denylist
//! - [`services`]: Business logic (gateway pipeline, routing, quotas, billing)
//!
//! # Configuration
//!
//! Configuration is loaded from a YAML file (`CONFIG_PATH`, default
//! `config.yaml`) with `${VAR:-default}` environment expansion.
//!
//! Optional environment variables:
//! - `DB_URL`: PostgreSQL URL enabling the durable cache tier and usage sink
//! - `CONFIG_PATH`: Path to the YAML configuration file
//! - `NO_COLOR`: Disable ANSI colors in log output

pub mod api;
pub mod cache;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, ApiDoc, ApiEnvelope, AppState};
pub use cache::{CacheKey, CacheScope, CacheStore};
pub use core::{AppConfig, GatewayError, Result};
pub use services::{Gateway, GatewayComponents, GatewayPolicy};
