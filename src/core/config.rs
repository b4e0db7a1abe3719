//! Configuration management for the gateway.
//!
//! This module handles loading and parsing configuration from YAML files,
//! with support for environment variable expansion.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port, deadlines, payload limit)
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream provider configurations, attempted in priority order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Pricing rules for cost computation
    #[serde(default)]
    pub pricing: Vec<PricingRuleConfig>,

    /// Quota tiers and the per-origin pre-check
    #[serde(default)]
    pub quotas: QuotaConfig,

    /// Response cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// API credentials (hashes only, never plaintext keys)
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,

    /// Prompt optimizer strategy selection
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Usage recorder tuning
    #[serde(default)]
    pub usage: UsageConfig,

    /// Platform fee policy
    #[serde(default)]
    pub fee: FeeConfig,

    /// Payment settlement collaborator toggle
    #[serde(default)]
    pub settlement: SettlementConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Outer deadline for one request, covering the whole pipeline
    #[serde(default = "default_request_deadline")]
    pub request_deadline_secs: u64,

    /// Maximum accepted request body size in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,

    /// Whether to verify SSL certificates for upstream requests
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_deadline_secs: default_request_deadline(),
            max_payload_bytes: default_max_payload(),
            verify_ssl: default_verify_ssl(),
        }
    }
}

/// Configuration for a single upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name (routing dimension, logging, metrics)
    pub name: String,

    /// Base URL for the provider's API
    pub api_base: String,

    /// API key for upstream authentication
    pub api_key: String,

    /// Default model requested from this provider
    pub model: String,

    /// Attempt order; lower priority is tried first (cost-ascending by convention)
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Per-attempt timeout in seconds
    #[serde(default = "default_attempt_timeout")]
    pub timeout_secs: u64,

    /// Whether this provider participates in routing
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// One pricing rule: micro-USD rates for a (provider, model prefix) pair.
///
/// Rates are per million tokens so realistic prices stay integral, e.g.
/// $0.15/M input tokens is `input_per_mtok_micros: 150000`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingRuleConfig {
    /// Provider this rule applies to
    pub provider: String,

    /// Model prefix; the longest matching prefix wins, empty matches all
    #[serde(default)]
    pub model_prefix: String,

    /// Input token rate in micro-USD per million tokens
    pub input_per_mtok_micros: u64,

    /// Output token rate in micro-USD per million tokens
    pub output_per_mtok_micros: u64,

    /// Fixed fee per request in micro-USD
    #[serde(default)]
    pub request_fee_micros: u64,
}

/// Quota configuration: identity tiers plus the per-origin pre-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Tier name -> window limit
    #[serde(default = "default_tiers")]
    pub tiers: HashMap<String, TierQuotaConfig>,

    /// Coarse per-IP admission before any identity work
    #[serde(default)]
    pub origin: OriginQuotaConfig,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            origin: OriginQuotaConfig::default(),
        }
    }
}

/// Per-tier window limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierQuotaConfig {
    /// Maximum admissions per window
    pub limit: u32,

    /// Window length in seconds
    pub window_secs: u64,
}

/// Per-origin token bucket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginQuotaConfig {
    /// Sustained requests per second per origin
    #[serde(default = "default_origin_rps")]
    pub requests_per_second: u32,

    /// Maximum burst size per origin
    #[serde(default = "default_origin_burst")]
    pub burst_size: u32,

    /// How often idle origin state is swept, in seconds
    #[serde(default = "default_origin_sweep")]
    pub sweep_interval_secs: u64,
}

impl Default for OriginQuotaConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_origin_rps(),
            burst_size: default_origin_burst(),
            sweep_interval_secs: default_origin_sweep(),
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries held by the in-process tier
    #[serde(default = "default_fast_capacity")]
    pub fast_capacity: usize,

    /// TTL applied to new entries, in seconds
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    /// Store entries shared across identities instead of per-identity
    #[serde(default)]
    pub shared: bool,

    /// Substrings/patterns whose presence in a payload blocks storage
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast_capacity: default_fast_capacity(),
            default_ttl_secs: default_cache_ttl(),
            shared: false,
            denylist: default_denylist(),
        }
    }
}

/// Configuration for one API credential. Only the SHA-256 hash of the issued
/// key is carried here; the plaintext exists nowhere but the issuance response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// SHA-256 hex digest of the issued key
    pub key_hash: String,

    /// Identity this credential authenticates as
    pub identity: String,

    /// Quota tier name
    #[serde(default = "default_tier")]
    pub tier: String,

    /// Actions this identity may invoke
    #[serde(default = "default_permissions")]
    pub permissions: Vec<String>,

    /// Whether this credential is active
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Optional expiry; expired credentials never authenticate
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Optimizer strategy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Strategy name: "noop", "whitespace", or "concise"
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
        }
    }
}

/// Usage recorder tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Bounded queue capacity between the recorder and the durable sink
    #[serde(default = "default_usage_queue")]
    pub queue_capacity: usize,

    /// Sink flush batch size
    #[serde(default = "default_usage_batch")]
    pub flush_batch_size: usize,

    /// Sink flush interval in seconds
    #[serde(default = "default_usage_interval")]
    pub flush_interval_secs: u64,

    /// How many recent records the analytics view returns
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,

    /// How many records the in-memory log retains for windowed sums
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_usage_queue(),
            flush_batch_size: default_usage_batch(),
            flush_interval_secs: default_usage_interval(),
            recent_limit: default_recent_limit(),
            history_limit: default_history_limit(),
        }
    }
}

/// Platform fee policy. The fee is a share of realized savings, so a request
/// that saves nothing is never charged a fee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Share of savings taken as the platform fee, in basis points
    #[serde(default = "default_fee_bps")]
    pub savings_share_bps: u32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            savings_share_bps: default_fee_bps(),
        }
    }
}

/// Payment settlement collaborator toggle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Whether settlement handoff runs after billable responses
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18080
}

fn default_request_deadline() -> u64 {
    60
}

fn default_max_payload() -> usize {
    64 * 1024
}

fn default_verify_ssl() -> bool {
    true
}

fn default_priority() -> u32 {
    100
}

fn default_attempt_timeout() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

fn default_tiers() -> HashMap<String, TierQuotaConfig> {
    let mut tiers = HashMap::new();
    tiers.insert(
        "free".to_string(),
        TierQuotaConfig {
            limit: 60,
            window_secs: 3600,
        },
    );
    tiers.insert(
        "pro".to_string(),
        TierQuotaConfig {
            limit: 1000,
            window_secs: 3600,
        },
    );
    tiers
}

fn default_origin_rps() -> u32 {
    20
}

fn default_origin_burst() -> u32 {
    40
}

fn default_origin_sweep() -> u64 {
    60
}

fn default_fast_capacity() -> usize {
    1024
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_denylist() -> Vec<String> {
    [
        "password",
        "secret",
        "api_key",
        "api-key",
        "private_key",
        "bearer ",
        "authorization:",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_tier() -> String {
    "free".to_string()
}

fn default_permissions() -> Vec<String> {
    ["optimize", "chat", "wallet", "analytics", "providers"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_strategy() -> String {
    "concise".to_string()
}

fn default_usage_queue() -> usize {
    1024
}

fn default_usage_batch() -> usize {
    50
}

fn default_usage_interval() -> u64 {
    2
}

fn default_recent_limit() -> usize {
    50
}

fn default_history_limit() -> usize {
    10_000
}

fn default_fee_bps() -> u32 {
    500
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use onchain_gateway_rust::core::config::AppConfig;
    ///
    /// let config = AppConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        // Expand environment variables
        let expanded = expand_env_vars(&content);

        let mut config: AppConfig = serde_yaml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides (env vars take precedence over file values).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }

        if let Ok(port_str) = std::env::var("PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(verify_ssl_str) = std::env::var("VERIFY_SSL") {
            self.server.verify_ssl = str_to_bool(&verify_ssl_str);
        }

        if let Ok(deadline_str) = std::env::var("REQUEST_DEADLINE_SECS") {
            if let Ok(deadline) = deadline_str.parse::<u64>() {
                self.server.request_deadline_secs = deadline;
            }
        }
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.quotas.tiers.is_empty() {
            bail!("At least one quota tier must be configured");
        }

        if self.fee.savings_share_bps > 10_000 {
            bail!(
                "fee.savings_share_bps must be at most 10000, got {}",
                self.fee.savings_share_bps
            );
        }

        if self.cache.fast_capacity == 0 {
            bail!("cache.fast_capacity must be positive");
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                bail!("Duplicate provider name: {}", provider.name);
            }
            if provider.timeout_secs == 0 {
                bail!("Provider {} has a zero attempt timeout", provider.name);
            }
        }

        for credential in &self.credentials {
            if !self.quotas.tiers.contains_key(&credential.tier) {
                bail!(
                    "Credential for identity {} references unknown tier {}",
                    credential.identity,
                    credential.tier
                );
            }
        }

        Ok(())
    }

    /// Providers that participate in routing, sorted by priority.
    pub fn enabled_providers(&self) -> Vec<ProviderConfig> {
        let mut providers: Vec<ProviderConfig> = self
            .providers
            .iter()
            .filter(|p| p.enabled)
            .cloned()
            .collect();
        providers.sort_by_key(|p| p.priority);
        providers
    }
}

/// Resolve the config file path from `CONFIG_PATH`, defaulting to `config.yaml`.
pub fn default_config_path() -> String {
    std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string())
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    let re = Regex::new(r#"["']?\$\{([^}:]+)(?::?-?([^}]*))?\}["']?"#).unwrap();

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");

        std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
    })
    .to_string()
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
pub fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
