//! API request and response models.
//!
//! Every response, success or error, uses the same envelope shape. Money
//! crosses the wire as USD floats; internal accounting stays in integer
//! micro-USD and converts only at this boundary.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core::error::Result;
use crate::services::gateway::CompletionOutcome;
use crate::services::quota_ledger::QuotaSnapshot;
use crate::services::usage_recorder::UsageRecord;

pub const MICROS_PER_USD: f64 = 1_000_000.0;

/// The stable response envelope.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[schema(example = json!({
    "success": true,
    "data": {"requestId": "6f9c1ad2-6a9b-4d22-a2f1-6a1f2d3c4b5a"},
    "error": null,
    "timestamp": "2026-08-22T12:00:00.000Z",
    "version": "1.2.0"
}))]
pub struct ApiEnvelope {
    /// Whether the request was served
    pub success: bool,

    /// Action-specific payload, null on errors
    pub data: Option<serde_json::Value>,

    /// Human-readable error, null on success
    pub error: Option<String>,

    /// RFC 3339 timestamp with millisecond precision
    pub timestamp: String,

    /// Gateway version
    pub version: String,
}

impl ApiEnvelope {
    pub fn ok<T: Serialize>(data: T) -> Result<Self> {
        Ok(Self {
            success: true,
            data: Some(serde_json::to_value(data)?),
            error: None,
            timestamp: now_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Body of `POST /api/v1`, dispatched on the `action` field.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ActionRequest {
    Optimize(OptimizeRequest),
    Chat(ChatRequest),
    Wallet(WalletRequest),
}

/// Optimize a prompt, route it, and return the response with the
/// cost/savings breakdown.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "action": "optimize",
    "prompt": "Please could you tell me what the capital of France is?",
    "maxCost": 0.01
}))]
pub struct OptimizeRequest {
    pub prompt: String,

    /// Settlement wallet hint; the authenticated identity is the billing
    /// principal either way
    pub wallet_address: Option<String>,

    /// Route only to this provider instead of the full fallback chain
    pub provider: Option<String>,

    /// Upper cost bound in USD; providers estimated above it are skipped
    pub max_cost: Option<f64>,
}

/// Route a message without prompt optimization.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({"action": "chat", "message": "What is the capital of France?"}))]
pub struct ChatRequest {
    pub message: String,

    pub wallet_address: Option<String>,

    pub provider: Option<String>,

    pub max_cost: Option<f64>,
}

/// Bind a settlement wallet to the authenticated identity.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "action": "wallet",
    "walletAddress": "0x742d35Cc6634C0532925a3b844Bc9e7595f2bD18"
}))]
pub struct WalletRequest {
    pub wallet_address: String,

    /// Reserved for signed ownership proofs
    pub signature: Option<String>,
}

/// Query of `GET /api/v1`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryAction {
    pub action: String,

    #[allow(dead_code)]
    pub wallet_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeData {
    pub response: String,
    pub optimized_prompt: String,
    pub original_tokens: u32,
    pub optimized_tokens: u32,
    pub provider: String,
    pub model: String,
    pub cost: f64,
    pub savings: f64,
    pub savings_percentage: f64,
    pub fee: f64,
    pub cache_hit: bool,
    pub request_id: String,
}

impl OptimizeData {
    /// `original_prompt` fills `optimizedPrompt` when no optimization ran,
    /// which is the case for cache hits.
    pub fn from_outcome(outcome: &CompletionOutcome, original_prompt: &str) -> Self {
        Self {
            response: outcome.content.clone(),
            optimized_prompt: outcome
                .optimized_prompt
                .clone()
                .unwrap_or_else(|| original_prompt.to_string()),
            original_tokens: outcome.original_tokens,
            optimized_tokens: outcome.final_tokens,
            provider: outcome.provider.clone(),
            model: outcome.model.clone(),
            cost: micros_to_usd(outcome.cost_micros),
            savings: micros_to_usd(outcome.savings_micros),
            savings_percentage: savings_percentage(outcome.cost_micros, outcome.savings_micros),
            fee: micros_to_usd(outcome.fee_micros),
            cache_hit: outcome.cache_hit,
            request_id: outcome.request_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatData {
    pub message: String,
    pub provider: String,
    pub model: String,
    pub cost: f64,
    pub cache_hit: bool,
    pub request_id: String,
}

impl ChatData {
    pub fn from_outcome(outcome: &CompletionOutcome) -> Self {
        Self {
            message: outcome.content.clone(),
            provider: outcome.provider.clone(),
            model: outcome.model.clone(),
            cost: micros_to_usd(outcome.cost_micros),
            cache_hit: outcome.cache_hit,
            request_id: outcome.request_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WalletData {
    pub connected: bool,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuotaData {
    pub limit: u32,
    pub remaining: u32,
    pub reset_in_secs: u64,
}

impl From<QuotaSnapshot> for QuotaData {
    fn from(snapshot: QuotaSnapshot) -> Self {
        Self {
            limit: snapshot.limit,
            remaining: snapshot.remaining,
            reset_in_secs: snapshot.reset_in.as_secs(),
        }
    }
}

/// One ledger entry as shown in the analytics feed.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecentUsage {
    pub id: String,
    pub request_id: String,
    pub action: String,
    pub provider: Option<String>,
    pub cache_hit: bool,
    pub cost: f64,
    pub savings: f64,
    pub fee: f64,
    pub recorded_at: String,
}

impl From<&UsageRecord> for RecentUsage {
    fn from(record: &UsageRecord) -> Self {
        Self {
            id: record.id.to_string(),
            request_id: record.request_id.clone(),
            action: record.action.clone(),
            provider: record.provider.clone(),
            cache_hit: record.cache_hit,
            cost: micros_to_usd(record.cost_micros),
            savings: micros_to_usd(record.savings_micros),
            fee: micros_to_usd(record.fee_micros),
            recorded_at: record
                .recorded_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsData {
    pub identity: String,
    pub requests: u64,
    pub cache_hits: u64,
    pub total_cost: f64,
    pub total_saved: f64,
    pub total_fees: f64,
    pub quota: QuotaData,
    pub recent: Vec<RecentUsage>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSummary {
    pub name: String,
    pub model: String,
    pub priority: u32,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersData {
    pub providers: Vec<ProviderSummary>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfoData {
    pub name: String,
    pub version: String,
    pub actions: Vec<String>,
}

/// Liveness payload for `GET /health`.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub providers: usize,
    pub tracked_identities: usize,
    pub cache_hit_rate: f64,
}

pub fn micros_to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// Parse a caller-supplied USD budget. Rejects NaN, infinities, and
/// negative amounts.
pub fn usd_to_micros(usd: f64) -> Option<u64> {
    if !usd.is_finite() || usd < 0.0 {
        return None;
    }
    Some((usd * MICROS_PER_USD).round() as u64)
}

/// Share of the would-be cost that the cache or optimizer avoided, as a
/// percentage rounded to two decimals.
pub fn savings_percentage(cost_micros: u64, savings_micros: u64) -> f64 {
    let base = cost_micros + savings_micros;
    if base == 0 {
        return 0.0;
    }
    let pct = savings_micros as f64 * 100.0 / base as f64;
    (pct * 100.0).round() / 100.0
}
