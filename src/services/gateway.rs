//! Gateway controller: the request pipeline.
//!
//! One `Gateway` instance wires the key registry, quota ledger, cache,
//! optimizer, provider router, usage recorder, and settlement collaborator
//! together. Every billable request walks the same gate order:
//! authenticate, permission, admit, cache lookup, optimize, route, record,
//! cache store. A rejection at any gate short-circuits; nothing past the
//! failing gate runs. Rejections before admission are not billable and
//! leave no usage record; failures after admission record a zero-cost
//! entry so consumed quota stays visible in the ledger.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;

use crate::cache::{CacheHit, CacheKey, CacheScope, CacheStore, CachedResponse, PutOutcome};
use crate::core::config::AppConfig;
use crate::core::error::{GatewayError, Result};
use crate::core::logging::{generate_request_id, get_request_id};
use crate::core::tokens::estimate_tokens;

use super::key_registry::{AuthContext, KeyRegistry};
use super::optimizer::PromptOptimizer;
use super::pricing::PricingBook;
use super::provider_router::{ProviderCallResult, ProviderRouter};
use super::quota_ledger::QuotaLedger;
use super::settlement::{spawn_settlement, SettlementGateway, WalletDirectory};
use super::usage_recorder::{UsageDraft, UsageRecorder};

/// The two billable request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// Prompt is optimized before routing
    Optimize,
    /// Prompt is routed as-is
    Chat,
}

impl CompletionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Optimize => "optimize",
            Self::Chat => "chat",
        }
    }

    const fn optimizes(self) -> bool {
        matches!(self, Self::Optimize)
    }
}

/// One billable request, already parsed and budget-converted.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub kind: CompletionKind,
    pub prompt: String,

    /// Restrict routing to this provider instead of the full chain.
    pub provider: Option<String>,

    /// Reject providers whose estimated cost exceeds this budget.
    pub max_cost_micros: Option<u64>,
}

/// What the pipeline produced for a served request.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub request_id: String,
    pub record_id: Uuid,
    pub content: String,
    pub provider: String,
    pub model: String,
    pub cache_hit: bool,
    pub original_tokens: u32,
    pub final_tokens: u32,

    /// The prompt actually routed, present only when optimization ran.
    pub optimized_prompt: Option<String>,

    pub cost_micros: u64,
    pub savings_micros: u64,
    pub fee_micros: u64,
}

/// Tuning knobs the controller reads from configuration.
#[derive(Debug, Clone)]
pub struct GatewayPolicy {
    /// Share of realized savings billed as the platform fee, in basis points
    pub savings_share_bps: u32,

    /// Cache entries are shared across identities instead of scoped per owner
    pub shared_cache: bool,

    /// Outer deadline covering cache lookup, optimization, and routing
    pub deadline: Duration,
}

impl GatewayPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            savings_share_bps: config.fee.savings_share_bps,
            shared_cache: config.cache.shared,
            deadline: Duration::from_secs(config.server.request_deadline_secs.max(1)),
        }
    }
}

/// Everything the controller orchestrates, built once at startup and
/// injected. Tests swap individual parts for fakes.
pub struct GatewayComponents {
    pub registry: Arc<KeyRegistry>,
    pub quotas: Arc<QuotaLedger>,
    pub cache: Arc<CacheStore>,
    pub optimizer: Arc<dyn PromptOptimizer>,
    pub router: Arc<ProviderRouter>,
    pub pricing: Arc<PricingBook>,
    pub recorder: Arc<UsageRecorder>,
    pub settlement: Option<Arc<dyn SettlementGateway>>,
    pub wallets: Arc<WalletDirectory>,
}

pub struct Gateway {
    pub registry: Arc<KeyRegistry>,
    pub quotas: Arc<QuotaLedger>,
    pub cache: Arc<CacheStore>,
    pub optimizer: Arc<dyn PromptOptimizer>,
    pub router: Arc<ProviderRouter>,
    pub pricing: Arc<PricingBook>,
    pub recorder: Arc<UsageRecorder>,
    pub settlement: Option<Arc<dyn SettlementGateway>>,
    pub wallets: Arc<WalletDirectory>,
    pub policy: GatewayPolicy,
}

enum Staged {
    Hit(CacheHit),
    Fresh {
        result: ProviderCallResult,
        original_tokens: u32,
        optimized_prompt: Option<String>,
    },
}

impl Gateway {
    pub fn new(components: GatewayComponents, policy: GatewayPolicy) -> Self {
        Self {
            registry: components.registry,
            quotas: components.quotas,
            cache: components.cache,
            optimizer: components.optimizer,
            router: components.router,
            pricing: components.pricing,
            recorder: components.recorder,
            settlement: components.settlement,
            wallets: components.wallets,
            policy,
        }
    }

    /// Resolve a presented credential. Every rejection reason maps to the
    /// same 401 at the HTTP layer.
    pub fn authenticate(&self, presented: Option<&str>) -> Result<AuthContext> {
        self.registry.authenticate(presented).map_err(GatewayError::Auth)
    }

    /// Run the full pipeline for one billable request.
    pub async fn complete(
        &self,
        ctx: &AuthContext,
        request: CompletionRequest,
    ) -> Result<CompletionOutcome> {
        let action = request.kind.as_str();
        if !ctx.allows(action) {
            return Err(GatewayError::Forbidden(format!(
                "Identity is not permitted to call {}",
                action
            )));
        }
        if request.prompt.trim().is_empty() {
            return Err(GatewayError::Validation("prompt must not be empty".to_string()));
        }
        if let Some(name) = &request.provider {
            if !self.router.provider_names().iter().any(|p| p == name) {
                return Err(GatewayError::Validation(format!("Unknown provider: {}", name)));
            }
        }

        let admitted = self.quotas.admit(&ctx.identity, &ctx.tier)?;
        tracing::debug!(
            identity = %ctx.identity,
            tier = %ctx.tier,
            remaining = admitted.remaining,
            "admission granted"
        );

        let request_id = current_request_id();
        let dimension = request.provider.as_deref().unwrap_or("auto");
        let key = CacheKey::derive(&request.prompt, dimension);
        let scope = if self.policy.shared_cache {
            CacheScope::Shared
        } else {
            CacheScope::Private(ctx.identity.clone())
        };

        let staged = match timeout(self.policy.deadline, self.stage(&key, &scope, &request)).await {
            Ok(Ok(staged)) => staged,
            Ok(Err(err)) => {
                self.record_unserved(ctx, action, &request_id);
                return Err(err);
            }
            Err(_) => {
                tracing::warn!(
                    identity = %ctx.identity,
                    deadline_secs = self.policy.deadline.as_secs(),
                    "request deadline exceeded"
                );
                self.record_unserved(ctx, action, &request_id);
                return Err(GatewayError::Timeout);
            }
        };

        let mut outcome = match staged {
            Staged::Hit(hit) => {
                let savings = hit.cost_at_creation_micros;
                let tokens = estimate_tokens(&request.prompt);
                CompletionOutcome {
                    request_id: request_id.clone(),
                    record_id: Uuid::nil(),
                    content: hit.response.content,
                    provider: hit.response.provider,
                    model: hit.response.model,
                    cache_hit: true,
                    original_tokens: tokens,
                    final_tokens: tokens,
                    optimized_prompt: None,
                    cost_micros: 0,
                    savings_micros: savings,
                    fee_micros: self.fee_for(savings),
                }
            }
            Staged::Fresh {
                result,
                original_tokens,
                optimized_prompt,
            } => {
                // Savings is what the unoptimized prompt would have cost
                // minus what the routed one did; the fixed per-request fee
                // cancels out of the difference.
                let pricing = self.pricing.get();
                let unoptimized_cost = pricing
                    .cost_micros(
                        &result.provider,
                        &result.model,
                        original_tokens,
                        result.output_tokens,
                    )
                    .unwrap_or(result.cost_micros);
                let savings = unoptimized_cost.saturating_sub(result.cost_micros);
                CompletionOutcome {
                    request_id: request_id.clone(),
                    record_id: Uuid::nil(),
                    content: result.content,
                    provider: result.provider,
                    model: result.model,
                    cache_hit: false,
                    original_tokens,
                    final_tokens: result.input_tokens,
                    optimized_prompt,
                    cost_micros: result.cost_micros,
                    savings_micros: savings,
                    fee_micros: self.fee_for(savings),
                }
            }
        };

        outcome.record_id = self.recorder.record(UsageDraft {
            request_id: request_id.clone(),
            identity: ctx.identity.clone(),
            action: action.to_string(),
            provider: Some(outcome.provider.clone()),
            cache_hit: outcome.cache_hit,
            cost_micros: outcome.cost_micros,
            savings_micros: outcome.savings_micros,
            fee_micros: outcome.fee_micros,
        });

        if !outcome.cache_hit {
            let response = CachedResponse {
                content: outcome.content.clone(),
                provider: outcome.provider.clone(),
                model: outcome.model.clone(),
            };
            match self
                .cache
                .put(&key, &scope, &request.prompt, &response, outcome.cost_micros, None)
                .await
            {
                Ok(PutOutcome::Stored) => {}
                Ok(PutOutcome::Rejected { rule }) => {
                    tracing::debug!(%rule, "response not cached")
                }
                Err(err) => tracing::warn!(error = %err, "cache store failed"),
            }
        }

        if let Some(settlement) = &self.settlement {
            spawn_settlement(
                Arc::clone(settlement),
                ctx.identity.clone(),
                self.wallets.wallet_for(&ctx.identity),
                outcome.fee_micros,
                request_id.clone(),
            );
        }

        tracing::info!(
            action,
            identity = %ctx.identity,
            provider = %outcome.provider,
            cache_hit = outcome.cache_hit,
            cost_micros = outcome.cost_micros,
            savings_micros = outcome.savings_micros,
            fee_micros = outcome.fee_micros,
            "request served"
        );

        Ok(outcome)
    }

    /// Bind a settlement wallet to the authenticated identity.
    pub fn link_wallet(&self, ctx: &AuthContext, address: &str) -> Result<()> {
        if !ctx.allows("wallet") {
            return Err(GatewayError::Forbidden(
                "Identity is not permitted to call wallet".to_string(),
            ));
        }
        self.wallets.link(&ctx.identity, address)
    }

    pub fn wallet_of(&self, ctx: &AuthContext) -> Option<String> {
        self.wallets.wallet_for(&ctx.identity)
    }

    // Cache lookup, optimization, and routing. Everything here runs under
    // the outer deadline.
    async fn stage(
        &self,
        key: &CacheKey,
        scope: &CacheScope,
        request: &CompletionRequest,
    ) -> Result<Staged> {
        if let Some(hit) = self.cache.get(key, scope).await {
            return Ok(Staged::Hit(hit));
        }

        let original_tokens = estimate_tokens(&request.prompt);
        let (final_prompt, optimized_prompt) = if request.kind.optimizes() {
            match self.optimizer.optimize(&request.prompt) {
                Ok(optimization) => {
                    tracing::debug!(
                        strategy = self.optimizer.name(),
                        token_delta = optimization.estimated_token_delta,
                        "prompt optimized"
                    );
                    (optimization.text.clone(), Some(optimization.text))
                }
                // Optimization is best-effort; route the original prompt
                Err(err) => {
                    tracing::warn!(
                        strategy = self.optimizer.name(),
                        error = %err,
                        "optimizer failed, routing original prompt"
                    );
                    (request.prompt.clone(), None)
                }
            }
        } else {
            (request.prompt.clone(), None)
        };

        let preference = request.provider.clone().map(|name| vec![name]);
        let result = self
            .router
            .route(&final_prompt, preference.as_deref(), request.max_cost_micros)
            .await
            .map_err(|failure| {
                tracing::warn!(%failure, "routing failed");
                if failure.all_too_expensive() {
                    GatewayError::Validation(
                        "No configured provider can satisfy the requested cost budget".to_string(),
                    )
                } else {
                    GatewayError::Upstream {
                        attempted: failure.attempted(),
                    }
                }
            })?;

        Ok(Staged::Fresh {
            result,
            original_tokens,
            optimized_prompt,
        })
    }

    // A post-admission failure consumed a quota slot without serving
    // anything; the ledger keeps a zero-cost entry for it.
    fn record_unserved(&self, ctx: &AuthContext, action: &str, request_id: &str) {
        self.recorder.record(UsageDraft {
            request_id: request_id.to_string(),
            identity: ctx.identity.clone(),
            action: action.to_string(),
            provider: None,
            cache_hit: false,
            cost_micros: 0,
            savings_micros: 0,
            fee_micros: 0,
        });
    }

    fn fee_for(&self, savings_micros: u64) -> u64 {
        savings_micros.saturating_mul(self.policy.savings_share_bps as u64) / 10_000
    }
}

fn current_request_id() -> String {
    let id = get_request_id();
    if id.is_empty() {
        generate_request_id()
    } else {
        id
    }
}
