//! Upstream provider routing with ordered fallback.
//!
//! Providers are attempted in priority order with an independent timeout
//! per attempt. A failed attempt (timeout, non-2xx, malformed payload)
//! moves straight to the next provider; a provider is never retried
//! within one routing call. When every provider fails, the per-provider
//! errors are returned together for diagnostics while the HTTP surface
//! reports a single upstream-unavailable error.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::config::ProviderConfig;
use crate::core::logging::PROVIDER_CONTEXT;
use crate::core::metrics::try_get_metrics;
use crate::core::tokens::estimate_tokens;
use crate::services::pricing::PricingBook;

/// Why a single provider attempt did not produce a response.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    Timeout,
    Connect(String),
    Status(u16),
    MalformedPayload(String),
    /// Skipped before any network call: the pre-call estimate exceeded
    /// the caller's budget.
    TooExpensive { estimate_micros: u64 },
}

impl AttemptFailure {
    fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect(_) => "connect",
            Self::Status(_) => "status",
            Self::MalformedPayload(_) => "malformed",
            Self::TooExpensive { .. } => "too_expensive",
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "attempt timed out"),
            Self::Connect(detail) => write!(f, "connection failed: {detail}"),
            Self::Status(code) => write!(f, "upstream returned status {code}"),
            Self::MalformedPayload(detail) => write!(f, "malformed payload: {detail}"),
            Self::TooExpensive { estimate_micros } => {
                write!(f, "estimated cost {estimate_micros} micro-USD over budget")
            }
        }
    }
}

/// One entry in the failure trail.
#[derive(Debug, Clone)]
pub struct AttemptError {
    pub provider: String,
    pub failure: AttemptFailure,
}

/// Every provider in the chain failed. Carries the last error from each
/// attempted provider.
#[derive(Debug)]
pub struct AllProvidersFailed {
    pub errors: Vec<AttemptError>,
}

impl AllProvidersFailed {
    pub fn attempted(&self) -> usize {
        self.errors.len()
    }

    /// True when every provider was skipped for budget reasons, i.e. no
    /// provider actually failed.
    pub fn all_too_expensive(&self) -> bool {
        !self.errors.is_empty()
            && self
                .errors
                .iter()
                .all(|e| matches!(e.failure, AttemptFailure::TooExpensive { .. }))
    }
}

impl fmt::Display for AllProvidersFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all {} providers failed", self.errors.len())
    }
}

impl std::error::Error for AllProvidersFailed {}

/// A successful upstream call.
#[derive(Debug, Clone)]
pub struct ProviderCallResult {
    pub provider: String,
    pub model: String,
    pub content: String,
    pub latency: Duration,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_micros: u64,
    /// Total attempts within this routing call, including the success.
    pub attempts: usize,
}

#[derive(Serialize)]
struct UpstreamRequest<'a> {
    model: &'a str,
    messages: Vec<UpstreamMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct UpstreamMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct UpstreamResponse {
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
    usage: Option<UpstreamUsage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct UpstreamChoice {
    message: UpstreamChoiceMessage,
}

#[derive(Deserialize)]
struct UpstreamChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct UpstreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

struct AttemptOutcome {
    content: String,
    model: String,
    latency: Duration,
    input_tokens: u32,
    output_tokens: u32,
}

pub struct ProviderRouter {
    client: Client,
    providers: Vec<ProviderConfig>,
    pricing: Arc<PricingBook>,
}

impl ProviderRouter {
    /// `providers` must already be filtered to enabled entries and sorted
    /// by priority; `AppConfig::enabled_providers` produces that list.
    pub fn new(client: Client, providers: Vec<ProviderConfig>, pricing: Arc<PricingBook>) -> Self {
        Self {
            client,
            providers,
            pricing,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name.clone()).collect()
    }

    /// Attempt providers in order until one succeeds.
    pub async fn route(
        &self,
        prompt: &str,
        preference: Option<&[String]>,
        max_cost_micros: Option<u64>,
    ) -> Result<ProviderCallResult, AllProvidersFailed> {
        let order: Vec<&ProviderConfig> = match preference {
            Some(names) => names
                .iter()
                .filter_map(|name| self.providers.iter().find(|p| &p.name == name))
                .collect(),
            None => self.providers.iter().collect(),
        };

        let pricing = self.pricing.get();
        let input_estimate = estimate_tokens(prompt);
        let mut errors = Vec::new();

        for provider in order {
            if let Some(budget) = max_cost_micros {
                // Pre-call estimate assumes the reply is roughly the size
                // of the prompt
                if let Some(estimate) =
                    pricing.cost_micros(&provider.name, &provider.model, input_estimate, input_estimate)
                {
                    if estimate > budget {
                        debug!(
                            provider = %provider.name,
                            estimate_micros = estimate,
                            budget_micros = budget,
                            "skipping provider over cost budget"
                        );
                        self.observe_attempt(&provider.name, "too_expensive");
                        errors.push(AttemptError {
                            provider: provider.name.clone(),
                            failure: AttemptFailure::TooExpensive {
                                estimate_micros: estimate,
                            },
                        });
                        continue;
                    }
                }
            }

            let attempt = PROVIDER_CONTEXT
                .scope(provider.name.clone(), self.attempt(provider, prompt))
                .await;

            match attempt {
                Ok(outcome) => {
                    self.observe_attempt(&provider.name, "success");
                    if let Some(metrics) = try_get_metrics() {
                        metrics
                            .provider_latency
                            .with_label_values(&[provider.name.as_str()])
                            .observe(outcome.latency.as_secs_f64());
                    }

                    let cost_micros = pricing
                        .cost_micros(
                            &provider.name,
                            &outcome.model,
                            outcome.input_tokens,
                            outcome.output_tokens,
                        )
                        .unwrap_or_else(|| {
                            warn!(
                                provider = %provider.name,
                                model = %outcome.model,
                                "no pricing rule for provider/model, billing zero"
                            );
                            0
                        });

                    info!(
                        provider = %provider.name,
                        model = %outcome.model,
                        latency_ms = outcome.latency.as_millis() as u64,
                        cost_micros,
                        attempts = errors.len() + 1,
                        "provider call succeeded"
                    );

                    return Ok(ProviderCallResult {
                        provider: provider.name.clone(),
                        model: outcome.model,
                        content: outcome.content,
                        latency: outcome.latency,
                        input_tokens: outcome.input_tokens,
                        output_tokens: outcome.output_tokens,
                        cost_micros,
                        attempts: errors.len() + 1,
                    });
                }
                Err(failure) => {
                    self.observe_attempt(&provider.name, failure.label());
                    warn!(
                        provider = %provider.name,
                        failure = %failure,
                        "provider attempt failed, trying next"
                    );
                    errors.push(AttemptError {
                        provider: provider.name.clone(),
                        failure,
                    });
                }
            }
        }

        Err(AllProvidersFailed { errors })
    }

    async fn attempt(
        &self,
        provider: &ProviderConfig,
        prompt: &str,
    ) -> Result<AttemptOutcome, AttemptFailure> {
        let url = format!(
            "{}/chat/completions",
            provider.api_base.trim_end_matches('/')
        );
        let body = UpstreamRequest {
            model: &provider.model,
            messages: vec![UpstreamMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
        };

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", provider.api_key))
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(provider.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(
                    provider = %provider.name,
                    url = %url,
                    error = %e,
                    is_timeout = e.is_timeout(),
                    is_connect = e.is_connect(),
                    "HTTP request failed to provider"
                );
                if e.is_timeout() {
                    AttemptFailure::Timeout
                } else {
                    AttemptFailure::Connect(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptFailure::Status(status.as_u16()));
        }

        let payload: UpstreamResponse = response
            .json()
            .await
            .map_err(|e| AttemptFailure::MalformedPayload(e.to_string()))?;

        let model = payload
            .model
            .unwrap_or_else(|| provider.model.clone());
        let content = payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                AttemptFailure::MalformedPayload("response carried no message content".to_string())
            })?;

        let (input_tokens, output_tokens) = match payload.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (estimate_tokens(prompt), estimate_tokens(&content)),
        };

        Ok(AttemptOutcome {
            content,
            model,
            latency: started.elapsed(),
            input_tokens,
            output_tokens,
        })
    }

    fn observe_attempt(&self, provider: &str, outcome: &str) {
        if let Some(metrics) = try_get_metrics() {
            metrics
                .provider_attempts
                .with_label_values(&[provider, outcome])
                .inc();
        }
    }
}
