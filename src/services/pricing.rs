//! Provider pricing and request cost computation.
//!
//! Rates are integer micro-USD per million tokens, so cost arithmetic
//! stays exact and aggregates can be maintained with atomic adds. The
//! live table sits behind an `ArcSwap` and can be replaced at runtime
//! without pausing request traffic.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::core::config::PricingRuleConfig;

/// Rates for one (provider, model prefix) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub input_per_mtok_micros: u64,
    pub output_per_mtok_micros: u64,
    pub request_fee_micros: u64,
}

const TOKENS_PER_MTOK: u64 = 1_000_000;

impl Rate {
    /// Cost of one call at this rate, in micro-USD. Token components
    /// round down; sub-micro remainders are not billed.
    pub fn cost_micros(&self, input_tokens: u32, output_tokens: u32) -> u64 {
        let input = input_tokens as u64 * self.input_per_mtok_micros / TOKENS_PER_MTOK;
        let output = output_tokens as u64 * self.output_per_mtok_micros / TOKENS_PER_MTOK;
        self.request_fee_micros + input + output
    }
}

/// Immutable snapshot of all pricing rules. Lookup is longest matching
/// model prefix within a provider; an empty prefix is the provider-wide
/// default.
#[derive(Debug, Default)]
pub struct PricingTable {
    rules: HashMap<String, Vec<(String, Rate)>>,
}

impl PricingTable {
    pub fn from_config(rules: &[PricingRuleConfig]) -> Self {
        let mut by_provider: HashMap<String, Vec<(String, Rate)>> = HashMap::new();
        for rule in rules {
            by_provider
                .entry(rule.provider.clone())
                .or_default()
                .push((
                    rule.model_prefix.clone(),
                    Rate {
                        input_per_mtok_micros: rule.input_per_mtok_micros,
                        output_per_mtok_micros: rule.output_per_mtok_micros,
                        request_fee_micros: rule.request_fee_micros,
                    },
                ));
        }
        for prefixes in by_provider.values_mut() {
            prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        }
        Self { rules: by_provider }
    }

    pub fn rate(&self, provider: &str, model: &str) -> Option<Rate> {
        self.rules
            .get(provider)?
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, rate)| *rate)
    }

    /// Cost of a call, or `None` when no rule covers the provider/model.
    pub fn cost_micros(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Option<u64> {
        self.rate(provider, model)
            .map(|rate| rate.cost_micros(input_tokens, output_tokens))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Hot-swappable pricing table shared across the router and controller.
pub struct PricingBook {
    table: arc_swap::ArcSwap<PricingTable>,
}

impl PricingBook {
    pub fn new(table: PricingTable) -> Self {
        Self {
            table: arc_swap::ArcSwap::from_pointee(table),
        }
    }

    /// Current table (zero-cost read).
    pub fn get(&self) -> arc_swap::Guard<Arc<PricingTable>> {
        self.table.load()
    }

    /// Swap in a refreshed table.
    pub fn replace(&self, table: PricingTable) {
        self.table.store(Arc::new(table));
        info!("pricing table replaced");
    }
}
