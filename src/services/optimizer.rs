//! Prompt optimization strategies.
//!
//! Each strategy is a pure, deterministic text transformation with no
//! I/O. The gateway treats optimization as best-effort: a strategy
//! error leaves the prompt untouched, while auth and quota failures
//! always reject.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use crate::core::tokens::estimate_tokens;

/// Result of one optimization pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimization {
    pub text: String,

    /// Estimated tokens removed relative to the input. Negative values
    /// mean the strategy grew the prompt, which the gateway tolerates.
    pub estimated_token_delta: i64,
}

pub trait PromptOptimizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transform the prompt. Must be deterministic for a given input.
    fn optimize(&self, text: &str) -> anyhow::Result<Optimization>;
}

fn measured(original: &str, optimized: String) -> Optimization {
    let delta = estimate_tokens(original) as i64 - estimate_tokens(&optimized) as i64;
    Optimization {
        text: optimized,
        estimated_token_delta: delta,
    }
}

/// Passes prompts through untouched.
pub struct NoopOptimizer;

impl PromptOptimizer for NoopOptimizer {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn optimize(&self, text: &str) -> anyhow::Result<Optimization> {
        Ok(Optimization {
            text: text.to_string(),
            estimated_token_delta: 0,
        })
    }
}

/// Collapses whitespace runs into single spaces and trims the ends.
pub struct WhitespaceOptimizer;

impl PromptOptimizer for WhitespaceOptimizer {
    fn name(&self) -> &'static str {
        "whitespace"
    }

    fn optimize(&self, text: &str) -> anyhow::Result<Optimization> {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        Ok(measured(text, collapsed))
    }
}

// Politeness filler that carries no signal for the model. Matched
// case-insensitively against the collapsed prompt.
const FILLER_PHRASES: &[&str] = &[
    "i was wondering if you could ",
    "i would like you to ",
    "could you please ",
    "can you please ",
    "would you kindly ",
    "please ",
    "kindly ",
];

static REPEATED_EXCLAMATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"!{2,}").unwrap());
static REPEATED_QUESTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\?{2,}").unwrap());

/// Whitespace collapse plus filler-phrase removal and punctuation
/// squeezing.
pub struct ConciseOptimizer;

impl ConciseOptimizer {
    fn strip_fillers(text: &str) -> String {
        let mut result = text.to_string();
        for phrase in FILLER_PHRASES {
            result = remove_case_insensitive(&result, phrase);
        }
        result
    }
}

fn remove_case_insensitive(text: &str, phrase: &str) -> String {
    let lowered = text.to_lowercase();
    let mut result = String::with_capacity(text.len());
    let mut last_end = 0;
    for (start, _) in lowered.match_indices(phrase) {
        if start < last_end {
            continue;
        }
        result.push_str(&text[last_end..start]);
        last_end = start + phrase.len();
    }
    result.push_str(&text[last_end..]);
    result
}

impl PromptOptimizer for ConciseOptimizer {
    fn name(&self) -> &'static str {
        "concise"
    }

    fn optimize(&self, text: &str) -> anyhow::Result<Optimization> {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let stripped = Self::strip_fillers(&collapsed);
        let squeezed = REPEATED_EXCLAMATION.replace_all(&stripped, "!");
        let squeezed = REPEATED_QUESTION.replace_all(&squeezed, "?");
        Ok(measured(text, squeezed.trim().to_string()))
    }
}

/// Look up a strategy by its configured name.
pub fn optimizer_from_name(name: &str) -> Option<Arc<dyn PromptOptimizer>> {
    match name {
        "noop" => Some(Arc::new(NoopOptimizer)),
        "whitespace" => Some(Arc::new(WhitespaceOptimizer)),
        "concise" => Some(Arc::new(ConciseOptimizer)),
        _ => None,
    }
}
