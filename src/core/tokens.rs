//! Token estimation.
//!
//! Providers report authoritative usage when they can; this estimator
//! fills in for optimization accounting and for responses that arrive
//! without usage figures.

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

static CL100K: Lazy<Option<CoreBPE>> = Lazy::new(|| tiktoken_rs::cl100k_base().ok());

/// Estimate the token count of `text` with the cl100k_base encoding,
/// falling back to a bytes-per-token heuristic if the encoder cannot
/// be built.
pub fn estimate_tokens(text: &str) -> u32 {
    match CL100K.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => ((text.len() + 3) / 4) as u32,
    }
}
