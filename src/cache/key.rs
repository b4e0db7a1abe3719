//! Cache key derivation.
//!
//! Keys are a stable SHA-256 over case/whitespace-normalized request content
//! joined with a routing dimension, so semantically identical requests
//! collide onto one entry while requests routed differently never do.

use sha2::{Digest, Sha256};

/// Visibility of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    /// Visible to every identity
    Shared,
    /// Visible only to the owning identity
    Private(String),
}

impl CacheScope {
    /// The storage key under which an entry lives. Private entries are
    /// partitioned by owner so two identities caching the same content
    /// never read or overwrite each other.
    pub fn storage_key(&self, key: &CacheKey) -> String {
        match self {
            CacheScope::Shared => format!("s:{}", key.as_str()),
            CacheScope::Private(identity) => format!("p:{}:{}", identity, key.as_str()),
        }
    }

    /// Owner recorded on the stored entry, checked again on reads.
    pub fn owner(&self) -> Option<&str> {
        match self {
            CacheScope::Shared => None,
            CacheScope::Private(identity) => Some(identity),
        }
    }
}

/// A derived cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from request content and a routing dimension.
    pub fn derive(content: &str, dimension: &str) -> Self {
        let normalized = normalize(content);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update([0x1f]);
        hasher.update(dimension.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize request content for key derivation: lowercase, trimmed, with
/// whitespace runs collapsed to single spaces.
pub fn normalize(content: &str) -> String {
    content
        .split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize("  Hello   world \n"), "hello world");
        assert_eq!(normalize("a\tb\r\nc"), "a b c");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize("  WHAT is   Rust? ");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn test_key_stable_across_whitespace_and_case() {
        let a = CacheKey::derive("What is Rust?", "openai");
        let b = CacheKey::derive("  what   IS rust? ", "openai");
        assert_eq!(a, b);
    }

    #[test]
    fn test_routing_dimension_partitions_keys() {
        let a = CacheKey::derive("What is Rust?", "openai");
        let b = CacheKey::derive("What is Rust?", "anthropic");
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_content_different_keys() {
        let a = CacheKey::derive("What is Rust?", "auto");
        let b = CacheKey::derive("What is Go?", "auto");
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_is_hex_digest() {
        let key = CacheKey::derive("prompt", "auto");
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_storage_key_partitions_by_scope() {
        let key = CacheKey::derive("prompt", "auto");
        let shared = CacheScope::Shared.storage_key(&key);
        let alpha = CacheScope::Private("acct_alpha".to_string()).storage_key(&key);
        let beta = CacheScope::Private("acct_beta".to_string()).storage_key(&key);

        assert_ne!(shared, alpha);
        assert_ne!(alpha, beta);
        assert!(shared.starts_with("s:"));
        assert!(alpha.starts_with("p:acct_alpha:"));
    }

    #[test]
    fn test_scope_owner() {
        assert_eq!(CacheScope::Shared.owner(), None);
        assert_eq!(
            CacheScope::Private("acct_alpha".to_string()).owner(),
            Some("acct_alpha")
        );
    }
}
