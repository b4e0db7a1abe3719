//! Two-tier response cache.
//!
//! Keys are derived from normalized request content, entries carry an
//! absolute TTL and an owning scope, and writes pass through a
//! sensitivity filter before admission.

pub mod denylist;
pub mod key;
pub mod postgres;
pub mod store;
pub mod tier;

pub use denylist::SensitiveContentFilter;
pub use key::{CacheKey, CacheScope};
pub use postgres::PostgresTier;
pub use store::{CacheHit, CacheStore, CacheStatsSnapshot, CachedResponse, PutOutcome};
pub use tier::{CacheTier, MemoryTier, TierEntry};
