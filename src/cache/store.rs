//! Two-tier response cache with scope isolation.
//!
//! Lookups consult the fast in-process tier first, then the durable tier.
//! Durable hits are copied back into the fast tier with their original
//! creation and expiry times, so promotion never extends an entry's life.
//! Writes are screened by the sensitivity filter before admission.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::metrics::try_get_metrics;

use super::denylist::SensitiveContentFilter;
use super::key::{CacheKey, CacheScope};
use super::tier::{CacheTier, TierEntry};

/// The cached upstream response, stored as JSON bytes in the tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: CachedResponse,

    /// What the original upstream call cost, in micro-USD. A hit saves
    /// exactly this amount.
    pub cost_at_creation_micros: u64,

    /// Age of the entry at serve time.
    pub age: Duration,

    /// Serve count including this hit.
    pub hits: u64,

    /// Which tier answered: "fast" or "durable".
    pub tier: &'static str,
}

/// Admission decision for a write.
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    Stored,
    /// The request content tripped the sensitivity filter; nothing was
    /// written to any tier.
    Rejected { rule: String },
}

#[derive(Default)]
struct StoreCounters {
    fast_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    rejections: AtomicU64,
}

/// Point-in-time cache statistics for the analytics surface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub fast_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub rejections: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

pub struct CacheStore {
    fast: Arc<dyn CacheTier>,
    durable: Arc<dyn CacheTier>,
    filter: SensitiveContentFilter,
    default_ttl: Duration,
    counters: StoreCounters,
}

impl CacheStore {
    pub fn new(
        fast: Arc<dyn CacheTier>,
        durable: Arc<dyn CacheTier>,
        filter: SensitiveContentFilter,
        default_ttl: Duration,
    ) -> Self {
        Self {
            fast,
            durable,
            filter,
            default_ttl,
            counters: StoreCounters::default(),
        }
    }

    /// Look up a response visible to `scope`. Records the hit on the tier
    /// that answered.
    pub async fn get(&self, key: &CacheKey, scope: &CacheScope) -> Option<CacheHit> {
        let storage_key = scope.storage_key(key);

        if let Some(entry) = self.tier_get(&self.fast, &storage_key).await {
            if self.scope_owns(&entry, scope, &storage_key) {
                self.counters.fast_hits.fetch_add(1, Ordering::Relaxed);
                self.observe("hit_fast");
                return self.serve(&self.fast, &storage_key, entry, "fast").await;
            }
        }

        if let Some(entry) = self.tier_get(&self.durable, &storage_key).await {
            if self.scope_owns(&entry, scope, &storage_key) {
                self.counters.durable_hits.fetch_add(1, Ordering::Relaxed);
                self.observe("hit_durable");
                let mut promoted = entry.clone();
                promoted.hits += 1;
                let hit = self.serve(&self.durable, &storage_key, entry, "durable").await?;
                self.backfill(&storage_key, promoted).await;
                return Some(hit);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.observe("miss");
        debug!(key = %key, "cache miss");
        None
    }

    /// Screen both the request content and the response payload and, if
    /// admitted, write to both tiers. Tier write failures are logged and
    /// do not fail the request being served.
    pub async fn put(
        &self,
        key: &CacheKey,
        scope: &CacheScope,
        request_content: &str,
        response: &CachedResponse,
        cost_micros: u64,
        ttl: Option<Duration>,
    ) -> anyhow::Result<PutOutcome> {
        let screened = self
            .filter
            .matches(request_content)
            .or_else(|| self.filter.matches(&response.content));
        if let Some(rule) = screened {
            self.counters.rejections.fetch_add(1, Ordering::Relaxed);
            self.observe("rejected");
            debug!(%rule, "cache write rejected by sensitivity filter");
            return Ok(PutOutcome::Rejected { rule });
        }

        let payload = serde_json::to_vec(response)?;
        let entry = TierEntry::new(
            payload,
            cost_micros,
            scope.owner().map(str::to_string),
            ttl.unwrap_or(self.default_ttl),
        );
        let storage_key = scope.storage_key(key);

        if let Err(err) = self.durable.put(&storage_key, entry.clone()).await {
            warn!(tier = self.durable.name(), error = %err, "cache write failed");
        }
        if let Err(err) = self.fast.put(&storage_key, entry).await {
            warn!(tier = self.fast.name(), error = %err, "cache write failed");
        }

        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        self.observe("store");
        Ok(PutOutcome::Stored)
    }

    /// Drop expired entries from both tiers. Returns (fast, durable) counts.
    pub async fn purge_expired(&self) -> (usize, usize) {
        let fast = self.purge_tier(&self.fast).await;
        let durable = self.purge_tier(&self.durable).await;
        (fast, durable)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let fast_hits = self.counters.fast_hits.load(Ordering::Relaxed);
        let durable_hits = self.counters.durable_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let hits = fast_hits + durable_hits;
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };

        CacheStatsSnapshot {
            fast_hits,
            durable_hits,
            misses,
            stores: self.counters.stores.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            evictions: self.fast.evictions() + self.durable.evictions(),
            hit_rate,
        }
    }

    async fn tier_get(&self, tier: &Arc<dyn CacheTier>, storage_key: &str) -> Option<TierEntry> {
        match tier.get(storage_key).await {
            Ok(found) => found,
            Err(err) => {
                warn!(tier = tier.name(), error = %err, "cache read failed");
                None
            }
        }
    }

    // Storage keys already partition by owner; this guards against a
    // mis-keyed row ever crossing an isolation boundary.
    fn scope_owns(&self, entry: &TierEntry, scope: &CacheScope, storage_key: &str) -> bool {
        let owns = match scope {
            CacheScope::Shared => entry.owner.is_none(),
            CacheScope::Private(identity) => entry.owner.as_deref() == Some(identity.as_str()),
        };
        if !owns {
            warn!(%storage_key, "cache entry owner mismatch, treating as miss");
        }
        owns
    }

    async fn serve(
        &self,
        tier: &Arc<dyn CacheTier>,
        storage_key: &str,
        entry: TierEntry,
        tier_label: &'static str,
    ) -> Option<CacheHit> {
        if let Err(err) = tier.record_hit(storage_key).await {
            warn!(tier = tier.name(), error = %err, "failed to record cache hit");
        }

        let response: CachedResponse = match serde_json::from_slice(&entry.payload) {
            Ok(response) => response,
            Err(err) => {
                warn!(tier = tier.name(), error = %err, "corrupt cache payload, dropping entry");
                let _ = tier.remove(storage_key).await;
                return None;
            }
        };

        Some(CacheHit {
            response,
            cost_at_creation_micros: entry.cost_micros,
            age: entry.age(chrono::Utc::now()),
            hits: entry.hits + 1,
            tier: tier_label,
        })
    }

    // Promote a durable entry into the fast tier, keeping its original
    // creation and expiry times.
    async fn backfill(&self, storage_key: &str, entry: TierEntry) {
        if entry.is_expired(chrono::Utc::now()) {
            return;
        }
        if let Err(err) = self.fast.put(storage_key, entry).await {
            warn!(error = %err, "cache backfill failed");
            return;
        }
        self.observe("backfill");
    }

    async fn purge_tier(&self, tier: &Arc<dyn CacheTier>) -> usize {
        match tier.purge_expired().await {
            Ok(removed) => {
                if removed > 0 {
                    debug!(tier = tier.name(), removed, "purged expired cache entries");
                }
                removed
            }
            Err(err) => {
                warn!(tier = tier.name(), error = %err, "cache purge failed");
                0
            }
        }
    }

    fn observe(&self, operation: &str) {
        if let Some(metrics) = try_get_metrics() {
            metrics
                .cache_operations
                .with_label_values(&[operation])
                .inc();
        }
    }
}
