//! Cache tier abstraction and the in-process tier.
//!
//! The store composes two tiers behind [`CacheTier`]: a small fast in-process
//! tier and a durable tier shared across instances. Tests inject in-memory
//! tiers for both, production wiring uses Postgres for the durable one.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One stored cache entry as handed between tiers.
#[derive(Debug, Clone, PartialEq)]
pub struct TierEntry {
    /// Serialized payload bytes
    pub payload: Vec<u8>,

    /// Provider cost of the response this entry replaced, in micro-USD
    pub cost_micros: u64,

    /// Owning identity for private entries, `None` for shared
    pub owner: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Absolute expiry. Fixed at creation and never extended by hits.
    pub expires_at: DateTime<Utc>,

    /// Number of times this entry has been served
    pub hits: u64,
}

impl TierEntry {
    pub fn new(payload: Vec<u8>, cost_micros: u64, owner: Option<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero());
        Self {
            payload,
            cost_micros,
            owner,
            created_at: now,
            expires_at: now + ttl,
            hits: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Age of the entry relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A single cache tier. Implementations enforce TTL on reads; an expired
/// entry is never returned.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Tier name for logs and stats.
    fn name(&self) -> &'static str;

    /// Look up an entry. Expired entries are dropped and reported as absent.
    async fn get(&self, key: &str) -> anyhow::Result<Option<TierEntry>>;

    /// Insert or replace an entry.
    async fn put(&self, key: &str, entry: TierEntry) -> anyhow::Result<()>;

    /// Bump the hit counter of an entry, if it still exists.
    async fn record_hit(&self, key: &str) -> anyhow::Result<()>;

    /// Remove an entry.
    async fn remove(&self, key: &str) -> anyhow::Result<()>;

    /// Number of live entries.
    async fn len(&self) -> anyhow::Result<usize>;

    /// Drop expired entries, returning how many were removed.
    async fn purge_expired(&self) -> anyhow::Result<usize>;

    /// Entries this tier has dropped for expiry or capacity.
    fn evictions(&self) -> u64 {
        0
    }
}

struct StoredEntry {
    payload: Vec<u8>,
    cost_micros: u64,
    owner: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    hits: AtomicU64,
    last_accessed: AtomicI64,
}

impl StoredEntry {
    fn from_entry(entry: TierEntry) -> Self {
        Self {
            payload: entry.payload,
            cost_micros: entry.cost_micros,
            owner: entry.owner,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            hits: AtomicU64::new(entry.hits),
            last_accessed: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    fn to_entry(&self) -> TierEntry {
        TierEntry {
            payload: self.payload.clone(),
            cost_micros: self.cost_micros,
            owner: self.owner.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            hits: self.hits.load(Ordering::Relaxed),
        }
    }
}

/// Bounded in-process tier with least-recently-accessed eviction.
pub struct MemoryTier {
    entries: DashMap<String, StoredEntry>,
    capacity: usize,
    evictions: AtomicU64,
    // Serializes the len check and eviction scan so concurrent inserts
    // cannot blow past capacity.
    insert_lock: Mutex<()>,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            evictions: AtomicU64::new(0),
            insert_lock: Mutex::new(()),
        }
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.last_accessed.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<TierEntry>> {
        let now = Utc::now();

        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) => {
                if now < entry.expires_at {
                    entry
                        .last_accessed
                        .store(now.timestamp_millis(), Ordering::Relaxed);
                    return Ok(Some(entry.to_entry()));
                }
                true
            }
        };

        if expired && self.entries.remove(key).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, entry: TierEntry) -> anyhow::Result<()> {
        if self.entries.contains_key(key) {
            self.entries
                .insert(key.to_string(), StoredEntry::from_entry(entry));
            return Ok(());
        }

        let _guard = self.insert_lock.lock().unwrap_or_else(|e| e.into_inner());
        while self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries
            .insert(key.to_string(), StoredEntry::from_entry(entry));
        Ok(())
    }

    async fn record_hit(&self, key: &str) -> anyhow::Result<()> {
        if let Some(entry) = self.entries.get(key) {
            entry.hits.fetch_add(1, Ordering::Relaxed);
            entry
                .last_accessed
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn len(&self) -> anyhow::Result<usize> {
        Ok(self.entries.len())
    }

    async fn purge_expired(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| now >= entry.expires_at)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}
