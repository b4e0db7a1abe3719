//! Request admission control.
//!
//! Two guards run in sequence. A coarse per-origin limiter sheds abusive
//! traffic before any credential work happens, then a fixed-window counter
//! enforces the authenticated identity's tier quota. The window counter
//! increments and checks under one entry lock, so concurrent requests can
//! never admit more than the tier limit within a window.

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core::config::QuotaConfig;
use crate::core::error::{GatewayError, QuotaScope, Result};
use crate::core::metrics::try_get_metrics;

type OriginLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

// Denied origins get a flat hint; the limiter refills within a second.
const ORIGIN_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct TierLimit {
    limit: u32,
    window: Duration,
}

#[derive(Debug)]
struct WindowSlot {
    window_start: Instant,
    count: u32,
}

/// Identity quota state after a successful admission or peek.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_in: Duration,
}

pub struct QuotaLedger {
    tiers: HashMap<String, TierLimit>,
    windows: DashMap<String, WindowSlot>,
    origin: OriginLimiter,
}

impl QuotaLedger {
    pub fn new(config: &QuotaConfig) -> Self {
        let tiers = config
            .tiers
            .iter()
            .map(|(name, tier)| {
                (
                    name.clone(),
                    TierLimit {
                        limit: tier.limit,
                        window: Duration::from_secs(tier.window_secs.max(1)),
                    },
                )
            })
            .collect();

        let quota = Quota::per_second(
            NonZeroU32::new(config.origin.requests_per_second).unwrap_or(nonzero!(1u32)),
        )
        .allow_burst(NonZeroU32::new(config.origin.burst_size).unwrap_or(nonzero!(10u32)));

        Self {
            tiers,
            windows: DashMap::new(),
            origin: RateLimiter::keyed(quota),
        }
    }

    /// Coarse per-origin check. Runs before authentication so floods never
    /// reach credential hashing.
    pub fn check_origin(&self, addr: IpAddr) -> Result<()> {
        if self.origin.check_key(&addr).is_err() {
            if let Some(metrics) = try_get_metrics() {
                metrics
                    .quota_rejections
                    .with_label_values(&[QuotaScope::Origin.as_str()])
                    .inc();
            }
            debug!(origin = %addr, "origin over rate limit");
            return Err(GatewayError::QuotaExceeded {
                scope: QuotaScope::Origin,
                retry_after: ORIGIN_RETRY_AFTER,
            });
        }
        Ok(())
    }

    /// Count one request against the identity's fixed window. The
    /// increment and the limit check happen under a single entry lock.
    pub fn admit(&self, identity: &str, tier: &str) -> Result<QuotaSnapshot> {
        let tier_limit = self.tier_limit(tier)?;

        let mut slot = self
            .windows
            .entry(identity.to_string())
            .or_insert_with(|| WindowSlot {
                window_start: Instant::now(),
                count: 0,
            });

        let now = Instant::now();
        let elapsed = now.duration_since(slot.window_start);
        if elapsed >= tier_limit.window {
            slot.window_start = now;
            slot.count = 0;
        }

        if slot.count >= tier_limit.limit {
            let retry_after = tier_limit
                .window
                .saturating_sub(now.duration_since(slot.window_start));
            drop(slot);

            if let Some(metrics) = try_get_metrics() {
                metrics
                    .quota_rejections
                    .with_label_values(&[QuotaScope::Identity.as_str()])
                    .inc();
            }
            debug!(identity, tier, "identity quota exhausted");
            return Err(GatewayError::QuotaExceeded {
                scope: QuotaScope::Identity,
                retry_after,
            });
        }

        slot.count += 1;
        Ok(QuotaSnapshot {
            limit: tier_limit.limit,
            remaining: tier_limit.limit - slot.count,
            reset_in: tier_limit
                .window
                .saturating_sub(now.duration_since(slot.window_start)),
        })
    }

    /// Read the identity's quota state without consuming a request.
    pub fn peek(&self, identity: &str, tier: &str) -> Result<QuotaSnapshot> {
        let tier_limit = self.tier_limit(tier)?;
        let now = Instant::now();

        let snapshot = match self.windows.get(identity) {
            Some(slot) if now.duration_since(slot.window_start) < tier_limit.window => {
                QuotaSnapshot {
                    limit: tier_limit.limit,
                    remaining: tier_limit.limit.saturating_sub(slot.count),
                    reset_in: tier_limit
                        .window
                        .saturating_sub(now.duration_since(slot.window_start)),
                }
            }
            _ => QuotaSnapshot {
                limit: tier_limit.limit,
                remaining: tier_limit.limit,
                reset_in: tier_limit.window,
            },
        };
        Ok(snapshot)
    }

    /// Drop idle origin state and identity windows that have fully lapsed.
    pub fn sweep(&self) {
        self.origin.retain_recent();

        let now = Instant::now();
        let tiers = &self.tiers;
        let max_window = tiers
            .values()
            .map(|t| t.window)
            .max()
            .unwrap_or(Duration::from_secs(3600));
        self.windows
            .retain(|_, slot| now.duration_since(slot.window_start) < max_window * 2);
    }

    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }

    fn tier_limit(&self, tier: &str) -> Result<TierLimit> {
        self.tiers
            .get(tier)
            .copied()
            .ok_or_else(|| GatewayError::Internal(format!("unknown quota tier: {tier}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{OriginQuotaConfig, TierQuotaConfig};
    use std::sync::Arc;

    fn ledger_with(limit: u32, window_secs: u64) -> QuotaLedger {
        let mut tiers = HashMap::new();
        tiers.insert(
            "free".to_string(),
            TierQuotaConfig {
                limit,
                window_secs,
            },
        );
        QuotaLedger::new(&QuotaConfig {
            tiers,
            origin: OriginQuotaConfig {
                requests_per_second: 1,
                burst_size: 2,
                sweep_interval_secs: 60,
            },
        })
    }

    #[test]
    fn test_admissions_decrement_remaining() {
        let ledger = ledger_with(3, 3600);

        let first = ledger.admit("acct_alpha", "free").unwrap();
        assert_eq!(first.limit, 3);
        assert_eq!(first.remaining, 2);

        let second = ledger.admit("acct_alpha", "free").unwrap();
        assert_eq!(second.remaining, 1);
        assert!(second.reset_in <= Duration::from_secs(3600));
    }

    #[test]
    fn test_exhausted_window_denies_with_retry_after() {
        let ledger = ledger_with(2, 3600);
        ledger.admit("acct_alpha", "free").unwrap();
        ledger.admit("acct_alpha", "free").unwrap();

        let err = ledger.admit("acct_alpha", "free").unwrap_err();
        match err {
            GatewayError::QuotaExceeded { scope, retry_after } => {
                assert_eq!(scope, QuotaScope::Identity);
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(3600));
            }
            other => panic!("expected quota error, got {other:?}"),
        }
    }

    #[test]
    fn test_window_rollover_restores_quota() {
        let ledger = ledger_with(1, 1);
        ledger.admit("acct_alpha", "free").unwrap();
        assert!(ledger.admit("acct_alpha", "free").is_err());

        std::thread::sleep(Duration::from_millis(1100));
        let snapshot = ledger.admit("acct_alpha", "free").unwrap();
        assert_eq!(snapshot.remaining, 0);
    }

    #[test]
    fn test_identities_do_not_share_windows() {
        let ledger = ledger_with(1, 3600);
        ledger.admit("acct_alpha", "free").unwrap();
        assert!(ledger.admit("acct_alpha", "free").is_err());
        assert!(ledger.admit("acct_beta", "free").is_ok());
    }

    #[test]
    fn test_concurrent_admissions_never_exceed_limit() {
        let ledger = Arc::new(ledger_with(2, 3600));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.admit("acct_alpha", "free").is_ok())
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|&ok| ok)
            .count();
        assert_eq!(admitted, 2);
    }

    #[test]
    fn test_unknown_tier_is_internal_error() {
        let ledger = ledger_with(2, 3600);
        let err = ledger.admit("acct_alpha", "enterprise").unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let ledger = ledger_with(2, 3600);
        ledger.admit("acct_alpha", "free").unwrap();

        let peeked = ledger.peek("acct_alpha", "free").unwrap();
        assert_eq!(peeked.remaining, 1);
        let peeked_again = ledger.peek("acct_alpha", "free").unwrap();
        assert_eq!(peeked_again.remaining, 1);

        let unseen = ledger.peek("acct_new", "free").unwrap();
        assert_eq!(unseen.remaining, 2);
    }

    #[test]
    fn test_origin_burst_then_denied() {
        let ledger = ledger_with(100, 3600);
        let addr: IpAddr = "203.0.113.7".parse().unwrap();

        assert!(ledger.check_origin(addr).is_ok());
        assert!(ledger.check_origin(addr).is_ok());
        let err = ledger.check_origin(addr).unwrap_err();
        match err {
            GatewayError::QuotaExceeded { scope, .. } => assert_eq!(scope, QuotaScope::Origin),
            other => panic!("expected quota error, got {other:?}"),
        }

        // A different origin is unaffected
        let other: IpAddr = "203.0.113.8".parse().unwrap();
        assert!(ledger.check_origin(other).is_ok());
    }

    #[test]
    fn test_sweep_drops_lapsed_windows() {
        let ledger = ledger_with(5, 1);
        ledger.admit("acct_alpha", "free").unwrap();
        assert_eq!(ledger.tracked_identities(), 1);

        std::thread::sleep(Duration::from_millis(2100));
        ledger.sweep();
        assert_eq!(ledger.tracked_identities(), 0);
    }
}
