//! Credential registry and authentication.
//!
//! Credentials are stored as SHA-256 hashes keyed by hash; the plaintext
//! key exists only in the issuance response and in the caller's hands.
//! Authentication classifies failures internally (missing, malformed,
//! unknown, revoked, expired) while the HTTP surface collapses them all
//! into one uniform 401.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::CredentialConfig;
use crate::core::error::AuthReason;
use crate::core::metrics::try_get_metrics;

pub const CREDENTIAL_PREFIX: &str = "ocg_";
const CREDENTIAL_HEX_LEN: usize = 32;

/// Hash a plaintext credential for storage and lookup.
pub fn hash_credential(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Credentials are `ocg_` followed by 32 lowercase hex characters. Anything
/// else is rejected before the registry is consulted.
fn is_well_formed(key: &str) -> bool {
    let Some(body) = key.strip_prefix(CREDENTIAL_PREFIX) else {
        return false;
    };
    body.len() == CREDENTIAL_HEX_LEN
        && body
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

struct CredentialRecord {
    identity: String,
    tier: String,
    permissions: Arc<HashSet<String>>,
    expires_at: Option<DateTime<Utc>>,
    enabled: AtomicBool,
    last_used_ms: AtomicI64,
    from_config: bool,
}

/// The authenticated caller, as seen by the rest of the pipeline.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub identity: String,
    pub tier: String,
    pub permissions: Arc<HashSet<String>>,
    pub key_hash: String,
}

impl AuthContext {
    pub fn allows(&self, action: &str) -> bool {
        self.permissions.contains(action)
    }
}

/// A freshly issued credential. The plaintext is returned exactly once.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub key: String,
    pub key_hash: String,
    pub identity: String,
}

#[derive(Default)]
pub struct KeyRegistry {
    records: DashMap<String, Arc<CredentialRecord>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticate a presented credential. On success the record's
    /// last-used timestamp is updated.
    pub fn authenticate(&self, presented: Option<&str>) -> Result<AuthContext, AuthReason> {
        let result = self.classify(presented);
        if let Err(reason) = &result {
            if let Some(metrics) = try_get_metrics() {
                metrics
                    .auth_failures
                    .with_label_values(&[reason.as_str()])
                    .inc();
            }
            debug!(reason = reason.as_str(), "authentication rejected");
        }
        result
    }

    fn classify(&self, presented: Option<&str>) -> Result<AuthContext, AuthReason> {
        let key = match presented {
            Some(key) if !key.is_empty() => key,
            _ => return Err(AuthReason::Missing),
        };
        if !is_well_formed(key) {
            return Err(AuthReason::Malformed);
        }

        let key_hash = hash_credential(key);
        let record = match self.records.get(&key_hash) {
            Some(record) => Arc::clone(record.value()),
            None => return Err(AuthReason::Unknown),
        };

        if !record.enabled.load(Ordering::Relaxed) {
            return Err(AuthReason::Revoked);
        }
        if let Some(expires_at) = record.expires_at {
            if Utc::now() >= expires_at {
                return Err(AuthReason::Expired);
            }
        }

        record
            .last_used_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        Ok(AuthContext {
            identity: record.identity.clone(),
            tier: record.tier.clone(),
            permissions: Arc::clone(&record.permissions),
            key_hash,
        })
    }

    /// Mint a new credential. The returned plaintext is not retained.
    pub fn issue(
        &self,
        identity: &str,
        tier: &str,
        permissions: impl IntoIterator<Item = String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> IssuedCredential {
        let mut bytes = [0u8; CREDENTIAL_HEX_LEN / 2];
        rand::thread_rng().fill(&mut bytes);
        let key = format!("{CREDENTIAL_PREFIX}{}", hex::encode(bytes));
        let key_hash = hash_credential(&key);

        self.records.insert(
            key_hash.clone(),
            Arc::new(CredentialRecord {
                identity: identity.to_string(),
                tier: tier.to_string(),
                permissions: Arc::new(permissions.into_iter().collect()),
                expires_at,
                enabled: AtomicBool::new(true),
                last_used_ms: AtomicI64::new(0),
                from_config: false,
            }),
        );

        info!(identity, tier, "issued credential");
        IssuedCredential {
            key,
            key_hash,
            identity: identity.to_string(),
        }
    }

    /// Disable a credential. The record is kept so later presentations
    /// classify as revoked rather than unknown.
    pub fn revoke(&self, key_hash: &str) -> bool {
        match self.records.get(key_hash) {
            Some(record) => {
                record.enabled.store(false, Ordering::Relaxed);
                info!(identity = %record.identity, "revoked credential");
                true
            }
            None => false,
        }
    }

    /// Replace a credential: revoke the old one and issue a fresh key with
    /// the same identity, tier, permissions and expiry.
    pub fn rotate(&self, key_hash: &str) -> Option<IssuedCredential> {
        let record = Arc::clone(self.records.get(key_hash)?.value());
        record.enabled.store(false, Ordering::Relaxed);

        let issued = self.issue(
            &record.identity,
            &record.tier,
            record.permissions.iter().cloned(),
            record.expires_at,
        );
        info!(identity = %record.identity, "rotated credential");
        Some(issued)
    }

    /// Reconcile config-sourced records with the credential list: new
    /// hashes are added, existing ones updated, and config records whose
    /// hash disappeared are dropped. Runtime-issued credentials are left
    /// untouched.
    pub fn sync_from_config(&self, credentials: &[CredentialConfig]) {
        let configured: HashSet<&str> = credentials.iter().map(|c| c.key_hash.as_str()).collect();

        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.from_config && !configured.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();
        for key_hash in stale {
            self.records.remove(&key_hash);
            debug!("removed credential absent from config");
        }

        for credential in credentials {
            if credential.key_hash.len() != 64 {
                warn!(identity = %credential.identity, "skipping credential with malformed key hash");
                continue;
            }
            let last_used = self
                .records
                .get(&credential.key_hash)
                .map(|r| r.last_used_ms.load(Ordering::Relaxed))
                .unwrap_or(0);

            self.records.insert(
                credential.key_hash.clone(),
                Arc::new(CredentialRecord {
                    identity: credential.identity.clone(),
                    tier: credential.tier.clone(),
                    permissions: Arc::new(credential.permissions.iter().cloned().collect()),
                    expires_at: credential.expires_at,
                    enabled: AtomicBool::new(credential.enabled),
                    last_used_ms: AtomicI64::new(last_used),
                    from_config: true,
                }),
            );
        }

        info!(total = self.records.len(), "credential registry synced");
    }

    /// Last successful authentication time for a credential, if any.
    pub fn last_used(&self, key_hash: &str) -> Option<DateTime<Utc>> {
        let record = self.records.get(key_hash)?;
        let millis = record.last_used_ms.load(Ordering::Relaxed);
        if millis == 0 {
            return None;
        }
        DateTime::from_timestamp_millis(millis)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
