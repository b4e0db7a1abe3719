//! Payment settlement collaborator.
//!
//! Settlement is opaque to the gateway: a billed fee goes in, a
//! confirmation reference comes out. The response path never waits on
//! confirmation; settlements run detached and land in the log.

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::{GatewayError, Result};

static WALLET_FORMAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").unwrap());

pub fn is_valid_wallet(address: &str) -> bool {
    WALLET_FORMAT.is_match(address)
}

/// Maps identities to their linked settlement wallet.
#[derive(Default)]
pub struct WalletDirectory {
    wallets: DashMap<String, String>,
}

impl WalletDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link a wallet to an identity, replacing any previous link.
    pub fn link(&self, identity: &str, address: &str) -> Result<()> {
        if !is_valid_wallet(address) {
            return Err(GatewayError::Validation(
                "walletAddress must be a 0x-prefixed 40 hex character address".to_string(),
            ));
        }
        self.wallets
            .insert(identity.to_string(), address.to_string());
        debug!(identity, "wallet linked");
        Ok(())
    }

    pub fn wallet_for(&self, identity: &str) -> Option<String> {
        self.wallets.get(identity).map(|w| w.clone())
    }
}

#[derive(Debug, Clone)]
pub struct SettlementReceipt {
    pub reference: String,
}

/// Opaque payment confirmation backend.
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    async fn settle(
        &self,
        identity: &str,
        wallet: Option<&str>,
        fee_micros: u64,
    ) -> anyhow::Result<SettlementReceipt>;
}

/// Local stand-in backend: always confirms with a synthetic reference.
pub struct SimulatedSettlement;

#[async_trait]
impl SettlementGateway for SimulatedSettlement {
    async fn settle(
        &self,
        identity: &str,
        wallet: Option<&str>,
        fee_micros: u64,
    ) -> anyhow::Result<SettlementReceipt> {
        let reference = format!("x402-sim-{}", Uuid::new_v4().simple());
        debug!(
            identity,
            wallet = wallet.unwrap_or("unlinked"),
            fee_micros,
            reference = %reference,
            "settlement simulated"
        );
        Ok(SettlementReceipt { reference })
    }
}

/// Queue a settlement without blocking the response. Zero-fee requests
/// settle nothing.
pub fn spawn_settlement(
    gateway: Arc<dyn SettlementGateway>,
    identity: String,
    wallet: Option<String>,
    fee_micros: u64,
    request_id: String,
) {
    if fee_micros == 0 {
        return;
    }
    tokio::spawn(async move {
        match gateway.settle(&identity, wallet.as_deref(), fee_micros).await {
            Ok(receipt) => debug!(
                request_id = %request_id,
                reference = %receipt.reference,
                fee_micros,
                "settlement confirmed"
            ),
            Err(err) => warn!(
                request_id = %request_id,
                error = %err,
                fee_micros,
                "settlement failed"
            ),
        }
    });
}
