//! Business logic services for the gateway.
//!
//! This module contains the pipeline components: credential registry,
//! quota ledger, optimizer strategies, provider router, usage recorder,
//! settlement collaborator, and the controller that wires them together.

pub mod gateway;
pub mod key_registry;
pub mod optimizer;
pub mod pricing;
pub mod provider_router;
pub mod quota_ledger;
pub mod settlement;
pub mod usage_recorder;

// Re-export commonly used types
pub use gateway::{CompletionKind, CompletionOutcome, CompletionRequest, Gateway, GatewayComponents, GatewayPolicy};
pub use key_registry::{AuthContext, KeyRegistry};
pub use optimizer::{optimizer_from_name, PromptOptimizer};
pub use pricing::{PricingBook, PricingTable};
pub use provider_router::{AllProvidersFailed, ProviderCallResult, ProviderRouter};
pub use quota_ledger::{QuotaLedger, QuotaSnapshot};
pub use settlement::{SettlementGateway, SimulatedSettlement, WalletDirectory};
pub use usage_recorder::{UsageDraft, UsageRecord, UsageRecorder, UsageSink};
