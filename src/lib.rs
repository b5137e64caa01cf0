//! THE APEX ENGINE
//!
//! Low-latency opportunity-to-execution trading core for Solana-like
//! ledgers. The library exposes the full pipeline:
//! - Priority scheduler with bounded, scored admission
//! - Provider-aware submission routing under circuit-breaker constraints
//! - Bundle/retry execution core with full-jitter backoff and MEV timing
//! - Risk engine with trading-halt conditions and reproducible sizing
//! - Snipe feasibility evaluation for new-pool events
//! - Triangular / cross-venue / statistical arbitrage detection
//!
//! External concerns (market data ingestion, quote APIs, relays, RPC,
//! persistence transports) are consumed through narrow traits; reference
//! HTTP clients and deterministic test doubles ship alongside.

pub mod config;
pub mod engine;
pub mod models;
pub mod modules;

// Re-export commonly used items
pub use config::Config;
pub use engine::{Collaborators, EngineStats, TradingEngine};
pub use models::{
    ExecutionOutcome, Opportunity, OpportunityKind, Portfolio, PortfolioSnapshot, Provider,
    ProviderCapability, SubmissionPlan, SubmissionStrategy, Urgency,
};
pub use modules::error_handling::{EngineError, ErrorKind};
pub use modules::scheduler::{SubmitOutcome, SubmitReject};
pub use modules::sniper::{PoolCreationEvent, SnipeDecision};
