// Submission plans and execution outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::opportunity::OpportunityKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubmissionStrategy {
    Standard,
    MevProtected,
    Bundle,
    FlashLoan,
}

impl SubmissionStrategy {
    /// Bundle-style strategies ride a relay and carry a tip.
    pub fn uses_bundle_relay(&self) -> bool {
        matches!(
            self,
            SubmissionStrategy::Bundle | SubmissionStrategy::MevProtected | SubmissionStrategy::FlashLoan
        )
    }
}

impl std::fmt::Display for SubmissionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmissionStrategy::Standard => write!(f, "standard"),
            SubmissionStrategy::MevProtected => write!(f, "mev_protected"),
            SubmissionStrategy::Bundle => write!(f, "bundle"),
            SubmissionStrategy::FlashLoan => write!(f, "flash_loan"),
        }
    }
}

/// One submission attempt, synthesized by the router and completed by the
/// execution core. Plans are never reused across retries: each retry
/// re-quotes and rebuilds with a fresh priority fee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionPlan {
    pub provider: String,
    pub transactions: Vec<String>,
    pub priority_fee: u64,
    pub tip: u64,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub skip_preflight: bool,
    pub strategy: SubmissionStrategy,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionErrorInfo {
    pub kind: String,
    pub message: String,
}

/// Terminal record of one opportunity's trip through the pipeline. This is
/// the unit the persistence sink appends and the risk engine commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub opportunity_id: String,
    pub kind: OpportunityKind,
    pub success: bool,
    pub executed_price: f64,
    pub executed_qty: f64,
    pub requested_price: f64,
    pub slippage_pct: f64,
    pub elapsed_ms: u64,
    pub fees: f64,
    pub actual_profit: f64,
    pub tx_hash: Option<String>,
    pub bundle_id: Option<String>,
    pub error: Option<ExecutionErrorInfo>,
    pub provider_used: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionOutcome {
    /// Slippage as a percentage of the requested price. Kept as a free
    /// function of the persisted fields so a replay from storage reproduces
    /// the recorded value exactly.
    pub fn compute_slippage_pct(executed_price: f64, requested_price: f64) -> f64 {
        if requested_price == 0.0 {
            return 0.0;
        }
        ((executed_price - requested_price).abs() / requested_price) * 100.0
    }

    /// Bundle profit: observed balance delta minus fees. May be negative;
    /// the caller must not clamp it.
    pub fn compute_bundle_profit(observed_sol_delta: f64, fees: f64) -> f64 {
        observed_sol_delta - fees
    }
}
