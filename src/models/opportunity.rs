// Opportunity model
// Immutable description of a trade the engine may execute

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::modules::error_handling::EngineError;

/// What class of trade an opportunity describes. The kind constrains the
/// legal symbol/venue arity and drives retry budgets and routing strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OpportunityKind {
    Triangular,
    CrossVenue,
    Statistical,
    FlashLoanSnipe,
    ManualTarget,
}

impl std::fmt::Display for OpportunityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpportunityKind::Triangular => write!(f, "triangular"),
            OpportunityKind::CrossVenue => write!(f, "cross_venue"),
            OpportunityKind::Statistical => write!(f, "statistical"),
            OpportunityKind::FlashLoanSnipe => write!(f, "flash_loan_snipe"),
            OpportunityKind::ManualTarget => write!(f, "manual_target"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

impl Urgency {
    /// Additive priority bonus used by the scheduler.
    pub fn priority_bonus(&self) -> f64 {
        match self {
            Urgency::Low => 0.0,
            Urgency::Normal => 0.1,
            Urgency::High => 0.2,
            Urgency::Critical => 0.3,
        }
    }

    /// Multiplier applied to the provider fee estimate by the router.
    pub fn fee_factor(&self) -> f64 {
        match self {
            Urgency::Low => 1.0,
            Urgency::Normal => 1.2,
            Urgency::High => 1.6,
            Urgency::Critical => 2.0,
        }
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Urgency::Low => write!(f, "low"),
            Urgency::Normal => write!(f, "normal"),
            Urgency::High => write!(f, "high"),
            Urgency::Critical => write!(f, "critical"),
        }
    }
}

/// Assessed exposure to frontrunning for a given opportunity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MevRisk {
    Low,
    Medium,
    High,
}

/// A described trade the engine may execute. Immutable once published:
/// producers construct it, `validate()` gates admission, and nothing
/// downstream mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub kind: OpportunityKind,
    pub symbols: Vec<String>,
    pub venues: Vec<String>,
    pub input_amount: f64,
    pub expected_output: f64,
    pub expected_profit: f64,
    pub max_slippage_bps: u16,
    pub urgency: Urgency,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub required_capital: f64,
    pub flash_loan_amount: Option<f64>,
    pub metadata: HashMap<String, String>,
}

impl Opportunity {
    /// Check the publication invariants. Producers call this before
    /// handing the opportunity to the scheduler; the scheduler calls it
    /// again on untrusted external submissions.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id.is_empty() {
            return Err(EngineError::Invariant("opportunity id is empty".into()));
        }
        if self.deadline <= self.created_at {
            return Err(EngineError::Invariant(format!(
                "opportunity {}: deadline {} not after created_at {}",
                self.id, self.deadline, self.created_at
            )));
        }
        if self.expected_profit < 0.0 {
            return Err(EngineError::Invariant(format!(
                "opportunity {}: negative expected_profit {}",
                self.id, self.expected_profit
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(EngineError::Invariant(format!(
                "opportunity {}: confidence {} outside [0,1]",
                self.id, self.confidence
            )));
        }
        if self.input_amount <= 0.0 {
            return Err(EngineError::Invariant(format!(
                "opportunity {}: non-positive input_amount",
                self.id
            )));
        }
        match self.kind {
            OpportunityKind::Triangular => {
                if self.symbols.len() != 3 || self.venues.len() != 3 {
                    return Err(EngineError::Invariant(format!(
                        "opportunity {}: triangular requires 3 symbols and 3 venues",
                        self.id
                    )));
                }
            }
            OpportunityKind::CrossVenue => {
                if self.symbols.len() != 1 || self.venues.len() != 2 {
                    return Err(EngineError::Invariant(format!(
                        "opportunity {}: cross-venue requires 1 symbol and 2 venues",
                        self.id
                    )));
                }
            }
            OpportunityKind::Statistical => {
                if self.symbols.len() != 1 {
                    return Err(EngineError::Invariant(format!(
                        "opportunity {}: statistical requires exactly 1 symbol",
                        self.id
                    )));
                }
            }
            OpportunityKind::FlashLoanSnipe => {
                if self.flash_loan_amount.is_none() {
                    return Err(EngineError::Invariant(format!(
                        "opportunity {}: flash-loan snipe missing flash_loan_amount",
                        self.id
                    )));
                }
            }
            OpportunityKind::ManualTarget => {}
        }
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline <= now
    }

    /// MEV risk assessment. A metadata override wins; otherwise flash-loan
    /// snipes are always High, and other kinds escalate with the profit
    /// share of the trade (fat margins attract frontrunners).
    pub fn mev_risk(&self) -> MevRisk {
        match self.metadata.get("mev_risk").map(|s| s.as_str()) {
            Some("high") => return MevRisk::High,
            Some("medium") => return MevRisk::Medium,
            Some("low") => return MevRisk::Low,
            _ => {}
        }
        if self.kind == OpportunityKind::FlashLoanSnipe {
            return MevRisk::High;
        }
        let profit_share = if self.input_amount > 0.0 {
            self.expected_profit / self.input_amount
        } else {
            0.0
        };
        if profit_share >= 0.02 {
            MevRisk::High
        } else if profit_share >= 0.005 {
            MevRisk::Medium
        } else {
            MevRisk::Low
        }
    }

    /// Whether the producer asked for MEV-protected submission.
    pub fn mev_protection_required(&self) -> bool {
        matches!(
            self.metadata.get("mev_protection").map(|s| s.as_str()),
            Some("required") | Some("true")
        )
    }

    /// Optional liquidity hint attached by the producer, used by risk
    /// sizing. Absent means unknown.
    pub fn liquidity_hint(&self) -> Option<f64> {
        self.metadata.get("liquidity").and_then(|v| v.parse().ok())
    }

    /// Optional volatility hint (fractional, e.g. 0.3 = 30%).
    pub fn volatility_hint(&self) -> Option<f64> {
        self.metadata.get("volatility").and_then(|v| v.parse().ok())
    }

    /// Optional price target / stop pair for the risk-reward check.
    pub fn price_target(&self) -> Option<f64> {
        self.metadata.get("price_target").and_then(|v| v.parse().ok())
    }

    pub fn stop_price(&self) -> Option<f64> {
        self.metadata.get("stop_price").and_then(|v| v.parse().ok())
    }
}

/// Deterministic opportunity id: the same logical observation always hashes
/// to the same id, which is what makes detectors idempotent.
pub fn deterministic_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_opportunity() -> Opportunity {
        let now = Utc::now();
        Opportunity {
            id: deterministic_id(&["test", "SOL/USDC"]),
            kind: OpportunityKind::CrossVenue,
            symbols: vec!["SOL/USDC".to_string()],
            venues: vec!["raydium".to_string(), "orca".to_string()],
            input_amount: 10.0,
            expected_output: 10.06,
            expected_profit: 0.06,
            max_slippage_bps: 50,
            urgency: Urgency::Normal,
            confidence: 0.8,
            created_at: now,
            deadline: now + chrono::Duration::seconds(30),
            required_capital: 10.0,
            flash_loan_amount: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        assert!(base_opportunity().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_arity() {
        let mut op = base_opportunity();
        op.kind = OpportunityKind::Triangular;
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_deadline_before_creation() {
        let mut op = base_opportunity();
        op.deadline = op.created_at - chrono::Duration::seconds(1);
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_flash_loan_requires_amount() {
        let mut op = base_opportunity();
        op.kind = OpportunityKind::FlashLoanSnipe;
        assert!(op.validate().is_err());
        op.flash_loan_amount = Some(5.0);
        assert!(op.validate().is_ok());
    }

    #[test]
    fn test_mev_risk_escalates_with_profit_share() {
        let mut op = base_opportunity();
        op.expected_profit = 0.01; // 0.1% share
        assert_eq!(op.mev_risk(), MevRisk::Low);
        op.expected_profit = 0.1; // 1% share
        assert_eq!(op.mev_risk(), MevRisk::Medium);
        op.expected_profit = 0.5; // 5% share
        assert_eq!(op.mev_risk(), MevRisk::High);
    }

    #[test]
    fn test_deterministic_id_is_stable() {
        let a = deterministic_id(&["tri", "X", "Y", "Z", "A", "B", "C"]);
        let b = deterministic_id(&["tri", "X", "Y", "Z", "A", "B", "C"]);
        assert_eq!(a, b);
        let c = deterministic_id(&["tri", "X", "Y", "Z", "A", "B", "D"]);
        assert_ne!(a, c);
    }
}
