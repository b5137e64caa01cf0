//! Snipe Feasibility Evaluator
//!
//! Turns new-pool events into flash-loan snipe opportunities. Fast filters
//! run first and short-circuit hopeless pools; survivors get a buy/sell
//! profitability simulation through the quote provider.

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::{Opportunity, OpportunityKind, Urgency};
use crate::models::opportunity::deterministic_id;
use crate::modules::dex_quotes::QuoteProvider;
use crate::modules::error_handling::EngineError;
use crate::modules::metrics::MetricsSink;
use crate::modules::time_source::Clock;

/// A pool-creation event as delivered by the ingestion side, enriched with
/// the token facts the filters need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolCreationEvent {
    pub token: String,
    pub pool: String,
    pub creator: String,
    pub initial_liquidity: f64,
    pub creation_time: DateTime<Utc>,
    pub mint_authority_revoked: bool,
    pub lp_burn_bps: u16,
    pub top5_holder_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SniperConfig {
    pub lp_burn_threshold_bps: u16,
    pub max_top5_holder_pct: f64,
    pub min_liquidity: f64,
    /// Token age window in seconds, relative to pool creation.
    pub min_token_age_secs: i64,
    pub max_token_age_secs: i64,
    pub profit_floor: f64,
    pub min_confidence: f64,
    pub min_loan: f64,
    pub max_loan: f64,
    /// Flat slippage estimate subtracted from the simulated round trip.
    pub slippage_estimate: f64,
    /// Flash-loan fee rate charged on the borrowed amount.
    pub loan_fee_rate: f64,
    /// Deadline granted to an approved snipe, from pool creation.
    pub deadline_secs: i64,
    /// Normalizers for the confidence blend.
    pub liquidity_norm: f64,
    pub profit_norm: f64,
}

impl Default for SniperConfig {
    fn default() -> Self {
        Self {
            lp_burn_threshold_bps: 8_000,
            max_top5_holder_pct: 30.0,
            min_liquidity: 5.0,
            min_token_age_secs: 0,
            max_token_age_secs: 600,
            profit_floor: 0.05,
            min_confidence: 0.3,
            min_loan: 1.0,
            max_loan: 50.0,
            slippage_estimate: 0.01,
            loan_fee_rate: 0.0009,
            deadline_secs: 30,
            liquidity_norm: 100.0,
            profit_norm: 1.0,
        }
    }
}

/// Which fast filter failed, in evaluation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SnipeFilter {
    CreatorBlacklisted,
    MintAuthorityActive,
    LpBurnBelowThreshold,
    HolderConcentration,
    LiquidityBelowFloor,
    TokenAgeOutOfWindow,
}

#[derive(Debug, Clone)]
pub enum SnipeDecision {
    Approved {
        opportunity: Opportunity,
        failed_filters: Vec<SnipeFilter>,
    },
    Rejected {
        failed_filters: Vec<SnipeFilter>,
        reason: String,
    },
}

pub struct SnipeEvaluator {
    config: SniperConfig,
    quotes: Arc<dyn QuoteProvider>,
    blacklist: DashSet<String>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    quote_mint: String,
}

impl SnipeEvaluator {
    pub fn new(
        config: SniperConfig,
        quotes: Arc<dyn QuoteProvider>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        quote_mint: &str,
    ) -> Self {
        Self {
            config,
            quotes,
            blacklist: DashSet::new(),
            clock,
            metrics,
            quote_mint: quote_mint.to_string(),
        }
    }

    /// Replace the blacklist with the externally reconciled set. Lookups
    /// stay O(1) throughout.
    pub fn reconcile_blacklist<I: IntoIterator<Item = String>>(&self, creators: I) {
        self.blacklist.clear();
        for creator in creators {
            self.blacklist.insert(creator);
        }
        debug!("🚫 Sniper blacklist reconciled ({} entries)", self.blacklist.len());
    }

    pub fn blacklist_contains(&self, creator: &str) -> bool {
        self.blacklist.contains(creator)
    }

    /// Run the ordered fast filters, stopping early once three have failed.
    fn run_filters(&self, event: &PoolCreationEvent, now: DateTime<Utc>) -> Vec<SnipeFilter> {
        let mut failed = Vec::new();
        let checks: [(SnipeFilter, bool); 6] = [
            (
                SnipeFilter::CreatorBlacklisted,
                self.blacklist.contains(&event.creator),
            ),
            (SnipeFilter::MintAuthorityActive, !event.mint_authority_revoked),
            (
                SnipeFilter::LpBurnBelowThreshold,
                event.lp_burn_bps < self.config.lp_burn_threshold_bps,
            ),
            (
                SnipeFilter::HolderConcentration,
                event.top5_holder_pct > self.config.max_top5_holder_pct,
            ),
            (
                SnipeFilter::LiquidityBelowFloor,
                event.initial_liquidity < self.config.min_liquidity,
            ),
            (SnipeFilter::TokenAgeOutOfWindow, {
                let age = now.signed_duration_since(event.creation_time).num_seconds();
                age < self.config.min_token_age_secs || age > self.config.max_token_age_secs
            }),
        ];
        for (filter, tripped) in checks {
            if tripped {
                failed.push(filter);
                if failed.len() >= 3 {
                    break;
                }
            }
        }
        failed
    }

    /// Simulate buy -> sell for one candidate loan size; returns the net
    /// profit after loan fees and the slippage estimate.
    async fn simulate_round_trip(&self, event: &PoolCreationEvent, loan: f64) -> Result<f64, EngineError> {
        let buy = self
            .quotes
            .get_quote(&self.quote_mint, &event.token, loan, 100)
            .await?;
        let sell = self
            .quotes
            .get_quote(&event.token, &self.quote_mint, buy.output_amount, 100)
            .await?;
        let loan_fee = loan * self.config.loan_fee_rate;
        let slippage_cost = loan * self.config.slippage_estimate;
        Ok(sell.output_amount - loan - loan_fee - slippage_cost)
    }

    /// Evaluate one pool event. At most two failed filters are tolerated;
    /// approval additionally needs a simulated profit at or above the floor
    /// and a blended confidence at or above the minimum.
    pub async fn evaluate(&self, event: &PoolCreationEvent) -> SnipeDecision {
        let now = self.clock.now();
        let failed_filters = self.run_filters(event, now);
        self.metrics
            .incr_counter("snipe_evaluated_total", &[("token", &event.token)]);

        if failed_filters.len() >= 3 {
            debug!(
                "🚫 Snipe {} rejected: {} fast filters failed",
                event.token,
                failed_filters.len()
            );
            return SnipeDecision::Rejected {
                reason: format!("{} fast filters failed", failed_filters.len()),
                failed_filters,
            };
        }

        // Candidate loan sizes: min, max/2, and half the pool's liquidity
        // capped at max.
        let candidates = [
            self.config.min_loan,
            self.config.max_loan / 2.0,
            self.config.max_loan.min(event.initial_liquidity * 0.5),
        ];

        let mut best: Option<(f64, f64)> = None; // (loan, net_profit)
        for loan in candidates {
            if loan <= 0.0 {
                continue;
            }
            match self.simulate_round_trip(event, loan).await {
                Ok(net) => {
                    debug!("🔬 Snipe sim {}: loan {:.3} -> net {:.4}", event.token, loan, net);
                    if best.map(|(_, p)| net > p).unwrap_or(true) {
                        best = Some((loan, net));
                    }
                }
                Err(e) => {
                    debug!("🔬 Snipe sim failed for {} at {:.3}: {}", event.token, loan, e);
                }
            }
        }

        let Some((loan, net_profit)) = best else {
            return SnipeDecision::Rejected {
                failed_filters,
                reason: "profitability simulation failed for all candidates".to_string(),
            };
        };
        if net_profit < self.config.profit_floor {
            return SnipeDecision::Rejected {
                failed_filters,
                reason: format!("net profit {:.4} below floor", net_profit),
            };
        }

        let confidence = 0.5 * (event.initial_liquidity / self.config.liquidity_norm).min(1.0)
            + 0.5 * (net_profit / self.config.profit_norm).min(1.0);
        if confidence < self.config.min_confidence {
            return SnipeDecision::Rejected {
                failed_filters,
                reason: format!("confidence {:.3} below minimum", confidence),
            };
        }

        let id = deterministic_id(&[
            "snipe",
            &event.token,
            &event.pool,
            &event.creation_time.timestamp_millis().to_string(),
        ]);
        let mut metadata = HashMap::new();
        metadata.insert("pool".to_string(), event.pool.clone());
        metadata.insert("creator".to_string(), event.creator.clone());
        metadata.insert("liquidity".to_string(), event.initial_liquidity.to_string());

        let opportunity = Opportunity {
            id,
            kind: OpportunityKind::FlashLoanSnipe,
            symbols: vec![event.token.clone()],
            venues: vec![event.pool.clone()],
            input_amount: loan,
            expected_output: loan + net_profit,
            expected_profit: net_profit,
            max_slippage_bps: (self.config.slippage_estimate * 10_000.0) as u16,
            urgency: Urgency::Critical,
            confidence,
            created_at: now,
            deadline: event.creation_time + chrono::Duration::seconds(self.config.deadline_secs),
            required_capital: 0.0,
            flash_loan_amount: Some(loan),
            metadata,
        };

        info!(
            "🎯 Snipe approved: {} loan {:.3} net {:.4} confidence {:.2}",
            event.token, loan, net_profit, confidence
        );
        SnipeDecision::Approved {
            opportunity,
            failed_filters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::dex_quotes::StaticQuoteProvider;
    use crate::modules::metrics::NullMetrics;
    use crate::modules::time_source::ManualClock;

    fn evaluator(rate_out: f64) -> (SnipeEvaluator, Arc<ManualClock>) {
        let quotes = Arc::new(StaticQuoteProvider::new(0.0));
        quotes.set_rate("SOL", "TOKEN", 1000.0);
        quotes.set_rate("TOKEN", "SOL", rate_out / 1000.0);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let evaluator = SnipeEvaluator::new(
            SniperConfig::default(),
            quotes,
            clock.clone(),
            Arc::new(NullMetrics),
            "SOL",
        );
        (evaluator, clock)
    }

    fn event(clock: &ManualClock) -> PoolCreationEvent {
        PoolCreationEvent {
            token: "TOKEN".to_string(),
            pool: "pool-1".to_string(),
            creator: "creator-1".to_string(),
            initial_liquidity: 50.0,
            creation_time: clock.now(),
            mint_authority_revoked: true,
            lp_burn_bps: 9_000,
            top5_holder_pct: 20.0,
        }
    }

    #[tokio::test]
    async fn test_clean_pool_is_approved() {
        // 10% edge on the round trip
        let (evaluator, clock) = evaluator(1.10);
        let decision = evaluator.evaluate(&event(&clock)).await;
        match decision {
            SnipeDecision::Approved {
                opportunity,
                failed_filters,
            } => {
                assert!(failed_filters.is_empty());
                assert_eq!(opportunity.kind, OpportunityKind::FlashLoanSnipe);
                assert_eq!(opportunity.urgency, Urgency::Critical);
                assert!(opportunity.flash_loan_amount.is_some());
                assert!(opportunity.validate().is_ok());
            }
            SnipeDecision::Rejected { reason, .. } => panic!("unexpected rejection: {}", reason),
        }
    }

    #[tokio::test]
    async fn test_three_filter_failures_short_circuit() {
        let (evaluator, clock) = evaluator(1.10);
        let mut bad = event(&clock);
        bad.mint_authority_revoked = false;
        bad.lp_burn_bps = 100;
        bad.top5_holder_pct = 45.0;
        let decision = evaluator.evaluate(&bad).await;
        match decision {
            SnipeDecision::Rejected { failed_filters, .. } => {
                assert_eq!(failed_filters.len(), 3);
                assert_eq!(
                    failed_filters,
                    vec![
                        SnipeFilter::MintAuthorityActive,
                        SnipeFilter::LpBurnBelowThreshold,
                        SnipeFilter::HolderConcentration,
                    ]
                );
            }
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_two_failures_still_simulates_and_approves() {
        let (evaluator, clock) = evaluator(1.10);
        let mut marginal = event(&clock);
        marginal.lp_burn_bps = 100;
        marginal.top5_holder_pct = 45.0;
        let decision = evaluator.evaluate(&marginal).await;
        assert!(matches!(decision, SnipeDecision::Approved { ref failed_filters, .. }
            if failed_filters.len() == 2));
    }

    #[tokio::test]
    async fn test_unprofitable_pool_is_rejected() {
        // losing round trip
        let (evaluator, clock) = evaluator(0.98);
        let decision = evaluator.evaluate(&event(&clock)).await;
        assert!(matches!(decision, SnipeDecision::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_blacklisted_creator_counts_as_filter_failure() {
        let (evaluator, clock) = evaluator(1.10);
        evaluator.reconcile_blacklist(vec!["creator-1".to_string()]);
        let mut bad = event(&clock);
        bad.mint_authority_revoked = false;
        bad.lp_burn_bps = 100;
        let decision = evaluator.evaluate(&bad).await;
        match decision {
            SnipeDecision::Rejected { failed_filters, .. } => {
                assert_eq!(failed_filters[0], SnipeFilter::CreatorBlacklisted);
                assert_eq!(failed_filters.len(), 3);
            }
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_same_event_yields_same_opportunity_id() {
        let (evaluator, clock) = evaluator(1.10);
        let e = event(&clock);
        let first = match evaluator.evaluate(&e).await {
            SnipeDecision::Approved { opportunity, .. } => opportunity.id,
            _ => panic!("expected approval"),
        };
        let second = match evaluator.evaluate(&e).await {
            SnipeDecision::Approved { opportunity, .. } => opportunity.id,
            _ => panic!("expected approval"),
        };
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_stale_pool_fails_age_window() {
        let (evaluator, clock) = evaluator(1.10);
        let e = event(&clock);
        clock.advance(std::time::Duration::from_secs(700));
        let mut bad = e;
        bad.lp_burn_bps = 100;
        bad.top5_holder_pct = 45.0;
        let decision = evaluator.evaluate(&bad).await;
        match decision {
            SnipeDecision::Rejected { failed_filters, .. } => {
                assert!(failed_filters.contains(&SnipeFilter::TokenAgeOutOfWindow));
            }
            _ => panic!("expected rejection"),
        }
    }
}
