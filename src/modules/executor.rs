//! Execution Core Module
//!
//! Drives one opportunity to a terminal outcome: risk approval, routing,
//! quote acquisition, transaction build, submission and confirmation, with
//! full-jitter retry and deadline-aware aborts. Every terminal outcome is
//! recorded, alerted and committed exactly once.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{
    ExecutionOutcome, Opportunity, OpportunityKind, SubmissionPlan, SubmissionStrategy,
};
use crate::modules::alerts::{Alert, AlertSink};
use crate::modules::bundle_submitter::{BundleSubmitter, ConfirmOutcome};
use crate::modules::circuit_breaker::CircuitRegistry;
use crate::modules::dex_quotes::{build_swap_transaction, Quote, QuoteProvider};
use crate::modules::error_handling::EngineError;
use crate::modules::metrics::{names, MetricsSink};
use crate::modules::persistence::PersistenceSink;
use crate::modules::provider_registry::ProviderRegistry;
use crate::modules::risk::{RiskEngine, RiskVerdict};
use crate::modules::router::SubmissionRouter;
use crate::modules::time_source::{Clock, RandomSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    /// Retry budget for arbitrage kinds; snipes get 2, statistical 0.
    pub max_retries: u32,
    pub mev_jitter_cap_ms: u64,
    /// Poll interval while waiting out a NoRoute condition.
    pub no_route_poll_ms: u64,
    /// Quote currency used to anchor legs.
    pub quote_mint: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: 100,
            retry_cap_ms: 800,
            max_retries: 3,
            mev_jitter_cap_ms: 50,
            no_route_poll_ms: 250,
            quote_mint: "USDC".to_string(),
        }
    }
}

/// One swap hop of the trade.
#[derive(Debug, Clone)]
struct Leg {
    input: String,
    output: String,
    venue: String,
}

enum AttemptEnd {
    Success {
        plan: SubmissionPlan,
        bundle_id: String,
        tx_hash: String,
        filled_input: f64,
        filled_output: f64,
        sol_delta: f64,
        fees: f64,
    },
    Failure {
        provider: Option<String>,
        error: EngineError,
    },
    Cancelled {
        provider: Option<String>,
    },
}

pub struct ExecutionCore {
    config: ExecutorConfig,
    router: Arc<SubmissionRouter>,
    quotes: Arc<dyn QuoteProvider>,
    submitters: DashMap<String, Arc<dyn BundleSubmitter>>,
    registry: Arc<ProviderRegistry>,
    circuits: Arc<CircuitRegistry>,
    risk: Arc<RiskEngine>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    metrics: Arc<dyn MetricsSink>,
    alerts: Arc<dyn AlertSink>,
    persistence: Arc<dyn PersistenceSink>,
}

impl ExecutionCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutorConfig,
        router: Arc<SubmissionRouter>,
        quotes: Arc<dyn QuoteProvider>,
        registry: Arc<ProviderRegistry>,
        circuits: Arc<CircuitRegistry>,
        risk: Arc<RiskEngine>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        metrics: Arc<dyn MetricsSink>,
        alerts: Arc<dyn AlertSink>,
        persistence: Arc<dyn PersistenceSink>,
    ) -> Self {
        Self {
            config,
            router,
            quotes,
            submitters: DashMap::new(),
            registry,
            circuits,
            risk,
            clock,
            random,
            metrics,
            alerts,
            persistence,
        }
    }

    /// Attach the submission path for a registered provider.
    pub fn register_submitter(&self, provider: &str, submitter: Arc<dyn BundleSubmitter>) {
        self.submitters.insert(provider.to_string(), submitter);
    }

    fn retry_budget(&self, kind: OpportunityKind) -> u32 {
        match kind {
            OpportunityKind::Statistical => 0,
            OpportunityKind::FlashLoanSnipe => 2,
            _ => self.config.max_retries,
        }
    }

    /// Full-jitter backoff sample for retry number `retry` (1-based):
    /// random(0, min(cap, base * 2^retry)).
    fn backoff_delay(&self, retry: u32) -> Duration {
        let bound = (self.config.retry_base_ms.saturating_mul(1u64 << retry.min(20)))
            .min(self.config.retry_cap_ms);
        Duration::from_millis((self.random.next_f64() * bound as f64) as u64)
    }

    fn legs_for(&self, opportunity: &Opportunity) -> Vec<Leg> {
        let quote_mint = opportunity
            .metadata
            .get("quote_mint")
            .cloned()
            .unwrap_or_else(|| self.config.quote_mint.clone());
        match opportunity.kind {
            OpportunityKind::Triangular => {
                // Cycle X -> Y -> Z -> X, one venue per hop.
                let s = &opportunity.symbols;
                let v = &opportunity.venues;
                vec![
                    Leg {
                        input: s[0].clone(),
                        output: s[1].clone(),
                        venue: v[0].clone(),
                    },
                    Leg {
                        input: s[1].clone(),
                        output: s[2].clone(),
                        venue: v[1].clone(),
                    },
                    Leg {
                        input: s[2].clone(),
                        output: s[0].clone(),
                        venue: v[2].clone(),
                    },
                ]
            }
            OpportunityKind::CrossVenue | OpportunityKind::FlashLoanSnipe => {
                let symbol = opportunity.symbols[0].clone();
                let (buy_venue, sell_venue) = match opportunity.venues.as_slice() {
                    [a, b, ..] => (a.clone(), b.clone()),
                    [a] => (a.clone(), a.clone()),
                    [] => (String::new(), String::new()),
                };
                vec![
                    Leg {
                        input: quote_mint.clone(),
                        output: symbol.clone(),
                        venue: buy_venue,
                    },
                    Leg {
                        input: symbol,
                        output: quote_mint,
                        venue: sell_venue,
                    },
                ]
            }
            OpportunityKind::Statistical | OpportunityKind::ManualTarget => {
                let symbol = opportunity.symbols[0].clone();
                let venue = opportunity.venues.first().cloned().unwrap_or_default();
                let sell_side = opportunity.metadata.get("side").map(|s| s == "sell").unwrap_or(false);
                if sell_side {
                    vec![Leg {
                        input: symbol,
                        output: quote_mint,
                        venue,
                    }]
                } else {
                    vec![Leg {
                        input: quote_mint,
                        output: symbol,
                        venue,
                    }]
                }
            }
        }
    }

    /// Drive one opportunity to its terminal outcome. Returns `Err` only on
    /// an internal invariant violation, which is fatal to the calling
    /// worker.
    pub async fn execute(
        &self,
        opportunity: Arc<Opportunity>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, EngineError> {
        let started = self.clock.now();

        let (approved_size, stop_loss) = match self.risk.approve(&opportunity).await {
            RiskVerdict::Approved { size, stop_loss } => (size, stop_loss),
            RiskVerdict::Rejected { reason } => {
                let error = EngineError::PolicyViolation(reason.to_string());
                let outcome = self.failure_outcome(&opportunity, started, None, &error);
                self.finalize(&opportunity, outcome.clone(), "rejected", 0.0, None).await;
                return Ok(outcome);
            }
        };

        let input_amount = if opportunity.kind == OpportunityKind::FlashLoanSnipe {
            opportunity.flash_loan_amount.unwrap_or(approved_size)
        } else {
            approved_size.min(opportunity.input_amount)
        };

        let mut retry = 0u32;
        let budget = self.retry_budget(opportunity.kind);

        loop {
            if cancel.is_cancelled() {
                let error = EngineError::Cancelled("engine shutdown".into());
                let outcome = self.failure_outcome(&opportunity, started, None, &error);
                self.finalize(&opportunity, outcome.clone(), "cancelled", approved_size, stop_loss)
                    .await;
                return Ok(outcome);
            }
            if opportunity.is_expired(self.clock.now()) {
                return Ok(self.expire(&opportunity, started, approved_size, stop_loss).await);
            }

            let end = self
                .attempt(&opportunity, input_amount, cancel, started)
                .await?;

            match end {
                AttemptEnd::Success {
                    plan,
                    bundle_id,
                    tx_hash,
                    filled_input,
                    filled_output,
                    sol_delta,
                    fees,
                } => {
                    let outcome = self.success_outcome(
                        &opportunity,
                        started,
                        &plan,
                        bundle_id,
                        tx_hash,
                        filled_input,
                        filled_output,
                        sol_delta,
                        fees,
                    );
                    self.registry
                        .record_result(&plan.provider, true, outcome.elapsed_ms as f64, 1.0);
                    self.circuits.record_success(&plan.provider);
                    self.finalize(&opportunity, outcome.clone(), "success", approved_size, stop_loss)
                        .await;
                    return Ok(outcome);
                }
                AttemptEnd::Cancelled { provider } => {
                    let error = EngineError::Cancelled("cancelled in flight".into());
                    let outcome = self.failure_outcome(&opportunity, started, provider, &error);
                    self.finalize(&opportunity, outcome.clone(), "cancelled", approved_size, stop_loss)
                        .await;
                    return Ok(outcome);
                }
                AttemptEnd::Failure { provider, error } => {
                    // NoRoute only surfaces after waiting for a circuit to
                    // close; by then the deadline decides the terminal state.
                    if matches!(error, EngineError::NoRoute) {
                        return Ok(self.expire(&opportunity, started, approved_size, stop_loss).await);
                    }
                    if let Some(name) = &provider {
                        let weight = error.provider_failure_weight();
                        if weight > 0.0 {
                            let elapsed = self.elapsed_ms(started);
                            self.registry.record_result(name, false, elapsed as f64, weight);
                            self.circuits
                                .record_failure(name, self.clock.now(), &error.to_string());
                        }
                    }

                    if !error.is_retryable() || retry >= budget {
                        let outcome = self.failure_outcome(&opportunity, started, provider, &error);
                        self.finalize(&opportunity, outcome.clone(), "failure", approved_size, stop_loss)
                            .await;
                        return Ok(outcome);
                    }

                    retry += 1;
                    let delay = self.backoff_delay(retry);
                    let resume_at =
                        self.clock.now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    if resume_at > opportunity.deadline {
                        debug!(
                            "⏰ Retry {} of {} would pass deadline; expiring",
                            retry, opportunity.id
                        );
                        return Ok(self.expire(&opportunity, started, approved_size, stop_loss).await);
                    }
                    warn!(
                        "⚠️ Attempt {} for {} failed ({}); retrying in {:?}",
                        retry, opportunity.id, error, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = self.clock.sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One pass through quote -> build -> submit -> confirm.
    async fn attempt(
        &self,
        opportunity: &Opportunity,
        input_amount: f64,
        cancel: &CancellationToken,
        _started: DateTime<Utc>,
    ) -> Result<AttemptEnd, EngineError> {
        // Route. NoRoute suspends until a circuit closes or the deadline
        // passes; the deadline check happens in the caller's loop.
        let mut plan = loop {
            match self.router.plan(opportunity).await {
                Ok(plan) => break plan,
                Err(EngineError::NoRoute) => {
                    if opportunity.is_expired(self.clock.now()) || cancel.is_cancelled() {
                        return Ok(AttemptEnd::Failure {
                            provider: None,
                            error: EngineError::NoRoute,
                        });
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = self.clock.sleep(Duration::from_millis(self.config.no_route_poll_ms)) => {}
                    }
                }
                Err(e) => {
                    return Ok(AttemptEnd::Failure {
                        provider: None,
                        error: e,
                    })
                }
            }
        };

        // QuoteAcquired: price every leg with fresh quotes, chaining
        // amounts through the cycle.
        let legs = self.legs_for(opportunity);
        let mut leg_quotes: Vec<Quote> = Vec::with_capacity(legs.len());
        let mut amount = input_amount;
        for leg in &legs {
            if cancel.is_cancelled() {
                return Ok(AttemptEnd::Cancelled { provider: None });
            }
            match self
                .quotes
                .get_quote(&leg.input, &leg.output, amount, opportunity.max_slippage_bps)
                .await
            {
                Ok(quote) => {
                    debug!(
                        "💱 Quoted {} {} -> {:.6} {} @ {}",
                        amount, leg.input, quote.output_amount, leg.output, leg.venue
                    );
                    amount = quote.output_amount;
                    leg_quotes.push(quote);
                }
                Err(e) => {
                    // FailQuote is terminal for this opportunity.
                    return Ok(AttemptEnd::Failure {
                        provider: None,
                        error: match e {
                            EngineError::Transient(m) => EngineError::PermanentExternal(m),
                            other => other,
                        },
                    });
                }
            }
        }

        // BuildPlan: assemble the opaque transaction payloads.
        for quote in &leg_quotes {
            match build_swap_transaction(quote, opportunity.max_slippage_bps, plan.priority_fee) {
                Ok(tx) => plan.transactions.push(tx),
                Err(e) => {
                    return Ok(AttemptEnd::Failure {
                        provider: None,
                        error: e,
                    })
                }
            }
        }

        // MEV desynchronization delay before submission.
        if plan.strategy == SubmissionStrategy::MevProtected && self.config.mev_jitter_cap_ms > 0 {
            let jitter = Duration::from_millis(
                (self.random.next_f64() * self.config.mev_jitter_cap_ms as f64) as u64,
            );
            debug!("🎲 MEV jitter {:?} before submit of {}", jitter, opportunity.id);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(AttemptEnd::Cancelled { provider: None }),
                _ = self.clock.sleep(jitter) => {}
            }
        }

        let provider_name = plan.provider.clone();
        let submitter = self
            .submitters
            .get(&provider_name)
            .map(|s| s.clone())
            .ok_or_else(|| {
                EngineError::Invariant(format!("no submitter registered for provider {}", provider_name))
            })?;

        // Submit.
        let receipt = match submitter.submit(&plan, opportunity.urgency).await {
            Ok(receipt) => receipt,
            Err(e) => {
                return Ok(AttemptEnd::Failure {
                    provider: Some(provider_name),
                    error: e,
                })
            }
        };

        // AwaitConfirm. On cancellation the submitted bundle is still
        // observed to conclusion for accounting, never retried.
        let confirm = tokio::select! {
            outcome = submitter.confirm(&receipt.bundle_id, plan.timeout) => outcome,
            _ = cancel.cancelled() => {
                let final_look = submitter
                    .confirm(&receipt.bundle_id, Duration::from_millis(100))
                    .await;
                match final_look {
                    Ok(ConfirmOutcome::Confirmed { .. }) => final_look,
                    _ => return Ok(AttemptEnd::Cancelled { provider: Some(provider_name) }),
                }
            }
        };

        match confirm {
            Ok(ConfirmOutcome::Confirmed {
                tx_hash,
                filled_input,
                filled_output,
                sol_delta,
                fees,
            }) => Ok(AttemptEnd::Success {
                plan,
                bundle_id: receipt.bundle_id,
                tx_hash,
                filled_input,
                filled_output,
                sol_delta,
                fees,
            }),
            Ok(ConfirmOutcome::Reverted { reason }) => Ok(AttemptEnd::Failure {
                provider: Some(provider_name),
                error: EngineError::PermanentExternal(format!("reverted: {}", reason)),
            }),
            Ok(ConfirmOutcome::TimedOut) => Ok(AttemptEnd::Failure {
                provider: Some(provider_name),
                error: EngineError::Transient("confirmation timed out".into()),
            }),
            Err(e) => Ok(AttemptEnd::Failure {
                provider: Some(provider_name),
                error: e,
            }),
        }
    }

    fn elapsed_ms(&self, started: DateTime<Utc>) -> u64 {
        self.clock
            .now()
            .signed_duration_since(started)
            .num_milliseconds()
            .max(0) as u64
    }

    fn requested_price(opportunity: &Opportunity) -> f64 {
        if opportunity.input_amount > 0.0 {
            opportunity.expected_output / opportunity.input_amount
        } else {
            0.0
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn success_outcome(
        &self,
        opportunity: &Opportunity,
        started: DateTime<Utc>,
        plan: &SubmissionPlan,
        bundle_id: String,
        tx_hash: String,
        filled_input: f64,
        filled_output: f64,
        sol_delta: f64,
        fees: f64,
    ) -> ExecutionOutcome {
        let executed_price = if filled_input > 0.0 {
            filled_output / filled_input
        } else {
            0.0
        };
        let requested_price = Self::requested_price(opportunity);
        // Bundles settle against the observed balance delta; standard swaps
        // against the fill. Either way losses stay negative.
        let actual_profit = if plan.strategy.uses_bundle_relay() {
            ExecutionOutcome::compute_bundle_profit(sol_delta, fees)
        } else {
            (filled_output - filled_input) - fees
        };
        ExecutionOutcome {
            opportunity_id: opportunity.id.clone(),
            kind: opportunity.kind,
            success: true,
            executed_price,
            executed_qty: filled_input,
            requested_price,
            slippage_pct: ExecutionOutcome::compute_slippage_pct(executed_price, requested_price),
            elapsed_ms: self.elapsed_ms(started),
            fees,
            actual_profit,
            tx_hash: Some(tx_hash),
            bundle_id: Some(bundle_id),
            error: None,
            provider_used: Some(plan.provider.clone()),
            timestamp: self.clock.now(),
        }
    }

    fn failure_outcome(
        &self,
        opportunity: &Opportunity,
        started: DateTime<Utc>,
        provider: Option<String>,
        error: &EngineError,
    ) -> ExecutionOutcome {
        ExecutionOutcome {
            opportunity_id: opportunity.id.clone(),
            kind: opportunity.kind,
            success: false,
            executed_price: 0.0,
            executed_qty: 0.0,
            requested_price: Self::requested_price(opportunity),
            slippage_pct: 0.0,
            elapsed_ms: self.elapsed_ms(started),
            fees: 0.0,
            actual_profit: 0.0,
            tx_hash: None,
            bundle_id: None,
            error: Some(error.to_info()),
            provider_used: provider,
            timestamp: self.clock.now(),
        }
    }

    async fn expire(
        &self,
        opportunity: &Opportunity,
        started: DateTime<Utc>,
        approved_size: f64,
        stop_loss: Option<f64>,
    ) -> ExecutionOutcome {
        let error = EngineError::Cancelled("deadline expired".into());
        let outcome = self.failure_outcome(opportunity, started, None, &error);
        self.metrics
            .incr_counter(names::OPPORTUNITY_EXPIRED_TOTAL, &[("stage", "executing")]);
        self.alerts.send(Alert::OpportunityExpired {
            opportunity_id: opportunity.id.clone(),
        });
        self.finalize(opportunity, outcome.clone(), "expired", approved_size, stop_loss)
            .await;
        outcome
    }

    /// Record the terminal outcome once: metrics, alert, persistence, and
    /// the risk commit for outcomes that actually touched the market.
    async fn finalize(
        &self,
        opportunity: &Opportunity,
        outcome: ExecutionOutcome,
        result: &str,
        approved_size: f64,
        stop_loss: Option<f64>,
    ) {
        let kind_label = opportunity.kind.to_string();
        self.metrics.incr_counter(
            names::OPPORTUNITY_EXECUTED_TOTAL,
            &[("kind", &kind_label), ("result", result)],
        );
        self.metrics.observe_histogram(
            names::EXECUTION_LATENCY_MS,
            &[("kind", &kind_label)],
            outcome.elapsed_ms as f64,
        );

        if outcome.success {
            info!(
                "💰 Executed {} via {} (profit {:.6}, slippage {:.3}%)",
                outcome.opportunity_id,
                outcome.provider_used.as_deref().unwrap_or("?"),
                outcome.actual_profit,
                outcome.slippage_pct
            );
            self.alerts.send(Alert::TradeExecuted {
                opportunity_id: outcome.opportunity_id.clone(),
                kind: kind_label.clone(),
                provider: outcome.provider_used.clone().unwrap_or_default(),
                profit: outcome.actual_profit,
                elapsed_ms: outcome.elapsed_ms,
            });
        } else if let Some(error) = &outcome.error {
            self.alerts.send(Alert::TradeFailed {
                opportunity_id: outcome.opportunity_id.clone(),
                kind: kind_label.clone(),
                error_kind: error.kind.clone(),
                reason: error.message.clone(),
            });
        }

        // Policy rejections, expiries and cancellations never touch the
        // portfolio; fills and fee-burning failures do.
        if outcome.success || outcome.fees > 0.0 {
            self.risk.commit_outcome(&outcome, approved_size, stop_loss).await;
        }

        if let Err(e) = self.persistence.record_outcome(&outcome).await {
            warn!("Failed to persist outcome {}: {}", outcome.opportunity_id, e);
        }
    }
}
