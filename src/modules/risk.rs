//! Risk Engine Module
//!
//! Pre-trade approval, position sizing and the trading-halt conditions.
//! The risk engine is the only writer of the portfolio; every execution
//! outcome is committed here atomically, and halt evaluation runs on each
//! commit.

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::{
    ExecutionOutcome, Opportunity, OpportunityKind, Portfolio, PortfolioSnapshot,
};
use crate::modules::alerts::{Alert, AlertSink};
use crate::modules::metrics::{names, MetricsSink};
use crate::modules::time_source::Clock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_position_fraction: f64,
    pub max_drawdown: f64,
    pub max_consecutive_losses: u32,
    pub max_daily_loss: f64,
    pub max_position_concentration: f64,
    pub rapid_drawdown_threshold: f64,
    pub min_risk_reward: f64,
    pub min_profit_threshold: f64,
    pub max_gas_cost: f64,
    pub max_open_positions: usize,
    pub max_positions_per_symbol: usize,
    pub min_symbol_interval_ms: u64,
    pub max_liquidity_ratio: f64,
    pub kelly_fraction: f64,
    pub default_stop_fraction: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_fraction: 0.25,
            max_drawdown: 0.20,
            max_consecutive_losses: 5,
            max_daily_loss: 0.10,
            max_position_concentration: 0.40,
            rapid_drawdown_threshold: 0.08,
            min_risk_reward: 1.5,
            min_profit_threshold: 0.001,
            max_gas_cost: 0.05,
            max_open_positions: 10,
            max_positions_per_symbol: 1,
            min_symbol_interval_ms: 2_000,
            max_liquidity_ratio: 0.10,
            kelly_fraction: 0.5,
            default_stop_fraction: 0.05,
        }
    }
}

/// Latched global halt shared between the risk engine and the scheduler.
/// Set by halt conditions or the operator, cleared only by operator resume.
#[derive(Debug, Default)]
pub struct HaltState {
    halted: AtomicBool,
    reason: PlMutex<Option<String>>,
}

impl HaltState {
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Returns true if this call performed the transition.
    pub(crate) fn engage(&self, reason: &str) -> bool {
        let first = !self.halted.swap(true, Ordering::AcqRel);
        if first {
            *self.reason.lock() = Some(reason.to_string());
        }
        first
    }

    pub(crate) fn release(&self) -> bool {
        let was_halted = self.halted.swap(false, Ordering::AcqRel);
        if was_halted {
            *self.reason.lock() = None;
        }
        was_halted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RiskRejectReason {
    Halted,
    ProfitBelowMinimum,
    GasAboveMaximum,
    PositionCapReached,
    SymbolCapReached,
    SymbolVelocity,
    InsufficientCapital,
    RiskRewardBelowMinimum,
    ConfidenceTooLow,
}

impl std::fmt::Display for RiskRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            RiskRejectReason::Halted => "halted",
            RiskRejectReason::ProfitBelowMinimum => "profit_below_minimum",
            RiskRejectReason::GasAboveMaximum => "gas_above_maximum",
            RiskRejectReason::PositionCapReached => "position_cap_reached",
            RiskRejectReason::SymbolCapReached => "symbol_cap_reached",
            RiskRejectReason::SymbolVelocity => "symbol_velocity",
            RiskRejectReason::InsufficientCapital => "insufficient_capital",
            RiskRejectReason::RiskRewardBelowMinimum => "risk_reward_below_minimum",
            RiskRejectReason::ConfidenceTooLow => "confidence_too_low",
        };
        write!(f, "{}", tag)
    }
}

#[derive(Debug, Clone)]
pub enum RiskVerdict {
    Approved { size: f64, stop_loss: Option<f64> },
    Rejected { reason: RiskRejectReason },
}

#[derive(Debug)]
struct DailyCounters {
    day: NaiveDate,
    day_start_value: f64,
    /// Realized losses (absolute values) with their commit times, for the
    /// hourly rapid-drawdown window.
    loss_events: VecDeque<(DateTime<Utc>, f64)>,
}

pub struct RiskEngine {
    config: RiskConfig,
    portfolio: RwLock<Portfolio>,
    halt: Arc<HaltState>,
    last_trade_at: DashMap<String, DateTime<Utc>>,
    consecutive_losses: AtomicU32,
    daily: PlMutex<DailyCounters>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    alerts: Arc<dyn AlertSink>,
}

impl RiskEngine {
    pub fn new(
        config: RiskConfig,
        starting_cash: f64,
        halt: Arc<HaltState>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let now = clock.now();
        Self {
            config,
            portfolio: RwLock::new(Portfolio::new(starting_cash)),
            halt,
            last_trade_at: DashMap::new(),
            consecutive_losses: AtomicU32::new(0),
            daily: PlMutex::new(DailyCounters {
                day: now.date_naive(),
                day_start_value: starting_cash,
                loss_events: VecDeque::new(),
            }),
            clock,
            metrics,
            alerts,
        }
    }

    pub fn halt_state(&self) -> Arc<HaltState> {
        self.halt.clone()
    }

    /// Pre-trade approval. Pure with respect to the portfolio: a rejection
    /// leaves no trace, an approval only stamps the symbol velocity clock.
    pub async fn approve(&self, opportunity: &Opportunity) -> RiskVerdict {
        let now = self.clock.now();
        self.roll_day_if_needed(now).await;

        if self.halt.is_halted() {
            return self.reject(opportunity, RiskRejectReason::Halted);
        }

        if opportunity.expected_profit < self.config.min_profit_threshold {
            return self.reject(opportunity, RiskRejectReason::ProfitBelowMinimum);
        }

        let gas_estimate: f64 = opportunity
            .metadata
            .get("gas_estimate")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.005);
        if gas_estimate > self.config.max_gas_cost {
            return self.reject(opportunity, RiskRejectReason::GasAboveMaximum);
        }

        let symbol = opportunity.symbols.first().cloned().unwrap_or_default();
        let (open_positions, symbol_open, total_value, available_cash) = {
            let portfolio = self.portfolio.read().await;
            (
                portfolio.positions.len(),
                portfolio.positions.contains_key(&symbol),
                portfolio.total_value,
                portfolio.available_cash,
            )
        };

        if open_positions >= self.config.max_open_positions {
            return self.reject(opportunity, RiskRejectReason::PositionCapReached);
        }
        if symbol_open && self.config.max_positions_per_symbol <= 1 {
            return self.reject(opportunity, RiskRejectReason::SymbolCapReached);
        }

        if let Some(last) = self.last_trade_at.get(&symbol) {
            let elapsed = now.signed_duration_since(*last);
            if elapsed < chrono::Duration::milliseconds(self.config.min_symbol_interval_ms as i64) {
                return self.reject(opportunity, RiskRejectReason::SymbolVelocity);
            }
        }

        let size = self.position_size(opportunity, total_value);
        let liquidity_cap = opportunity
            .liquidity_hint()
            .map(|liq| liq * self.config.max_liquidity_ratio)
            .unwrap_or(f64::MAX);
        let cash_cap = available_cash * self.config.max_position_fraction;
        let size = size.min(cash_cap).min(liquidity_cap);
        if size <= 0.0 {
            return self.reject(opportunity, RiskRejectReason::InsufficientCapital);
        }

        let entry_price = if opportunity.input_amount > 0.0 {
            opportunity.expected_output / opportunity.input_amount
        } else {
            0.0
        };
        let stop_loss = opportunity
            .stop_price()
            .or_else(|| (entry_price > 0.0).then(|| entry_price * (1.0 - self.config.default_stop_fraction)));

        if let (Some(target), Some(stop)) = (opportunity.price_target(), opportunity.stop_price()) {
            let reward = target - entry_price;
            let risk = entry_price - stop;
            if risk > 0.0 && reward / risk < self.config.min_risk_reward {
                return self.reject(opportunity, RiskRejectReason::RiskRewardBelowMinimum);
            }
        }

        self.last_trade_at.insert(symbol, now);
        debug!(
            "🛡️ Approved {} size {:.4} (stop {:?})",
            opportunity.id, size, stop_loss
        );
        RiskVerdict::Approved { size, stop_loss }
    }

    fn reject(&self, opportunity: &Opportunity, reason: RiskRejectReason) -> RiskVerdict {
        let reason_label = reason.to_string();
        self.metrics.incr_counter(
            names::OPPORTUNITY_REJECTED_TOTAL,
            &[("reason", &reason_label)],
        );
        debug!("🛡️ Rejected {}: {}", opportunity.id, reason_label);
        RiskVerdict::Rejected { reason }
    }

    /// Multiplicative sizing: base capital fraction, then confidence, kind
    /// risk factor, liquidity factor, volatility factor and the configured
    /// Kelly fraction, applied in that order. The combined multiplier is
    /// clamped to [0.1, 1.0] so the result stays within
    /// [0.1 * base, max_position_fraction * total].
    pub fn position_size(&self, opportunity: &Opportunity, total_value: f64) -> f64 {
        let base = total_value * self.config.max_position_fraction;

        let kind_factor = match opportunity.kind {
            OpportunityKind::Triangular => 0.9,
            OpportunityKind::CrossVenue => 1.0,
            OpportunityKind::Statistical => 0.8,
            OpportunityKind::FlashLoanSnipe => 0.5,
            OpportunityKind::ManualTarget => 0.7,
        };
        let liquidity_factor = opportunity
            .liquidity_hint()
            .map(|liq| (liq / (opportunity.required_capital.max(1e-9) * 10.0)).min(1.0))
            .unwrap_or(1.0);
        let volatility_factor = opportunity
            .volatility_hint()
            .map(|vol| 1.0 / (1.0 + vol))
            .unwrap_or(1.0);

        let multiplier = opportunity.confidence
            * kind_factor
            * liquidity_factor
            * volatility_factor
            * self.config.kelly_fraction;
        let multiplier = multiplier.clamp(0.1, 1.0);
        base * multiplier
    }

    /// Commit a terminal outcome into the portfolio. Single writer: callers
    /// serialize through the portfolio write lock held for the whole commit.
    pub async fn commit_outcome(&self, outcome: &ExecutionOutcome, _approved_size: f64, stop_loss: Option<f64>) {
        let now = self.clock.now();
        self.roll_day_if_needed(now).await;

        {
            let mut portfolio = self.portfolio.write().await;
            if outcome.success {
                match outcome.kind {
                    OpportunityKind::ManualTarget => {
                        // Directional entry: the position stays open and is
                        // marked against later price updates.
                        if outcome.executed_qty > 0.0 && outcome.executed_price > 0.0 {
                            let symbol = outcome.opportunity_id.clone();
                            portfolio.open_position(
                                &symbol,
                                outcome.executed_qty,
                                outcome.executed_price,
                                stop_loss,
                                now,
                            );
                        }
                        portfolio.available_cash -= outcome.fees;
                    }
                    _ => {
                        // Atomic round trips settle to a cash delta.
                        portfolio.available_cash += outcome.actual_profit;
                        portfolio.daily_pnl += outcome.actual_profit;
                    }
                }
            } else {
                // Failed attempts still burn fees.
                portfolio.available_cash -= outcome.fees;
                portfolio.daily_pnl -= outcome.fees;
            }
            portfolio.refresh_totals();

            self.metrics.set_gauge(names::PORTFOLIO_VALUE, &[], portfolio.total_value);
            self.metrics
                .set_gauge(names::DRAWDOWN_PCT, &[], portfolio.drawdown() * 100.0);
        }

        let realized = if outcome.success {
            outcome.actual_profit
        } else {
            -outcome.fees
        };
        if realized < 0.0 {
            self.consecutive_losses.fetch_add(1, Ordering::AcqRel);
            let mut daily = self.daily.lock();
            daily.loss_events.push_back((now, realized.abs()));
        } else if realized > 0.0 {
            self.consecutive_losses.store(0, Ordering::Release);
        }

        self.evaluate_halts(now).await;
    }

    /// Mark-to-market update from the ingestion side.
    pub async fn update_market_price(&self, symbol: &str, price: f64) {
        {
            let mut portfolio = self.portfolio.write().await;
            portfolio.update_price(symbol, price);
        }
        self.evaluate_halts(self.clock.now()).await;
    }

    /// Evaluate every trading-halt condition; first trigger engages the
    /// latched halt and alerts exactly once.
    pub async fn evaluate_halts(&self, now: DateTime<Utc>) {
        if self.halt.is_halted() {
            return;
        }

        let (drawdown, concentration, total_value, daily_pnl) = {
            let portfolio = self.portfolio.read().await;
            (
                portfolio.drawdown(),
                portfolio.max_concentration(),
                portfolio.total_value,
                portfolio.daily_pnl,
            )
        };

        if drawdown >= self.config.max_drawdown {
            self.engage_halt("drawdown");
            return;
        }

        if self.consecutive_losses.load(Ordering::Acquire) >= self.config.max_consecutive_losses {
            self.engage_halt("consecutive_losses");
            return;
        }

        let (day_start_value, hourly_losses) = {
            let mut daily = self.daily.lock();
            let hour_ago = now - chrono::Duration::hours(1);
            while let Some((t, _)) = daily.loss_events.front() {
                if *t < hour_ago {
                    daily.loss_events.pop_front();
                } else {
                    break;
                }
            }
            let hourly: f64 = daily.loss_events.iter().map(|(_, loss)| loss).sum();
            (daily.day_start_value, hourly)
        };

        if daily_pnl < 0.0 && day_start_value > 0.0 {
            let daily_loss_ratio = -daily_pnl / day_start_value;
            if daily_loss_ratio >= self.config.max_daily_loss {
                self.engage_halt("daily_loss");
                return;
            }
        }

        if concentration >= self.config.max_position_concentration {
            self.engage_halt("position_concentration");
            return;
        }

        if total_value > 0.0 && hourly_losses / total_value >= self.config.rapid_drawdown_threshold {
            self.engage_halt("rapid_drawdown");
        }
    }

    fn engage_halt(&self, reason: &str) {
        if self.halt.engage(reason) {
            warn!("🚨 Global halt engaged: {}", reason);
            self.metrics
                .set_gauge(names::CIRCUIT_STATE, &[("scope", "global")], 2.0);
            self.alerts.send(Alert::Halted {
                reason: reason.to_string(),
            });
        }
    }

    /// Operator halt. Same latch as the automatic conditions.
    pub fn halt(&self, reason: &str) {
        self.engage_halt(reason);
    }

    /// Operator resume: clears the latch and resets the streak counters
    /// that caused the trip, so trading does not instantly re-halt.
    pub fn resume(&self) {
        if self.halt.release() {
            self.consecutive_losses.store(0, Ordering::Release);
            info!("🟢 Global halt released by operator");
            self.metrics
                .set_gauge(names::CIRCUIT_STATE, &[("scope", "global")], 0.0);
            self.alerts.send(Alert::Resumed);
        }
    }

    /// Reset daily counters exactly once per UTC day boundary.
    async fn roll_day_if_needed(&self, now: DateTime<Utc>) {
        let today = now.date_naive();
        let needs_roll = {
            let daily = self.daily.lock();
            daily.day != today
        };
        if !needs_roll {
            return;
        }
        let total_value = {
            let mut portfolio = self.portfolio.write().await;
            portfolio.daily_pnl = 0.0;
            portfolio.total_value
        };
        let mut daily = self.daily.lock();
        if daily.day != today {
            daily.day = today;
            daily.day_start_value = total_value;
            daily.loss_events.clear();
            info!("📅 Daily risk counters reset for {}", today);
        }
    }

    pub async fn snapshot(&self) -> PortfolioSnapshot {
        let now = self.clock.now();
        let portfolio = self.portfolio.read().await;
        portfolio.snapshot(now)
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses.load(Ordering::Acquire)
    }

    /// Test/ops hook: overwrite portfolio marks in one atomic write.
    pub async fn with_portfolio_mut<F: FnOnce(&mut Portfolio)>(&self, mutate: F) {
        let mut portfolio = self.portfolio.write().await;
        mutate(&mut portfolio);
        portfolio.refresh_totals();
    }
}
