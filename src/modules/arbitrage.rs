//! Arbitrage Opportunity Detector
//!
//! Three independent detectors over a shared venue-rate snapshot:
//! triangular cycles, cross-venue spreads, and statistical mean reversion.
//! All emissions are deterministic: the same snapshot always yields the
//! same opportunity ids.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::{Opportunity, OpportunityKind, Urgency};
use crate::models::opportunity::deterministic_id;
use crate::modules::metrics::MetricsSink;
use crate::modules::time_source::Clock;

/// One observed exchange rate: `rate` units of `quote` per unit of `base`
/// at `venue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateUpdate {
    pub base: String,
    pub quote: String,
    pub venue: String,
    pub rate: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub enable_triangular: bool,
    pub enable_cross_venue: bool,
    pub enable_statistical: bool,
    /// Per-leg trading fee for triangular cycles.
    pub fee_per_leg: f64,
    /// Minimum net margin for a triangular emission.
    pub triangular_profit_floor: f64,
    /// Combined two-leg fee for cross-venue trades.
    pub cross_venue_fee_rate: f64,
    /// Margin the spread must clear beyond fees.
    pub cross_venue_min_margin: f64,
    /// Normalizer turning net margin into confidence.
    pub margin_confidence_norm: f64,
    pub stat_z_threshold: f64,
    pub stat_window: usize,
    pub stat_min_samples: usize,
    /// Minimum interval between emissions of the same opportunity id.
    pub min_emit_interval_ms: u64,
    /// Snapshot entries older than this are evicted.
    pub price_retention_secs: i64,
    pub opportunity_ttl_secs: i64,
    /// Notional input used for expected-profit projection.
    pub default_input_amount: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enable_triangular: true,
            enable_cross_venue: true,
            enable_statistical: true,
            fee_per_leg: 0.001,
            triangular_profit_floor: 0.002,
            cross_venue_fee_rate: 0.004,
            cross_venue_min_margin: 0.001,
            margin_confidence_norm: 0.02,
            stat_z_threshold: 2.0,
            stat_window: 64,
            stat_min_samples: 16,
            min_emit_interval_ms: 0,
            price_retention_secs: 30,
            opportunity_ttl_secs: 10,
            default_input_amount: 10.0,
        }
    }
}

#[derive(Debug, Clone)]
struct RateEntry {
    rate: f64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RollingStats {
    window: VecDeque<f64>,
}

impl RollingStats {
    fn push(&mut self, value: f64, cap: usize) {
        self.window.push_back(value);
        while self.window.len() > cap {
            self.window.pop_front();
        }
    }

    fn mean(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    fn stddev(&self) -> f64 {
        if self.window.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .window
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / (self.window.len() - 1) as f64;
        variance.sqrt()
    }

    fn len(&self) -> usize {
        self.window.len()
    }
}

#[derive(Default)]
struct DetectorState {
    /// (base, quote) -> venue -> latest rate.
    rates: HashMap<(String, String), HashMap<String, RateEntry>>,
    stats: HashMap<String, RollingStats>,
    last_emit: HashMap<String, DateTime<Utc>>,
}

pub struct ArbitrageDetector {
    config: DetectorConfig,
    state: Mutex<DetectorState>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl ArbitrageDetector {
    pub fn new(config: DetectorConfig, clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsSink>) -> Self {
        info!(
            "🔍 Arbitrage detector ready (tri={}, xv={}, stat={})",
            config.enable_triangular, config.enable_cross_venue, config.enable_statistical
        );
        Self {
            config,
            state: Mutex::new(DetectorState::default()),
            clock,
            metrics,
        }
    }

    /// Fold one rate observation into the snapshot and run the detectors it
    /// can affect. Returns every opportunity the snapshot now supports.
    pub fn observe(&self, update: RateUpdate) -> Vec<Opportunity> {
        let now = self.clock.now();
        let mut emitted = Vec::new();
        let mut state = self.state.lock();

        state
            .rates
            .entry((update.base.clone(), update.quote.clone()))
            .or_default()
            .insert(
                update.venue.clone(),
                RateEntry {
                    rate: update.rate,
                    timestamp: update.timestamp,
                },
            );
        Self::evict_stale(&mut state, now, self.config.price_retention_secs);

        if self.config.enable_statistical {
            let symbol = format!("{}/{}", update.base, update.quote);
            let stats = state.stats.entry(symbol.clone()).or_default();
            stats.push(update.rate, self.config.stat_window);
            if let Some(op) = self.detect_statistical(&symbol, update.rate, stats, now) {
                emitted.push(op);
            }
        }

        if self.config.enable_cross_venue {
            if let Some(op) = self.detect_cross_venue(&state, &update.base, &update.quote, now) {
                emitted.push(op);
            }
        }

        if self.config.enable_triangular {
            emitted.extend(self.detect_triangular(&state, &update.base, &update.quote, now));
        }

        emitted.retain(|op| self.throttle_admit(&mut state, op, now));
        for op in &emitted {
            let kind_label = op.kind.to_string();
            self.metrics
                .incr_counter("detector_emitted_total", &[("kind", &kind_label)]);
        }
        emitted
    }

    fn evict_stale(state: &mut DetectorState, now: DateTime<Utc>, retention_secs: i64) {
        let cutoff = now - chrono::Duration::seconds(retention_secs);
        for venues in state.rates.values_mut() {
            venues.retain(|_, entry| entry.timestamp > cutoff);
        }
        state.rates.retain(|_, venues| !venues.is_empty());
    }

    fn throttle_admit(&self, state: &mut DetectorState, op: &Opportunity, now: DateTime<Utc>) -> bool {
        if self.config.min_emit_interval_ms == 0 {
            state.last_emit.insert(op.id.clone(), now);
            return true;
        }
        let admit = state
            .last_emit
            .get(&op.id)
            .map(|last| {
                now.signed_duration_since(*last)
                    >= chrono::Duration::milliseconds(self.config.min_emit_interval_ms as i64)
            })
            .unwrap_or(true);
        if admit {
            state.last_emit.insert(op.id.clone(), now);
        }
        admit
    }

    fn best_rate(state: &DetectorState, base: &str, quote: &str) -> Option<(String, f64)> {
        state
            .rates
            .get(&(base.to_string(), quote.to_string()))
            .and_then(|venues| {
                venues
                    .iter()
                    .max_by(|a, b| a.1.rate.total_cmp(&b.1.rate))
                    .map(|(venue, entry)| (venue.clone(), entry.rate))
            })
    }

    /// Enumerate 3-cycles X -> Y -> Z -> X seeded by the updated pair,
    /// taking the best venue per leg.
    fn detect_triangular(
        &self,
        state: &DetectorState,
        base: &str,
        quote: &str,
        now: DateTime<Utc>,
    ) -> Vec<Opportunity> {
        let mut found = Vec::new();
        let symbols: BTreeSet<String> = state
            .rates
            .keys()
            .flat_map(|(b, q)| [b.clone(), q.clone()])
            .collect();

        let Some((venue_xy, rate_xy)) = Self::best_rate(state, base, quote) else {
            return found;
        };

        for third in &symbols {
            if third == base || third == quote {
                continue;
            }
            let Some((venue_yz, rate_yz)) = Self::best_rate(state, quote, third) else {
                continue;
            };
            let Some((venue_zx, rate_zx)) = Self::best_rate(state, third, base) else {
                continue;
            };

            let product = rate_xy * rate_yz * rate_zx;
            let net_margin = product - 1.0 - 3.0 * self.config.fee_per_leg;
            if product <= 1.0 || net_margin < self.config.triangular_profit_floor {
                continue;
            }

            let mut sorted_symbols = vec![base.to_string(), quote.to_string(), third.clone()];
            sorted_symbols.sort();
            let mut sorted_venues = vec![venue_xy.clone(), venue_yz.clone(), venue_zx.clone()];
            sorted_venues.sort();
            let id_parts: Vec<&str> = std::iter::once("tri")
                .chain(sorted_symbols.iter().map(|s| s.as_str()))
                .chain(sorted_venues.iter().map(|s| s.as_str()))
                .collect();
            let id = deterministic_id(&id_parts);

            let input_amount = self.config.default_input_amount;
            let confidence = (net_margin / self.config.margin_confidence_norm).clamp(0.0, 1.0);
            debug!(
                "🔺 Triangular {}->{}->{} product {:.6} net {:.6}",
                base, quote, third, product, net_margin
            );
            found.push(Opportunity {
                id,
                kind: OpportunityKind::Triangular,
                symbols: vec![base.to_string(), quote.to_string(), third.clone()],
                venues: vec![venue_xy.clone(), venue_yz, venue_zx],
                input_amount,
                expected_output: input_amount * (1.0 + net_margin),
                expected_profit: net_margin * input_amount,
                max_slippage_bps: 50,
                urgency: Urgency::Normal,
                confidence,
                created_at: now,
                deadline: now + chrono::Duration::seconds(self.config.opportunity_ttl_secs),
                required_capital: input_amount,
                flash_loan_amount: None,
                metadata: HashMap::new(),
            });
        }
        found
    }

    /// Spread between the cheapest and dearest venue for one pair; buy side
    /// is always the lower-priced venue.
    fn detect_cross_venue(
        &self,
        state: &DetectorState,
        base: &str,
        quote: &str,
        now: DateTime<Utc>,
    ) -> Option<Opportunity> {
        let venues = state.rates.get(&(base.to_string(), quote.to_string()))?;
        if venues.len() < 2 {
            return None;
        }
        let (buy_venue, buy_entry) = venues.iter().min_by(|a, b| a.1.rate.total_cmp(&b.1.rate))?;
        let (sell_venue, sell_entry) = venues.iter().max_by(|a, b| a.1.rate.total_cmp(&b.1.rate))?;
        if buy_venue == sell_venue || buy_entry.rate <= 0.0 {
            return None;
        }

        let spread_frac = (sell_entry.rate - buy_entry.rate) / buy_entry.rate;
        let net = spread_frac - self.config.cross_venue_fee_rate;
        if net < self.config.cross_venue_min_margin {
            return None;
        }

        let symbol = format!("{}/{}", base, quote);
        let id = deterministic_id(&["xv", &symbol, buy_venue, sell_venue]);
        let input_amount = self.config.default_input_amount;
        let confidence = (net / self.config.margin_confidence_norm).clamp(0.0, 1.0);
        debug!(
            "↔️ Cross-venue {} {}@{} -> {}@{} net {:.4}",
            symbol, buy_entry.rate, buy_venue, sell_entry.rate, sell_venue, net
        );
        let mut metadata = HashMap::new();
        metadata.insert("buy_price".to_string(), buy_entry.rate.to_string());
        metadata.insert("sell_price".to_string(), sell_entry.rate.to_string());
        Some(Opportunity {
            id,
            kind: OpportunityKind::CrossVenue,
            symbols: vec![symbol],
            venues: vec![buy_venue.clone(), sell_venue.clone()],
            input_amount,
            expected_output: input_amount * (1.0 + net),
            expected_profit: net * input_amount,
            max_slippage_bps: 50,
            urgency: Urgency::Normal,
            confidence,
            created_at: now,
            deadline: now + chrono::Duration::seconds(self.config.opportunity_ttl_secs),
            required_capital: input_amount,
            flash_loan_amount: None,
            metadata,
        })
    }

    /// Mean-reversion signal when the latest rate sits far from the rolling
    /// mean.
    fn detect_statistical(
        &self,
        symbol: &str,
        price: f64,
        stats: &RollingStats,
        now: DateTime<Utc>,
    ) -> Option<Opportunity> {
        if stats.len() < self.config.stat_min_samples {
            return None;
        }
        let stddev = stats.stddev();
        if stddev <= 0.0 {
            return None;
        }
        let z = (price - stats.mean()) / stddev;
        if z.abs() < self.config.stat_z_threshold {
            return None;
        }

        // Price above the mean reverts down: sell. Below: buy.
        let side = if z > 0.0 { "sell" } else { "buy" };
        let id = deterministic_id(&["stat", symbol, side, &format!("{:.6}", price)]);
        let input_amount = self.config.default_input_amount;
        let edge = (z.abs() - self.config.stat_z_threshold) / self.config.stat_z_threshold;
        let confidence = (0.3 + 0.35 * edge).clamp(0.0, 1.0);
        debug!("📈 Statistical {} z={:.2} side={}", symbol, z, side);
        let mut metadata = HashMap::new();
        metadata.insert("side".to_string(), side.to_string());
        metadata.insert("z_score".to_string(), format!("{:.4}", z));
        Some(Opportunity {
            id,
            kind: OpportunityKind::Statistical,
            symbols: vec![symbol.to_string()],
            venues: Vec::new(),
            input_amount,
            expected_output: input_amount * (1.0 + 0.25 * (z.abs() - self.config.stat_z_threshold) * stddev / stats.mean().max(1e-9)),
            expected_profit: input_amount * 0.25 * (z.abs() - self.config.stat_z_threshold) * stddev
                / stats.mean().max(1e-9),
            max_slippage_bps: 50,
            urgency: Urgency::Low,
            confidence,
            created_at: now,
            deadline: now + chrono::Duration::seconds(self.config.opportunity_ttl_secs),
            required_capital: input_amount,
            flash_loan_amount: None,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::metrics::NullMetrics;
    use crate::modules::time_source::ManualClock;

    fn detector() -> (ArbitrageDetector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let detector = ArbitrageDetector::new(
            DetectorConfig::default(),
            clock.clone(),
            Arc::new(NullMetrics),
        );
        (detector, clock)
    }

    fn update(clock: &ManualClock, base: &str, quote: &str, venue: &str, rate: f64) -> RateUpdate {
        RateUpdate {
            base: base.to_string(),
            quote: quote.to_string(),
            venue: venue.to_string(),
            rate,
            timestamp: clock.now(),
        }
    }

    #[test]
    fn test_triangular_cycle_from_literal_rates() {
        let (detector, clock) = detector();
        detector.observe(update(&clock, "X", "Y", "A", 1.01));
        detector.observe(update(&clock, "Y", "Z", "B", 1.01));
        let emitted = detector.observe(update(&clock, "Z", "X", "C", 0.99));

        let tri: Vec<_> = emitted
            .iter()
            .filter(|o| o.kind == OpportunityKind::Triangular)
            .collect();
        assert_eq!(tri.len(), 1);
        let op = tri[0];
        // product 1.01 * 1.01 * 0.99 = 1.009899; net after 3 * 0.001 fees
        let expected_margin = 1.01f64 * 1.01 * 0.99 - 1.0 - 0.003;
        assert!((expected_margin - 0.006899).abs() < 1e-6);
        assert!((op.expected_profit - expected_margin * 10.0).abs() < 1e-6);
        assert_eq!(op.symbols.len(), 3);
        assert_eq!(op.venues.len(), 3);
        assert!(op.validate().is_ok());
    }

    #[test]
    fn test_triangular_id_is_deterministic() {
        let (detector, clock) = detector();
        detector.observe(update(&clock, "X", "Y", "A", 1.01));
        detector.observe(update(&clock, "Y", "Z", "B", 1.01));
        let first = detector.observe(update(&clock, "Z", "X", "C", 0.99));
        let second = detector.observe(update(&clock, "Z", "X", "C", 0.99));
        let id_of = |ops: &[Opportunity]| {
            ops.iter()
                .find(|o| o.kind == OpportunityKind::Triangular)
                .map(|o| o.id.clone())
                .unwrap()
        };
        assert_eq!(id_of(&first), id_of(&second));
    }

    #[test]
    fn test_unprofitable_cycle_not_emitted() {
        let (detector, clock) = detector();
        detector.observe(update(&clock, "X", "Y", "A", 1.0));
        detector.observe(update(&clock, "Y", "Z", "B", 1.0));
        let emitted = detector.observe(update(&clock, "Z", "X", "C", 1.001));
        assert!(emitted.iter().all(|o| o.kind != OpportunityKind::Triangular));
    }

    #[test]
    fn test_cross_venue_spread_from_literal_prices() {
        let (detector, clock) = detector();
        detector.observe(update(&clock, "SOL", "USDC", "venue_a", 1.000));
        let emitted = detector.observe(update(&clock, "SOL", "USDC", "venue_b", 1.010));

        let xv: Vec<_> = emitted
            .iter()
            .filter(|o| o.kind == OpportunityKind::CrossVenue)
            .collect();
        assert_eq!(xv.len(), 1);
        let op = xv[0];
        // (1.010 - 1.000) / 1.000 - 0.004 = 0.006
        assert!((op.expected_profit - 0.006 * 10.0).abs() < 1e-9);
        // buy side is the cheaper venue
        assert_eq!(op.venues[0], "venue_a");
        assert_eq!(op.venues[1], "venue_b");
    }

    #[test]
    fn test_cross_venue_below_margin_not_emitted() {
        let (detector, clock) = detector();
        detector.observe(update(&clock, "SOL", "USDC", "venue_a", 1.000));
        // spread 0.45% barely above fees but below fee + margin
        let emitted = detector.observe(update(&clock, "SOL", "USDC", "venue_b", 1.0045));
        assert!(emitted.iter().all(|o| o.kind != OpportunityKind::CrossVenue));
    }

    #[test]
    fn test_statistical_emits_on_z_breach() {
        let (detector, clock) = detector();
        let mut emitted = Vec::new();
        for _ in 0..20 {
            emitted = detector.observe(update(&clock, "SOL", "USDC", "venue_a", 1.0));
            clock.advance(std::time::Duration::from_millis(100));
        }
        assert!(emitted.iter().all(|o| o.kind != OpportunityKind::Statistical));

        // a big dislocation above the flat history
        let emitted = detector.observe(update(&clock, "SOL", "USDC", "venue_a", 1.5));
        let stat: Vec<_> = emitted
            .iter()
            .filter(|o| o.kind == OpportunityKind::Statistical)
            .collect();
        assert_eq!(stat.len(), 1);
        assert_eq!(stat[0].metadata.get("side").map(|s| s.as_str()), Some("sell"));
    }

    #[test]
    fn test_stale_rates_are_evicted() {
        let (detector, clock) = detector();
        detector.observe(update(&clock, "SOL", "USDC", "venue_a", 1.000));
        clock.advance(std::time::Duration::from_secs(60));
        // venue_a's quote is gone; a lone fresh quote cannot spread
        let emitted = detector.observe(update(&clock, "SOL", "USDC", "venue_b", 1.010));
        assert!(emitted.iter().all(|o| o.kind != OpportunityKind::CrossVenue));
    }

    #[test]
    fn test_throttle_suppresses_repeat_emissions() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let detector = ArbitrageDetector::new(
            DetectorConfig {
                min_emit_interval_ms: 1_000,
                ..DetectorConfig::default()
            },
            clock.clone(),
            Arc::new(NullMetrics),
        );
        detector.observe(update(&clock, "SOL", "USDC", "venue_a", 1.000));
        let first = detector.observe(update(&clock, "SOL", "USDC", "venue_b", 1.010));
        assert_eq!(first.len(), 1);
        let suppressed = detector.observe(update(&clock, "SOL", "USDC", "venue_b", 1.010));
        assert!(suppressed.is_empty());
        clock.advance(std::time::Duration::from_millis(1_500));
        let again = detector.observe(update(&clock, "SOL", "USDC", "venue_b", 1.010));
        assert_eq!(again.len(), 1);
    }
}
