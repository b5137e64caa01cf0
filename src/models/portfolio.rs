// Portfolio and position state
// Mutated only by the risk engine; everyone else reads snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
}

impl Position {
    pub fn unrealized_pnl(&self) -> f64 {
        (self.current_price - self.entry_price) * self.size
    }

    pub fn value(&self) -> f64 {
        self.current_price * self.size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub total_value: f64,
    pub available_cash: f64,
    pub peak_value: f64,
    pub daily_pnl: f64,
    pub positions: HashMap<String, Position>,
}

impl Portfolio {
    pub fn new(starting_cash: f64) -> Self {
        Self {
            total_value: starting_cash,
            available_cash: starting_cash,
            peak_value: starting_cash,
            daily_pnl: 0.0,
            positions: HashMap::new(),
        }
    }

    /// Recompute `total_value` from cash plus marked positions and ratchet
    /// the peak. Called after every mutation so the `peak_value >=
    /// total_value` observation holds at all read points.
    pub fn refresh_totals(&mut self) {
        let position_value: f64 = self.positions.values().map(|p| p.value()).sum();
        self.total_value = self.available_cash + position_value;
        if self.total_value > self.peak_value {
            self.peak_value = self.total_value;
        }
    }

    /// Open (or extend) a position, moving the cost out of cash.
    pub fn open_position(
        &mut self,
        symbol: &str,
        size: f64,
        price: f64,
        stop_loss: Option<f64>,
        entry_time: DateTime<Utc>,
    ) {
        let cost = size * price;
        self.available_cash -= cost;
        let entry = self.positions.entry(symbol.to_string());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut existing) => {
                let pos = existing.get_mut();
                let combined = pos.size + size;
                pos.entry_price = (pos.entry_price * pos.size + price * size) / combined;
                pos.size = combined;
                pos.current_price = price;
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Position {
                    symbol: symbol.to_string(),
                    size,
                    entry_price: price,
                    current_price: price,
                    entry_time,
                    stop_loss_price: stop_loss,
                    take_profit_price: None,
                });
            }
        }
        self.refresh_totals();
    }

    /// Close up to `size` of a position at `price`, returning the realized
    /// pnl of the closed slice.
    pub fn close_position(&mut self, symbol: &str, size: f64, price: f64) -> f64 {
        let mut realized = 0.0;
        let mut remove = false;
        if let Some(pos) = self.positions.get_mut(symbol) {
            let closed = size.min(pos.size);
            realized = (price - pos.entry_price) * closed;
            self.available_cash += closed * price;
            pos.size -= closed;
            if pos.size <= f64::EPSILON {
                remove = true;
            }
        }
        if remove {
            self.positions.remove(symbol);
        }
        self.daily_pnl += realized;
        self.refresh_totals();
        realized
    }

    pub fn update_price(&mut self, symbol: &str, price: f64) {
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.current_price = price;
        }
        self.refresh_totals();
    }

    /// Fractional drawdown from the running peak.
    pub fn drawdown(&self) -> f64 {
        if self.peak_value <= 0.0 {
            return 0.0;
        }
        ((self.peak_value - self.total_value) / self.peak_value).max(0.0)
    }

    /// Largest single-position share of total value.
    pub fn max_concentration(&self) -> f64 {
        if self.total_value <= 0.0 {
            return 0.0;
        }
        self.positions
            .values()
            .map(|p| p.value() / self.total_value)
            .fold(0.0, f64::max)
    }

    pub fn snapshot(&self, taken_at: DateTime<Utc>) -> PortfolioSnapshot {
        PortfolioSnapshot {
            taken_at,
            total_value: self.total_value,
            available_cash: self.available_cash,
            peak_value: self.peak_value,
            daily_pnl: self.daily_pnl,
            drawdown_pct: self.drawdown() * 100.0,
            open_positions: self.positions.len(),
        }
    }
}

/// Read-only view handed to callers of `snapshot_portfolio` and appended to
/// the persistence sink on a fixed cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub taken_at: DateTime<Utc>,
    pub total_value: f64,
    pub available_cash: f64,
    pub peak_value: f64,
    pub daily_pnl: f64,
    pub drawdown_pct: f64,
    pub open_positions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_value_identity() {
        let mut portfolio = Portfolio::new(100.0);
        portfolio.open_position("SOL", 2.0, 10.0, None, Utc::now());
        assert!((portfolio.total_value - 100.0).abs() < 1e-9);
        portfolio.update_price("SOL", 12.0);
        assert!((portfolio.total_value - 104.0).abs() < 1e-9);
    }

    #[test]
    fn test_peak_value_is_monotonic() {
        let mut portfolio = Portfolio::new(100.0);
        portfolio.open_position("SOL", 2.0, 10.0, None, Utc::now());
        portfolio.update_price("SOL", 15.0);
        assert!((portfolio.peak_value - 110.0).abs() < 1e-9);
        portfolio.update_price("SOL", 5.0);
        assert!((portfolio.peak_value - 110.0).abs() < 1e-9);
        assert!(portfolio.peak_value >= portfolio.total_value);
    }

    #[test]
    fn test_close_realizes_pnl() {
        let mut portfolio = Portfolio::new(100.0);
        portfolio.open_position("SOL", 2.0, 10.0, None, Utc::now());
        let realized = portfolio.close_position("SOL", 2.0, 13.0);
        assert!((realized - 6.0).abs() < 1e-9);
        assert!((portfolio.daily_pnl - 6.0).abs() < 1e-9);
        assert!(portfolio.positions.is_empty());
        assert!((portfolio.available_cash - 106.0).abs() < 1e-9);
    }

    #[test]
    fn test_drawdown_fraction() {
        let mut portfolio = Portfolio::new(100.0);
        portfolio.peak_value = 100.0;
        portfolio.available_cash = 79.0;
        portfolio.positions.clear();
        portfolio.total_value = 79.0;
        assert!((portfolio.drawdown() - 0.21).abs() < 1e-9);
    }
}
