//! Alerting Module
//!
//! Typed operator-facing notifications. The engine publishes these at
//! every user-visible state change; transports live behind `AlertSink`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Alert {
    TradeExecuted {
        opportunity_id: String,
        kind: String,
        provider: String,
        profit: f64,
        elapsed_ms: u64,
    },
    TradeFailed {
        opportunity_id: String,
        kind: String,
        error_kind: String,
        reason: String,
    },
    Halted {
        reason: String,
    },
    Resumed,
    CircuitOpened {
        scope: String,
        reason: String,
    },
    CircuitClosed {
        scope: String,
    },
    OpportunityExpired {
        opportunity_id: String,
    },
    WorkerReplaced {
        worker_id: usize,
        reason: String,
    },
}

pub trait AlertSink: Send + Sync {
    fn send(&self, alert: Alert);
}

/// Default sink: structured log lines in the engine's register.
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn send(&self, alert: Alert) {
        match &alert {
            Alert::TradeExecuted {
                opportunity_id,
                provider,
                profit,
                elapsed_ms,
                ..
            } => {
                info!(
                    "✅ Trade executed: {} via {} ({:.6} profit, {}ms)",
                    opportunity_id, provider, profit, elapsed_ms
                );
            }
            Alert::TradeFailed {
                opportunity_id,
                error_kind,
                reason,
                ..
            } => {
                warn!("❌ Trade failed: {} [{}] {}", opportunity_id, error_kind, reason);
            }
            Alert::Halted { reason } => {
                error!("🚨 TRADING HALTED: {}", reason);
            }
            Alert::Resumed => {
                info!("🟢 Trading resumed by operator");
            }
            Alert::CircuitOpened { scope, reason } => {
                warn!("🔴 Circuit opened for {}: {}", scope, reason);
            }
            Alert::CircuitClosed { scope } => {
                info!("🟢 Circuit closed for {}", scope);
            }
            Alert::OpportunityExpired { opportunity_id } => {
                info!("⏰ Opportunity expired: {}", opportunity_id);
            }
            Alert::WorkerReplaced { worker_id, reason } => {
                error!("🔁 Worker {} replaced: {}", worker_id, reason);
            }
        }
    }
}

/// Test sink that keeps every alert for assertions.
#[derive(Debug, Default)]
pub struct BufferedAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl BufferedAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock())
    }

    pub fn snapshot(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for BufferedAlertSink {
    fn send(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_sink_records_in_order() {
        let sink = BufferedAlertSink::new();
        sink.send(Alert::Halted {
            reason: "drawdown".to_string(),
        });
        sink.send(Alert::Resumed);
        let alerts = sink.snapshot();
        assert_eq!(alerts.len(), 2);
        assert!(matches!(alerts[0], Alert::Halted { .. }));
        assert!(matches!(alerts[1], Alert::Resumed));
    }
}
