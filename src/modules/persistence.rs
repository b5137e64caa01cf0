//! Persistence Module
//!
//! Append-only recording of execution outcomes and periodic portfolio
//! snapshots. The engine never reads this data back; it exists for offline
//! analytics and operator audits.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::models::{ExecutionOutcome, PortfolioSnapshot};

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn record_outcome(&self, outcome: &ExecutionOutcome) -> Result<()>;
    async fn record_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()>;
}

/// Discards all records. Used in benches and by deployments that rely on
/// the metrics/alert path only.
#[derive(Debug, Default)]
pub struct NullPersistence;

#[async_trait]
impl PersistenceSink for NullPersistence {
    async fn record_outcome(&self, _outcome: &ExecutionOutcome) -> Result<()> {
        Ok(())
    }

    async fn record_snapshot(&self, _snapshot: &PortfolioSnapshot) -> Result<()> {
        Ok(())
    }
}

/// One JSON document per line, appended to a local file. Writes are small
/// and happen post-trade, off the submission hot path.
pub struct JsonlPersistence {
    outcomes: Mutex<File>,
    snapshots: Mutex<File>,
}

impl JsonlPersistence {
    pub fn open(outcomes_path: &Path, snapshots_path: &Path) -> Result<Self> {
        let outcomes = OpenOptions::new()
            .create(true)
            .append(true)
            .open(outcomes_path)
            .with_context(|| format!("opening outcome log {:?}", outcomes_path))?;
        let snapshots = OpenOptions::new()
            .create(true)
            .append(true)
            .open(snapshots_path)
            .with_context(|| format!("opening snapshot log {:?}", snapshots_path))?;
        Ok(Self {
            outcomes: Mutex::new(outcomes),
            snapshots: Mutex::new(snapshots),
        })
    }
}

#[async_trait]
impl PersistenceSink for JsonlPersistence {
    async fn record_outcome(&self, outcome: &ExecutionOutcome) -> Result<()> {
        let line = serde_json::to_string(outcome).context("serializing execution outcome")?;
        let mut file = self.outcomes.lock();
        writeln!(file, "{}", line).context("appending execution outcome")?;
        Ok(())
    }

    async fn record_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        let line = serde_json::to_string(snapshot).context("serializing portfolio snapshot")?;
        let mut file = self.snapshots.lock();
        writeln!(file, "{}", line).context("appending portfolio snapshot")?;
        Ok(())
    }
}

/// In-memory sink for integration tests.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    pub outcomes: Mutex<Vec<ExecutionOutcome>>,
    pub snapshots: Mutex<Vec<PortfolioSnapshot>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceSink for MemoryPersistence {
    async fn record_outcome(&self, outcome: &ExecutionOutcome) -> Result<()> {
        self.outcomes.lock().push(outcome.clone());
        Ok(())
    }

    async fn record_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OpportunityKind;
    use chrono::Utc;

    fn sample_outcome() -> ExecutionOutcome {
        ExecutionOutcome {
            opportunity_id: "op-1".to_string(),
            kind: OpportunityKind::CrossVenue,
            success: true,
            executed_price: 1.005,
            executed_qty: 10.0,
            requested_price: 1.0,
            slippage_pct: 0.5,
            elapsed_ms: 42,
            fees: 0.001,
            actual_profit: 0.049,
            tx_hash: Some("abc".to_string()),
            bundle_id: None,
            error: None,
            provider_used: Some("helius".to_string()),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_jsonl_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let outcomes = dir.path().join("outcomes.jsonl");
        let snapshots = dir.path().join("snapshots.jsonl");
        let sink = JsonlPersistence::open(&outcomes, &snapshots).unwrap();

        sink.record_outcome(&sample_outcome()).await.unwrap();
        sink.record_outcome(&sample_outcome()).await.unwrap();

        let contents = std::fs::read_to_string(&outcomes).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let parsed: ExecutionOutcome = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.opportunity_id, "op-1");
    }

    #[tokio::test]
    async fn test_persisted_outcome_reproduces_derived_values() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlPersistence::open(
            &dir.path().join("o.jsonl"),
            &dir.path().join("s.jsonl"),
        )
        .unwrap();
        let outcome = sample_outcome();
        sink.record_outcome(&outcome).await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join("o.jsonl")).unwrap();
        let replayed: ExecutionOutcome = serde_json::from_str(contents.trim()).unwrap();
        let recomputed =
            ExecutionOutcome::compute_slippage_pct(replayed.executed_price, replayed.requested_price);
        assert!((recomputed - replayed.slippage_pct).abs() < 1e-9);
    }
}
