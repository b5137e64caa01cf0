//! Priority Scheduler Module
//!
//! Bounded max-priority queue of admitted opportunities. Producers submit
//! without blocking (capacity overflow is a rejection, not backpressure by
//! waiting); workers pull the highest-priority live entry cooperatively.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::{MevRisk, Opportunity};
use crate::modules::alerts::{Alert, AlertSink};
use crate::modules::metrics::{names, MetricsSink};
use crate::modules::risk::HaltState;
use crate::modules::time_source::Clock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub capacity: usize,
    /// Base term of the priority formula.
    pub base_priority: f64,
    /// Age at which the age penalty saturates.
    pub age_cap_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            base_priority: 0.0,
            age_cap_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubmitReject {
    DeadlinePassed,
    QueueFull,
    Halted,
    Invalid(String),
}

impl std::fmt::Display for SubmitReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitReject::DeadlinePassed => write!(f, "deadline_passed"),
            SubmitReject::QueueFull => write!(f, "queue_full"),
            SubmitReject::Halted => write!(f, "halted"),
            SubmitReject::Invalid(_) => write!(f, "invalid"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Accepted { priority: f64 },
    Rejected { reason: SubmitReject },
}

#[derive(Debug)]
struct QueueEntry {
    priority: f64,
    deadline: DateTime<Utc>,
    created_at: DateTime<Utc>,
    id: String,
    opportunity: Arc<Opportunity>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// Max-heap order: highest priority first; ties broken by earliest
    /// deadline, then earliest creation, then id.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.deadline.cmp(&self.deadline))
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.id.cmp(&self.id))
    }
}

pub struct PriorityScheduler {
    config: SchedulerConfig,
    heap: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    halt: Arc<HaltState>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    alerts: Arc<dyn AlertSink>,
}

impl PriorityScheduler {
    pub fn new(
        config: SchedulerConfig,
        halt: Arc<HaltState>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        info!("📋 Priority scheduler ready (capacity {})", config.capacity);
        Self {
            config,
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            halt,
            clock,
            metrics,
            alerts,
        }
    }

    /// Priority score, clamped to [0, 1]:
    /// base + urgency_bonus + confidence * 0.2 - mev_penalty - age_penalty.
    pub fn priority(&self, opportunity: &Opportunity, now: DateTime<Utc>) -> f64 {
        let urgency_bonus = opportunity.urgency.priority_bonus();
        let confidence_term = opportunity.confidence * 0.2;
        let mev_penalty = if opportunity.mev_risk() == MevRisk::High {
            0.2
        } else {
            0.0
        };
        let age_ms = now
            .signed_duration_since(opportunity.created_at)
            .num_milliseconds()
            .max(0) as f64;
        let age_penalty = (age_ms / self.config.age_cap_ms as f64).min(0.3);

        (self.config.base_priority + urgency_bonus + confidence_term - mev_penalty - age_penalty)
            .clamp(0.0, 1.0)
    }

    /// Admit an opportunity. Never blocks: a full queue or a halted engine
    /// is an immediate rejection.
    pub fn submit(&self, opportunity: Opportunity) -> SubmitOutcome {
        let now = self.clock.now();

        if let Err(e) = opportunity.validate() {
            return self.rejected(SubmitReject::Invalid(e.to_string()));
        }
        if opportunity.is_expired(now) {
            return self.rejected(SubmitReject::DeadlinePassed);
        }
        if self.halt.is_halted() {
            return self.rejected(SubmitReject::Halted);
        }

        let priority = self.priority(&opportunity, now);
        let kind_label = opportunity.kind.to_string();
        {
            let mut heap = self.heap.lock();
            if heap.len() >= self.config.capacity {
                drop(heap);
                return self.rejected(SubmitReject::QueueFull);
            }
            heap.push(QueueEntry {
                priority,
                deadline: opportunity.deadline,
                created_at: opportunity.created_at,
                id: opportunity.id.clone(),
                opportunity: Arc::new(opportunity),
            });
            self.metrics
                .set_gauge(names::QUEUE_DEPTH, &[], heap.len() as f64);
        }

        self.metrics
            .incr_counter(names::OPPORTUNITY_SUBMITTED_TOTAL, &[("kind", &kind_label)]);
        self.notify.notify_one();
        SubmitOutcome::Accepted { priority }
    }

    fn rejected(&self, reason: SubmitReject) -> SubmitOutcome {
        let reason_label = reason.to_string();
        self.metrics
            .incr_counter(names::OPPORTUNITY_REJECTED_TOTAL, &[("reason", &reason_label)]);
        SubmitOutcome::Rejected { reason }
    }

    /// Pull the highest-priority live opportunity, suspending until one is
    /// available or the token is cancelled. Entries already past their
    /// deadline are dropped here, not returned.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Arc<Opportunity>> {
        loop {
            {
                let mut heap = self.heap.lock();
                while let Some(entry) = heap.pop() {
                    if entry.deadline <= self.clock.now() {
                        self.note_expired(&entry.id);
                        continue;
                    }
                    self.metrics
                        .set_gauge(names::QUEUE_DEPTH, &[], heap.len() as f64);
                    return Some(entry.opportunity);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Purge every entry whose deadline has passed. Run on a fixed cadence
    /// by the engine so stale entries do not linger when no worker polls.
    pub fn expire_sweep(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<QueueEntry>;
        {
            let mut heap = self.heap.lock();
            let drained = std::mem::take(&mut *heap).into_vec();
            let (dead, live): (Vec<_>, Vec<_>) =
                drained.into_iter().partition(|e| e.deadline <= now);
            *heap = BinaryHeap::from(live);
            self.metrics
                .set_gauge(names::QUEUE_DEPTH, &[], heap.len() as f64);
            expired = dead;
        }
        for entry in &expired {
            self.note_expired(&entry.id);
        }
        if !expired.is_empty() {
            debug!("🧹 Expired {} queued opportunities", expired.len());
        }
        expired.len()
    }

    fn note_expired(&self, id: &str) {
        self.metrics
            .incr_counter(names::OPPORTUNITY_EXPIRED_TOTAL, &[("stage", "queued")]);
        self.alerts.send(Alert::OpportunityExpired {
            opportunity_id: id.to_string(),
        });
    }

    pub fn depth(&self) -> usize {
        self.heap.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OpportunityKind, Urgency};
    use crate::modules::alerts::BufferedAlertSink;
    use crate::modules::metrics::MetricsCollector;
    use crate::modules::time_source::ManualClock;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn make_opportunity(id: &str, urgency: Urgency, confidence: f64, now: DateTime<Utc>) -> Opportunity {
        Opportunity {
            id: id.to_string(),
            kind: OpportunityKind::CrossVenue,
            symbols: vec!["SOL/USDC".to_string()],
            venues: vec!["a".to_string(), "b".to_string()],
            input_amount: 10.0,
            expected_output: 10.01,
            expected_profit: 0.01,
            max_slippage_bps: 50,
            urgency,
            confidence,
            created_at: now,
            deadline: now + chrono::Duration::seconds(30),
            required_capital: 10.0,
            flash_loan_amount: None,
            metadata: HashMap::new(),
        }
    }

    fn scheduler(capacity: usize) -> (PriorityScheduler, Arc<ManualClock>, Arc<HaltState>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let halt = Arc::new(HaltState::default());
        let scheduler = PriorityScheduler::new(
            SchedulerConfig {
                capacity,
                ..SchedulerConfig::default()
            },
            halt.clone(),
            clock.clone(),
            Arc::new(MetricsCollector::new()),
            Arc::new(BufferedAlertSink::new()),
        );
        (scheduler, clock, halt)
    }

    #[test]
    fn test_priority_formula_matches_contract() {
        let (scheduler, clock, _) = scheduler(16);
        let now = clock.now();
        // Normal urgency, confidence 0.8, no mev penalty, no age:
        // 0 + 0.1 + 0.16 = 0.26
        let op = make_opportunity("op", Urgency::Normal, 0.8, now);
        assert!((scheduler.priority(&op, now) - 0.26).abs() < 1e-9);
    }

    #[test]
    fn test_age_penalty_saturates() {
        let (scheduler, clock, _) = scheduler(16);
        let now = clock.now();
        let op = make_opportunity("op", Urgency::Critical, 1.0, now);
        let aged = scheduler.priority(&op, now + chrono::Duration::seconds(60));
        // 0.3 + 0.2 - 0.3 (saturated age penalty)
        assert!((aged - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_orders_by_priority_then_deadline() {
        let (scheduler, clock, _) = scheduler(16);
        let now = clock.now();
        let cancel = CancellationToken::new();

        let low = make_opportunity("low", Urgency::Low, 0.2, now);
        let high = make_opportunity("high", Urgency::Critical, 0.9, now);
        let mut tight = make_opportunity("tight", Urgency::Critical, 0.9, now);
        tight.deadline = now + chrono::Duration::seconds(5);

        scheduler.submit(low);
        scheduler.submit(high);
        scheduler.submit(tight);

        assert_eq!(scheduler.next(&cancel).await.unwrap().id, "tight");
        assert_eq!(scheduler.next(&cancel).await.unwrap().id, "high");
        assert_eq!(scheduler.next(&cancel).await.unwrap().id, "low");
    }

    #[tokio::test]
    async fn test_equal_entries_tie_break_on_id() {
        let (scheduler, clock, _) = scheduler(16);
        let now = clock.now();
        let cancel = CancellationToken::new();
        scheduler.submit(make_opportunity("bbb", Urgency::Normal, 0.5, now));
        scheduler.submit(make_opportunity("aaa", Urgency::Normal, 0.5, now));
        assert_eq!(scheduler.next(&cancel).await.unwrap().id, "aaa");
    }

    #[test]
    fn test_queue_full_rejects_without_blocking() {
        let (scheduler, clock, _) = scheduler(2);
        let now = clock.now();
        scheduler.submit(make_opportunity("a", Urgency::Normal, 0.5, now));
        scheduler.submit(make_opportunity("b", Urgency::Normal, 0.5, now));
        let outcome = scheduler.submit(make_opportunity("c", Urgency::Normal, 0.5, now));
        assert!(matches!(
            outcome,
            SubmitOutcome::Rejected {
                reason: SubmitReject::QueueFull
            }
        ));
        assert_eq!(scheduler.depth(), 2);
    }

    #[test]
    fn test_halted_rejects() {
        let (scheduler, clock, halt) = scheduler(4);
        let now = clock.now();
        halt.engage("drawdown");
        let outcome = scheduler.submit(make_opportunity("a", Urgency::Normal, 0.5, now));
        assert!(matches!(
            outcome,
            SubmitOutcome::Rejected {
                reason: SubmitReject::Halted
            }
        ));
        halt.release();
        assert!(matches!(
            scheduler.submit(make_opportunity("a", Urgency::Normal, 0.5, now)),
            SubmitOutcome::Accepted { .. }
        ));
    }

    #[test]
    fn test_deadline_now_is_rejected() {
        let (scheduler, clock, _) = scheduler(4);
        let now = clock.now();
        let mut op = make_opportunity("a", Urgency::Normal, 0.5, now);
        op.deadline = now;
        // deadline == created_at fails validation; nudge creation back so
        // only the expiry check fires
        op.created_at = now - chrono::Duration::seconds(1);
        let outcome = scheduler.submit(op);
        assert!(matches!(
            outcome,
            SubmitOutcome::Rejected {
                reason: SubmitReject::DeadlinePassed
            }
        ));
    }

    #[test]
    fn test_expire_sweep_purges_stale_entries() {
        let (scheduler, clock, _) = scheduler(8);
        let now = clock.now();
        let mut short = make_opportunity("short", Urgency::Normal, 0.5, now);
        short.deadline = now + chrono::Duration::seconds(1);
        scheduler.submit(short);
        scheduler.submit(make_opportunity("long", Urgency::Normal, 0.5, now));

        clock.advance(std::time::Duration::from_secs(2));
        assert_eq!(scheduler.expire_sweep(), 1);
        assert_eq!(scheduler.depth(), 1);
    }

    proptest! {
        #[test]
        fn prop_priority_always_in_unit_interval(
            confidence in 0.0f64..=1.0,
            urgency_idx in 0usize..4,
            age_ms in 0i64..600_000,
            profit in 0.0f64..5.0,
        ) {
            let (scheduler, clock, _) = scheduler(4);
            let now = clock.now();
            let urgency = [Urgency::Low, Urgency::Normal, Urgency::High, Urgency::Critical][urgency_idx];
            let mut op = make_opportunity("prop", urgency, confidence, now);
            op.expected_profit = profit;
            let priority = scheduler.priority(&op, now + chrono::Duration::milliseconds(age_ms));
            prop_assert!((0.0..=1.0).contains(&priority));
        }
    }
}
