//! Engine Orchestrator
//!
//! Wires the pipeline together and owns the worker pool. The exposed
//! surface is a library API: submit opportunities and pool events, read
//! portfolio snapshots and stats, halt/resume, and a shutdown that drains
//! in-flight work deterministically.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::models::{Opportunity, PortfolioSnapshot, Provider};
use crate::modules::alerts::{Alert, AlertSink};
use crate::modules::arbitrage::{ArbitrageDetector, RateUpdate};
use crate::modules::bundle_submitter::BundleSubmitter;
use crate::modules::circuit_breaker::CircuitRegistry;
use crate::modules::dex_quotes::QuoteProvider;
use crate::modules::executor::ExecutionCore;
use crate::modules::metrics::MetricsSink;
use crate::modules::persistence::PersistenceSink;
use crate::modules::provider_registry::ProviderRegistry;
use crate::modules::risk::{HaltState, RiskEngine};
use crate::modules::router::SubmissionRouter;
use crate::modules::rpc_client::RpcClient;
use crate::modules::scheduler::{PriorityScheduler, SubmitOutcome};
use crate::modules::sniper::{PoolCreationEvent, SnipeDecision, SnipeEvaluator};
use crate::modules::time_source::{Clock, RandomSource};

/// Everything the core consumes but does not own.
pub struct Collaborators {
    pub quotes: Arc<dyn QuoteProvider>,
    pub rpc: Arc<dyn RpcClient>,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
    pub metrics: Arc<dyn MetricsSink>,
    pub alerts: Arc<dyn AlertSink>,
    pub persistence: Arc<dyn PersistenceSink>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub queue_depth: usize,
    pub registered_providers: usize,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub executed_success: u64,
    pub executed_failure: u64,
    pub workers: usize,
}

pub struct TradingEngine {
    config: Config,
    scheduler: Arc<PriorityScheduler>,
    risk: Arc<RiskEngine>,
    registry: Arc<ProviderRegistry>,
    circuits: Arc<CircuitRegistry>,
    executor: Arc<ExecutionCore>,
    sniper: Arc<SnipeEvaluator>,
    detector: Arc<ArbitrageDetector>,
    halt: Arc<HaltState>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
    persistence: Arc<dyn PersistenceSink>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    executed_success: Arc<AtomicU64>,
    executed_failure: Arc<AtomicU64>,
}

impl TradingEngine {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let Collaborators {
            quotes,
            rpc,
            clock,
            random,
            metrics,
            alerts,
            persistence,
        } = collaborators;

        let halt = Arc::new(HaltState::default());
        let registry = Arc::new(ProviderRegistry::new(config.provider.clone(), metrics.clone()));
        let circuits = Arc::new(CircuitRegistry::new(
            config.circuit.clone(),
            metrics.clone(),
            alerts.clone(),
        ));
        let scheduler = Arc::new(PriorityScheduler::new(
            config.scheduler.clone(),
            halt.clone(),
            clock.clone(),
            metrics.clone(),
            alerts.clone(),
        ));
        let risk = Arc::new(RiskEngine::new(
            config.risk.clone(),
            config.engine.starting_cash,
            halt.clone(),
            clock.clone(),
            metrics.clone(),
            alerts.clone(),
        ));
        let router = Arc::new(SubmissionRouter::new(
            config.router.clone(),
            registry.clone(),
            circuits.clone(),
            rpc,
            clock.clone(),
        ));
        let executor = Arc::new(ExecutionCore::new(
            config.executor.clone(),
            router,
            quotes.clone(),
            registry.clone(),
            circuits.clone(),
            risk.clone(),
            clock.clone(),
            random,
            metrics.clone(),
            alerts.clone(),
            persistence.clone(),
        ));
        let sniper = Arc::new(SnipeEvaluator::new(
            config.sniper.clone(),
            quotes,
            clock.clone(),
            metrics.clone(),
            &config.executor.quote_mint,
        ));
        let detector = Arc::new(ArbitrageDetector::new(
            config.detector.clone(),
            clock.clone(),
            metrics,
        ));

        info!("🏁 THE APEX ENGINE assembled ({} workers)", config.engine.workers);
        Self {
            config,
            scheduler,
            risk,
            registry,
            circuits,
            executor,
            sniper,
            detector,
            halt,
            clock,
            alerts,
            persistence,
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            executed_success: Arc::new(AtomicU64::new(0)),
            executed_failure: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a provider together with its submission path.
    pub fn register_provider(&self, provider: Provider, submitter: Arc<dyn BundleSubmitter>) {
        self.executor.register_submitter(&provider.name, submitter);
        self.registry.register(provider);
    }

    /// Spawn the worker pool and the maintenance tasks. Idempotent-hostile
    /// by design: call once.
    pub fn start(&self) {
        let workers = self.config.engine.workers;
        let mut tasks = self.tasks.lock();

        for worker_id in 0..workers {
            let scheduler = self.scheduler.clone();
            let executor = self.executor.clone();
            let alerts = self.alerts.clone();
            let cancel = self.cancel.clone();
            let success_counter = self.executed_success.clone();
            let failure_counter = self.executed_failure.clone();
            tasks.push(tokio::spawn(async move {
                info!("👷 Worker {} online", worker_id);
                loop {
                    let Some(opportunity) = scheduler.next(&cancel).await else {
                        break;
                    };
                    match executor.execute(opportunity, &cancel).await {
                        Ok(outcome) => {
                            if outcome.success {
                                success_counter.fetch_add(1, Ordering::Relaxed);
                            } else {
                                failure_counter.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(invariant) => {
                            // Fatal to this worker; the loop continues as
                            // its replacement with fresh state.
                            error!("💥 Worker {} invariant failure: {}", worker_id, invariant);
                            alerts.send(Alert::WorkerReplaced {
                                worker_id,
                                reason: invariant.to_string(),
                            });
                        }
                    }
                }
                info!("👷 Worker {} drained", worker_id);
            }));
        }

        // Expiry sweeper.
        {
            let scheduler = self.scheduler.clone();
            let clock = self.clock.clone();
            let cancel = self.cancel.clone();
            let interval = Duration::from_millis(self.config.engine.sweep_interval_ms);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = clock.sleep(interval) => {
                            scheduler.expire_sweep();
                        }
                    }
                }
            }));
        }

        // Periodic portfolio snapshots to the persistence sink.
        {
            let risk = self.risk.clone();
            let persistence = self.persistence.clone();
            let clock = self.clock.clone();
            let cancel = self.cancel.clone();
            let interval = Duration::from_millis(self.config.engine.snapshot_interval_ms);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = clock.sleep(interval) => {
                            let snapshot = risk.snapshot().await;
                            if let Err(e) = persistence.record_snapshot(&snapshot).await {
                                warn!("Failed to persist portfolio snapshot: {}", e);
                            }
                        }
                    }
                }
            }));
        }
    }

    /// Admit an externally produced opportunity.
    pub fn submit_opportunity(&self, opportunity: Opportunity) -> SubmitOutcome {
        self.scheduler.submit(opportunity)
    }

    /// Evaluate a new-pool event; approved snipes are enqueued with
    /// critical urgency.
    pub async fn submit_event(&self, event: PoolCreationEvent) -> SnipeDecision {
        let decision = self.sniper.evaluate(&event).await;
        if let SnipeDecision::Approved { opportunity, .. } = &decision {
            match self.scheduler.submit(opportunity.clone()) {
                SubmitOutcome::Accepted { priority } => {
                    info!("🎯 Snipe {} enqueued at priority {:.3}", opportunity.id, priority);
                }
                SubmitOutcome::Rejected { reason } => {
                    warn!("🎯 Snipe {} rejected by scheduler: {}", opportunity.id, reason);
                }
            }
        }
        decision
    }

    /// Feed a market rate into the arbitrage detector; emitted
    /// opportunities go straight to the scheduler. Returns the number
    /// accepted.
    pub fn observe_rate(&self, update: RateUpdate) -> usize {
        let mut accepted = 0;
        for opportunity in self.detector.observe(update) {
            if matches!(
                self.scheduler.submit(opportunity),
                SubmitOutcome::Accepted { .. }
            ) {
                accepted += 1;
            }
        }
        accepted
    }

    pub async fn snapshot_portfolio(&self) -> PortfolioSnapshot {
        self.risk.snapshot().await
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            queue_depth: self.scheduler.depth(),
            registered_providers: self.registry.len(),
            halted: self.halt.is_halted(),
            halt_reason: self.halt.reason(),
            executed_success: self.executed_success.load(Ordering::Relaxed),
            executed_failure: self.executed_failure.load(Ordering::Relaxed),
            workers: self.config.engine.workers,
        }
    }

    pub fn halt(&self, reason: &str) {
        self.risk.halt(reason);
    }

    pub fn resume(&self) {
        self.risk.resume();
    }

    /// Reconcile the sniper blacklist from an external set.
    pub fn reconcile_blacklist<I: IntoIterator<Item = String>>(&self, creators: I) {
        self.sniper.reconcile_blacklist(creators);
    }

    pub fn sniper(&self) -> Arc<SnipeEvaluator> {
        self.sniper.clone()
    }

    pub fn circuits(&self) -> Arc<CircuitRegistry> {
        self.circuits.clone()
    }

    /// Cancel all tasks and drain them. In-flight executions observe the
    /// token at their next suspension point and exit with `Cancelled`.
    pub async fn shutdown(&self) {
        info!("🛑 Engine shutting down; draining workers...");
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Task join error during shutdown: {}", e);
            }
        }
        info!("🛑 Engine shutdown complete");
    }
}
