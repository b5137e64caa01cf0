/*
THE APEX ENGINE - Execution Scenario Tests

Component-level scenarios with a manual clock:
- provider circuit lifecycle under sustained transient failures
- NoRoute wait ending in expiry
- cancellation and policy rejections leaving no portfolio trace
*/

use apex_engine::modules::time_source::Clock;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use apex_engine::config::Config;
use apex_engine::models::{Opportunity, OpportunityKind, Provider, ProviderCapability, Urgency};
use apex_engine::modules::alerts::{Alert, AlertSink, BufferedAlertSink};
use apex_engine::modules::bundle_submitter::{MockSubmitter, ScriptedAttempt};
use apex_engine::modules::circuit_breaker::{CircuitConfig, CircuitPhase, CircuitRegistry};
use apex_engine::modules::dex_quotes::StaticQuoteProvider;
use apex_engine::modules::executor::{ExecutionCore, ExecutorConfig};
use apex_engine::modules::metrics::{MetricsCollector, MetricsSink};
use apex_engine::modules::persistence::MemoryPersistence;
use apex_engine::modules::provider_registry::{ProviderHealthConfig, ProviderRegistry};
use apex_engine::modules::risk::{HaltState, RiskEngine};
use apex_engine::modules::router::{RouterConfig, SubmissionRouter};
use apex_engine::modules::rpc_client::MockRpcClient;
use apex_engine::modules::time_source::{FixedRandom, ManualClock, RandomSource};

struct Rig {
    core: ExecutionCore,
    clock: Arc<ManualClock>,
    submitter: Arc<MockSubmitter>,
    circuits: Arc<CircuitRegistry>,
    risk: Arc<RiskEngine>,
    registry: Arc<ProviderRegistry>,
    alerts: Arc<BufferedAlertSink>,
    persistence: Arc<MemoryPersistence>,
}

fn rig(with_provider: bool, random: Arc<dyn RandomSource>) -> Rig {
    let config = Config::default();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let metrics: Arc<dyn MetricsSink> = Arc::new(MetricsCollector::new());
    let alerts = Arc::new(BufferedAlertSink::new());
    let alerts_dyn: Arc<dyn AlertSink> = alerts.clone();

    let registry = Arc::new(ProviderRegistry::new(
        ProviderHealthConfig::default(),
        metrics.clone(),
    ));
    let submitter = Arc::new(MockSubmitter::confirming(10.0, 10.06, 0.003));
    if with_provider {
        registry.register(Provider::new(
            "flaky",
            "https://relay.example",
            "ams",
            &[
                ProviderCapability::StandardRpc,
                ProviderCapability::Bundle,
                ProviderCapability::MevProtect,
            ],
        ));
    }
    let circuits = Arc::new(CircuitRegistry::new(
        CircuitConfig {
            failure_threshold: 5,
            cooldown_ms: 1_000,
            halfopen_probes: 3,
        },
        metrics.clone(),
        alerts_dyn.clone(),
    ));
    let router = Arc::new(SubmissionRouter::new(
        RouterConfig::default(),
        registry.clone(),
        circuits.clone(),
        Arc::new(MockRpcClient::new(1_000)),
        clock.clone(),
    ));
    let risk = Arc::new(RiskEngine::new(
        config.risk.clone(),
        10_000.0,
        Arc::new(HaltState::default()),
        clock.clone(),
        metrics.clone(),
        alerts_dyn.clone(),
    ));
    let quotes = Arc::new(StaticQuoteProvider::new(0.001));
    quotes.set_rate("USDC", "SOL/USDC", 1.0);
    quotes.set_rate("SOL/USDC", "USDC", 1.01);
    let persistence = Arc::new(MemoryPersistence::new());

    let core = ExecutionCore::new(
        ExecutorConfig {
            retry_base_ms: 100,
            retry_cap_ms: 800,
            max_retries: 3,
            mev_jitter_cap_ms: 0,
            no_route_poll_ms: 100,
            quote_mint: "USDC".to_string(),
        },
        router,
        quotes,
        registry.clone(),
        circuits.clone(),
        risk.clone(),
        clock.clone(),
        random,
        metrics,
        alerts_dyn,
        persistence.clone(),
    );
    core.register_submitter("flaky", submitter.clone());

    Rig {
        core,
        clock,
        submitter,
        circuits,
        risk,
        registry,
        alerts,
        persistence,
    }
}

fn opportunity(clock: &ManualClock, id: &str, deadline_ms: i64) -> Arc<Opportunity> {
    let now = clock.now();
    Arc::new(Opportunity {
        id: id.to_string(),
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
        deadline: now + chrono::Duration::milliseconds(deadline_ms),
        required_capital: 10.0,
        flash_loan_amount: None,
        metadata: HashMap::new(),
    })
}

#[tokio::test]
async fn test_provider_circuit_full_lifecycle() {
    let r = rig(true, Arc::new(FixedRandom(0.25)));
    let cancel = CancellationToken::new();
    for _ in 0..5 {
        r.submitter
            .push_attempt(ScriptedAttempt::SubmitError("relay 503".into()));
    }

    // First opportunity burns four attempts; breaker stays Closed at 4/5.
    let outcome = r
        .core
        .execute(opportunity(&r.clock, "op-1", 60_000), &cancel)
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(r.circuits.phase("flaky"), CircuitPhase::Closed);

    // Fifth consecutive failure opens the circuit; the execution then waits
    // out the cooldown, probes through HalfOpen, and lands its fill.
    r.clock.advance(Duration::from_millis(2_500));
    let outcome = r
        .core
        .execute(opportunity(&r.clock, "op-2", 60_000), &cancel)
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(r.circuits.phase("flaky"), CircuitPhase::HalfOpen);
    assert!(r
        .alerts
        .snapshot()
        .iter()
        .any(|a| matches!(a, Alert::CircuitOpened { scope, .. } if scope == "flaky")));

    // Two more clean executions complete the three half-open probes.
    for (id, offset) in [("op-3", 2_500u64), ("op-4", 2_500)] {
        r.clock.advance(Duration::from_millis(offset));
        let outcome = r
            .core
            .execute(opportunity(&r.clock, id, 60_000), &cancel)
            .await
            .unwrap();
        assert!(outcome.success, "{} should succeed", id);
    }
    assert_eq!(r.circuits.phase("flaky"), CircuitPhase::Closed);
    assert!(r
        .alerts
        .snapshot()
        .iter()
        .any(|a| matches!(a, Alert::CircuitClosed { scope } if scope == "flaky")));
}

#[tokio::test]
async fn test_no_route_waits_then_expires() {
    let r = rig(false, Arc::new(FixedRandom(0.25)));
    let cancel = CancellationToken::new();
    let outcome = r
        .core
        .execute(opportunity(&r.clock, "op-nr", 1_000), &cancel)
        .await
        .unwrap();
    assert!(!outcome.success);
    let error = outcome.error.unwrap();
    assert_eq!(error.kind, "cancelled");
    assert!(error.message.contains("deadline expired"));
    assert!(r
        .alerts
        .snapshot()
        .iter()
        .any(|a| matches!(a, Alert::OpportunityExpired { .. })));
}

#[tokio::test]
async fn test_pre_cancelled_execution_records_no_provider_failure() {
    let r = rig(true, Arc::new(FixedRandom(0.25)));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let before = r.registry.snapshot("flaky").unwrap();
    let outcome = r
        .core
        .execute(opportunity(&r.clock, "op-c", 30_000), &cancel)
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.error.unwrap().kind, "cancelled");
    assert_eq!(r.submitter.submission_count(), 0);

    let after = r.registry.snapshot("flaky").unwrap();
    assert_eq!(before.success_ewma, after.success_ewma);
    assert_eq!(r.circuits.phase("flaky"), CircuitPhase::Closed);
}

#[tokio::test]
async fn test_policy_rejection_leaves_portfolio_untouched() {
    let r = rig(true, Arc::new(FixedRandom(0.25)));
    let cancel = CancellationToken::new();

    r.risk.halt("operator");
    let before = r.risk.snapshot().await;
    let outcome = r
        .core
        .execute(opportunity(&r.clock, "op-p", 30_000), &cancel)
        .await
        .unwrap();
    let after = r.risk.snapshot().await;

    assert!(!outcome.success);
    assert_eq!(outcome.error.unwrap().kind, "policy_violation");
    assert_eq!(before.total_value, after.total_value);
    assert_eq!(before.available_cash, after.available_cash);
    assert_eq!(before.open_positions, after.open_positions);
    // the rejection is still a terminal outcome on the record
    assert_eq!(r.persistence.outcomes.lock().len(), 1);
}

#[tokio::test]
async fn test_successful_execution_grows_cash_by_profit() {
    let r = rig(true, Arc::new(FixedRandom(0.25)));
    let cancel = CancellationToken::new();
    let before = r.risk.snapshot().await;
    let outcome = r
        .core
        .execute(opportunity(&r.clock, "op-s", 30_000), &cancel)
        .await
        .unwrap();
    assert!(outcome.success);
    let after = r.risk.snapshot().await;
    assert!((after.total_value - before.total_value - outcome.actual_profit).abs() < 1e-9);
    assert!(after.peak_value >= before.peak_value);
}
