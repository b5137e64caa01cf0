//! Submission Router Module
//!
//! Picks the submission strategy for an opportunity, scores the qualifying
//! providers, and composes the plan skeleton (provider, fee, tip, timeout).
//! The execution core fills in the built transactions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::{
    MevRisk, Opportunity, OpportunityKind, Provider, ProviderCapability, SubmissionPlan,
    SubmissionStrategy, Urgency,
};
use crate::modules::circuit_breaker::CircuitRegistry;
use crate::modules::error_handling::EngineError;
use crate::modules::provider_registry::ProviderRegistry;
use crate::modules::rpc_client::RpcClient;
use crate::modules::time_source::Clock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Scoring weights; must sum to 1.
    pub w_latency: f64,
    pub w_success: f64,
    pub w_region: f64,
    pub w_age: f64,
    /// Idle-time normalizer for the age term.
    pub age_norm_ms: u64,
    /// Providers whose recent-window success rate sits below this floor are
    /// disqualified.
    pub recent_success_floor: f64,
    /// Hard cap on the priority fee after the urgency factor.
    pub max_priority_fee: u64,
    /// Minimum tip for bundle strategies.
    pub tip_floor: u64,
    /// Fallback fee when the estimator fails.
    pub fee_floor: u64,
    /// Regions with known bundle-relay presence; preferred for
    /// MEV-protected plans.
    pub bundle_regions: Vec<String>,
    /// Force MEV protection for all non-bundle plans.
    pub mev_protection_required: bool,
    /// Per-attempt confirmation timeout.
    pub confirm_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            w_latency: 0.35,
            w_success: 0.35,
            w_region: 0.15,
            w_age: 0.15,
            age_norm_ms: 60_000,
            recent_success_floor: 0.5,
            max_priority_fee: 1_000_000,
            tip_floor: 10_000,
            fee_floor: 5_000,
            bundle_regions: vec!["ams".to_string(), "ny".to_string(), "tokyo".to_string()],
            mev_protection_required: false,
            confirm_timeout_ms: 2_000,
        }
    }
}

pub struct SubmissionRouter {
    config: RouterConfig,
    registry: Arc<ProviderRegistry>,
    circuits: Arc<CircuitRegistry>,
    rpc: Arc<dyn RpcClient>,
    clock: Arc<dyn Clock>,
}

impl SubmissionRouter {
    pub fn new(
        config: RouterConfig,
        registry: Arc<ProviderRegistry>,
        circuits: Arc<CircuitRegistry>,
        rpc: Arc<dyn RpcClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            circuits,
            rpc,
            clock,
        }
    }

    /// Strategy rules, first match wins.
    pub fn choose_strategy(&self, opportunity: &Opportunity) -> SubmissionStrategy {
        if opportunity.kind == OpportunityKind::FlashLoanSnipe {
            return SubmissionStrategy::FlashLoan;
        }
        if opportunity.urgency == Urgency::Critical && opportunity.mev_risk() == MevRisk::High {
            return SubmissionStrategy::Bundle;
        }
        if self.config.mev_protection_required || opportunity.mev_protection_required() {
            return SubmissionStrategy::MevProtected;
        }
        SubmissionStrategy::Standard
    }

    fn required_capability(strategy: SubmissionStrategy) -> ProviderCapability {
        match strategy {
            SubmissionStrategy::Standard => ProviderCapability::StandardRpc,
            SubmissionStrategy::MevProtected => ProviderCapability::MevProtect,
            SubmissionStrategy::Bundle | SubmissionStrategy::FlashLoan => ProviderCapability::Bundle,
        }
    }

    fn score(&self, provider: &Provider, strategy: SubmissionStrategy, now: DateTime<Utc>) -> f64 {
        let latency_term = 1.0 / (provider.latency_ewma + 1.0);
        let success_term = provider.success_ewma;
        let region_bonus = if strategy.uses_bundle_relay()
            && self.config.bundle_regions.iter().any(|r| r == &provider.region)
        {
            1.0
        } else if strategy.uses_bundle_relay() {
            0.0
        } else {
            0.5
        };
        let idle_ms = provider
            .last_used_at
            .map(|t| now.signed_duration_since(t).num_milliseconds().max(0) as f64)
            .unwrap_or(self.config.age_norm_ms as f64);
        let age_term = (idle_ms / self.config.age_norm_ms as f64).min(1.0);

        self.config.w_latency * latency_term
            + self.config.w_success * success_term
            + self.config.w_region * region_bonus
            + self.config.w_age * age_term
    }

    /// Select the provider for a strategy right now, or `NoRoute`.
    pub fn select_provider(&self, strategy: SubmissionStrategy) -> Result<Provider, EngineError> {
        let now = self.clock.now();
        let mut best: Option<(f64, Provider)> = None;

        for provider in self.registry.candidates(Self::required_capability(strategy)) {
            if !self.circuits.admit(&provider.name, now) {
                debug!("⛔ {} skipped: circuit not admitting", provider.name);
                continue;
            }
            if let Some(rate) = self.registry.recent_success_rate(&provider.name) {
                if rate < self.config.recent_success_floor {
                    debug!("⛔ {} skipped: recent success {:.2} below floor", provider.name, rate);
                    continue;
                }
            }
            let score = self.score(&provider, strategy, now);
            let better = match &best {
                None => true,
                Some((best_score, best_provider)) => {
                    score > *best_score
                        || (score == *best_score && provider.latency_ewma < best_provider.latency_ewma)
                }
            };
            if better {
                best = Some((score, provider));
            }
        }

        best.map(|(_, provider)| provider).ok_or(EngineError::NoRoute)
    }

    /// Compose a plan skeleton for the opportunity: provider, strategy,
    /// priority fee and tip. Transactions are attached by the builder.
    pub async fn plan(&self, opportunity: &Opportunity) -> Result<SubmissionPlan, EngineError> {
        let strategy = self.choose_strategy(opportunity);
        let provider = self.select_provider(strategy)?;

        let estimated = match self.rpc.fee_estimate(opportunity.urgency).await {
            Ok(estimate) => estimate.fee_lamports,
            Err(e) => {
                warn!(
                    "⚠️ Fee estimator failed ({}); falling back to floor {}",
                    e, self.config.fee_floor
                );
                self.config.fee_floor
            }
        };
        let priority_fee = ((estimated as f64 * opportunity.urgency.fee_factor()) as u64)
            .min(self.config.max_priority_fee);
        let tip = if strategy.uses_bundle_relay() {
            priority_fee.max(self.config.tip_floor)
        } else {
            0
        };

        self.registry.mark_used(&provider.name, self.clock.now());
        debug!(
            "🧭 Routed {} via {} [{}] fee {} tip {}",
            opportunity.id, provider.name, strategy, priority_fee, tip
        );

        Ok(SubmissionPlan {
            provider: provider.name,
            transactions: Vec::new(),
            priority_fee,
            tip,
            timeout: Duration::from_millis(self.config.confirm_timeout_ms),
            skip_preflight: opportunity.urgency >= Urgency::High,
            strategy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::alerts::BufferedAlertSink;
    use crate::modules::circuit_breaker::CircuitConfig;
    use crate::modules::metrics::NullMetrics;
    use crate::modules::provider_registry::ProviderHealthConfig;
    use crate::modules::rpc_client::MockRpcClient;
    use crate::modules::time_source::ManualClock;
    use std::collections::HashMap;

    fn opportunity(kind: OpportunityKind, urgency: Urgency) -> Opportunity {
        let now = Utc::now();
        let (symbols, venues) = match kind {
            OpportunityKind::Triangular => (
                vec!["X".to_string(), "Y".to_string(), "Z".to_string()],
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
            ),
            _ => (
                vec!["SOL/USDC".to_string()],
                vec!["a".to_string(), "b".to_string()],
            ),
        };
        Opportunity {
            id: "op".to_string(),
            kind,
            symbols,
            venues,
            input_amount: 10.0,
            expected_output: 10.01,
            expected_profit: 0.01,
            max_slippage_bps: 50,
            urgency,
            confidence: 0.8,
            created_at: now,
            deadline: now + chrono::Duration::seconds(30),
            required_capital: 10.0,
            flash_loan_amount: if kind == OpportunityKind::FlashLoanSnipe {
                Some(5.0)
            } else {
                None
            },
            metadata: HashMap::new(),
        }
    }

    struct Fixture {
        router: SubmissionRouter,
        registry: Arc<ProviderRegistry>,
        circuits: Arc<CircuitRegistry>,
    }

    fn fixture() -> Fixture {
        let metrics: Arc<dyn crate::modules::metrics::MetricsSink> = Arc::new(NullMetrics);
        let registry = Arc::new(ProviderRegistry::new(
            ProviderHealthConfig::default(),
            metrics.clone(),
        ));
        let circuits = Arc::new(CircuitRegistry::new(
            CircuitConfig::default(),
            metrics,
            Arc::new(BufferedAlertSink::new()),
        ));
        let router = SubmissionRouter::new(
            RouterConfig::default(),
            registry.clone(),
            circuits.clone(),
            Arc::new(MockRpcClient::new(10_000)),
            Arc::new(ManualClock::new(Utc::now())),
        );
        Fixture {
            router,
            registry,
            circuits,
        }
    }

    fn full_provider(name: &str, region: &str) -> Provider {
        Provider::new(
            name,
            "https://rpc.example",
            region,
            &[
                ProviderCapability::StandardRpc,
                ProviderCapability::Bundle,
                ProviderCapability::MevProtect,
            ],
        )
    }

    #[test]
    fn test_strategy_rules_first_match_wins() {
        let f = fixture();
        assert_eq!(
            f.router.choose_strategy(&opportunity(OpportunityKind::FlashLoanSnipe, Urgency::Low)),
            SubmissionStrategy::FlashLoan
        );

        let mut critical = opportunity(OpportunityKind::CrossVenue, Urgency::Critical);
        critical.metadata.insert("mev_risk".to_string(), "high".to_string());
        assert_eq!(f.router.choose_strategy(&critical), SubmissionStrategy::Bundle);

        let mut protected = opportunity(OpportunityKind::CrossVenue, Urgency::Normal);
        protected
            .metadata
            .insert("mev_protection".to_string(), "required".to_string());
        assert_eq!(f.router.choose_strategy(&protected), SubmissionStrategy::MevProtected);

        assert_eq!(
            f.router
                .choose_strategy(&opportunity(OpportunityKind::CrossVenue, Urgency::Normal)),
            SubmissionStrategy::Standard
        );
    }

    #[test]
    fn test_no_providers_is_no_route() {
        let f = fixture();
        assert!(matches!(
            f.router.select_provider(SubmissionStrategy::Standard),
            Err(EngineError::NoRoute)
        ));
    }

    #[test]
    fn test_open_circuit_disqualifies() {
        let f = fixture();
        f.registry.register(full_provider("only", "ams"));
        let now = Utc::now();
        for _ in 0..5 {
            f.circuits.record_failure("only", now, "transient");
        }
        assert!(matches!(
            f.router.select_provider(SubmissionStrategy::Standard),
            Err(EngineError::NoRoute)
        ));
    }

    #[test]
    fn test_prefers_healthier_provider() {
        let f = fixture();
        f.registry.register(full_provider("fast", "ams"));
        f.registry.register(full_provider("slow", "ams"));
        for _ in 0..10 {
            f.registry.record_result("fast", true, 20.0, 1.0);
            f.registry.record_result("slow", true, 400.0, 1.0);
        }
        let chosen = f.router.select_provider(SubmissionStrategy::Standard).unwrap();
        assert_eq!(chosen.name, "fast");
    }

    #[test]
    fn test_bundle_region_bonus_applies() {
        let f = fixture();
        f.registry.register(full_provider("relay", "ams"));
        f.registry.register(full_provider("remote", "nowhere"));
        // identical health, only the region differs
        for _ in 0..10 {
            f.registry.record_result("relay", true, 50.0, 1.0);
            f.registry.record_result("remote", true, 50.0, 1.0);
        }
        let chosen = f.router.select_provider(SubmissionStrategy::MevProtected).unwrap();
        assert_eq!(chosen.name, "relay");
    }

    #[tokio::test]
    async fn test_fee_urgency_factor_and_cap() {
        let f = fixture();
        f.registry.register(full_provider("p", "ams"));

        // mock estimator: base 10_000 * 8 for critical; factor 2.0 => 160_000
        let plan = f
            .router
            .plan(&opportunity(OpportunityKind::CrossVenue, Urgency::Critical))
            .await
            .unwrap();
        assert_eq!(plan.priority_fee, 160_000);
        assert_eq!(plan.tip, 0);

        let mut bundle_op = opportunity(OpportunityKind::CrossVenue, Urgency::Critical);
        bundle_op.metadata.insert("mev_risk".to_string(), "high".to_string());
        let bundle_plan = f.router.plan(&bundle_op).await.unwrap();
        assert!(bundle_plan.strategy.uses_bundle_relay());
        assert_eq!(bundle_plan.tip, bundle_plan.priority_fee.max(10_000));
    }

    #[tokio::test]
    async fn test_fee_estimator_failure_uses_floor() {
        let f = fixture();
        f.registry.register(full_provider("p", "ams"));
        let rpc = MockRpcClient::new(10_000);
        rpc.fail_next_fee_estimates(1);
        let router = SubmissionRouter::new(
            RouterConfig::default(),
            f.registry.clone(),
            f.circuits.clone(),
            Arc::new(rpc),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let plan = router
            .plan(&opportunity(OpportunityKind::CrossVenue, Urgency::Low))
            .await
            .unwrap();
        // floor 5_000 * factor 1.0
        assert_eq!(plan.priority_fee, 5_000);
    }
}
