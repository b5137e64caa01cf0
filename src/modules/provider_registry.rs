//! Provider Health Registry
//!
//! Shared registry of submission providers with EWMA latency/success
//! tracking. All pipeline components read snapshots; only the registry's
//! record path writes, one entry at a time, so readers may observe slightly
//! stale EWMAs but never uninitialized state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{Provider, ProviderCapability};
use crate::modules::metrics::{names, MetricsSink};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthConfig {
    /// EWMA weight of a new latency sample.
    pub latency_alpha: f64,
    /// EWMA weight of a new success/failure observation at full weight.
    pub success_alpha: f64,
    /// Below this success EWMA the provider is health-deactivated.
    pub deactivation_threshold: f64,
    /// Recovery above this EWMA re-activates a health-deactivated provider.
    pub reactivation_threshold: f64,
    /// Sliding window length for the recent-outcome success floor.
    pub recent_window: usize,
}

impl Default for ProviderHealthConfig {
    fn default() -> Self {
        Self {
            latency_alpha: 0.2,
            success_alpha: 0.1,
            deactivation_threshold: 0.5,
            reactivation_threshold: 0.6,
            recent_window: 20,
        }
    }
}

#[derive(Debug, Clone)]
struct ProviderHealth {
    provider: Provider,
    recent: VecDeque<bool>,
}

/// Concurrent provider map. Writes take the per-entry exclusive lock that
/// `DashMap` provides; no entry lock is ever held across an await point.
pub struct ProviderRegistry {
    entries: DashMap<String, ProviderHealth>,
    config: ProviderHealthConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl ProviderRegistry {
    pub fn new(config: ProviderHealthConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            metrics,
        }
    }

    pub fn register(&self, provider: Provider) {
        info!(
            "📇 Registered provider {} ({}, {:?})",
            provider.name, provider.region, provider.capabilities
        );
        self.entries.insert(
            provider.name.clone(),
            ProviderHealth {
                provider,
                recent: VecDeque::new(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self, name: &str) -> Option<Provider> {
        self.entries.get(name).map(|e| e.provider.clone())
    }

    pub fn all(&self) -> Vec<Provider> {
        self.entries.iter().map(|e| e.provider.clone()).collect()
    }

    /// Providers eligible for routing: selectable and carrying the
    /// capability the chosen strategy needs.
    pub fn candidates(&self, capability: ProviderCapability) -> Vec<Provider> {
        self.entries
            .iter()
            .filter(|e| e.provider.selectable() && e.provider.supports(capability))
            .map(|e| e.provider.clone())
            .collect()
    }

    /// Success rate over the recent-outcome window, if enough samples exist.
    pub fn recent_success_rate(&self, name: &str) -> Option<f64> {
        self.entries.get(name).and_then(|e| {
            if e.recent.len() < self.config.recent_window {
                return None;
            }
            let successes = e.recent.iter().filter(|s| **s).count();
            Some(successes as f64 / e.recent.len() as f64)
        })
    }

    pub fn mark_used(&self, name: &str, now: DateTime<Utc>) {
        if let Some(mut entry) = self.entries.get_mut(name) {
            entry.provider.last_used_at = Some(now);
        }
    }

    /// Fold one attempt outcome into the provider's health. `weight`
    /// discounts how hard a failure counts (permanent-external failures
    /// carry 0.25; cancellations never reach this path).
    pub fn record_result(&self, name: &str, success: bool, latency_ms: f64, weight: f64) {
        let Some(mut entry) = self.entries.get_mut(name) else {
            return;
        };
        let health = entry.value_mut();
        let provider = &mut health.provider;

        if provider.latency_ewma == 0.0 {
            provider.latency_ewma = latency_ms;
        } else {
            provider.latency_ewma = provider.latency_ewma * (1.0 - self.config.latency_alpha)
                + latency_ms * self.config.latency_alpha;
        }

        let observation = if success { 1.0 } else { 0.0 };
        let alpha = (self.config.success_alpha * weight.max(0.0)).min(1.0);
        if alpha > 0.0 {
            provider.success_ewma = provider.success_ewma * (1.0 - alpha) + observation * alpha;
        }

        health.recent.push_back(success);
        while health.recent.len() > self.config.recent_window {
            health.recent.pop_front();
        }

        if provider.active && provider.success_ewma < self.config.deactivation_threshold {
            provider.active = false;
            warn!(
                "🔻 Provider {} deactivated (success ewma {:.3})",
                provider.name, provider.success_ewma
            );
        } else if !provider.active && provider.success_ewma >= self.config.reactivation_threshold {
            provider.active = true;
            info!(
                "🔼 Provider {} reactivated (success ewma {:.3})",
                provider.name, provider.success_ewma
            );
        }

        let name_label = provider.name.clone();
        let success_ewma = provider.success_ewma;
        drop(entry);

        self.metrics.observe_histogram(
            names::PROVIDER_LATENCY_MS,
            &[("provider", &name_label)],
            latency_ms,
        );
        self.metrics.set_gauge(
            names::PROVIDER_SUCCESS_RATE,
            &[("provider", &name_label)],
            success_ewma,
        );
    }

    /// Operator switch; independent of health deactivation and never
    /// cleared automatically.
    pub fn set_manual_disable(&self, name: &str, disabled: bool) {
        if let Some(mut entry) = self.entries.get_mut(name) {
            entry.provider.manually_disabled = disabled;
            if disabled {
                warn!("⛔ Provider {} manually disabled", name);
            } else {
                info!("✳️ Provider {} manually re-enabled", name);
            }
        }
    }
}
