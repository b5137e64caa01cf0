// Configuration management for THE APEX ENGINE
// Frozen, typed configuration built once at startup from environment
// variables. Hot reload is replacing the struct atomically, nothing else.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use tracing::info;

use crate::modules::arbitrage::DetectorConfig;
use crate::modules::circuit_breaker::CircuitConfig;
use crate::modules::executor::ExecutorConfig;
use crate::modules::provider_registry::ProviderHealthConfig;
use crate::modules::risk::RiskConfig;
use crate::modules::router::RouterConfig;
use crate::modules::scheduler::SchedulerConfig;
use crate::modules::sniper::SniperConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Size of the executor worker pool.
    pub workers: usize,
    pub starting_cash: f64,
    pub sweep_interval_ms: u64,
    pub snapshot_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            starting_cash: 10_000.0,
            sweep_interval_ms: 1_000,
            snapshot_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub quote_url: String,
    pub rpc_url: String,
    pub relay_auth_key: String,
    pub http_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            quote_url: "https://quote-api.jup.ag/v6".to_string(),
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            relay_auth_key: String::new(),
            http_timeout_ms: 5_000,
        }
    }
}

/// Root configuration for THE APEX ENGINE.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineSettings,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub risk: RiskConfig,
    pub provider: ProviderHealthConfig,
    pub circuit: CircuitConfig,
    pub router: RouterConfig,
    pub sniper: SniperConfig,
    pub detector: DetectorConfig,
    pub api: ApiConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Config::default();

        config.engine.workers = env_parse("APEX_EXECUTOR_WORKERS", config.engine.workers)?;
        config.engine.starting_cash = env_parse("APEX_STARTING_CASH", config.engine.starting_cash)?;
        config.engine.sweep_interval_ms =
            env_parse("APEX_SWEEP_INTERVAL_MS", config.engine.sweep_interval_ms)?;
        config.engine.snapshot_interval_ms =
            env_parse("APEX_SNAPSHOT_INTERVAL_MS", config.engine.snapshot_interval_ms)?;

        config.scheduler.capacity = env_parse("APEX_SCHEDULER_CAPACITY", config.scheduler.capacity)?;
        config.scheduler.age_cap_ms = env_parse("APEX_SCHEDULER_AGE_CAP_MS", config.scheduler.age_cap_ms)?;

        config.executor.retry_base_ms = env_parse("APEX_RETRY_BASE_MS", config.executor.retry_base_ms)?;
        config.executor.retry_cap_ms = env_parse("APEX_RETRY_CAP_MS", config.executor.retry_cap_ms)?;
        config.executor.max_retries = env_parse("APEX_RETRY_MAX_ATTEMPTS", config.executor.max_retries)?;
        config.executor.mev_jitter_cap_ms =
            env_parse("APEX_MEV_JITTER_CAP_MS", config.executor.mev_jitter_cap_ms)?;

        config.risk.max_position_fraction =
            env_parse("APEX_RISK_MAX_POSITION_FRACTION", config.risk.max_position_fraction)?;
        config.risk.max_drawdown = env_parse("APEX_RISK_MAX_DRAWDOWN", config.risk.max_drawdown)?;
        config.risk.max_consecutive_losses = env_parse(
            "APEX_RISK_MAX_CONSECUTIVE_LOSSES",
            config.risk.max_consecutive_losses,
        )?;
        config.risk.max_daily_loss = env_parse("APEX_RISK_MAX_DAILY_LOSS", config.risk.max_daily_loss)?;
        config.risk.max_position_concentration = env_parse(
            "APEX_RISK_MAX_POSITION_CONCENTRATION",
            config.risk.max_position_concentration,
        )?;
        config.risk.rapid_drawdown_threshold = env_parse(
            "APEX_RISK_RAPID_DRAWDOWN_THRESHOLD",
            config.risk.rapid_drawdown_threshold,
        )?;
        config.risk.min_risk_reward = env_parse("APEX_RISK_MIN_RISK_REWARD", config.risk.min_risk_reward)?;

        config.circuit.failure_threshold =
            env_parse("APEX_PROVIDER_FAILURE_THRESHOLD", config.circuit.failure_threshold)?;
        config.circuit.cooldown_ms =
            env_parse("APEX_PROVIDER_COOLDOWN_MS", config.circuit.cooldown_ms)?;
        config.circuit.halfopen_probes =
            env_parse("APEX_PROVIDER_HALFOPEN_PROBES", config.circuit.halfopen_probes)?;

        config.sniper.lp_burn_threshold_bps = env_parse(
            "APEX_SNIPER_LP_BURN_THRESHOLD_BPS",
            config.sniper.lp_burn_threshold_bps,
        )?;
        config.sniper.max_top5_holder_pct =
            env_parse("APEX_SNIPER_MAX_TOP5_HOLDER_PCT", config.sniper.max_top5_holder_pct)?;
        config.sniper.min_liquidity = env_parse("APEX_SNIPER_MIN_LIQUIDITY", config.sniper.min_liquidity)?;
        config.sniper.min_token_age_secs =
            env_parse("APEX_SNIPER_MIN_TOKEN_AGE", config.sniper.min_token_age_secs)?;
        config.sniper.max_token_age_secs =
            env_parse("APEX_SNIPER_MAX_TOKEN_AGE", config.sniper.max_token_age_secs)?;
        config.sniper.profit_floor = env_parse("APEX_SNIPER_PROFIT_FLOOR", config.sniper.profit_floor)?;

        config.router.max_priority_fee = env_parse("APEX_MAX_PRIORITY_FEE", config.router.max_priority_fee)?;
        config.router.tip_floor = env_parse("APEX_TIP_FLOOR", config.router.tip_floor)?;
        config.router.mev_protection_required = env_parse(
            "APEX_MEV_PROTECTION_REQUIRED",
            config.router.mev_protection_required,
        )?;

        config.api.quote_url = env::var("APEX_QUOTE_URL").unwrap_or(config.api.quote_url);
        config.api.rpc_url = env::var("APEX_RPC_URL").unwrap_or(config.api.rpc_url);
        config.api.relay_auth_key = env::var("APEX_RELAY_AUTH_KEY").unwrap_or(config.api.relay_auth_key);
        config.api.http_timeout_ms = env_parse("APEX_HTTP_TIMEOUT_MS", config.api.http_timeout_ms)?;

        config.validate().context("configuration validation failed")?;
        info!(
            "⚙️ Configuration loaded: {} workers, queue capacity {}",
            config.engine.workers, config.scheduler.capacity
        );
        Ok(config)
    }

    /// Validate cross-field invariants that a frozen config must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.engine.workers == 0 {
            anyhow::bail!("executor.workers must be at least 1");
        }
        if self.scheduler.capacity == 0 {
            anyhow::bail!("scheduler.capacity must be at least 1");
        }
        if self.engine.starting_cash <= 0.0 {
            anyhow::bail!("starting cash must be positive");
        }
        if !(0.0..=1.0).contains(&self.risk.max_position_fraction) {
            anyhow::bail!("risk.max_position_fraction must be in (0, 1]");
        }
        if !(0.0..=1.0).contains(&self.risk.max_drawdown) {
            anyhow::bail!("risk.max_drawdown must be in (0, 1]");
        }
        let weight_sum =
            self.router.w_latency + self.router.w_success + self.router.w_region + self.router.w_age;
        if (weight_sum - 1.0).abs() > 1e-6 {
            anyhow::bail!("router weights must sum to 1 (got {})", weight_sum);
        }
        if self.executor.retry_cap_ms < self.executor.retry_base_ms {
            anyhow::bail!("retry.cap_ms must be >= retry.base_ms");
        }
        if self.sniper.max_token_age_secs < self.sniper.min_token_age_secs {
            anyhow::bail!("sniper token age window is inverted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut config = Config::default();
        config.engine.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_router_weights() {
        let mut config = Config::default();
        config.router.w_latency = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_retry_bounds() {
        let mut config = Config::default();
        config.executor.retry_base_ms = 2_000;
        config.executor.retry_cap_ms = 100;
        assert!(config.validate().is_err());
    }
}
