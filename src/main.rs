// THE APEX ENGINE
// Binary entry point: assemble the engine from environment configuration
// with HTTP-backed collaborators and run until interrupted.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use apex_engine::config::Config;
use apex_engine::engine::{Collaborators, TradingEngine};
use apex_engine::models::{Provider, ProviderCapability};
use apex_engine::modules::alerts::TracingAlertSink;
use apex_engine::modules::bundle_submitter::HttpBundleSubmitter;
use apex_engine::modules::dex_quotes::HttpQuoteClient;
use apex_engine::modules::metrics::MetricsCollector;
use apex_engine::modules::persistence::{JsonlPersistence, NullPersistence, PersistenceSink};
use apex_engine::modules::rpc_client::HttpRpcClient;
use apex_engine::modules::time_source::{SystemClock, ThreadRandom};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .init();

    info!("🏁 THE APEX ENGINE starting...");
    let config = Config::from_env()?;

    let persistence: Arc<dyn PersistenceSink> = match std::env::var("APEX_OUTCOME_LOG") {
        Ok(path) => {
            let outcomes = std::path::PathBuf::from(&path);
            let snapshots = outcomes.with_extension("snapshots.jsonl");
            Arc::new(JsonlPersistence::open(&outcomes, &snapshots)?)
        }
        Err(_) => {
            warn!("APEX_OUTCOME_LOG unset; outcomes will not be persisted");
            Arc::new(NullPersistence)
        }
    };

    let collaborators = Collaborators {
        quotes: Arc::new(HttpQuoteClient::new(
            &config.api.quote_url,
            config.api.http_timeout_ms,
        )),
        rpc: Arc::new(HttpRpcClient::new(
            "primary-rpc",
            &config.api.rpc_url,
            config.api.http_timeout_ms,
        )),
        clock: Arc::new(SystemClock),
        random: Arc::new(ThreadRandom),
        metrics: Arc::new(MetricsCollector::new()),
        alerts: Arc::new(TracingAlertSink),
        persistence,
    };

    let engine = TradingEngine::new(config.clone(), collaborators);

    // Submission providers come from APEX_PROVIDERS:
    // "name|endpoint|region[;name|endpoint|region...]". Every provider gets
    // the full capability set; trim via the registry if a path lacks a
    // bundle relay.
    let providers = std::env::var("APEX_PROVIDERS").unwrap_or_default();
    for entry in providers.split(';').filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split('|').collect();
        let [name, endpoint, region] = parts.as_slice() else {
            warn!("Skipping malformed provider entry: {}", entry);
            continue;
        };
        let provider = Provider::new(
            name,
            endpoint,
            region,
            &[
                ProviderCapability::StandardRpc,
                ProviderCapability::Bundle,
                ProviderCapability::MevProtect,
            ],
        );
        let submitter = Arc::new(HttpBundleSubmitter::new(
            endpoint,
            &config.api.relay_auth_key,
            config.api.http_timeout_ms,
        ));
        engine.register_provider(provider, submitter);
        info!("🔌 Provider {} registered at {}", name, endpoint);
    }
    if engine.stats().registered_providers == 0 {
        warn!("No providers registered; every plan will return NoRoute");
    }

    engine.start();
    info!("✅ Engine online; press Ctrl-C to drain and exit");

    tokio::signal::ctrl_c().await?;
    engine.shutdown().await;
    Ok(())
}
