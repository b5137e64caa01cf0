//! DEX Quote Module
//!
//! The quote provider contract the pipeline consumes, an aggregator-backed
//! HTTP client, and the transaction-building helper that turns an accepted
//! quote into an opaque signed-payload string.

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::modules::error_handling::{classify_status, EngineError};

/// A priced route for one swap leg. `plan` is an opaque token the quote
/// service hands back; the builder threads it through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub input_mint: String,
    pub output_mint: String,
    pub input_amount: f64,
    pub output_amount: f64,
    pub price_impact: f64,
    pub plan: String,
}

impl Quote {
    pub fn effective_price(&self) -> f64 {
        if self.input_amount == 0.0 {
            return 0.0;
        }
        self.output_amount / self.input_amount
    }
}

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: f64,
        slippage_bps: u16,
    ) -> Result<Quote, EngineError>;
}

/// Aggregator-style HTTP quote client (Jupiter v6 shape).
pub struct HttpQuoteClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpQuoteClient {
    pub fn new(base_url: &str, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl QuoteProvider for HttpQuoteClient {
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: f64,
        slippage_bps: u16,
    ) -> Result<Quote, EngineError> {
        let url = format!(
            "{}/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}",
            self.base_url, input_mint, output_mint, amount as u64, slippage_bps
        );
        debug!("📡 Fetching quote: {} -> {}", input_mint, output_mint);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("quote request failed: {}", e)))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("quote response unreadable: {}", e)))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body.to_string()));
        }
        if let Some(error) = body.get("error") {
            return Err(EngineError::PermanentExternal(format!("quote rejected: {}", error)));
        }

        let output_amount = body
            .get("outAmount")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| body.get("outAmount").and_then(|v| v.as_f64()))
            .ok_or_else(|| EngineError::PermanentExternal("quote missing outAmount".into()))?;
        let price_impact = body
            .get("priceImpactPct")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(Quote {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            input_amount: amount,
            output_amount,
            price_impact,
            plan: body.to_string(),
        })
    }
}

/// Deterministic quote source backed by a rate table. Serves tests and
/// paper-mode runs; rates are directional (`(input, output)` keyed).
#[derive(Debug, Default)]
pub struct StaticQuoteProvider {
    rates: DashMap<(String, String), f64>,
    fee_rate: f64,
}

impl StaticQuoteProvider {
    pub fn new(fee_rate: f64) -> Self {
        Self {
            rates: DashMap::new(),
            fee_rate,
        }
    }

    pub fn set_rate(&self, input_mint: &str, output_mint: &str, rate: f64) {
        self.rates
            .insert((input_mint.to_string(), output_mint.to_string()), rate);
    }
}

#[async_trait]
impl QuoteProvider for StaticQuoteProvider {
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: f64,
        _slippage_bps: u16,
    ) -> Result<Quote, EngineError> {
        let rate = self
            .rates
            .get(&(input_mint.to_string(), output_mint.to_string()))
            .map(|r| *r)
            .ok_or_else(|| {
                EngineError::PermanentExternal(format!(
                    "no route quoted for {} -> {}",
                    input_mint, output_mint
                ))
            })?;
        let gross = amount * rate;
        let output_amount = gross * (1.0 - self.fee_rate);
        Ok(Quote {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            input_amount: amount,
            output_amount,
            price_impact: 0.0,
            plan: format!("{{\"static\":\"{}->{}\"}}", input_mint, output_mint),
        })
    }
}

/// Instruction payload serialized into the opaque transaction string.
#[derive(Debug, Serialize, Deserialize)]
struct SwapInstruction {
    plan: String,
    input_mint: String,
    output_mint: String,
    amount: f64,
    slippage_bps: u16,
    priority_fee: u64,
}

/// Build the wire payload for one accepted quote. The engine treats the
/// result as opaque; only the submission provider decodes it.
pub fn build_swap_transaction(quote: &Quote, slippage_bps: u16, priority_fee: u64) -> Result<String, EngineError> {
    let instruction = SwapInstruction {
        plan: quote.plan.clone(),
        input_mint: quote.input_mint.clone(),
        output_mint: quote.output_mint.clone(),
        amount: quote.input_amount,
        slippage_bps,
        priority_fee,
    };
    let bytes = bincode::serialize(&instruction)
        .map_err(|e| EngineError::PermanentExternal(format!("transaction build failed: {}", e)))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    info!(
        "🔧 Built swap transaction {} -> {} ({} bytes)",
        quote.input_mint,
        quote.output_mint,
        encoded.len()
    );
    Ok(encoded)
}
