//! RPC Client Module
//!
//! JSON-RPC access to the ledger plus priority-fee estimation. The HTTP
//! implementation follows the standard `{"jsonrpc":"2.0",...}` envelope.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::models::Urgency;
use crate::modules::error_handling::{classify_status, EngineError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub fee_lamports: u64,
    pub confidence: f64,
    pub provider: String,
}

#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError>;
    async fn fee_estimate(&self, urgency: Urgency) -> Result<FeeEstimate, EngineError>;
}

pub struct HttpRpcClient {
    client: reqwest::Client,
    endpoint: String,
    name: String,
}

impl HttpRpcClient {
    pub fn new(name: &str, endpoint: &str, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let request_body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Transient(format!("rpc timeout: {}", e))
                } else {
                    EngineError::Transient(format!("rpc request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let json_response: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Transient(format!("rpc response unreadable: {}", e)))?;

        if let Some(error) = json_response.get("error") {
            return Err(EngineError::PermanentExternal(format!("rpc error: {}", error)));
        }

        json_response
            .get("result")
            .cloned()
            .ok_or_else(|| EngineError::PermanentExternal("rpc response missing result".into()))
    }

    async fn fee_estimate(&self, urgency: Urgency) -> Result<FeeEstimate, EngineError> {
        let level = match urgency {
            Urgency::Low => "low",
            Urgency::Normal => "medium",
            Urgency::High => "high",
            Urgency::Critical => "veryHigh",
        };
        let result = self
            .call(
                "getPriorityFeeEstimate",
                serde_json::json!([{ "priorityLevel": level }]),
            )
            .await?;
        let fee_lamports = result
            .get("priorityFeeEstimate")
            .and_then(|v| v.as_f64())
            .map(|v| v as u64)
            .ok_or_else(|| EngineError::PermanentExternal("fee estimate missing value".into()))?;
        debug!("💸 Fee estimate [{}]: {} lamports", level, fee_lamports);
        Ok(FeeEstimate {
            fee_lamports,
            confidence: result.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.5),
            provider: self.name.clone(),
        })
    }
}

/// Scripted RPC for tests: fixed fee schedule, optional scripted failures.
pub struct MockRpcClient {
    fee_base: u64,
    fail_fee_estimates: Mutex<u32>,
}

impl MockRpcClient {
    pub fn new(fee_base: u64) -> Self {
        Self {
            fee_base,
            fail_fee_estimates: Mutex::new(0),
        }
    }

    /// Make the next `count` fee estimates fail with a transient error.
    pub fn fail_next_fee_estimates(&self, count: u32) {
        *self.fail_fee_estimates.lock() = count;
    }
}

#[async_trait]
impl RpcClient for MockRpcClient {
    async fn call(&self, _method: &str, _params: Value) -> Result<Value, EngineError> {
        Ok(Value::Null)
    }

    async fn fee_estimate(&self, urgency: Urgency) -> Result<FeeEstimate, EngineError> {
        {
            let mut remaining = self.fail_fee_estimates.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::Transient("fee estimator unavailable".into()));
            }
        }
        let multiplier = match urgency {
            Urgency::Low => 1,
            Urgency::Normal => 2,
            Urgency::High => 4,
            Urgency::Critical => 8,
        };
        Ok(FeeEstimate {
            fee_lamports: self.fee_base * multiplier,
            confidence: 0.9,
            provider: "mock".to_string(),
        })
    }
}
