//! Bundle Submitter Module
//!
//! The per-provider submission path: hand a plan's transactions to the
//! provider, then poll the resulting bundle to conclusion. The HTTP client
//! speaks the relay JSON-RPC (`sendBundle` / `getBundleStatus`).

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{SubmissionPlan, Urgency};
use crate::modules::error_handling::{classify_status, EngineError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub bundle_id: String,
    pub submission_ms: u64,
}

/// Terminal confirmation state for a submitted bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfirmOutcome {
    Confirmed {
        tx_hash: String,
        filled_input: f64,
        filled_output: f64,
        sol_delta: f64,
        fees: f64,
    },
    Reverted {
        reason: String,
    },
    TimedOut,
}

#[async_trait]
pub trait BundleSubmitter: Send + Sync {
    async fn submit(&self, plan: &SubmissionPlan, urgency: Urgency) -> Result<SubmissionReceipt, EngineError>;
    async fn confirm(&self, bundle_id: &str, timeout: Duration) -> Result<ConfirmOutcome, EngineError>;
}

/// Relay-backed submitter in the block-engine JSON-RPC shape.
pub struct HttpBundleSubmitter {
    client: reqwest::Client,
    endpoint: String,
    auth_key: String,
    poll_interval: Duration,
}

impl HttpBundleSubmitter {
    pub fn new(endpoint: &str, auth_key: &str, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.to_string(),
            auth_key: auth_key.to_string(),
            poll_interval: Duration::from_millis(200),
        }
    }

    async fn rpc(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, EngineError> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", &self.auth_key)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::Transient(format!("relay request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::Transient(format!("relay response unreadable: {}", e)))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &text));
        }
        let body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| EngineError::PermanentExternal(format!("relay response invalid: {}", e)))?;
        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown relay error");
            return Err(EngineError::PermanentExternal(format!("relay error: {}", message)));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| EngineError::PermanentExternal("relay response missing result".into()))
    }
}

#[async_trait]
impl BundleSubmitter for HttpBundleSubmitter {
    async fn submit(&self, plan: &SubmissionPlan, urgency: Urgency) -> Result<SubmissionReceipt, EngineError> {
        if plan.transactions.is_empty() {
            return Err(EngineError::Invariant("submission plan has no transactions".into()));
        }
        let start = Instant::now();
        info!(
            "🚀 Submitting {} tx(s) via {} (tip {}, urgency {})",
            plan.transactions.len(),
            plan.provider,
            plan.tip,
            urgency
        );
        let result = self
            .rpc(
                "sendBundle",
                serde_json::json!({
                    "transactions": plan.transactions,
                    "tip_lamports": plan.tip,
                    "skip_preflight": plan.skip_preflight,
                }),
            )
            .await?;
        let bundle_id = result
            .as_str()
            .map(|s| s.to_string())
            .or_else(|| result.get("bundle_id").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .ok_or_else(|| EngineError::PermanentExternal("relay returned no bundle id".into()))?;
        Ok(SubmissionReceipt {
            bundle_id,
            submission_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn confirm(&self, bundle_id: &str, timeout: Duration) -> Result<ConfirmOutcome, EngineError> {
        let started = Instant::now();
        loop {
            let result = self
                .rpc("getBundleStatus", serde_json::json!({ "bundle_id": bundle_id }))
                .await?;
            let status = result.get("status").and_then(|s| s.as_str()).unwrap_or("pending");
            debug!("⏳ Bundle {} status: {}", bundle_id, status);
            match status {
                "landed" | "confirmed" => {
                    return Ok(ConfirmOutcome::Confirmed {
                        tx_hash: result
                            .get("signature")
                            .and_then(|s| s.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        filled_input: result.get("filled_input").and_then(|v| v.as_f64()).unwrap_or(0.0),
                        filled_output: result.get("filled_output").and_then(|v| v.as_f64()).unwrap_or(0.0),
                        sol_delta: result.get("sol_delta").and_then(|v| v.as_f64()).unwrap_or(0.0),
                        fees: result.get("fees").and_then(|v| v.as_f64()).unwrap_or(0.0),
                    });
                }
                "reverted" | "failed" => {
                    let reason = result
                        .get("reason")
                        .and_then(|r| r.as_str())
                        .unwrap_or("bundle reverted")
                        .to_string();
                    return Ok(ConfirmOutcome::Reverted { reason });
                }
                _ => {}
            }
            if started.elapsed() >= timeout {
                return Ok(ConfirmOutcome::TimedOut);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Scripted result for one `MockSubmitter` attempt.
#[derive(Debug, Clone)]
pub enum ScriptedAttempt {
    Confirm {
        filled_input: f64,
        filled_output: f64,
        sol_delta: f64,
        fees: f64,
    },
    Revert(String),
    SubmitError(String),
    Timeout,
}

/// Test submitter that plays back a script, in order, one entry per
/// attempt. When the script runs dry every attempt confirms with the
/// configured default fill.
pub struct MockSubmitter {
    script: Mutex<VecDeque<ScriptedAttempt>>,
    default_fill: ScriptedAttempt,
    pub submissions: Mutex<Vec<SubmissionPlan>>,
    pending: Mutex<std::collections::HashMap<String, ScriptedAttempt>>,
}

impl MockSubmitter {
    pub fn new(default_fill: ScriptedAttempt) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_fill,
            submissions: Mutex::new(Vec::new()),
            pending: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn confirming(filled_input: f64, filled_output: f64, fees: f64) -> Self {
        Self::new(ScriptedAttempt::Confirm {
            filled_input,
            filled_output,
            sol_delta: filled_output - filled_input,
            fees,
        })
    }

    pub fn push_attempt(&self, attempt: ScriptedAttempt) {
        self.script.lock().push_back(attempt);
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }
}

#[async_trait]
impl BundleSubmitter for MockSubmitter {
    async fn submit(&self, plan: &SubmissionPlan, _urgency: Urgency) -> Result<SubmissionReceipt, EngineError> {
        self.submissions.lock().push(plan.clone());
        let attempt = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_fill.clone());
        if let ScriptedAttempt::SubmitError(message) = &attempt {
            return Err(EngineError::Transient(message.clone()));
        }
        let bundle_id = format!("bundle_{}", Uuid::new_v4());
        self.pending.lock().insert(bundle_id.clone(), attempt);
        Ok(SubmissionReceipt {
            bundle_id,
            submission_ms: 1,
        })
    }

    async fn confirm(&self, bundle_id: &str, _timeout: Duration) -> Result<ConfirmOutcome, EngineError> {
        let attempt = self
            .pending
            .lock()
            .remove(bundle_id)
            .ok_or_else(|| EngineError::Invariant(format!("unknown bundle {}", bundle_id)))?;
        match attempt {
            ScriptedAttempt::Confirm {
                filled_input,
                filled_output,
                sol_delta,
                fees,
            } => Ok(ConfirmOutcome::Confirmed {
                tx_hash: format!("tx_{}", &bundle_id[7..15.min(bundle_id.len())]),
                filled_input,
                filled_output,
                sol_delta,
                fees,
            }),
            ScriptedAttempt::Revert(reason) => Ok(ConfirmOutcome::Reverted { reason }),
            ScriptedAttempt::Timeout => Ok(ConfirmOutcome::TimedOut),
            ScriptedAttempt::SubmitError(message) => Err(EngineError::Transient(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubmissionStrategy;

    fn plan() -> SubmissionPlan {
        SubmissionPlan {
            provider: "mock".to_string(),
            transactions: vec!["AQ==".to_string()],
            priority_fee: 1_000,
            tip: 2_000,
            timeout: Duration::from_millis(500),
            skip_preflight: true,
            strategy: SubmissionStrategy::Bundle,
        }
    }

    #[tokio::test]
    async fn test_mock_plays_script_then_default() {
        let submitter = MockSubmitter::confirming(1.0, 1.01, 0.001);
        submitter.push_attempt(ScriptedAttempt::SubmitError("relay 503".into()));

        let err = submitter.submit(&plan(), Urgency::Normal).await.unwrap_err();
        assert!(matches!(err, EngineError::Transient(_)));

        let receipt = submitter.submit(&plan(), Urgency::Normal).await.unwrap();
        let outcome = submitter
            .confirm(&receipt.bundle_id, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(outcome, ConfirmOutcome::Confirmed { .. }));
        assert_eq!(submitter.submission_count(), 2);
    }
}
