//! Error Handling Module
//!
//! The typed failure taxonomy for THE APEX ENGINE. Every fallible pipeline
//! step collapses into one of these kinds, and the kind alone decides retry
//! eligibility, provider-health accounting and upstream propagation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ExecutionErrorInfo;

/// Engine error, one variant per failure kind.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Timeouts, provider 5xx, temporary rate limits. Retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Quote rejected, simulation reverted. Not retryable; counts against
    /// the provider at a discounted weight.
    #[error("permanent external failure: {0}")]
    PermanentExternal(String),

    /// Risk rejection or global halt. Returned upstream verbatim.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Internal invariant broke. Fatal to the current worker.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Deadline expiry or cooperative cancellation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// No provider qualified for the required capability.
    #[error("no route: no qualifying provider")]
    NoRoute,
}

/// Stable string tag for metrics labels, alerts and persisted outcomes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    PermanentExternal,
    PolicyViolation,
    Invariant,
    Cancelled,
    NoRoute,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::PermanentExternal => write!(f, "permanent_external"),
            ErrorKind::PolicyViolation => write!(f, "policy_violation"),
            ErrorKind::Invariant => write!(f, "invariant"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::NoRoute => write!(f, "no_route"),
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Transient(_) => ErrorKind::Transient,
            EngineError::PermanentExternal(_) => ErrorKind::PermanentExternal,
            EngineError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            EngineError::Invariant(_) => ErrorKind::Invariant,
            EngineError::Cancelled(_) => ErrorKind::Cancelled,
            EngineError::NoRoute => ErrorKind::NoRoute,
        }
    }

    /// Only transient failures enter the retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    /// Weight this failure contributes to the provider's health record.
    /// Cancellations and policy rejections never count against a provider;
    /// permanent external failures count at a discount.
    pub fn provider_failure_weight(&self) -> f64 {
        match self {
            EngineError::Transient(_) => 1.0,
            EngineError::PermanentExternal(_) => 0.25,
            _ => 0.0,
        }
    }

    pub fn to_info(&self) -> ExecutionErrorInfo {
        ExecutionErrorInfo {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// Classify an HTTP-ish status code from a collaborator into an engine error.
pub fn classify_status(status: u16, body: &str) -> EngineError {
    match status {
        429 | 500..=599 => EngineError::Transient(format!("HTTP {}: {}", status, body)),
        408 => EngineError::Transient(format!("request timeout: {}", body)),
        _ => EngineError::PermanentExternal(format!("HTTP {}: {}", status, body)),
    }
}
