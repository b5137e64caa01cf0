//! Data model for THE APEX ENGINE
//!
//! Core domain types shared across the pipeline: opportunities, portfolio
//! state, providers, submission plans and execution outcomes. All types are
//! serde-serializable so they can flow through persistence and alerting
//! unchanged.

pub mod execution;
pub mod opportunity;
pub mod portfolio;
pub mod provider;

pub use execution::{ExecutionErrorInfo, ExecutionOutcome, SubmissionPlan, SubmissionStrategy};
pub use opportunity::{MevRisk, Opportunity, OpportunityKind, Urgency};
pub use portfolio::{Portfolio, PortfolioSnapshot, Position};
pub use provider::{Provider, ProviderCapability};
