// Submission provider descriptor
// Health fields are maintained by the provider registry's single writer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProviderCapability {
    StandardRpc,
    Bundle,
    MevProtect,
    ShredStream,
}

/// A transaction-submission path: a standard RPC endpoint, a bundle relay,
/// or both. `active` tracks health-based deactivation; `manually_disabled`
/// is an independent operator switch and only an operator clears it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub endpoint: String,
    pub region: String,
    pub latency_ewma: f64,
    pub success_ewma: f64,
    pub active: bool,
    pub manually_disabled: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub capabilities: HashSet<ProviderCapability>,
}

impl Provider {
    pub fn new(name: &str, endpoint: &str, region: &str, capabilities: &[ProviderCapability]) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            region: region.to_string(),
            latency_ewma: 0.0,
            success_ewma: 1.0,
            active: true,
            manually_disabled: false,
            last_used_at: None,
            capabilities: capabilities.iter().copied().collect(),
        }
    }

    pub fn supports(&self, capability: ProviderCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Selectable means neither health-deactivated nor operator-disabled.
    pub fn selectable(&self) -> bool {
        self.active && !self.manually_disabled
    }
}
