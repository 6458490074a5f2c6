//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use vaultmesh_gmp::ChainId;

/// Report window in seconds
pub const DEFAULT_REPORT_WINDOW_SECS: u64 = 300;
/// Acknowledgement window in seconds
pub const DEFAULT_ACK_WINDOW_SECS: u64 = 600;
pub const DEFAULT_JOURNAL_CAPACITY: usize = 1_024;
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub report_window_secs: u64,
    pub ack_window_secs: u64,
    /// Chain the controller lives on
    pub home_chain_id: ChainId,
    /// Chain receiving allocation dust; defaults to the home chain
    pub rounding_remainder_chain: Option<ChainId>,
    pub journal_capacity: usize,
    pub history_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            report_window_secs: DEFAULT_REPORT_WINDOW_SECS,
            ack_window_secs: DEFAULT_ACK_WINDOW_SECS,
            home_chain_id: vaultmesh_gmp::chains::ETHEREUM,
            rounding_remainder_chain: None,
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    pub fn remainder_chain(&self) -> ChainId {
        self.rounding_remainder_chain.unwrap_or(self.home_chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.report_window_secs, 300);
        assert_eq!(config.ack_window_secs, 600);
        assert_eq!(config.remainder_chain(), 1);

        let config = OrchestratorConfig {
            rounding_remainder_chain: Some(10),
            ..config
        };
        assert_eq!(config.remainder_chain(), 10);
    }
}
