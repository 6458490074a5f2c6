//! Round and chain bookkeeping owned by the controller

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use vaultmesh_gmp::{Acknowledgement, AllocationInstruction, Amount, ChainId, RoundId};

use crate::guard::Principal;

// ═══════════════════════════════════════════════════════════════════════════════
// STATES
// ═══════════════════════════════════════════════════════════════════════════════

/// Controller round lifecycle. Transitions are strictly linear:
/// `Idle → AwaitingReports → Ready → Allocating → Dispatching → Settling → Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Idle,
    AwaitingReports,
    Ready,
    Allocating,
    Dispatching,
    Settling,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundState::Idle => "idle",
            RoundState::AwaitingReports => "awaiting_reports",
            RoundState::Ready => "ready",
            RoundState::Allocating => "allocating",
            RoundState::Dispatching => "dispatching",
            RoundState::Settling => "settling",
        };
        f.write_str(name)
    }
}

/// Per-chain status, reset at every round start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Unregistered,
    Registered,
    /// Balance request outstanding
    Reporting,
    Reported,
    /// Missed a deadline this round
    Failed,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAINS
// ═══════════════════════════════════════════════════════════════════════════════

/// Remote vault endpoint on a registered chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEndpoint {
    /// Vault contract address on its chain
    pub address: String,
    /// Identity allowed to report and acknowledge for the chain
    pub principal: Principal,
}

impl VaultEndpoint {
    pub fn new(address: impl Into<String>, principal: impl Into<Principal>) -> Self {
        Self {
            address: address.into(),
            principal: principal.into(),
        }
    }
}

/// Controller-side view of a registered chain
#[derive(Debug, Clone, Serialize)]
pub struct ChainEntry {
    pub chain_id: ChainId,
    pub chain_name: String,
    pub endpoint: VaultEndpoint,
    pub last_reported_balance: Amount,
    /// Zero until the chain reports for the first time
    pub last_report_round: RoundId,
    pub last_achieved: Option<Amount>,
    pub status: ChainStatus,
}

impl ChainEntry {
    pub fn new(chain_id: ChainId, endpoint: VaultEndpoint) -> Self {
        Self {
            chain_id,
            chain_name: vaultmesh_gmp::chains::display_name(chain_id),
            endpoint,
            last_reported_balance: 0,
            last_report_round: 0,
            last_achieved: None,
            status: ChainStatus::Registered,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROUNDS
// ═══════════════════════════════════════════════════════════════════════════════

/// The single in-progress round
#[derive(Debug, Clone, Serialize)]
pub struct Round {
    pub round_id: RoundId,
    pub state: RoundState,
    pub started_at: u64,
    /// Report deadline, unix seconds
    pub deadline: u64,
    pub expected: BTreeSet<ChainId>,
    pub reported: BTreeSet<ChainId>,
    pub failed: BTreeSet<ChainId>,
    pub balances: BTreeMap<ChainId, Amount>,
    pub total_underlying: Amount,
    /// Set when instructions go out
    pub ack_deadline: Option<u64>,
    pub instructions: BTreeMap<ChainId, AllocationInstruction>,
    pub acks: BTreeMap<ChainId, Acknowledgement>,
    /// Whether the lapsed report deadline has been announced
    #[serde(skip)]
    pub(crate) deadline_lapse_reported: bool,
}

impl Round {
    pub fn new(round_id: RoundId, expected: BTreeSet<ChainId>, now: u64, report_window: u64) -> Self {
        Self {
            round_id,
            state: RoundState::AwaitingReports,
            started_at: now,
            deadline: now.saturating_add(report_window),
            expected,
            reported: BTreeSet::new(),
            failed: BTreeSet::new(),
            balances: BTreeMap::new(),
            total_underlying: 0,
            ack_deadline: None,
            instructions: BTreeMap::new(),
            acks: BTreeMap::new(),
            deadline_lapse_reported: false,
        }
    }

    /// Expected chains that have not reported
    pub fn missing_reports(&self) -> BTreeSet<ChainId> {
        self.expected.difference(&self.reported).copied().collect()
    }

    /// Dispatched chains that have not acknowledged
    pub fn missing_acks(&self) -> BTreeSet<ChainId> {
        self.instructions
            .keys()
            .filter(|chain_id| !self.acks.contains_key(chain_id))
            .copied()
            .collect()
    }

    pub fn has_quorum(&self) -> bool {
        self.reported == self.expected
    }

    /// Chains that take part in allocation: reported and not failed
    pub fn participants(&self) -> BTreeMap<ChainId, Amount> {
        self.balances
            .iter()
            .filter(|(chain_id, _)| !self.failed.contains(chain_id))
            .map(|(chain_id, amount)| (*chain_id, *amount))
            .collect()
    }

    pub fn all_acked(&self) -> bool {
        self.instructions.keys().all(|chain_id| self.acks.contains_key(chain_id))
    }
}

/// How a round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Completed,
    AckTimeout,
    ForceSettled,
}

/// Archived record of a finished round
#[derive(Debug, Clone, Serialize)]
pub struct RoundSummary {
    pub round_id: RoundId,
    pub started_at: u64,
    pub settled_at: u64,
    pub total_underlying: Amount,
    pub participants: BTreeSet<ChainId>,
    pub failed: BTreeSet<ChainId>,
    pub instructions: Vec<AllocationInstruction>,
    pub acknowledgements: Vec<Acknowledgement>,
    pub outcome: RoundOutcome,
}

impl RoundSummary {
    pub fn archive(round: Round, settled_at: u64, outcome: RoundOutcome) -> Self {
        let participants = round.participants().into_keys().collect();
        Self {
            round_id: round.round_id,
            started_at: round.started_at,
            settled_at,
            total_underlying: round.total_underlying,
            participants,
            failed: round.failed,
            instructions: round.instructions.into_values().collect(),
            acknowledgements: round.acks.into_values().collect(),
            outcome,
        }
    }
}
