//! Error types for the rebalancing orchestrator

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use vaultmesh_gmp::{Amount, ChainId, RoundId};

use crate::round::RoundState;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Role a caller must hold for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequiredRole {
    Dao,
    Guardian,
    DaoOrScheduler,
    GuardianOrDao,
    Vault(ChainId),
}

impl fmt::Display for RequiredRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequiredRole::Dao => write!(f, "dao"),
            RequiredRole::Guardian => write!(f, "guardian"),
            RequiredRole::DaoOrScheduler => write!(f, "dao or scheduler"),
            RequiredRole::GuardianOrDao => write!(f, "guardian or dao"),
            RequiredRole::Vault(chain_id) => write!(f, "vault of chain {}", chain_id),
        }
    }
}

/// Errors returned by controller entry points. None of them leaves the
/// controller in a state a later round cannot recover from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// Capability check failed, nothing was changed
    #[error("unauthorized: {caller} is not {required}")]
    Unauthorized { caller: String, required: RequiredRole },

    /// Message tagged with a round other than the active one
    #[error("stale message for round {received} (current round {current})")]
    StaleMessage { received: RoundId, current: RoundId },

    #[error("round {round_id} already active ({state})")]
    RoundAlreadyActive { round_id: RoundId, state: RoundState },

    /// Operation invoked out of sequence
    #[error("round is {actual}, operation requires {expected}")]
    RoundNotReady { expected: RoundState, actual: RoundState },

    #[error("no active round")]
    NoActiveRound,

    #[error("report deadline {deadline} not reached (now {now})")]
    DeadlineNotReached { deadline: u64, now: u64 },

    #[error("chain {0} already registered")]
    AlreadyRegistered(ChainId),

    #[error("chain {0} is not part of the active round")]
    UnknownChain(ChainId),

    #[error("no chains registered")]
    NoRegisteredChains,

    #[error("controller is paused")]
    Paused,

    #[error("malformed message: {0}")]
    Malformed(String),

    /// Report would push the round total past the amount range; not recorded
    #[error("report of {amount} from chain {chain_id} overflows round total {total}")]
    TotalOverflow { chain_id: ChainId, amount: Amount, total: Amount },

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

impl OrchestratorError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Unauthorized { .. } => "UNAUTHORIZED",
            OrchestratorError::StaleMessage { .. } => "STALE_MESSAGE",
            OrchestratorError::RoundAlreadyActive { .. } => "ROUND_ALREADY_ACTIVE",
            OrchestratorError::RoundNotReady { .. } => "ROUND_NOT_READY",
            OrchestratorError::NoActiveRound => "NO_ACTIVE_ROUND",
            OrchestratorError::DeadlineNotReached { .. } => "DEADLINE_NOT_REACHED",
            OrchestratorError::AlreadyRegistered(_) => "ALREADY_REGISTERED",
            OrchestratorError::UnknownChain(_) => "UNKNOWN_CHAIN",
            OrchestratorError::NoRegisteredChains => "NO_REGISTERED_CHAINS",
            OrchestratorError::Paused => "PAUSED",
            OrchestratorError::Malformed(_) => "MALFORMED_MESSAGE",
            OrchestratorError::TotalOverflow { .. } => "TOTAL_OVERFLOW",
            OrchestratorError::Allocation(_) => "ALLOCATION_ERROR",
        }
    }
}

/// Errors from the allocation calculator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("cannot allocate {total} across zero chains")]
    NoParticipants { total: Amount },
}

/// Errors returned by a chain vault when handling an instruction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    /// Duplicate or reordered instruction
    #[error("stale round {round_id}: last applied round is {last_applied}")]
    StaleRound { round_id: RoundId, last_applied: RoundId },

    /// A previous instruction is still moving funds; retry later
    #[error("vault busy with round {in_flight}")]
    VaultBusy { in_flight: RoundId },

    #[error("instruction for chain {got} delivered to chain {expected}")]
    WrongChain { expected: ChainId, got: ChainId },

    #[error("unknown strategy index {0}")]
    UnknownStrategy(usize),
}
