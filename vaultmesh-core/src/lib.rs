//! vaultmesh-core
//!
//! Cross-chain rebalancing orchestrator.
//!
//! A home-chain [`RebalanceController`] collects balance reports from every
//! registered [`ChainVault`], computes a target allocation and sends one
//! instruction per chain back out, over a bridge that may drop, duplicate or
//! reorder messages. Everything here is synchronous and deterministic: time
//! comes in as unix seconds and messages move through a
//! [`vaultmesh_gmp::Transport`].
//!
//! # Round lifecycle
//!
//! ```text
//! Idle → AwaitingReports → Ready → Allocating → Dispatching → Settling → Idle
//! ```
//!
//! The guardian can push a round past a missing report quorum once the report
//! deadline passed (`force_advance`) and can end any round (`force_settle`).

pub mod allocation;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod guard;
pub mod round;
pub mod strategy;
pub mod vault;

pub use allocation::{allocate, plan, split_by_weight, StrategyWeights};
pub use config::OrchestratorConfig;
pub use controller::{AckOutcome, DeliveryOutcome, Origin, RebalanceController, ReportOutcome};
pub use error::{AllocationError, OrchestratorError, RequiredRole, Result, VaultError};
pub use events::{AuditEvent, AuditJournal, AuditKind};
pub use guard::{PolicyGuard, Principal, Role, RoleBindings};
pub use round::{
    ChainEntry, ChainStatus, Round, RoundOutcome, RoundState, RoundSummary, VaultEndpoint,
};
pub use strategy::{StrategyAdapter, RATE_SCALE};
pub use vault::{ChainVault, StrategySlot, VaultSnapshot};
