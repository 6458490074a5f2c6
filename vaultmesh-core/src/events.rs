//! Audit journal
//!
//! Every state transition, guardian bypass, acknowledgement mismatch,
//! delivery failure and role change is appended here and mirrored to
//! `tracing` under the `vaultmesh::audit` target.

use std::collections::{BTreeSet, VecDeque};

use serde::Serialize;
use tracing::info;
use vaultmesh_gmp::{Amount, ChainId, RoundId};

use crate::round::RoundState;

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditKind {
    StateTransition,
    /// Guardian skipped a quorum or acknowledgement requirement
    GuardianBypass {
        condition: String,
        chains: BTreeSet<ChainId>,
    },
    AcknowledgementMismatch { target: Amount, achieved: Amount },
    ChainFailed { reason: String },
    DeliveryFailure { reason: String },
    RoleChanged { role: String, previous: String, current: String },
    ChainRegistered,
    ChainDeregistered,
    ReportDeadlineLapsed { missing: BTreeSet<ChainId> },
    Paused,
    Unpaused,
}

impl AuditKind {
    pub fn label(&self) -> &'static str {
        match self {
            AuditKind::StateTransition => "state_transition",
            AuditKind::GuardianBypass { .. } => "guardian_bypass",
            AuditKind::AcknowledgementMismatch { .. } => "acknowledgement_mismatch",
            AuditKind::ChainFailed { .. } => "chain_failed",
            AuditKind::DeliveryFailure { .. } => "delivery_failure",
            AuditKind::RoleChanged { .. } => "role_changed",
            AuditKind::ChainRegistered => "chain_registered",
            AuditKind::ChainDeregistered => "chain_deregistered",
            AuditKind::ReportDeadlineLapsed { .. } => "report_deadline_lapsed",
            AuditKind::Paused => "paused",
            AuditKind::Unpaused => "unpaused",
        }
    }
}

/// One journal entry
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub seq: u64,
    /// Unix seconds
    pub at: u64,
    pub round_id: Option<RoundId>,
    pub chain_id: Option<ChainId>,
    pub before: Option<RoundState>,
    pub after: Option<RoundState>,
    /// Principal that triggered the event; `None` for message-driven events
    pub actor: Option<String>,
    #[serde(flatten)]
    pub kind: AuditKind,
}

impl AuditEvent {
    pub fn new(at: u64, kind: AuditKind) -> Self {
        Self {
            seq: 0,
            at,
            round_id: None,
            chain_id: None,
            before: None,
            after: None,
            actor: None,
            kind,
        }
    }

    pub fn round(mut self, round_id: RoundId) -> Self {
        self.round_id = Some(round_id);
        self
    }

    pub fn chain(mut self, chain_id: ChainId) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn transition(mut self, before: RoundState, after: RoundState) -> Self {
        self.before = Some(before);
        self.after = Some(after);
        self
    }

    pub fn actor(mut self, actor: impl ToString) -> Self {
        self.actor = Some(actor.to_string());
        self
    }
}

/// Bounded in-memory event log; oldest entries are evicted first
#[derive(Debug, Clone)]
pub struct AuditJournal {
    capacity: usize,
    next_seq: u64,
    events: VecDeque<AuditEvent>,
}

impl AuditJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 1,
            events: VecDeque::new(),
        }
    }

    pub fn record(&mut self, mut event: AuditEvent) {
        event.seq = self.next_seq;
        self.next_seq += 1;

        info!(
            target: "vaultmesh::audit",
            seq = event.seq,
            kind = event.kind.label(),
            round_id = ?event.round_id,
            chain_id = ?event.chain_id,
            before = ?event.before,
            after = ?event.after,
            actor = ?event.actor,
            "audit event"
        );

        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn events(&self) -> impl Iterator<Item = &AuditEvent> {
        self.events.iter()
    }

    /// Most recent `limit` events, oldest first
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let skip = self.events.len().saturating_sub(limit);
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
