//! Rebalance controller
//!
//! Home-chain side of the orchestrator. Owns the registered chains and the
//! single active round, and drives it through
//! `Idle → AwaitingReports → Ready → Allocating → Dispatching → Settling → Idle`.
//!
//! The controller is synchronous: callers pass the current time and feed
//! inbound deliveries in. Outbound messages go through the `Transport` and are
//! fire-and-forget; lost messages are re-sent by `retry_outstanding`, and
//! deadlines are enforced by `tick` even when nothing arrives.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, info, warn};
use vaultmesh_gmp::{
    encode_payload, Acknowledgement, AllocationInstruction, BalanceReport, BalanceRequest, ChainId,
    Delivery, Payload, RoundId, Transport,
};

use crate::allocation::{allocate, plan, StrategyWeights};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, RequiredRole, Result};
use crate::events::{AuditEvent, AuditJournal, AuditKind};
use crate::guard::{PolicyGuard, Principal};
use crate::round::{
    ChainEntry, ChainStatus, Round, RoundOutcome, RoundState, RoundSummary, VaultEndpoint,
};

// ═══════════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Authenticated origin of an inbound delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub source_chain: ChainId,
    pub sender: Principal,
}

impl Origin {
    pub fn new(source_chain: ChainId, sender: impl Into<Principal>) -> Self {
        Self {
            source_chain,
            sender: sender.into(),
        }
    }
}

impl From<&Delivery> for Origin {
    fn from(delivery: &Delivery) -> Self {
        Self::new(delivery.source_chain, delivery.sender.as_str())
    }
}

/// Result of handling a balance report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Recorded, `outstanding` chains still to report
    Recorded { outstanding: usize },
    /// Last expected report arrived, round is Ready
    QuorumReached,
    /// Chain already reported this round; ignored
    Duplicate,
    /// Round no longer collects reports; ignored
    Late,
}

/// Result of handling an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Recorded {
        outstanding: usize,
        /// Achieved minus target, when non-zero
        mismatch: Option<i128>,
    },
    /// Last acknowledgement arrived, round archived
    Settled { mismatch: Option<i128> },
    Duplicate,
    Late,
}

/// Result of handling any inbound delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Report(ReportOutcome),
    Ack(AckOutcome),
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROLLER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct RebalanceController<T: Transport> {
    config: OrchestratorConfig,
    guard: PolicyGuard,
    weights: StrategyWeights,
    transport: T,
    chains: BTreeMap<ChainId, ChainEntry>,
    round: Option<Round>,
    last_round_id: RoundId,
    history: VecDeque<RoundSummary>,
    /// Achieved minus target from the last mismatched acknowledgement
    reconciliation: BTreeMap<ChainId, i128>,
    journal: AuditJournal,
    paused: bool,
}

impl<T: Transport> RebalanceController<T> {
    pub fn new(
        config: OrchestratorConfig,
        guard: PolicyGuard,
        weights: StrategyWeights,
        transport: T,
    ) -> Self {
        let journal = AuditJournal::new(config.journal_capacity);
        Self {
            config,
            guard,
            weights,
            transport,
            chains: BTreeMap::new(),
            round: None,
            last_round_id: 0,
            history: VecDeque::new(),
            reconciliation: BTreeMap::new(),
            journal,
            paused: false,
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Queries
    // ───────────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> RoundState {
        self.round.as_ref().map_or(RoundState::Idle, |round| round.state)
    }

    pub fn round(&self) -> Option<&Round> {
        self.round.as_ref()
    }

    /// Active round id, or the last one when idle (0 before the first round)
    pub fn round_id(&self) -> RoundId {
        self.round.as_ref().map_or(self.last_round_id, |round| round.round_id)
    }

    pub fn chain(&self, chain_id: ChainId) -> Option<&ChainEntry> {
        self.chains.get(&chain_id)
    }

    pub fn chains(&self) -> impl Iterator<Item = &ChainEntry> {
        self.chains.values()
    }

    /// Archived rounds, oldest first
    pub fn history(&self) -> impl Iterator<Item = &RoundSummary> {
        self.history.iter()
    }

    pub fn reconciliation(&self, chain_id: ChainId) -> i128 {
        self.reconciliation.get(&chain_id).copied().unwrap_or(0)
    }

    pub fn journal(&self) -> &AuditJournal {
        &self.journal
    }

    pub fn guard(&self) -> &PolicyGuard {
        &self.guard
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn weights(&self) -> &StrategyWeights {
        &self.weights
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Chain registry
    // ───────────────────────────────────────────────────────────────────────────

    /// Register a chain's vault endpoint. It joins every round started afterwards.
    pub fn register_chain(
        &mut self,
        caller: &Principal,
        chain_id: ChainId,
        endpoint: VaultEndpoint,
        now: u64,
    ) -> Result<()> {
        self.guard.require_dao(caller)?;
        if self.chains.contains_key(&chain_id) {
            return Err(OrchestratorError::AlreadyRegistered(chain_id));
        }

        self.guard.bind_vault(chain_id, endpoint.principal.clone());
        let entry = ChainEntry::new(chain_id, endpoint);
        info!(chain_id, chain = %entry.chain_name, "registered chain");
        self.chains.insert(chain_id, entry);

        self.journal.record(
            AuditEvent::new(now, AuditKind::ChainRegistered)
                .chain(chain_id)
                .actor(caller),
        );
        Ok(())
    }

    pub fn deregister_chain(&mut self, caller: &Principal, chain_id: ChainId, now: u64) -> Result<()> {
        self.guard.require_dao(caller)?;
        self.require_state(RoundState::Idle)?;
        if self.chains.remove(&chain_id).is_none() {
            return Err(OrchestratorError::UnknownChain(chain_id));
        }

        self.guard.unbind_vault(chain_id);
        self.reconciliation.remove(&chain_id);
        info!(chain_id, "deregistered chain");

        self.journal.record(
            AuditEvent::new(now, AuditKind::ChainDeregistered)
                .chain(chain_id)
                .actor(caller),
        );
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Round lifecycle
    // ───────────────────────────────────────────────────────────────────────────

    /// Open a new round and request balances from every registered chain
    pub fn start_round(&mut self, caller: &Principal, now: u64) -> Result<RoundId> {
        self.guard.require_dao_or_scheduler(caller)?;
        if self.paused {
            return Err(OrchestratorError::Paused);
        }
        if let Some(round) = &self.round {
            return Err(OrchestratorError::RoundAlreadyActive {
                round_id: round.round_id,
                state: round.state,
            });
        }
        if self.chains.is_empty() {
            return Err(OrchestratorError::NoRegisteredChains);
        }

        let round_id = self.last_round_id + 1;
        self.last_round_id = round_id;

        for entry in self.chains.values_mut() {
            entry.status = ChainStatus::Reporting;
        }
        let expected: BTreeSet<ChainId> = self.chains.keys().copied().collect();
        let round = Round::new(round_id, expected.clone(), now, self.config.report_window_secs);

        info!(round_id, chains = expected.len(), deadline = round.deadline, "round started");
        self.journal.record(
            AuditEvent::new(now, AuditKind::StateTransition)
                .round(round_id)
                .transition(RoundState::Idle, RoundState::AwaitingReports)
                .actor(caller),
        );
        self.round = Some(round);

        let request = BalanceRequest {
            round_id,
            reply_chain: self.config.home_chain_id,
        };
        for chain_id in expected {
            self.send(chain_id, Payload::BalanceRequest(request), now);
        }

        Ok(round_id)
    }

    /// Decode an inbound delivery and route it to the matching handler
    pub fn handle_delivery(&mut self, delivery: &Delivery, now: u64) -> Result<DeliveryOutcome> {
        let payload = delivery
            .decode()
            .map_err(|e| OrchestratorError::Malformed(e.to_string()))?;
        let origin = Origin::from(delivery);

        debug!(
            message_id = %delivery.message_id,
            source_chain = delivery.source_chain,
            message_type = ?payload.message_type(),
            "controller received delivery"
        );

        match payload {
            Payload::BalanceReport(report) => self
                .receive_balance_report(&origin, report, now)
                .map(DeliveryOutcome::Report),
            Payload::Acknowledgement(ack) => {
                self.acknowledge(&origin, ack, now).map(DeliveryOutcome::Ack)
            }
            other => Err(OrchestratorError::Malformed(format!(
                "controller does not accept {:?}",
                other.message_type()
            ))),
        }
    }

    pub fn receive_balance_report(
        &mut self,
        origin: &Origin,
        report: BalanceReport,
        now: u64,
    ) -> Result<ReportOutcome> {
        self.authenticate(origin, report.chain_id)?;
        let current = self.round_id();

        let round = match self.round.as_mut() {
            Some(round) if round.round_id == report.round_id => round,
            _ => {
                warn!(
                    chain_id = report.chain_id,
                    received = report.round_id,
                    current,
                    "dropping stale balance report"
                );
                return Err(OrchestratorError::StaleMessage {
                    received: report.round_id,
                    current,
                });
            }
        };

        if !round.expected.contains(&report.chain_id) {
            return Err(OrchestratorError::UnknownChain(report.chain_id));
        }
        if round.reported.contains(&report.chain_id) {
            debug!(chain_id = report.chain_id, round_id = round.round_id, "duplicate balance report");
            return Ok(ReportOutcome::Duplicate);
        }
        if round.state != RoundState::AwaitingReports {
            debug!(chain_id = report.chain_id, state = %round.state, "late balance report");
            return Ok(ReportOutcome::Late);
        }

        let Some(total) = round.total_underlying.checked_add(report.amount) else {
            warn!(
                round_id = round.round_id,
                chain_id = report.chain_id,
                amount = report.amount,
                total = round.total_underlying,
                "balance report overflows round total"
            );
            return Err(OrchestratorError::TotalOverflow {
                chain_id: report.chain_id,
                amount: report.amount,
                total: round.total_underlying,
            });
        };

        round.reported.insert(report.chain_id);
        round.balances.insert(report.chain_id, report.amount);
        round.total_underlying = total;

        if let Some(entry) = self.chains.get_mut(&report.chain_id) {
            entry.last_reported_balance = report.amount;
            entry.last_report_round = report.round_id;
            entry.status = ChainStatus::Reported;
        }

        info!(
            round_id = round.round_id,
            chain_id = report.chain_id,
            amount = report.amount,
            total = round.total_underlying,
            "balance report recorded"
        );

        if round.has_quorum() {
            Self::transition(&mut self.journal, round, RoundState::Ready, None, now);
            Ok(ReportOutcome::QuorumReached)
        } else {
            Ok(ReportOutcome::Recorded {
                outstanding: round.missing_reports().len(),
            })
        }
    }

    /// Guardian override: advance without full quorum once the deadline passed.
    /// Returns the chains marked Failed.
    pub fn force_advance(&mut self, caller: &Principal, now: u64) -> Result<BTreeSet<ChainId>> {
        self.guard.require_guardian(caller)?;
        let actual = self.state();

        let round = match self.round.as_mut() {
            Some(round) if round.state == RoundState::AwaitingReports => round,
            _ => {
                return Err(OrchestratorError::RoundNotReady {
                    expected: RoundState::AwaitingReports,
                    actual,
                })
            }
        };
        if now < round.deadline {
            return Err(OrchestratorError::DeadlineNotReached {
                deadline: round.deadline,
                now,
            });
        }

        let missing = round.missing_reports();
        round.failed.extend(missing.iter().copied());
        for chain_id in &missing {
            if let Some(entry) = self.chains.get_mut(chain_id) {
                entry.status = ChainStatus::Failed;
            }
        }

        warn!(round_id = round.round_id, failed = ?missing, "guardian forced round past report quorum");
        self.journal.record(
            AuditEvent::new(
                now,
                AuditKind::GuardianBypass {
                    condition: "report quorum".to_string(),
                    chains: missing.clone(),
                },
            )
            .round(round.round_id)
            .actor(caller),
        );
        Self::transition(&mut self.journal, round, RoundState::Ready, Some(caller), now);

        Ok(missing)
    }

    /// Compute targets for the participating chains and send one instruction
    /// to each
    pub fn compute_and_dispatch(
        &mut self,
        caller: &Principal,
        now: u64,
    ) -> Result<Vec<AllocationInstruction>> {
        self.guard.require_dao_or_scheduler(caller)?;
        if self.paused {
            return Err(OrchestratorError::Paused);
        }
        let actual = self.state();

        let round = match self.round.as_mut() {
            Some(round) if round.state == RoundState::Ready => round,
            _ => {
                return Err(OrchestratorError::RoundNotReady {
                    expected: RoundState::Ready,
                    actual,
                })
            }
        };

        let participants = round.participants();
        let targets = allocate(
            round.total_underlying,
            &participants,
            &self.weights,
            self.config.remainder_chain(),
        )?;

        Self::transition(&mut self.journal, round, RoundState::Allocating, Some(caller), now);
        let instructions = plan(round.round_id, &targets, &participants);

        round.instructions = instructions.iter().map(|i| (i.chain_id, *i)).collect();
        round.ack_deadline = Some(now.saturating_add(self.config.ack_window_secs));
        Self::transition(&mut self.journal, round, RoundState::Dispatching, Some(caller), now);

        info!(
            round_id = round.round_id,
            total = round.total_underlying,
            participants = instructions.len(),
            "dispatching allocation"
        );

        if instructions.is_empty() {
            self.settle(RoundOutcome::Completed, Some(caller), now);
            return Ok(instructions);
        }

        for instruction in &instructions {
            self.send(instruction.chain_id, Payload::AllocationInstruction(*instruction), now);
        }
        Ok(instructions)
    }

    pub fn acknowledge(&mut self, origin: &Origin, ack: Acknowledgement, now: u64) -> Result<AckOutcome> {
        self.authenticate(origin, ack.chain_id)?;
        let current = self.round_id();

        let round = match self.round.as_mut() {
            Some(round) if round.round_id == ack.round_id => round,
            _ => {
                warn!(
                    chain_id = ack.chain_id,
                    received = ack.round_id,
                    current,
                    "dropping stale acknowledgement"
                );
                return Err(OrchestratorError::StaleMessage {
                    received: ack.round_id,
                    current,
                });
            }
        };

        let target = match round.instructions.get(&ack.chain_id) {
            Some(instruction) => instruction.target_amount,
            None if round.state == RoundState::Dispatching => {
                return Err(OrchestratorError::UnknownChain(ack.chain_id))
            }
            None => return Ok(AckOutcome::Late),
        };
        if round.acks.contains_key(&ack.chain_id) {
            debug!(chain_id = ack.chain_id, round_id = round.round_id, "duplicate acknowledgement");
            return Ok(AckOutcome::Duplicate);
        }
        if round.state != RoundState::Dispatching {
            return Ok(AckOutcome::Late);
        }

        round.acks.insert(ack.chain_id, ack);
        let delta = ack.achieved_amount as i128 - target as i128;
        let mismatch = (delta != 0).then_some(delta);

        if let Some(entry) = self.chains.get_mut(&ack.chain_id) {
            entry.last_achieved = Some(ack.achieved_amount);
        }

        if let Some(delta) = mismatch {
            warn!(
                round_id = round.round_id,
                chain_id = ack.chain_id,
                target,
                achieved = ack.achieved_amount,
                "allocation mismatch"
            );
            self.reconciliation.insert(ack.chain_id, delta);
            self.journal.record(
                AuditEvent::new(
                    now,
                    AuditKind::AcknowledgementMismatch {
                        target,
                        achieved: ack.achieved_amount,
                    },
                )
                .round(round.round_id)
                .chain(ack.chain_id),
            );
        } else {
            self.reconciliation.remove(&ack.chain_id);
        }

        if round.all_acked() {
            self.settle(RoundOutcome::Completed, None, now);
            Ok(AckOutcome::Settled { mismatch })
        } else {
            Ok(AckOutcome::Recorded {
                outstanding: round.missing_acks().len(),
                mismatch,
            })
        }
    }

    /// Guardian override: end the active round whatever its state. Chains
    /// that have not reported or acknowledged are marked Failed.
    pub fn force_settle(&mut self, caller: &Principal, now: u64) -> Result<RoundSummary> {
        self.guard.require_guardian(caller)?;
        let round = self.round.as_mut().ok_or(OrchestratorError::NoActiveRound)?;

        let (condition, missing) = match round.state {
            RoundState::AwaitingReports => ("report quorum", round.missing_reports()),
            RoundState::Dispatching => ("acknowledgements", round.missing_acks()),
            _ => ("round completion", BTreeSet::new()),
        };
        round.failed.extend(missing.iter().copied());
        for chain_id in &missing {
            if let Some(entry) = self.chains.get_mut(chain_id) {
                entry.status = ChainStatus::Failed;
            }
        }

        warn!(round_id = round.round_id, state = %round.state, failed = ?missing, "guardian force-settled round");
        self.journal.record(
            AuditEvent::new(
                now,
                AuditKind::GuardianBypass {
                    condition: condition.to_string(),
                    chains: missing,
                },
            )
            .round(round.round_id)
            .actor(caller),
        );

        self.settle(RoundOutcome::ForceSettled, Some(caller), now)
            .ok_or(OrchestratorError::NoActiveRound)
    }

    /// Evaluate deadlines. Returns the archived round if the acknowledgement
    /// window closed.
    pub fn tick(&mut self, now: u64) -> Option<RoundSummary> {
        let round = self.round.as_mut()?;

        match round.state {
            RoundState::AwaitingReports if now >= round.deadline && !round.deadline_lapse_reported => {
                round.deadline_lapse_reported = true;
                let missing = round.missing_reports();
                warn!(round_id = round.round_id, missing = ?missing, "report deadline lapsed");
                self.journal.record(
                    AuditEvent::new(now, AuditKind::ReportDeadlineLapsed { missing })
                        .round(round.round_id),
                );
                None
            }
            RoundState::Dispatching if round.ack_deadline.is_some_and(|deadline| now >= deadline) => {
                let missing = round.missing_acks();
                round.failed.extend(missing.iter().copied());
                for chain_id in &missing {
                    if let Some(entry) = self.chains.get_mut(chain_id) {
                        entry.status = ChainStatus::Failed;
                    }
                    self.journal.record(
                        AuditEvent::new(
                            now,
                            AuditKind::ChainFailed {
                                reason: "acknowledgement timeout".to_string(),
                            },
                        )
                        .round(round.round_id)
                        .chain(*chain_id),
                    );
                }
                warn!(round_id = round.round_id, failed = ?missing, "acknowledgement window closed");
                self.settle(RoundOutcome::AckTimeout, None, now)
            }
            _ => None,
        }
    }

    /// Re-send requests and instructions whose answer has not arrived.
    /// Returns the number of messages handed to the transport.
    pub fn retry_outstanding(&mut self, now: u64) -> usize {
        let Some(round) = self.round.as_ref() else {
            return 0;
        };

        let resend: Vec<(ChainId, Payload)> = match round.state {
            RoundState::AwaitingReports => {
                let request = BalanceRequest {
                    round_id: round.round_id,
                    reply_chain: self.config.home_chain_id,
                };
                round
                    .missing_reports()
                    .into_iter()
                    .map(|chain_id| (chain_id, Payload::BalanceRequest(request)))
                    .collect()
            }
            RoundState::Dispatching => round
                .missing_acks()
                .into_iter()
                .filter_map(|chain_id| {
                    round
                        .instructions
                        .get(&chain_id)
                        .map(|i| (chain_id, Payload::AllocationInstruction(*i)))
                })
                .collect(),
            _ => Vec::new(),
        };

        let mut sent = 0;
        for (chain_id, payload) in resend {
            if self.send(chain_id, payload, now) {
                sent += 1;
            }
        }
        if sent > 0 {
            debug!(round_id = self.round_id(), sent, "re-sent outstanding messages");
        }
        sent
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Emergency & roles
    // ───────────────────────────────────────────────────────────────────────────

    /// Block new rounds and dispatch. Guardian overrides keep working.
    pub fn pause(&mut self, caller: &Principal, now: u64) -> Result<()> {
        self.guard.require_guardian_or_dao(caller)?;
        if !self.paused {
            self.paused = true;
            warn!(caller = %caller, "controller paused");
            self.journal.record(
                AuditEvent::new(now, AuditKind::Paused)
                    .round(self.round_id())
                    .actor(caller),
            );
        }
        Ok(())
    }

    pub fn unpause(&mut self, caller: &Principal, now: u64) -> Result<()> {
        self.guard.require_dao(caller)?;
        if self.paused {
            self.paused = false;
            info!(caller = %caller, "controller unpaused");
            self.journal.record(
                AuditEvent::new(now, AuditKind::Unpaused)
                    .round(self.round_id())
                    .actor(caller),
            );
        }
        Ok(())
    }

    pub fn set_dao(&mut self, caller: &Principal, dao: Principal, now: u64) -> Result<()> {
        let previous = self.guard.set_dao(caller, dao.clone())?;
        self.record_role_change("dao", previous.to_string(), dao.to_string(), caller, now);
        Ok(())
    }

    pub fn set_guardian(&mut self, caller: &Principal, guardian: Principal, now: u64) -> Result<()> {
        let previous = self.guard.set_guardian(caller, guardian.clone())?;
        self.record_role_change("guardian", previous.to_string(), guardian.to_string(), caller, now);
        Ok(())
    }

    pub fn set_scheduler(
        &mut self,
        caller: &Principal,
        scheduler: Option<Principal>,
        now: u64,
    ) -> Result<()> {
        let current = scheduler.as_ref().map_or_else(|| "none".to_string(), Principal::to_string);
        let previous = self.guard.set_scheduler(caller, scheduler)?;
        let previous = previous.map_or_else(|| "none".to_string(), |p| p.to_string());
        self.record_role_change("scheduler", previous, current, caller, now);
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────────────────

    fn record_role_change(
        &mut self,
        role: &str,
        previous: String,
        current: String,
        caller: &Principal,
        now: u64,
    ) {
        info!(role, %previous, %current, "role changed");
        self.journal.record(
            AuditEvent::new(
                now,
                AuditKind::RoleChanged {
                    role: role.to_string(),
                    previous,
                    current,
                },
            )
            .actor(caller),
        );
    }

    fn require_state(&self, expected: RoundState) -> Result<()> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(OrchestratorError::RoundNotReady { expected, actual })
        }
    }

    /// Sender must be the chain's vault principal and the message must come
    /// from that chain
    fn authenticate(&self, origin: &Origin, chain_id: ChainId) -> Result<()> {
        self.guard.require_vault(chain_id, &origin.sender)?;
        if origin.source_chain != chain_id {
            return Err(OrchestratorError::Unauthorized {
                caller: origin.sender.to_string(),
                required: RequiredRole::Vault(chain_id),
            });
        }
        Ok(())
    }

    /// Hand a payload to the transport. Failures are journaled, not returned.
    fn send(&mut self, destination: ChainId, payload: Payload, now: u64) -> bool {
        let round_id = payload.round_id();
        match self.transport.send(destination, encode_payload(&payload)) {
            Ok(message_id) => {
                debug!(%message_id, destination, round_id, message_type = ?payload.message_type(), "sent");
                true
            }
            Err(e) => {
                warn!(destination, round_id, error = %e, "delivery failure");
                self.journal.record(
                    AuditEvent::new(now, AuditKind::DeliveryFailure { reason: e.to_string() })
                        .round(round_id)
                        .chain(destination),
                );
                false
            }
        }
    }

    fn transition(
        journal: &mut AuditJournal,
        round: &mut Round,
        next: RoundState,
        actor: Option<&Principal>,
        now: u64,
    ) {
        let before = round.state;
        round.state = next;
        info!(round_id = round.round_id, from = %before, to = %next, "round transition");

        let mut event = AuditEvent::new(now, AuditKind::StateTransition)
            .round(round.round_id)
            .transition(before, next);
        if let Some(actor) = actor {
            event = event.actor(actor);
        }
        journal.record(event);
    }

    /// Walk the round through Settling to Idle and archive it
    fn settle(&mut self, outcome: RoundOutcome, actor: Option<&Principal>, now: u64) -> Option<RoundSummary> {
        let mut round = self.round.take()?;
        Self::transition(&mut self.journal, &mut round, RoundState::Settling, actor, now);
        Self::transition(&mut self.journal, &mut round, RoundState::Idle, actor, now);

        let summary = RoundSummary::archive(round, now, outcome);
        info!(
            round_id = summary.round_id,
            outcome = ?summary.outcome,
            failed = summary.failed.len(),
            "round settled"
        );

        if self.history.len() >= self.config.history_capacity.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vaultmesh_gmp::{decode_payload, Direction, MemoryTransport};

    use super::*;

    const HOME: ChainId = 1;
    const ARB: ChainId = 42161;
    const OP: ChainId = 10;

    fn dao() -> Principal {
        Principal::new("0xdao")
    }

    fn guardian() -> Principal {
        Principal::new("0xguardian")
    }

    fn vault_of(chain_id: ChainId) -> Principal {
        Principal::new(format!("0xvault-{}", chain_id))
    }

    fn controller() -> (RebalanceController<Arc<MemoryTransport>>, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new(HOME, "0xcontroller"));
        let mut controller = RebalanceController::new(
            OrchestratorConfig::default(),
            PolicyGuard::new(dao(), guardian()),
            StrategyWeights::Equal,
            transport.clone(),
        );
        for chain_id in [HOME, ARB, OP] {
            controller
                .register_chain(&dao(), chain_id, VaultEndpoint::new("0xvault", vault_of(chain_id)), 0)
                .unwrap();
        }
        (controller, transport)
    }

    fn report(
        controller: &mut RebalanceController<Arc<MemoryTransport>>,
        round_id: RoundId,
        chain_id: ChainId,
        amount: u64,
    ) -> Result<ReportOutcome> {
        controller.receive_balance_report(
            &Origin::new(chain_id, vault_of(chain_id)),
            BalanceReport { round_id, chain_id, amount },
            10,
        )
    }

    fn ack_exact(
        controller: &mut RebalanceController<Arc<MemoryTransport>>,
        instruction: &AllocationInstruction,
    ) -> Result<AckOutcome> {
        controller.acknowledge(
            &Origin::new(instruction.chain_id, vault_of(instruction.chain_id)),
            Acknowledgement {
                round_id: instruction.round_id,
                chain_id: instruction.chain_id,
                target_amount: instruction.target_amount,
                achieved_amount: instruction.target_amount,
            },
            20,
        )
    }

    #[test]
    fn test_start_round_sends_requests() {
        let (mut controller, transport) = controller();
        let round_id = controller.start_round(&dao(), 0).unwrap();

        assert_eq!(round_id, 1);
        assert_eq!(controller.state(), RoundState::AwaitingReports);
        assert_eq!(controller.round().unwrap().deadline, 300);

        let sent = transport.drain();
        assert_eq!(sent.len(), 3);
        for message in sent {
            assert_eq!(
                decode_payload(&message.payload).unwrap(),
                Payload::BalanceRequest(BalanceRequest { round_id: 1, reply_chain: HOME })
            );
        }
        assert!(controller.chains().all(|c| c.status == ChainStatus::Reporting));
    }

    #[test]
    fn test_start_round_preconditions() {
        let (mut controller, _) = controller();
        controller.start_round(&dao(), 0).unwrap();
        assert!(matches!(
            controller.start_round(&dao(), 1),
            Err(OrchestratorError::RoundAlreadyActive { round_id: 1, .. })
        ));

        let transport = Arc::new(MemoryTransport::new(HOME, "0xcontroller"));
        let mut empty = RebalanceController::new(
            OrchestratorConfig::default(),
            PolicyGuard::new(dao(), guardian()),
            StrategyWeights::Equal,
            transport,
        );
        assert_eq!(empty.start_round(&dao(), 0), Err(OrchestratorError::NoRegisteredChains));
    }

    #[test]
    fn test_quorum_then_dispatch() {
        let (mut controller, transport) = controller();
        controller.start_round(&dao(), 0).unwrap();
        transport.drain();

        assert_eq!(report(&mut controller, 1, HOME, 1_000), Ok(ReportOutcome::Recorded { outstanding: 2 }));
        assert_eq!(report(&mut controller, 1, ARB, 2_000), Ok(ReportOutcome::Recorded { outstanding: 1 }));
        assert_eq!(report(&mut controller, 1, OP, 0), Ok(ReportOutcome::QuorumReached));
        assert_eq!(controller.state(), RoundState::Ready);
        assert_eq!(controller.round().unwrap().total_underlying, 3_000);

        let instructions = controller.compute_and_dispatch(&dao(), 30).unwrap();
        assert_eq!(controller.state(), RoundState::Dispatching);
        assert!(instructions.iter().all(|i| i.target_amount == 1_000));
        assert_eq!(transport.drain().len(), 3);

        assert!(matches!(
            ack_exact(&mut controller, &instructions[0]),
            Ok(AckOutcome::Recorded { outstanding: 2, mismatch: None })
        ));
        ack_exact(&mut controller, &instructions[1]).unwrap();
        assert_eq!(
            ack_exact(&mut controller, &instructions[2]),
            Ok(AckOutcome::Settled { mismatch: None })
        );

        assert_eq!(controller.state(), RoundState::Idle);
        let summary = controller.history().last().unwrap();
        assert_eq!(summary.outcome, RoundOutcome::Completed);
        assert_eq!(summary.total_underlying, 3_000);
    }

    #[test]
    fn test_duplicate_report_ignored() {
        let (mut controller, _) = controller();
        controller.start_round(&dao(), 0).unwrap();
        report(&mut controller, 1, HOME, 1_000).unwrap();

        assert_eq!(report(&mut controller, 1, HOME, 1_000), Ok(ReportOutcome::Duplicate));
        assert_eq!(report(&mut controller, 1, HOME, 9_999), Ok(ReportOutcome::Duplicate));
        assert_eq!(controller.round().unwrap().total_underlying, 1_000);
    }

    #[test]
    fn test_stale_report_does_not_mutate() {
        let (mut controller, _) = controller();
        controller.start_round(&dao(), 0).unwrap();

        assert_eq!(
            report(&mut controller, 7, HOME, 1_000),
            Err(OrchestratorError::StaleMessage { received: 7, current: 1 })
        );
        assert!(controller.round().unwrap().reported.is_empty());
    }

    #[test]
    fn test_overflowing_report_rejected() {
        let (mut controller, _) = controller();
        controller.start_round(&dao(), 0).unwrap();
        report(&mut controller, 1, HOME, u64::MAX).unwrap();

        assert_eq!(
            report(&mut controller, 1, OP, 5),
            Err(OrchestratorError::TotalOverflow { chain_id: OP, amount: 5, total: u64::MAX })
        );
        let round = controller.round().unwrap();
        assert_eq!(round.total_underlying, u64::MAX);
        assert!(!round.reported.contains(&OP));
        assert!(!round.balances.contains_key(&OP));
        assert_eq!(controller.chain(OP).unwrap().status, ChainStatus::Reporting);

        // the round still completes once the guardian drops the chain
        assert_eq!(
            report(&mut controller, 1, ARB, 0),
            Ok(ReportOutcome::Recorded { outstanding: 1 })
        );
        let failed = controller.force_advance(&guardian(), 300).unwrap();
        assert_eq!(failed, BTreeSet::from([OP]));

        let instructions = controller.compute_and_dispatch(&dao(), 310).unwrap();
        let total: u128 = instructions.iter().map(|i| i.target_amount as u128).sum();
        assert_eq!(instructions.len(), 2);
        assert_eq!(total, u64::MAX as u128);
    }

    #[test]
    fn test_report_authentication() {
        let (mut controller, _) = controller();
        controller.start_round(&dao(), 0).unwrap();

        let impostor = controller.receive_balance_report(
            &Origin::new(ARB, vault_of(OP)),
            BalanceReport { round_id: 1, chain_id: ARB, amount: 5 },
            1,
        );
        assert!(matches!(impostor, Err(OrchestratorError::Unauthorized { .. })));

        let wrong_source = controller.receive_balance_report(
            &Origin::new(OP, vault_of(ARB)),
            BalanceReport { round_id: 1, chain_id: ARB, amount: 5 },
            1,
        );
        assert!(matches!(wrong_source, Err(OrchestratorError::Unauthorized { .. })));
        assert!(controller.round().unwrap().reported.is_empty());
    }

    #[test]
    fn test_force_advance_rules() {
        let (mut controller, _) = controller();
        controller.start_round(&dao(), 0).unwrap();
        report(&mut controller, 1, HOME, 1_000).unwrap();
        report(&mut controller, 1, ARB, 2_000).unwrap();

        assert!(matches!(
            controller.force_advance(&dao(), 400),
            Err(OrchestratorError::Unauthorized { .. })
        ));
        assert_eq!(
            controller.force_advance(&guardian(), 299),
            Err(OrchestratorError::DeadlineNotReached { deadline: 300, now: 299 })
        );

        let failed = controller.force_advance(&guardian(), 300).unwrap();
        assert_eq!(failed.into_iter().collect::<Vec<_>>(), vec![OP]);
        assert_eq!(controller.state(), RoundState::Ready);
        assert_eq!(controller.chain(OP).unwrap().status, ChainStatus::Failed);

        assert_eq!(report(&mut controller, 1, OP, 50), Ok(ReportOutcome::Late));
        assert!(controller
            .journal()
            .events()
            .any(|e| matches!(e.kind, AuditKind::GuardianBypass { .. }) && e.actor.as_deref() == Some("0xguardian")));

        let instructions = controller.compute_and_dispatch(&dao(), 310).unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions.iter().map(|i| i.target_amount).sum::<u64>(), 3_000);
        assert_eq!(instructions[0].direction, Direction::Deposit);
    }

    #[test]
    fn test_mismatch_recorded_for_reconciliation() {
        let (mut controller, _) = controller();
        controller.start_round(&dao(), 0).unwrap();
        for (chain_id, amount) in [(HOME, 1_000), (ARB, 2_000), (OP, 0)] {
            report(&mut controller, 1, chain_id, amount).unwrap();
        }
        let instructions = controller.compute_and_dispatch(&dao(), 30).unwrap();
        let arb = instructions.iter().find(|i| i.chain_id == ARB).unwrap();

        let outcome = controller
            .acknowledge(
                &Origin::new(ARB, vault_of(ARB)),
                Acknowledgement {
                    round_id: 1,
                    chain_id: ARB,
                    target_amount: 1_000,
                    achieved_amount: 1_200,
                },
                40,
            )
            .unwrap();

        assert_eq!(outcome, AckOutcome::Recorded { outstanding: 2, mismatch: Some(200) });
        assert_eq!(controller.reconciliation(ARB), 200);
        assert_eq!(controller.chain(ARB).unwrap().last_achieved, Some(1_200));
        assert_eq!(arb.target_amount, 1_000);
    }

    #[test]
    fn test_ack_timeout_settles_round() {
        let (mut controller, _) = controller();
        controller.start_round(&dao(), 0).unwrap();
        for (chain_id, amount) in [(HOME, 1_000), (ARB, 2_000), (OP, 0)] {
            report(&mut controller, 1, chain_id, amount).unwrap();
        }
        let instructions = controller.compute_and_dispatch(&dao(), 30).unwrap();
        ack_exact(&mut controller, &instructions[0]).unwrap();

        assert!(controller.tick(629).is_none());
        let summary = controller.tick(630).unwrap();
        assert_eq!(summary.outcome, RoundOutcome::AckTimeout);
        assert_eq!(summary.failed.len(), 2);
        assert_eq!(controller.state(), RoundState::Idle);

        // a late ack for the archived round is stale
        assert!(matches!(
            ack_exact(&mut controller, &instructions[1]),
            Err(OrchestratorError::StaleMessage { .. })
        ));
    }

    #[test]
    fn test_tick_reports_lapse_once() {
        let (mut controller, _) = controller();
        controller.start_round(&dao(), 0).unwrap();

        let lapses = |c: &RebalanceController<Arc<MemoryTransport>>| {
            c.journal()
                .events()
                .filter(|e| matches!(e.kind, AuditKind::ReportDeadlineLapsed { .. }))
                .count()
        };
        controller.tick(100);
        assert_eq!(lapses(&controller), 0);
        controller.tick(300);
        controller.tick(301);
        assert_eq!(lapses(&controller), 1);
        assert_eq!(controller.state(), RoundState::AwaitingReports);
    }

    #[test]
    fn test_force_settle_from_awaiting() {
        let (mut controller, _) = controller();
        assert_eq!(
            controller.force_settle(&guardian(), 0).unwrap_err(),
            OrchestratorError::NoActiveRound
        );

        controller.start_round(&dao(), 0).unwrap();
        report(&mut controller, 1, HOME, 10).unwrap();
        let summary = controller.force_settle(&guardian(), 5).unwrap();

        assert_eq!(summary.outcome, RoundOutcome::ForceSettled);
        assert_eq!(summary.failed.len(), 2);
        assert_eq!(controller.state(), RoundState::Idle);

        // failures only last for the round they happened in
        controller.start_round(&dao(), 6).unwrap();
        assert_eq!(controller.round_id(), 2);
        assert!(controller.chains().all(|c| c.status == ChainStatus::Reporting));
    }

    #[test]
    fn test_retry_resends_only_missing() {
        let (mut controller, transport) = controller();
        controller.start_round(&dao(), 0).unwrap();
        transport.drain();
        report(&mut controller, 1, HOME, 10).unwrap();

        assert_eq!(controller.retry_outstanding(1), 2);
        let destinations: Vec<ChainId> = transport.drain().iter().map(|m| m.destination).collect();
        assert_eq!(destinations, vec![OP, ARB]);
    }

    #[test]
    fn test_delivery_failure_absorbed() {
        let (mut controller, transport) = controller();
        transport.set_failing(true);

        controller.start_round(&dao(), 0).unwrap();
        assert_eq!(controller.state(), RoundState::AwaitingReports);
        let failures = controller
            .journal()
            .events()
            .filter(|e| matches!(e.kind, AuditKind::DeliveryFailure { .. }))
            .count();
        assert_eq!(failures, 3);

        transport.set_failing(false);
        assert_eq!(controller.retry_outstanding(1), 3);
    }

    #[test]
    fn test_pause_blocks_new_rounds() {
        let (mut controller, _) = controller();
        controller.pause(&guardian(), 0).unwrap();
        assert_eq!(controller.start_round(&dao(), 0), Err(OrchestratorError::Paused));

        assert!(controller.unpause(&guardian(), 1).is_err());
        controller.unpause(&dao(), 1).unwrap();
        assert!(controller.start_round(&dao(), 2).is_ok());
    }

    #[test]
    fn test_unauthorized_calls_leave_state_intact() {
        let (mut controller, _) = controller();
        let stranger = Principal::new("0xstranger");

        assert!(controller.start_round(&stranger, 0).is_err());
        assert!(controller.pause(&stranger, 0).is_err());
        assert!(controller.set_dao(&stranger, stranger.clone(), 0).is_err());
        assert!(controller
            .register_chain(&stranger, 8453, VaultEndpoint::new("0x", "0xbase"), 0)
            .is_err());

        assert_eq!(controller.state(), RoundState::Idle);
        assert_eq!(controller.round_id(), 0);
        assert!(!controller.is_paused());
        assert!(controller.chain(8453).is_none());
    }

    #[test]
    fn test_deregister_only_when_idle() {
        let (mut controller, _) = controller();
        controller.start_round(&dao(), 0).unwrap();
        assert!(matches!(
            controller.deregister_chain(&dao(), OP, 1),
            Err(OrchestratorError::RoundNotReady { expected: RoundState::Idle, .. })
        ));

        controller.force_settle(&guardian(), 2).unwrap();
        controller.deregister_chain(&dao(), OP, 3).unwrap();
        assert!(controller.chain(OP).is_none());
        assert!(controller.guard().require_vault(OP, &vault_of(OP)).is_err());
    }

    #[test]
    fn test_role_change_audited() {
        let (mut controller, _) = controller();
        controller.set_guardian(&dao(), Principal::new("0xnewguardian"), 5).unwrap();

        let last = controller.journal().recent(1).pop().unwrap();
        assert_eq!(
            last.kind,
            AuditKind::RoleChanged {
                role: "guardian".to_string(),
                previous: "0xguardian".to_string(),
                current: "0xnewguardian".to_string(),
            }
        );
        assert!(controller.force_advance(&guardian(), 0).is_err());
    }
}
