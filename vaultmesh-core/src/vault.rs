//! Chain vault
//!
//! Local state machine of one chain's vault endpoint. Answers balance requests
//! with a pure read and applies allocation instructions at most once per round.
//! Applying an instruction is split in two steps so a runtime can keep the
//! vault busy while funds are in motion:
//!
//! 1. `begin_instruction` validates and records the round as applied
//! 2. `complete_movement` moves funds and produces the acknowledgement

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};
use vaultmesh_gmp::{
    Acknowledgement, AllocationInstruction, Amount, BalanceReport, ChainId, Direction, RoundId,
};

use crate::allocation::split_by_weight;
use crate::error::VaultError;
use crate::strategy::StrategyAdapter;

/// An adapter together with its local allocation weight
#[derive(Debug, Clone, Serialize)]
pub struct StrategySlot {
    pub adapter: StrategyAdapter,
    pub weight: u64,
}

#[derive(Debug, Clone)]
pub struct ChainVault {
    chain_id: ChainId,
    strategies: Vec<StrategySlot>,
    /// Bridged funds not yet deployed into a strategy
    inbound: Amount,
    /// Total handed to the outbound transfer primitive
    released: Amount,
    last_applied_round: RoundId,
    in_flight: Option<AllocationInstruction>,
    last_ack: Option<Acknowledgement>,
}

impl ChainVault {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            strategies: Vec::new(),
            inbound: 0,
            released: 0,
            last_applied_round: 0,
            in_flight: None,
            last_ack: None,
        }
    }

    pub fn with_strategy(mut self, adapter: StrategyAdapter, weight: u64) -> Self {
        self.strategies.push(StrategySlot { adapter, weight });
        self
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn strategies(&self) -> &[StrategySlot] {
        &self.strategies
    }

    /// Deployed funds plus uncommitted inbound funds, saturating at the top
    /// of the amount range
    pub fn total_holdings(&self) -> Amount {
        self.deployed().saturating_add(self.inbound)
    }

    fn deployed(&self) -> Amount {
        self.strategies
            .iter()
            .fold(0, |total: Amount, s| total.saturating_add(s.adapter.report_balance()))
    }

    pub fn inbound(&self) -> Amount {
        self.inbound
    }

    pub fn released(&self) -> Amount {
        self.released
    }

    pub fn last_applied_round(&self) -> RoundId {
        self.last_applied_round
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Funds still missing before the in-flight instruction can reach its
    /// target; zero when idle or when holdings already cover it
    pub fn shortfall(&self) -> Amount {
        self.in_flight
            .map_or(0, |instruction| instruction.target_amount.saturating_sub(self.total_holdings()))
    }

    /// Cached acknowledgement of the last completed instruction
    pub fn last_ack(&self) -> Option<Acknowledgement> {
        self.last_ack
    }

    /// Answer a balance request. Never mutates, so duplicates get the same answer.
    pub fn on_balance_request(&self, round_id: RoundId) -> BalanceReport {
        BalanceReport {
            round_id,
            chain_id: self.chain_id,
            amount: self.total_holdings(),
        }
    }

    /// Record funds arriving from the bridge
    pub fn credit_inbound(&mut self, amount: Amount) {
        self.inbound = self.inbound.saturating_add(amount);
        debug!(chain_id = self.chain_id, amount, inbound = self.inbound, "credited inbound funds");
    }

    /// Update the exchange rate of the strategy at `index`
    pub fn set_exchange_rate(&mut self, index: usize, rate: u64) -> Result<(), VaultError> {
        let slot = self
            .strategies
            .get_mut(index)
            .ok_or(VaultError::UnknownStrategy(index))?;
        slot.adapter.set_exchange_rate(rate);
        Ok(())
    }

    /// Validate an instruction and mark it in flight
    pub fn begin_instruction(&mut self, instruction: AllocationInstruction) -> Result<(), VaultError> {
        if instruction.chain_id != self.chain_id {
            return Err(VaultError::WrongChain {
                expected: self.chain_id,
                got: instruction.chain_id,
            });
        }
        if instruction.round_id <= self.last_applied_round {
            return Err(VaultError::StaleRound {
                round_id: instruction.round_id,
                last_applied: self.last_applied_round,
            });
        }
        if let Some(in_flight) = &self.in_flight {
            return Err(VaultError::VaultBusy {
                in_flight: in_flight.round_id,
            });
        }

        self.last_applied_round = instruction.round_id;
        self.in_flight = Some(instruction);
        Ok(())
    }

    /// Execute the in-flight movement. Returns `None` when nothing is in flight.
    pub fn complete_movement(&mut self) -> Option<Acknowledgement> {
        let instruction = self.in_flight.take()?;
        let current = self.total_holdings();
        let target = instruction.target_amount;

        // Direction is re-derived from current holdings, which may have
        // moved since the report.
        match Direction::between(current, target) {
            Direction::Withdraw => {
                let withdrawn = self.withdraw(current - target);
                self.released = self.released.saturating_add(withdrawn);
            }
            direction => {
                let from_inbound = self.inbound;
                self.deploy(from_inbound);
                if direction == Direction::Deposit {
                    debug!(
                        chain_id = self.chain_id,
                        shortfall = target - current,
                        "deposit target above holdings, waiting on inbound funds"
                    );
                }
            }
        }

        let ack = Acknowledgement {
            round_id: instruction.round_id,
            chain_id: self.chain_id,
            target_amount: target,
            achieved_amount: self.total_holdings(),
        };

        info!(
            chain_id = self.chain_id,
            round_id = ack.round_id,
            target = ack.target_amount,
            achieved = ack.achieved_amount,
            "applied allocation instruction"
        );

        self.last_ack = Some(ack);
        Some(ack)
    }

    /// Apply an instruction in one step
    pub fn on_allocation_instruction(
        &mut self,
        instruction: AllocationInstruction,
    ) -> Result<Acknowledgement, VaultError> {
        self.begin_instruction(instruction)?;
        self.complete_movement().ok_or(VaultError::VaultBusy {
            in_flight: instruction.round_id,
        })
    }

    /// Pull up to `amount`: inbound first, then reserves, then the other
    /// strategies in declared order.
    fn withdraw(&mut self, amount: Amount) -> Amount {
        let from_inbound = amount.min(self.inbound);
        self.inbound -= from_inbound;
        let mut withdrawn = from_inbound;

        let order = self
            .strategies
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.adapter, StrategyAdapter::Reserve(_)))
            .chain(
                self.strategies
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| !matches!(s.adapter, StrategyAdapter::Reserve(_))),
            )
            .map(|(index, _)| index)
            .collect::<Vec<_>>();

        for index in order {
            if withdrawn == amount {
                break;
            }
            if let Some(slot) = self.strategies.get_mut(index) {
                withdrawn += slot.adapter.move_funds(amount - withdrawn, Direction::Withdraw);
            }
        }
        withdrawn
    }

    /// Move `amount` of inbound funds into strategies by local weight. What a
    /// capped strategy refuses goes to the reserve, else stays inbound.
    fn deploy(&mut self, amount: Amount) -> Amount {
        if amount == 0 || self.strategies.is_empty() {
            return 0;
        }

        let weights: BTreeMap<usize, u64> = self
            .strategies
            .iter()
            .enumerate()
            .map(|(index, slot)| (index, slot.weight))
            .collect();
        let reserve = self.reserve_index();

        let shares = split_by_weight(amount, &weights, reserve)
            .unwrap_or_else(|| BTreeMap::from([(reserve.unwrap_or(0), amount)]));

        let mut deployed = 0;
        for (index, share) in shares {
            if let Some(slot) = self.strategies.get_mut(index) {
                deployed += slot.adapter.move_funds(share, Direction::Deposit);
            }
        }

        if deployed < amount {
            if let Some(slot) = reserve.and_then(|index| self.strategies.get_mut(index)) {
                deployed += slot.adapter.move_funds(amount - deployed, Direction::Deposit);
            }
        }

        self.inbound -= deployed;
        deployed
    }

    fn reserve_index(&self) -> Option<usize> {
        self.strategies
            .iter()
            .position(|s| matches!(s.adapter, StrategyAdapter::Reserve(_)))
    }

    pub fn snapshot(&self) -> VaultSnapshot {
        VaultSnapshot {
            chain_id: self.chain_id,
            total_holdings: self.total_holdings(),
            inbound: self.inbound,
            released: self.released,
            last_applied_round: self.last_applied_round,
            busy: self.is_busy(),
            last_ack: self.last_ack,
            strategies: self
                .strategies
                .iter()
                .map(|slot| StrategyView {
                    name: slot.adapter.name().to_string(),
                    balance: slot.adapter.report_balance(),
                    withdrawable: slot.adapter.withdrawable(),
                    weight: slot.weight,
                })
                .collect(),
        }
    }
}

/// Serializable view of a vault
#[derive(Debug, Clone, Serialize)]
pub struct VaultSnapshot {
    pub chain_id: ChainId,
    pub total_holdings: Amount,
    pub inbound: Amount,
    pub released: Amount,
    pub last_applied_round: RoundId,
    pub busy: bool,
    pub last_ack: Option<Acknowledgement>,
    pub strategies: Vec<StrategyView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyView {
    pub name: String,
    pub balance: Amount,
    pub withdrawable: Amount,
    pub weight: u64,
}
