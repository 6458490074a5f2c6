//! Allocation calculator
//!
//! Pure functions mapping an aggregate balance and strategic weights to
//! per-chain target amounts. Targets always sum exactly to the input total:
//! integer-division dust is assigned to one designated key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;
use vaultmesh_gmp::{AllocationInstruction, Amount, ChainId, Direction, RoundId};

use crate::error::AllocationError;

/// Strategic weights across chains
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyWeights {
    /// Every participating chain gets the same share
    #[default]
    Equal,
    /// Relative weights; chains without an entry get nothing
    Weighted(BTreeMap<ChainId, u64>),
}

impl StrategyWeights {
    pub fn weight_of(&self, chain_id: ChainId) -> u64 {
        match self {
            StrategyWeights::Equal => 1,
            StrategyWeights::Weighted(weights) => weights.get(&chain_id).copied().unwrap_or(0),
        }
    }
}

/// Split `total` across `weights` proportionally.
///
/// `target_k = floor(total * w_k / W)`; the remainder goes to `remainder_key`
/// when present in `weights`, otherwise to the heaviest key (lowest key on a
/// tie). Returns `None` when the weights sum to zero.
pub fn split_by_weight<K: Ord + Copy>(
    total: Amount,
    weights: &BTreeMap<K, u64>,
    remainder_key: Option<K>,
) -> Option<BTreeMap<K, Amount>> {
    let total_weight: u128 = weights.values().map(|w| *w as u128).sum();
    if total_weight == 0 {
        return None;
    }

    let mut targets: BTreeMap<K, Amount> = weights
        .iter()
        .map(|(key, weight)| {
            let share = (total as u128 * *weight as u128) / total_weight;
            (*key, share as Amount)
        })
        .collect();

    let assigned: Amount = targets.values().sum();
    let remainder = total - assigned;

    if remainder > 0 {
        let sink = remainder_key
            .filter(|key| weights.contains_key(key))
            .or_else(|| heaviest(weights))?;
        if let Some(target) = targets.get_mut(&sink) {
            *target += remainder;
        }
    }

    Some(targets)
}

fn heaviest<K: Ord + Copy>(weights: &BTreeMap<K, u64>) -> Option<K> {
    // max_by_key keeps the last maximum; iterate in reverse so ties resolve
    // to the lowest key.
    weights
        .iter()
        .rev()
        .max_by_key(|(_, weight)| **weight)
        .map(|(key, _)| *key)
}

/// Compute per-chain targets for one round.
///
/// `prior` holds the reported balance of every participating chain. Chains
/// outside `prior` (failed or unregistered) never receive a target. When the
/// weights give the participants zero total weight, targets follow the prior
/// balances so funds stay put.
pub fn allocate(
    total: Amount,
    prior: &BTreeMap<ChainId, Amount>,
    weights: &StrategyWeights,
    remainder_chain: ChainId,
) -> Result<BTreeMap<ChainId, Amount>, AllocationError> {
    if prior.is_empty() {
        return if total == 0 {
            Ok(BTreeMap::new())
        } else {
            Err(AllocationError::NoParticipants { total })
        };
    }

    let chain_weights: BTreeMap<ChainId, u64> = prior
        .keys()
        .map(|chain_id| (*chain_id, weights.weight_of(*chain_id)))
        .collect();

    if let Some(targets) = split_by_weight(total, &chain_weights, Some(remainder_chain)) {
        return Ok(targets);
    }

    warn!(
        participants = prior.len(),
        "participating chains carry no weight, holding current balances"
    );

    if let Some(targets) = split_by_weight(total, prior, Some(remainder_chain)) {
        return Ok(targets);
    }

    // Every participant reported zero as well.
    let equal: BTreeMap<ChainId, u64> = prior.keys().map(|chain_id| (*chain_id, 1)).collect();
    split_by_weight(total, &equal, Some(remainder_chain))
        .ok_or(AllocationError::NoParticipants { total })
}

/// Turn targets into instructions, deriving each direction from the prior
/// balance.
pub fn plan(
    round_id: RoundId,
    targets: &BTreeMap<ChainId, Amount>,
    prior: &BTreeMap<ChainId, Amount>,
) -> Vec<AllocationInstruction> {
    targets
        .iter()
        .map(|(chain_id, target)| {
            let current = prior.get(chain_id).copied().unwrap_or(0);
            AllocationInstruction {
                round_id,
                chain_id: *chain_id,
                target_amount: *target,
                direction: Direction::between(current, *target),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn balances(entries: &[(ChainId, Amount)]) -> BTreeMap<ChainId, Amount> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_equal_split_three_chains() {
        let prior = balances(&[(1, 1000), (2, 2000), (3, 0)]);
        let targets = allocate(3000, &prior, &StrategyWeights::Equal, 1).unwrap();
        assert_eq!(targets, balances(&[(1, 1000), (2, 1000), (3, 1000)]));
    }

    #[test]
    fn test_remainder_goes_to_designated_chain() {
        let prior = balances(&[(1, 0), (2, 0), (3, 10)]);
        let targets = allocate(10, &prior, &StrategyWeights::Equal, 2).unwrap();
        assert_eq!(targets, balances(&[(1, 3), (2, 4), (3, 3)]));
    }

    #[test]
    fn test_remainder_falls_back_to_heaviest_when_home_absent() {
        let prior = balances(&[(10, 0), (20, 0), (30, 0)]);
        let weights = StrategyWeights::Weighted(balances(&[(10, 1), (20, 3), (30, 3)]));
        let targets = allocate(100, &prior, &weights, 1).unwrap();

        // 14 + 42 + 42 = 98, dust of 2 to chain 20 (heaviest, lowest id on tie)
        assert_eq!(targets, balances(&[(10, 14), (20, 44), (30, 42)]));
    }

    #[test]
    fn test_unweighted_participants_hold() {
        let prior = balances(&[(5, 700), (6, 300)]);
        let weights = StrategyWeights::Weighted(balances(&[(99, 1)]));
        let targets = allocate(1000, &prior, &weights, 5).unwrap();
        assert_eq!(targets, prior);
    }

    #[test]
    fn test_all_zero_falls_back_to_equal() {
        let prior = balances(&[(5, 0), (6, 0)]);
        let weights = StrategyWeights::Weighted(BTreeMap::new());
        let targets = allocate(0, &prior, &weights, 5).unwrap();
        assert_eq!(targets, balances(&[(5, 0), (6, 0)]));
    }

    #[test]
    fn test_no_participants() {
        let empty = BTreeMap::new();
        assert!(allocate(0, &empty, &StrategyWeights::Equal, 1).unwrap().is_empty());
        assert_eq!(
            allocate(5, &empty, &StrategyWeights::Equal, 1),
            Err(AllocationError::NoParticipants { total: 5 })
        );
    }

    #[test]
    fn test_plan_directions() {
        let prior = balances(&[(1, 1000), (2, 2000), (3, 0)]);
        let targets = balances(&[(1, 1000), (2, 1000), (3, 1000)]);
        let instructions = plan(9, &targets, &prior);

        let directions: Vec<_> = instructions.iter().map(|i| i.direction).collect();
        assert_eq!(
            directions,
            vec![Direction::Hold, Direction::Withdraw, Direction::Deposit]
        );
        assert!(instructions.iter().all(|i| i.round_id == 9));
    }

    proptest! {
        #[test]
        fn prop_allocation_conserves_total(
            total in 0u64..=u64::MAX / 2,
            prior in proptest::collection::btree_map(1u64..50, 0u64..1_000_000_000, 1..8),
            weights in proptest::collection::btree_map(1u64..50, 0u64..10_000, 0..8),
            remainder in 1u64..50,
        ) {
            let weights = StrategyWeights::Weighted(weights);
            let targets = allocate(total, &prior, &weights, remainder).unwrap();
            let sum: u128 = targets.values().map(|v| *v as u128).sum();
            prop_assert_eq!(sum, total as u128);
            prop_assert!(targets.keys().all(|k| prior.contains_key(k)));
        }

        #[test]
        fn prop_allocation_is_deterministic(
            total in 0u64..1_000_000_000_000,
            prior in proptest::collection::btree_map(1u64..50, 0u64..1_000_000, 1..8),
            remainder in 1u64..50,
        ) {
            let first = allocate(total, &prior, &StrategyWeights::Equal, remainder).unwrap();
            let second = allocate(total, &prior, &StrategyWeights::Equal, remainder).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
