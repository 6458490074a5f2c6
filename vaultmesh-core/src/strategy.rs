//! Strategy adapters held by a chain vault
//!
//! The set of supported strategies is closed: each variant exposes the same
//! two capabilities, `report_balance` and `move_funds`. Positions are held in
//! shares and converted to the underlying through the adapter's exchange rate.

use serde::{Deserialize, Serialize};
use vaultmesh_gmp::{Amount, Direction};

/// Fixed-point scale of exchange rates (1.0 == 1_000_000)
pub const RATE_SCALE: u64 = 1_000_000;

// Conversions saturate at the top of the u64 range.
fn clamp(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn shares_to_underlying(shares: u64, rate: u64) -> Amount {
    clamp((shares as u128 * rate as u128) / RATE_SCALE as u128)
}

fn underlying_to_shares_floor(amount: Amount, rate: u64) -> u64 {
    clamp((amount as u128 * RATE_SCALE as u128) / rate.max(1) as u128)
}

fn underlying_to_shares_ceil(amount: Amount, rate: u64) -> u64 {
    let rate = rate.max(1) as u128;
    clamp((amount as u128 * RATE_SCALE as u128 + rate - 1) / rate)
}

/// Undeployed cash held directly by the vault
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reserve {
    pub balance: Amount,
}

/// Lending market position; withdrawals are limited by market liquidity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LendingMarket {
    pub name: String,
    pub shares: u64,
    pub exchange_rate: u64,
    /// Underlying the market can pay out right now
    pub available_liquidity: Amount,
}

/// Staking pool position; deposits are limited by pool capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakingPool {
    pub name: String,
    pub shares: u64,
    pub exchange_rate: u64,
    /// Maximum underlying the pool accepts
    pub capacity: Amount,
}

/// One yield strategy position on a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyAdapter {
    Reserve(Reserve),
    Lending(LendingMarket),
    Staking(StakingPool),
}

impl StrategyAdapter {
    pub fn reserve(balance: Amount) -> Self {
        StrategyAdapter::Reserve(Reserve { balance })
    }

    pub fn lending(name: &str, balance: Amount, available_liquidity: Amount) -> Self {
        StrategyAdapter::Lending(LendingMarket {
            name: name.to_string(),
            shares: balance,
            exchange_rate: RATE_SCALE,
            available_liquidity,
        })
    }

    pub fn staking(name: &str, balance: Amount, capacity: Amount) -> Self {
        StrategyAdapter::Staking(StakingPool {
            name: name.to_string(),
            shares: balance,
            exchange_rate: RATE_SCALE,
            capacity,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            StrategyAdapter::Reserve(_) => "reserve",
            StrategyAdapter::Lending(m) => &m.name,
            StrategyAdapter::Staking(p) => &p.name,
        }
    }

    /// Position value in the common underlying unit
    pub fn report_balance(&self) -> Amount {
        match self {
            StrategyAdapter::Reserve(r) => r.balance,
            StrategyAdapter::Lending(m) => shares_to_underlying(m.shares, m.exchange_rate),
            StrategyAdapter::Staking(p) => shares_to_underlying(p.shares, p.exchange_rate),
        }
    }

    /// Underlying that can be pulled out right now
    pub fn withdrawable(&self) -> Amount {
        match self {
            StrategyAdapter::Reserve(r) => r.balance,
            StrategyAdapter::Lending(m) => self.report_balance().min(m.available_liquidity),
            StrategyAdapter::Staking(_) => self.report_balance(),
        }
    }

    /// Underlying the position accepts right now, never more than keeps its
    /// balance within the amount range
    pub fn deposit_capacity(&self) -> Amount {
        let headroom = Amount::MAX - self.report_balance();
        match self {
            StrategyAdapter::Reserve(_) | StrategyAdapter::Lending(_) => headroom,
            StrategyAdapter::Staking(p) => p.capacity.saturating_sub(self.report_balance()),
        }
    }

    /// Move up to `amount` in `direction`; returns the underlying actually moved.
    pub fn move_funds(&mut self, amount: Amount, direction: Direction) -> Amount {
        match direction {
            Direction::Hold => 0,
            Direction::Deposit => {
                let moved = amount.min(self.deposit_capacity());
                match self {
                    StrategyAdapter::Reserve(r) => r.balance = r.balance.saturating_add(moved),
                    StrategyAdapter::Lending(m) => {
                        let minted = underlying_to_shares_floor(moved, m.exchange_rate);
                        m.shares = m.shares.saturating_add(minted);
                        m.available_liquidity = m.available_liquidity.saturating_add(moved);
                    }
                    StrategyAdapter::Staking(p) => {
                        let minted = underlying_to_shares_floor(moved, p.exchange_rate);
                        p.shares = p.shares.saturating_add(minted);
                    }
                }
                moved
            }
            Direction::Withdraw => {
                let moved = amount.min(self.withdrawable());
                match self {
                    StrategyAdapter::Reserve(r) => r.balance -= moved,
                    StrategyAdapter::Lending(m) => {
                        let burn = underlying_to_shares_ceil(moved, m.exchange_rate);
                        m.shares = m.shares.saturating_sub(burn);
                        m.available_liquidity -= moved;
                    }
                    StrategyAdapter::Staking(p) => {
                        let burn = underlying_to_shares_ceil(moved, p.exchange_rate);
                        p.shares = p.shares.saturating_sub(burn);
                    }
                }
                moved
            }
        }
    }

    /// Update the share price, e.g. after yield accrues. No-op for the reserve.
    pub fn set_exchange_rate(&mut self, rate: u64) {
        match self {
            StrategyAdapter::Reserve(_) => {}
            StrategyAdapter::Lending(m) => m.exchange_rate = rate,
            StrategyAdapter::Staking(p) => p.exchange_rate = rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_rate_conversion() {
        let mut lending = StrategyAdapter::lending("aave", 1_000, 1_000);
        assert_eq!(lending.report_balance(), 1_000);

        lending.set_exchange_rate(1_050_000);
        assert_eq!(lending.report_balance(), 1_050);
    }

    #[test]
    fn test_lending_withdraw_bounded_by_liquidity() {
        let mut lending = StrategyAdapter::lending("aave", 1_000, 300);
        let moved = lending.move_funds(500, Direction::Withdraw);
        assert_eq!(moved, 300);
        assert_eq!(lending.report_balance(), 700);
        assert_eq!(lending.withdrawable(), 0);
    }

    #[test]
    fn test_staking_deposit_bounded_by_capacity() {
        let mut staking = StrategyAdapter::staking("lido", 800, 1_000);
        assert_eq!(staking.deposit_capacity(), 200);
        assert_eq!(staking.move_funds(500, Direction::Deposit), 200);
        assert_eq!(staking.report_balance(), 1_000);
    }

    #[test]
    fn test_reserve_and_hold() {
        let mut reserve = StrategyAdapter::reserve(50);
        assert_eq!(reserve.move_funds(80, Direction::Withdraw), 50);
        assert_eq!(reserve.move_funds(10, Direction::Hold), 0);
        assert_eq!(reserve.move_funds(25, Direction::Deposit), 25);
        assert_eq!(reserve.report_balance(), 25);
    }

    #[test]
    fn test_deposit_capped_at_amount_range() {
        let mut reserve = StrategyAdapter::reserve(u64::MAX - 10);
        assert_eq!(reserve.deposit_capacity(), 10);
        assert_eq!(reserve.move_funds(50, Direction::Deposit), 10);
        assert_eq!(reserve.report_balance(), u64::MAX);

        let mut lending = StrategyAdapter::lending("aave", 0, u64::MAX);
        assert_eq!(lending.move_funds(u64::MAX, Direction::Deposit), u64::MAX);
        assert_eq!(lending.move_funds(1, Direction::Deposit), 0);
        assert_eq!(lending.withdrawable(), u64::MAX);
    }

    #[test]
    fn test_rate_growth_saturates_balance() {
        let mut staking = StrategyAdapter::staking("lido", u64::MAX, u64::MAX);
        staking.set_exchange_rate(3 * RATE_SCALE);
        assert_eq!(staking.report_balance(), u64::MAX);
        assert_eq!(staking.deposit_capacity(), 0);
    }

    #[test]
    fn test_withdraw_at_premium_rate_burns_fewer_shares() {
        let mut staking = StrategyAdapter::staking("lido", 1_000, u64::MAX);
        staking.set_exchange_rate(2 * RATE_SCALE);
        assert_eq!(staking.report_balance(), 2_000);

        assert_eq!(staking.move_funds(500, Direction::Withdraw), 500);
        assert_eq!(staking.report_balance(), 1_500);
    }
}
