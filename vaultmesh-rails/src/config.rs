//! Service configuration.

use std::collections::BTreeMap;
use std::env;

use anyhow::{anyhow, bail, Context, Result};
use vaultmesh_core::{OrchestratorConfig, Principal, StrategyWeights};
use vaultmesh_gmp::{chains, ChainId};

/// Service configuration.
#[derive(Clone, Debug)]
pub struct RailsConfig {
    /// HTTP port.
    pub port: u16,
    /// Chain the controller lives on.
    pub home_chain: ChainId,
    /// Chains registered at startup, each gets a vault actor.
    pub chains: Vec<ChainId>,
    pub dao: Principal,
    pub guardian: Principal,
    pub scheduler: Option<Principal>,
    pub report_window_secs: u64,
    pub ack_window_secs: u64,
    pub remainder_chain: Option<ChainId>,
    /// Controller liveness tick.
    pub tick_millis: u64,
    /// How long a vault stays busy moving funds.
    pub move_delay_millis: u64,
    /// How long a depositing vault waits for bridged funds.
    pub transfer_timeout_millis: u64,
    /// Probability the bridge silently drops a message.
    pub drop_rate: f64,
    /// Probability the bridge delivers a message twice.
    pub duplicate_rate: f64,
    pub weights: StrategyWeights,
}

impl RailsConfig {
    /// Defaults for a local mesh driven by the given dao and guardian.
    pub fn local(dao: impl Into<Principal>, guardian: impl Into<Principal>) -> Self {
        Self {
            port: 3010,
            home_chain: chains::ETHEREUM,
            chains: vec![chains::ETHEREUM, chains::ARBITRUM, chains::OPTIMISM],
            dao: dao.into(),
            guardian: guardian.into(),
            scheduler: None,
            report_window_secs: vaultmesh_core::config::DEFAULT_REPORT_WINDOW_SECS,
            ack_window_secs: vaultmesh_core::config::DEFAULT_ACK_WINDOW_SECS,
            remainder_chain: None,
            tick_millis: 1_000,
            move_delay_millis: 0,
            transfer_timeout_millis: 2_000,
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            weights: StrategyWeights::Equal,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let dao = env::var("VAULTMESH_DAO").context("VAULTMESH_DAO must be set")?;
        let guardian = env::var("VAULTMESH_GUARDIAN").context("VAULTMESH_GUARDIAN must be set")?;
        let mut config = Self::local(dao, guardian);

        config.scheduler = env::var("VAULTMESH_SCHEDULER").ok().map(Principal::from);

        if let Some(port) = parse_var("VAULTMESH_PORT")? {
            config.port = port;
        }
        if let Ok(home) = env::var("VAULTMESH_HOME_CHAIN") {
            config.home_chain = resolve_chain(&home).context("invalid VAULTMESH_HOME_CHAIN")?;
        }
        if let Ok(list) = env::var("VAULTMESH_CHAINS") {
            config.chains = parse_chains(&list).context("invalid VAULTMESH_CHAINS")?;
        }
        if let Some(secs) = parse_var("VAULTMESH_REPORT_WINDOW_SECS")? {
            config.report_window_secs = secs;
        }
        if let Some(secs) = parse_var("VAULTMESH_ACK_WINDOW_SECS")? {
            config.ack_window_secs = secs;
        }
        if let Ok(chain) = env::var("VAULTMESH_REMAINDER_CHAIN") {
            config.remainder_chain =
                Some(resolve_chain(&chain).context("invalid VAULTMESH_REMAINDER_CHAIN")?);
        }
        if let Some(millis) = parse_var("VAULTMESH_TICK_MILLIS")? {
            config.tick_millis = millis;
        }
        if let Some(millis) = parse_var("VAULTMESH_MOVE_DELAY_MILLIS")? {
            config.move_delay_millis = millis;
        }
        if let Some(millis) = parse_var("VAULTMESH_TRANSFER_TIMEOUT_MILLIS")? {
            config.transfer_timeout_millis = millis;
        }
        if let Some(rate) = parse_var("VAULTMESH_DROP_RATE")? {
            config.drop_rate = probability(rate).context("invalid VAULTMESH_DROP_RATE")?;
        }
        if let Some(rate) = parse_var("VAULTMESH_DUPLICATE_RATE")? {
            config.duplicate_rate = probability(rate).context("invalid VAULTMESH_DUPLICATE_RATE")?;
        }
        if let Ok(weights) = env::var("VAULTMESH_WEIGHTS") {
            config.weights = parse_weights(&weights).context("invalid VAULTMESH_WEIGHTS")?;
        }

        Ok(config)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            report_window_secs: self.report_window_secs,
            ack_window_secs: self.ack_window_secs,
            home_chain_id: self.home_chain,
            rounding_remainder_chain: self.remainder_chain,
            ..OrchestratorConfig::default()
        }
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {}: {:?}", name, value)),
        Err(_) => Ok(None),
    }
}

fn probability(rate: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        bail!("{} is not within 0.0..=1.0", rate)
    }
}

fn resolve_chain(value: &str) -> Result<ChainId> {
    chains::resolve(value).ok_or_else(|| anyhow!("unknown chain {:?}", value))
}

/// Comma-separated chain ids or names.
pub fn parse_chains(list: &str) -> Result<Vec<ChainId>> {
    let mut chain_ids = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let chain_id = resolve_chain(item)?;
        if !chain_ids.contains(&chain_id) {
            chain_ids.push(chain_id);
        }
    }
    if chain_ids.is_empty() {
        bail!("no chains listed");
    }
    Ok(chain_ids)
}

/// `chain:weight` pairs, e.g. `arbitrum:2,10:1`.
pub fn parse_weights(list: &str) -> Result<StrategyWeights> {
    let mut weights = BTreeMap::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (chain, weight) = item
            .split_once(':')
            .ok_or_else(|| anyhow!("expected chain:weight, got {:?}", item))?;
        let weight: u64 = weight
            .trim()
            .parse()
            .with_context(|| format!("invalid weight in {:?}", item))?;
        weights.insert(resolve_chain(chain.trim())?, weight);
    }
    if weights.is_empty() {
        return Ok(StrategyWeights::Equal);
    }
    Ok(StrategyWeights::Weighted(weights))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chains_by_name_and_id() {
        let chains = parse_chains("ethereum, 42161,optimism,1").unwrap();
        assert_eq!(chains, vec![1, 42161, 10]);
        assert!(parse_chains("ethereum,narnia").is_err());
        assert!(parse_chains(" , ").is_err());
    }

    #[test]
    fn test_parse_weights() {
        let weights = parse_weights("arbitrum:2, 10:1").unwrap();
        assert_eq!(weights.weight_of(42161), 2);
        assert_eq!(weights.weight_of(10), 1);
        assert_eq!(weights.weight_of(1), 0);

        assert_eq!(parse_weights("").unwrap(), StrategyWeights::Equal);
        assert!(parse_weights("arbitrum").is_err());
        assert!(parse_weights("arbitrum:lots").is_err());
    }

    #[test]
    fn test_orchestrator_config() {
        let mut config = RailsConfig::local("0xdao", "0xguardian");
        config.remainder_chain = Some(10);
        let orchestrator = config.orchestrator();
        assert_eq!(orchestrator.report_window_secs, 300);
        assert_eq!(orchestrator.remainder_chain(), 10);
    }

    #[test]
    fn test_probability_bounds() {
        assert!(probability(0.5).is_ok());
        assert!(probability(1.5).is_err());
    }
}
