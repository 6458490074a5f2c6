//! Chain identifiers and metadata
//!
//! Known chains a vault can be deployed on. Chains are addressed by their
//! numeric EVM chain id on the wire; names are accepted in configuration.

use serde::{Deserialize, Serialize};

use crate::ChainId;

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN IDENTIFIERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Ethereum mainnet
pub const ETHEREUM: ChainId = 1;
/// Ethereum Sepolia testnet
pub const ETHEREUM_SEPOLIA: ChainId = 11_155_111;
/// Arbitrum One
pub const ARBITRUM: ChainId = 42_161;
/// Optimism
pub const OPTIMISM: ChainId = 10;
/// Base
pub const BASE: ChainId = 8_453;
/// Base Sepolia testnet
pub const BASE_SEPOLIA: ChainId = 84_532;
/// Polygon PoS
pub const POLYGON: ChainId = 137;
/// Avalanche C-Chain
pub const AVALANCHE: ChainId = 43_114;

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN INFO
// ═══════════════════════════════════════════════════════════════════════════════

/// How the chain settles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainKind {
    /// Settlement layer
    L1,
    /// Rollup settling to Ethereum
    Rollup,
    /// Independent sidechain
    Sidechain,
}

/// Chain information structure
#[derive(Debug, Clone, Serialize)]
pub struct ChainInfo {
    pub chain_id: ChainId,
    /// Short identifier used in configuration
    pub chain_name: &'static str,
    /// Human-readable chain name
    pub display_name: &'static str,
    pub kind: ChainKind,
    /// Default gas limit for bridge calls
    pub default_gas: u64,
    /// Whether chain is production-ready
    pub production_ready: bool,
}

const KNOWN_CHAINS: &[ChainInfo] = &[
    ChainInfo {
        chain_id: ETHEREUM,
        chain_name: "ethereum",
        display_name: "Ethereum",
        kind: ChainKind::L1,
        default_gas: 200_000,
        production_ready: true,
    },
    ChainInfo {
        chain_id: ETHEREUM_SEPOLIA,
        chain_name: "ethereum-sepolia",
        display_name: "Ethereum Sepolia",
        kind: ChainKind::L1,
        default_gas: 200_000,
        production_ready: false,
    },
    ChainInfo {
        chain_id: ARBITRUM,
        chain_name: "arbitrum",
        display_name: "Arbitrum One",
        kind: ChainKind::Rollup,
        default_gas: 1_000_000,
        production_ready: true,
    },
    ChainInfo {
        chain_id: OPTIMISM,
        chain_name: "optimism",
        display_name: "Optimism",
        kind: ChainKind::Rollup,
        default_gas: 500_000,
        production_ready: true,
    },
    ChainInfo {
        chain_id: BASE,
        chain_name: "base",
        display_name: "Base",
        kind: ChainKind::Rollup,
        default_gas: 500_000,
        production_ready: true,
    },
    ChainInfo {
        chain_id: BASE_SEPOLIA,
        chain_name: "base-sepolia",
        display_name: "Base Sepolia",
        kind: ChainKind::Rollup,
        default_gas: 500_000,
        production_ready: false,
    },
    ChainInfo {
        chain_id: POLYGON,
        chain_name: "polygon",
        display_name: "Polygon",
        kind: ChainKind::Sidechain,
        default_gas: 300_000,
        production_ready: true,
    },
    ChainInfo {
        chain_id: AVALANCHE,
        chain_name: "avalanche",
        display_name: "Avalanche",
        kind: ChainKind::L1,
        default_gas: 300_000,
        production_ready: true,
    },
];

/// Get info for a known chain id
pub fn get_chain_info(chain_id: ChainId) -> Option<&'static ChainInfo> {
    KNOWN_CHAINS.iter().find(|c| c.chain_id == chain_id)
}

/// Look up a chain by its configuration name
pub fn find_by_name(name: &str) -> Option<&'static ChainInfo> {
    KNOWN_CHAINS
        .iter()
        .find(|c| c.chain_name.eq_ignore_ascii_case(name))
}

/// Resolve a chain from either a numeric id or a name
pub fn resolve(value: &str) -> Option<ChainId> {
    let value = value.trim();
    match value.parse::<ChainId>() {
        Ok(id) => Some(id),
        Err(_) => find_by_name(value).map(|c| c.chain_id),
    }
}

/// Display name for a chain, falling back to the numeric id
pub fn display_name(chain_id: ChainId) -> String {
    get_chain_info(chain_id)
        .map(|c| c.display_name.to_string())
        .unwrap_or_else(|| format!("chain-{}", chain_id))
}

/// All known chains
pub fn known_chains() -> &'static [ChainInfo] {
    KNOWN_CHAINS
}

/// Get all production-ready chains
pub fn production_chains() -> Vec<&'static ChainInfo> {
    KNOWN_CHAINS.iter().filter(|c| c.production_ready).collect()
}
