//! vaultmesh-gmp
//!
//! Message types and transport contract for cross-chain vault rebalancing.
//! This crate defines the payloads exchanged between the home-chain controller
//! and the per-chain vaults, their 32-byte-word encoding, and the `Transport`
//! trait every bridge implementation satisfies.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod chains;
pub mod encoding;
pub mod transport;

pub use transport::{Delivery, MemoryTransport, MessageId, OutboundMessage, Transport};

/// Chain identifier (EVM chain id)
pub type ChainId = u64;

/// Rebalancing round identifier
pub type RoundId = u64;

/// Smallest-unit amount of the common underlying asset
pub type Amount = u64;

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum GmpError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("invalid direction: {0}")]
    InvalidDirection(u8),

    #[error("delivery failed to chain {chain_id}: {reason}")]
    DeliveryFailure { chain_id: ChainId, reason: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Message types for rebalancing payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Controller asks a vault for its total underlying
    BalanceRequest = 0,
    /// Vault answers with its total underlying
    BalanceReport = 1,
    /// Controller pushes a target amount to a vault
    AllocationInstruction = 2,
    /// Vault confirms an instruction with the achieved amount
    Acknowledgement = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = GmpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::BalanceRequest),
            1 => Ok(Self::BalanceReport),
            2 => Ok(Self::AllocationInstruction),
            3 => Ok(Self::Acknowledgement),
            _ => Err(GmpError::InvalidMessageType(value)),
        }
    }
}

/// Which way funds move on the receiving chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// Chain receives funds and deploys them into strategies
    Deposit = 0,
    /// Chain releases funds out of its strategies
    Withdraw = 1,
    /// Target equals current holdings
    Hold = 2,
}

impl TryFrom<u8> for Direction {
    type Error = GmpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Deposit),
            1 => Ok(Self::Withdraw),
            2 => Ok(Self::Hold),
            _ => Err(GmpError::InvalidDirection(value)),
        }
    }
}

impl Direction {
    /// Direction needed to move `current` holdings to `target`
    pub fn between(current: Amount, target: Amount) -> Self {
        match target.cmp(&current) {
            std::cmp::Ordering::Greater => Self::Deposit,
            std::cmp::Ordering::Less => Self::Withdraw,
            std::cmp::Ordering::Equal => Self::Hold,
        }
    }
}

/// Balance request sent by the controller at round start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRequest {
    pub round_id: RoundId,
    /// Chain the reply must be sent to
    pub reply_chain: ChainId,
}

/// Balance report sent by a vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceReport {
    pub round_id: RoundId,
    pub chain_id: ChainId,
    /// Total underlying held on the chain, smallest unit
    pub amount: Amount,
}

/// Per-chain target produced by the allocation calculator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInstruction {
    pub round_id: RoundId,
    pub chain_id: ChainId,
    pub target_amount: Amount,
    pub direction: Direction,
}

/// Acknowledgement of an allocation instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub round_id: RoundId,
    pub chain_id: ChainId,
    pub target_amount: Amount,
    /// Holdings actually reached after the move
    pub achieved_amount: Amount,
}

impl Acknowledgement {
    /// Signed gap between achieved and target (positive = over target)
    pub fn delta(&self) -> i128 {
        self.achieved_amount as i128 - self.target_amount as i128
    }

    pub fn is_exact(&self) -> bool {
        self.achieved_amount == self.target_amount
    }
}

/// Decoded message body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    BalanceRequest(BalanceRequest),
    BalanceReport(BalanceReport),
    AllocationInstruction(AllocationInstruction),
    Acknowledgement(Acknowledgement),
}

impl Payload {
    /// Round the payload belongs to
    pub fn round_id(&self) -> RoundId {
        match self {
            Payload::BalanceRequest(m) => m.round_id,
            Payload::BalanceReport(m) => m.round_id,
            Payload::AllocationInstruction(m) => m.round_id,
            Payload::Acknowledgement(m) => m.round_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::BalanceRequest(_) => MessageType::BalanceRequest,
            Payload::BalanceReport(_) => MessageType::BalanceReport,
            Payload::AllocationInstruction(_) => MessageType::AllocationInstruction,
            Payload::Acknowledgement(_) => MessageType::Acknowledgement,
        }
    }
}

/// GMP message wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmpMessage {
    /// Message type
    pub msg_type: MessageType,
    /// Encoded payload
    pub payload: Vec<u8>,
}

impl GmpMessage {
    pub fn balance_request(request: &BalanceRequest) -> Self {
        Self {
            msg_type: MessageType::BalanceRequest,
            payload: encoding::encode_balance_request(request),
        }
    }

    pub fn balance_report(report: &BalanceReport) -> Self {
        Self {
            msg_type: MessageType::BalanceReport,
            payload: encoding::encode_balance_report(report),
        }
    }

    pub fn instruction(instruction: &AllocationInstruction) -> Self {
        Self {
            msg_type: MessageType::AllocationInstruction,
            payload: encoding::encode_instruction(instruction),
        }
    }

    pub fn acknowledgement(ack: &Acknowledgement) -> Self {
        Self {
            msg_type: MessageType::Acknowledgement,
            payload: encoding::encode_acknowledgement(ack),
        }
    }

    /// Build the wire message for any payload
    pub fn from_payload(payload: &Payload) -> Self {
        match payload {
            Payload::BalanceRequest(m) => Self::balance_request(m),
            Payload::BalanceReport(m) => Self::balance_report(m),
            Payload::AllocationInstruction(m) => Self::instruction(m),
            Payload::Acknowledgement(m) => Self::acknowledgement(m),
        }
    }

    /// Decode a GMP message from bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, GmpError> {
        let (first, rest) = bytes
            .split_first()
            .ok_or_else(|| GmpError::Decoding("empty payload".into()))?;

        let msg_type = MessageType::try_from(*first)?;

        Ok(Self {
            msg_type,
            payload: rest.to_vec(),
        })
    }

    /// Encode the message to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut result = vec![self.msg_type as u8];
        result.extend_from_slice(&self.payload);
        result
    }

    /// Decode the body according to the message type
    pub fn body(&self) -> Result<Payload, GmpError> {
        Ok(match self.msg_type {
            MessageType::BalanceRequest => {
                Payload::BalanceRequest(encoding::decode_balance_request(&self.payload)?)
            }
            MessageType::BalanceReport => {
                Payload::BalanceReport(encoding::decode_balance_report(&self.payload)?)
            }
            MessageType::AllocationInstruction => {
                Payload::AllocationInstruction(encoding::decode_instruction(&self.payload)?)
            }
            MessageType::Acknowledgement => {
                Payload::Acknowledgement(encoding::decode_acknowledgement(&self.payload)?)
            }
        })
    }
}

/// Decode raw bytes straight into a payload
pub fn decode_payload(bytes: &[u8]) -> Result<Payload, GmpError> {
    GmpMessage::decode(bytes)?.body()
}

/// Encode a payload into raw bytes
pub fn encode_payload(payload: &Payload) -> Vec<u8> {
    GmpMessage::from_payload(payload).encode()
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
