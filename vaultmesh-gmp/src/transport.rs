//! Transport contract between controller and vault endpoints
//!
//! A transport sends opaque payloads to a destination chain. Delivery is
//! best-effort: a payload may be dropped, delayed, reordered against other
//! sends, or delivered more than once. It is never delivered to the wrong
//! destination. Receivers must therefore apply each logical message at most
//! once themselves.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Serialize, Serializer};
use sha3::{Digest, Keccak256};
use tracing::debug;

use crate::{decode_payload, ChainId, GmpError, Payload};

// ═══════════════════════════════════════════════════════════════════════════════
// MESSAGE IDS
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier assigned to every send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 32]);

impl MessageId {
    /// keccak256(source || destination || nonce || payload)
    pub fn compute(source: ChainId, destination: ChainId, nonce: u64, payload: &[u8]) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(source.to_be_bytes());
        hasher.update(destination.to_be_bytes());
        hasher.update(nonce.to_be_bytes());
        hasher.update(payload);
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DELIVERY
// ═══════════════════════════════════════════════════════════════════════════════

/// A payload as handed to the receiving endpoint
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub message_id: MessageId,
    pub source_chain: ChainId,
    pub destination_chain: ChainId,
    /// Endpoint address that sent the payload on the source chain
    pub sender: String,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl Delivery {
    /// Decode the carried payload
    pub fn decode(&self) -> Result<Payload, GmpError> {
        decode_payload(&self.payload)
    }
}

mod hex_bytes {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSPORT TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Outbound half of a cross-chain bridge, bound to one local endpoint
pub trait Transport: Send + Sync {
    /// Chain this endpoint lives on
    fn local_chain(&self) -> ChainId;

    /// Fire-and-forget send. `Ok` means the bridge accepted the payload, not
    /// that it will arrive.
    fn send(&self, destination: ChainId, payload: Vec<u8>) -> Result<MessageId, GmpError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn local_chain(&self) -> ChainId {
        (**self).local_chain()
    }

    fn send(&self, destination: ChainId, payload: Vec<u8>) -> Result<MessageId, GmpError> {
        (**self).send(destination, payload)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEMORY TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════════

/// A payload accepted by a `MemoryTransport`
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message_id: MessageId,
    pub destination: ChainId,
    pub payload: Vec<u8>,
}

/// Transport that records sends instead of delivering them.
///
/// Tests drain the outbox and hand the messages to receivers explicitly, which
/// makes drops, duplicates and reordering easy to script.
#[derive(Debug)]
pub struct MemoryTransport {
    local_chain: ChainId,
    sender: String,
    nonce: AtomicU64,
    failing: AtomicBool,
    outbox: Mutex<Vec<OutboundMessage>>,
}

impl MemoryTransport {
    pub fn new(local_chain: ChainId, sender: impl Into<String>) -> Self {
        Self {
            local_chain,
            sender: sender.into(),
            nonce: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            outbox: Mutex::new(Vec::new()),
        }
    }

    /// Make every subsequent send fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Take every recorded message, leaving the outbox empty
    pub fn drain(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of messages waiting in the outbox
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Wrap a recorded message as it would arrive at its destination
    pub fn deliver(&self, message: &OutboundMessage) -> Delivery {
        Delivery {
            message_id: message.message_id,
            source_chain: self.local_chain,
            destination_chain: message.destination,
            sender: self.sender.clone(),
            payload: message.payload.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OutboundMessage>> {
        self.outbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for MemoryTransport {
    fn local_chain(&self) -> ChainId {
        self.local_chain
    }

    fn send(&self, destination: ChainId, payload: Vec<u8>) -> Result<MessageId, GmpError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GmpError::DeliveryFailure {
                chain_id: destination,
                reason: "transport unavailable".into(),
            });
        }

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let message_id = MessageId::compute(self.local_chain, destination, nonce, &payload);
        debug!(%message_id, destination, "recorded outbound message");

        self.lock().push(OutboundMessage {
            message_id,
            destination,
            payload,
        });
        Ok(message_id)
    }
}
