//! In-process cross-chain bridge
//!
//! Routes payloads between the controller and vault actors over unbounded
//! mpsc channels. Requests and instructions go to the destination chain's
//! vault, reports and acknowledgements to the controller. Optional fault
//! injection drops or duplicates messages to exercise the retry paths.
//!
//! Funds move on a separate hop: a vault that withdraws hands the released
//! amount to the bridge, where it stays in transit until a vault short of its
//! deposit target claims it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vaultmesh_gmp::{Amount, ChainId, Delivery, GmpError, MessageId, MessageType, Transport};

/// Inbound side of an endpoint
pub type Inbox = mpsc::UnboundedReceiver<Delivery>;

/// Which endpoint on a chain a payload is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Controller,
    Vault,
}

impl Endpoint {
    fn for_message(msg_type: MessageType) -> Self {
        match msg_type {
            MessageType::BalanceRequest | MessageType::AllocationInstruction => Endpoint::Vault,
            MessageType::BalanceReport | MessageType::Acknowledgement => Endpoint::Controller,
        }
    }
}

/// Fault injection rates
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub drop_rate: f64,
    pub duplicate_rate: f64,
}

/// Counters exposed on `/bridge/stats`
#[derive(Debug, Clone, Default, Serialize)]
pub struct BridgeStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub failed: u64,
    /// Funds handed to the bridge by withdrawing vaults
    pub transferred_out: u64,
    /// Funds claimed by depositing vaults
    pub transferred_in: u64,
    /// Released funds not yet claimed
    pub in_transit: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
    failed: AtomicU64,
    transferred_out: AtomicU64,
    transferred_in: AtomicU64,
}

struct Inner {
    routes: RwLock<HashMap<(ChainId, Endpoint), mpsc::UnboundedSender<Delivery>>>,
    faults: Faults,
    nonce: AtomicU64,
    counters: Counters,
    in_transit: AtomicU64,
}

#[derive(Clone)]
pub struct LocalBridge {
    inner: Arc<Inner>,
}

impl LocalBridge {
    pub fn new(faults: Faults) -> Self {
        Self {
            inner: Arc::new(Inner {
                routes: RwLock::new(HashMap::new()),
                faults,
                nonce: AtomicU64::new(0),
                counters: Counters::default(),
                in_transit: AtomicU64::new(0),
            }),
        }
    }

    /// Attach an endpoint and return its inbox. Re-attaching replaces the route.
    pub fn attach(&self, chain_id: ChainId, endpoint: Endpoint) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .routes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((chain_id, endpoint), tx);
        rx
    }

    pub fn is_attached(&self, chain_id: ChainId, endpoint: Endpoint) -> bool {
        self.inner
            .routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&(chain_id, endpoint))
    }

    /// Outbound handle for an endpoint living on `local_chain`
    pub fn handle(&self, local_chain: ChainId, sender: impl Into<String>) -> BridgeHandle {
        BridgeHandle {
            bridge: self.clone(),
            local_chain,
            sender: sender.into(),
        }
    }

    pub fn stats(&self) -> BridgeStats {
        let c = &self.inner.counters;
        BridgeStats {
            sent: c.sent.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            duplicated: c.duplicated.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            transferred_out: c.transferred_out.load(Ordering::Relaxed),
            transferred_in: c.transferred_in.load(Ordering::Relaxed),
            in_transit: self.inner.in_transit.load(Ordering::SeqCst),
        }
    }

    /// Put funds released on `source_chain` in transit
    pub fn release_funds(&self, source_chain: ChainId, amount: Amount) {
        if amount == 0 {
            return;
        }
        let _ = self
            .inner
            .in_transit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                Some(held.saturating_add(amount))
            });
        self.inner
            .counters
            .transferred_out
            .fetch_add(amount, Ordering::Relaxed);
        debug!(source_chain, amount, "funds released to bridge");
    }

    /// Take up to `wanted` of the funds in transit for `chain_id`; returns the
    /// amount claimed
    pub fn claim_funds(&self, chain_id: ChainId, wanted: Amount) -> Amount {
        let mut claimed = 0;
        let _ = self
            .inner
            .in_transit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                claimed = held.min(wanted);
                Some(held - claimed)
            });
        if claimed > 0 {
            self.inner
                .counters
                .transferred_in
                .fetch_add(claimed, Ordering::Relaxed);
            debug!(chain_id, claimed, wanted, "funds claimed from bridge");
        }
        claimed
    }

    fn route(
        &self,
        source_chain: ChainId,
        sender: &str,
        destination: ChainId,
        payload: Vec<u8>,
    ) -> Result<MessageId, GmpError> {
        let counters = &self.inner.counters;
        let msg_type = payload
            .first()
            .copied()
            .ok_or_else(|| GmpError::Encoding("empty payload".into()))
            .and_then(MessageType::try_from)?;
        let endpoint = Endpoint::for_message(msg_type);

        let route = self
            .inner
            .routes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(destination, endpoint))
            .cloned();
        let Some(route) = route else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            return Err(GmpError::DeliveryFailure {
                chain_id: destination,
                reason: format!("no {:?} endpoint attached", endpoint),
            });
        };

        let nonce = self.inner.nonce.fetch_add(1, Ordering::SeqCst);
        let message_id = MessageId::compute(source_chain, destination, nonce, &payload);
        counters.sent.fetch_add(1, Ordering::Relaxed);

        let (drop, duplicate) = {
            let mut rng = rand::thread_rng();
            let faults = self.inner.faults;
            (
                faults.drop_rate > 0.0 && rng.gen_bool(faults.drop_rate),
                faults.duplicate_rate > 0.0 && rng.gen_bool(faults.duplicate_rate),
            )
        };

        if drop {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(%message_id, destination, ?msg_type, "bridge dropped message");
            return Ok(message_id);
        }

        let delivery = Delivery {
            message_id,
            source_chain,
            destination_chain: destination,
            sender: sender.to_string(),
            payload,
        };
        let copies = if duplicate {
            counters.duplicated.fetch_add(1, Ordering::Relaxed);
            2
        } else {
            1
        };

        for _ in 0..copies {
            if route.send(delivery.clone()).is_err() {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(%message_id, destination, "endpoint inbox closed");
                return Err(GmpError::DeliveryFailure {
                    chain_id: destination,
                    reason: "endpoint stopped".into(),
                });
            }
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(message_id)
    }
}

/// `Transport` implementation bound to one endpoint
#[derive(Clone)]
pub struct BridgeHandle {
    bridge: LocalBridge,
    local_chain: ChainId,
    sender: String,
}

impl BridgeHandle {
    pub fn release_funds(&self, amount: Amount) {
        self.bridge.release_funds(self.local_chain, amount);
    }

    pub fn claim_funds(&self, wanted: Amount) -> Amount {
        self.bridge.claim_funds(self.local_chain, wanted)
    }
}

impl Transport for BridgeHandle {
    fn local_chain(&self) -> ChainId {
        self.local_chain
    }

    fn send(&self, destination: ChainId, payload: Vec<u8>) -> Result<MessageId, GmpError> {
        self.bridge.route(self.local_chain, &self.sender, destination, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultmesh_gmp::{encode_payload, BalanceReport, BalanceRequest, Payload};

    fn request() -> Vec<u8> {
        encode_payload(&Payload::BalanceRequest(BalanceRequest { round_id: 1, reply_chain: 1 }))
    }

    fn report() -> Vec<u8> {
        encode_payload(&Payload::BalanceReport(BalanceReport { round_id: 1, chain_id: 10, amount: 5 }))
    }

    #[test]
    fn test_routes_by_message_type() {
        let bridge = LocalBridge::new(Faults::default());
        let mut controller = bridge.attach(1, Endpoint::Controller);
        let mut vault = bridge.attach(1, Endpoint::Vault);

        let handle = bridge.handle(10, "vault:10");
        handle.send(1, report()).unwrap();
        bridge.handle(1, "controller").send(1, request()).unwrap();

        let delivery = controller.try_recv().unwrap();
        assert_eq!(delivery.source_chain, 10);
        assert_eq!(delivery.sender, "vault:10");
        assert!(vault.try_recv().is_ok());
        assert!(controller.try_recv().is_err());
    }

    #[test]
    fn test_unrouted_destination_fails() {
        let bridge = LocalBridge::new(Faults::default());
        let err = bridge.handle(1, "controller").send(42161, request()).unwrap_err();
        assert!(matches!(err, GmpError::DeliveryFailure { chain_id: 42161, .. }));
        assert_eq!(bridge.stats().failed, 1);
    }

    #[test]
    fn test_fault_injection() {
        let bridge = LocalBridge::new(Faults { drop_rate: 1.0, duplicate_rate: 0.0 });
        let mut vault = bridge.attach(10, Endpoint::Vault);
        bridge.handle(1, "controller").send(10, request()).unwrap();
        assert!(vault.try_recv().is_err());
        assert_eq!(bridge.stats().dropped, 1);

        let bridge = LocalBridge::new(Faults { drop_rate: 0.0, duplicate_rate: 1.0 });
        let mut vault = bridge.attach(10, Endpoint::Vault);
        bridge.handle(1, "controller").send(10, request()).unwrap();
        let first = vault.try_recv().unwrap();
        let second = vault.try_recv().unwrap();
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(bridge.stats().delivered, 2);
    }

    #[test]
    fn test_funds_in_transit() {
        let bridge = LocalBridge::new(Faults::default());
        bridge.handle(42161, "vault:42161").release_funds(500);
        assert_eq!(bridge.stats().in_transit, 500);

        assert_eq!(bridge.handle(10, "vault:10").claim_funds(300), 300);
        assert_eq!(bridge.handle(8453, "vault:8453").claim_funds(300), 200);
        assert_eq!(bridge.claim_funds(1, 50), 0);

        let stats = bridge.stats();
        assert_eq!(stats.transferred_out, 500);
        assert_eq!(stats.transferred_in, 500);
        assert_eq!(stats.in_transit, 0);
    }
}
