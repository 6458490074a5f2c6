//! Controller and vault actors
//!
//! Each endpoint runs on its own tokio task and exclusively owns its state.
//! Deliveries arrive through the bridge; the HTTP layer talks to an actor by
//! sending it a job over an mpsc channel and awaiting the oneshot reply, so
//! every mutation runs on the actor's sequential path.
//!
//! A vault that withdraws hands the released funds to the bridge once the
//! movement completes. A vault short of its deposit target claims funds in
//! transit until it is covered or the transfer timeout passes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use vaultmesh_core::{ChainVault, RebalanceController, VaultError};
use vaultmesh_gmp::{encode_payload, ChainId, Delivery, Payload, Transport};

use crate::bridge::{BridgeHandle, Inbox};

/// The controller type every actor in this service runs
pub type Controller = RebalanceController<BridgeHandle>;

type ControllerJob = Box<dyn FnOnce(&mut Controller, u64) + Send>;
type VaultJob = Box<dyn FnOnce(&mut ChainVault) + Send>;

/// How often a vault waiting on inbound funds checks the bridge
const FUNDS_POLL: Duration = Duration::from_millis(10);

/// The actor task is gone
#[derive(Debug, Error)]
#[error("{0} actor stopped")]
pub struct ActorStopped(pub &'static str);

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROLLER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct ControllerHandle {
    jobs: mpsc::UnboundedSender<ControllerJob>,
}

impl ControllerHandle {
    /// Run `f` on the controller actor with the current time and return its
    /// result
    pub async fn call<R, F>(&self, f: F) -> Result<R, ActorStopped>
    where
        R: Send + 'static,
        F: FnOnce(&mut Controller, u64) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: ControllerJob = Box::new(move |controller, now| {
            let _ = tx.send(f(controller, now));
        });
        self.jobs.send(job).map_err(|_| ActorStopped("controller"))?;
        rx.await.map_err(|_| ActorStopped("controller"))
    }
}

/// Spawn the controller actor. It owns `controller` until every handle is
/// dropped.
pub fn spawn_controller(
    mut controller: Controller,
    mut inbox: Inbox,
    tick: Duration,
) -> (ControllerHandle, JoinHandle<()>) {
    let (jobs_tx, mut jobs) = mpsc::unbounded_channel::<ControllerJob>();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(home_chain = controller.config().home_chain_id, "controller actor started");

        loop {
            tokio::select! {
                Some(delivery) = inbox.recv() => {
                    match controller.handle_delivery(&delivery, unix_now()) {
                        Ok(outcome) => debug!(message_id = %delivery.message_id, ?outcome, "delivery handled"),
                        Err(e) => warn!(message_id = %delivery.message_id, error = %e, "delivery rejected"),
                    }
                }
                job = jobs.recv() => match job {
                    Some(job) => job(&mut controller, unix_now()),
                    None => break,
                },
                _ = ticker.tick() => {
                    let now = unix_now();
                    if let Some(summary) = controller.tick(now) {
                        info!(round_id = summary.round_id, outcome = ?summary.outcome, "round closed by deadline");
                    }
                    controller.retry_outstanding(now);
                }
            }
        }
        info!("controller actor stopped");
    });

    (ControllerHandle { jobs: jobs_tx }, task)
}

// ═══════════════════════════════════════════════════════════════════════════════
// VAULTS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct VaultHandle {
    chain_id: ChainId,
    jobs: mpsc::UnboundedSender<VaultJob>,
}

impl VaultHandle {
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub async fn call<R, F>(&self, f: F) -> Result<R, ActorStopped>
    where
        R: Send + 'static,
        F: FnOnce(&mut ChainVault) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: VaultJob = Box::new(move |vault| {
            let _ = tx.send(f(vault));
        });
        self.jobs.send(job).map_err(|_| ActorStopped("vault"))?;
        rx.await.map_err(|_| ActorStopped("vault"))
    }
}

/// Identity a vault accepts requests and instructions from
#[derive(Debug, Clone)]
pub struct TrustedController {
    pub chain_id: ChainId,
    pub sender: String,
}

#[derive(Debug, Clone, Copy)]
struct Movement {
    reply_chain: ChainId,
    /// Next time the movement is checked
    ready_at: Instant,
    /// Last moment to wait for inbound funds
    funds_deadline: Instant,
}

struct VaultActor {
    vault: ChainVault,
    transport: BridgeHandle,
    controller: TrustedController,
    move_delay: Duration,
    transfer_timeout: Duration,
    pending: Option<Movement>,
}

impl VaultActor {
    fn handle(&mut self, delivery: Delivery) {
        if delivery.source_chain != self.controller.chain_id
            || !delivery.sender.eq_ignore_ascii_case(&self.controller.sender)
        {
            warn!(
                chain_id = self.vault.chain_id(),
                source_chain = delivery.source_chain,
                sender = %delivery.sender,
                "vault ignored delivery from untrusted source"
            );
            return;
        }

        let payload = match delivery.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(chain_id = self.vault.chain_id(), error = %e, "vault received malformed payload");
                return;
            }
        };

        match payload {
            Payload::BalanceRequest(request) => {
                let report = self.vault.on_balance_request(request.round_id);
                self.reply(request.reply_chain, Payload::BalanceReport(report));
            }
            Payload::AllocationInstruction(instruction) => {
                match self.vault.begin_instruction(instruction) {
                    Ok(()) => {
                        let ready_at = Instant::now() + self.move_delay;
                        self.pending = Some(Movement {
                            reply_chain: delivery.source_chain,
                            ready_at,
                            funds_deadline: ready_at + self.transfer_timeout,
                        });
                        if self.move_delay.is_zero() {
                            self.advance();
                        }
                    }
                    Err(VaultError::StaleRound { round_id, .. }) => {
                        // replayed instruction: answer again without re-applying
                        match self.vault.last_ack().filter(|ack| ack.round_id == round_id) {
                            Some(ack) => self.reply(delivery.source_chain, Payload::Acknowledgement(ack)),
                            None => debug!(chain_id = self.vault.chain_id(), round_id, "stale instruction"),
                        }
                    }
                    Err(e) => debug!(chain_id = self.vault.chain_id(), error = %e, "instruction deferred"),
                }
            }
            other => warn!(
                chain_id = self.vault.chain_id(),
                message_type = ?other.message_type(),
                "vault does not accept message"
            ),
        }
    }

    /// Pull bridged funds toward the target, then complete the movement
    /// unless still short and inside the transfer window
    fn advance(&mut self) {
        let Some(movement) = self.pending else {
            return;
        };
        let wanted = self.vault.shortfall();
        if wanted > 0 {
            let claimed = self.transport.claim_funds(wanted);
            if claimed > 0 {
                self.vault.credit_inbound(claimed);
            }
        }

        let now = Instant::now();
        if self.vault.shortfall() > 0 && now < movement.funds_deadline {
            self.pending = Some(Movement {
                ready_at: now + FUNDS_POLL,
                ..movement
            });
            return;
        }
        self.finish(movement.reply_chain);
    }

    fn finish(&mut self, reply_chain: ChainId) {
        self.pending = None;
        let released_before = self.vault.released();
        let Some(ack) = self.vault.complete_movement() else {
            return;
        };
        let released = self.vault.released().saturating_sub(released_before);
        self.transport.release_funds(released);
        if !ack.is_exact() {
            warn!(
                chain_id = self.vault.chain_id(),
                round_id = ack.round_id,
                target = ack.target_amount,
                achieved = ack.achieved_amount,
                "movement finished off target"
            );
        }
        self.reply(reply_chain, Payload::Acknowledgement(ack));
    }

    fn reply(&self, destination: ChainId, payload: Payload) {
        if let Err(e) = self.transport.send(destination, encode_payload(&payload)) {
            warn!(chain_id = self.vault.chain_id(), error = %e, "vault reply failed");
        }
    }
}

/// Spawn a vault actor
pub fn spawn_vault(
    vault: ChainVault,
    mut inbox: Inbox,
    transport: BridgeHandle,
    controller: TrustedController,
    move_delay: Duration,
    transfer_timeout: Duration,
) -> (VaultHandle, JoinHandle<()>) {
    let chain_id = vault.chain_id();
    let (jobs_tx, mut jobs) = mpsc::unbounded_channel::<VaultJob>();

    let mut actor = VaultActor {
        vault,
        transport,
        controller,
        move_delay,
        transfer_timeout,
        pending: None,
    };

    let task = tokio::spawn(async move {
        info!(chain_id, "vault actor started");
        loop {
            let movement_due = actor.pending.map_or_else(Instant::now, |m| m.ready_at);
            tokio::select! {
                biased;
                Some(delivery) = inbox.recv() => actor.handle(delivery),
                job = jobs.recv() => match job {
                    Some(job) => job(&mut actor.vault),
                    None => break,
                },
                _ = sleep_until(movement_due), if actor.pending.is_some() => actor.advance(),
            }
        }
        info!(chain_id, "vault actor stopped");
    });

    (VaultHandle { chain_id, jobs: jobs_tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Endpoint, Faults, LocalBridge};
    use vaultmesh_core::StrategyAdapter;
    use vaultmesh_gmp::{decode_payload, AllocationInstruction, BalanceRequest, Direction};

    fn vault_fixture(move_delay: Duration) -> (LocalBridge, VaultHandle, Inbox, BridgeHandle) {
        let bridge = LocalBridge::new(Faults::default());
        let controller_inbox = bridge.attach(1, Endpoint::Controller);
        let vault_inbox = bridge.attach(10, Endpoint::Vault);

        let vault = ChainVault::new(10).with_strategy(StrategyAdapter::reserve(500), 1);
        let (handle, _task) = spawn_vault(
            vault,
            vault_inbox,
            bridge.handle(10, "vault:10"),
            TrustedController {
                chain_id: 1,
                sender: "controller".to_string(),
            },
            move_delay,
            Duration::from_secs(1),
        );
        let controller_out = bridge.handle(1, "controller");
        (bridge, handle, controller_inbox, controller_out)
    }

    fn instruction(round_id: u64, target: u64) -> Vec<u8> {
        move_to(round_id, target, Direction::Withdraw)
    }

    fn move_to(round_id: u64, target: u64, direction: Direction) -> Vec<u8> {
        encode_payload(&Payload::AllocationInstruction(AllocationInstruction {
            round_id,
            chain_id: 10,
            target_amount: target,
            direction,
        }))
    }

    async fn next_ack(inbox: &mut Inbox) -> vaultmesh_gmp::Acknowledgement {
        let delivery = inbox.recv().await.unwrap();
        match decode_payload(&delivery.payload).unwrap() {
            Payload::Acknowledgement(ack) => ack,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_vault_answers_balance_request() {
        let (_bridge, _handle, mut inbox, controller) = vault_fixture(Duration::ZERO);
        let request = Payload::BalanceRequest(BalanceRequest { round_id: 3, reply_chain: 1 });
        controller.send(10, encode_payload(&request)).unwrap();

        let delivery = inbox.recv().await.unwrap();
        match decode_payload(&delivery.payload).unwrap() {
            Payload::BalanceReport(report) => {
                assert_eq!(report.round_id, 3);
                assert_eq!(report.amount, 500);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replayed_instruction_re_acknowledged() {
        let (bridge, handle, mut inbox, controller) = vault_fixture(Duration::ZERO);
        controller.send(10, instruction(1, 200)).unwrap();
        controller.send(10, instruction(1, 200)).unwrap();

        let first = inbox.recv().await.unwrap();
        let second = inbox.recv().await.unwrap();
        assert_eq!(first.payload, second.payload);

        let holdings = handle.call(|vault| vault.total_holdings()).await.unwrap();
        assert_eq!(holdings, 200);
        // released once, not per replay
        assert_eq!(bridge.stats().in_transit, 300);
    }

    #[tokio::test]
    async fn test_deposit_claims_bridged_funds() {
        let (bridge, handle, mut inbox, controller) = vault_fixture(Duration::ZERO);
        bridge.handle(42161, "vault:42161").release_funds(400);
        controller.send(10, move_to(1, 800, Direction::Deposit)).unwrap();

        let ack = next_ack(&mut inbox).await;
        assert!(ack.is_exact());
        assert_eq!(ack.achieved_amount, 800);

        let holdings = handle.call(|vault| vault.total_holdings()).await.unwrap();
        assert_eq!(holdings, 800);
        let stats = bridge.stats();
        assert_eq!(stats.transferred_in, 300);
        assert_eq!(stats.in_transit, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deposit_waits_for_late_funds() {
        let (bridge, _handle, mut inbox, controller) = vault_fixture(Duration::ZERO);
        controller.send(10, move_to(1, 700, Direction::Deposit)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(inbox.try_recv().is_err());

        bridge.handle(42161, "vault:42161").release_funds(200);
        let ack = next_ack(&mut inbox).await;
        assert!(ack.is_exact());
        assert_eq!(bridge.stats().in_transit, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deposit_short_after_transfer_timeout() {
        let (bridge, _handle, mut inbox, controller) = vault_fixture(Duration::ZERO);
        let started = Instant::now();
        controller.send(10, move_to(1, 800, Direction::Deposit)).unwrap();

        let ack = next_ack(&mut inbox).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(ack.achieved_amount, 500);
        assert_eq!(ack.delta(), -300);
        assert_eq!(bridge.stats().transferred_in, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vault_busy_during_movement() {
        let (_bridge, handle, mut inbox, controller) = vault_fixture(Duration::from_secs(5));
        controller.send(10, instruction(1, 400)).unwrap();
        tokio::task::yield_now().await;

        assert!(handle.call(|vault| vault.is_busy()).await.unwrap());
        // a newer round is refused while funds are moving
        controller.send(10, instruction(2, 100)).unwrap();

        let ack = inbox.recv().await.unwrap();
        match decode_payload(&ack.payload).unwrap() {
            Payload::Acknowledgement(ack) => assert_eq!(ack.round_id, 1),
            other => panic!("unexpected {:?}", other),
        }
        let holdings = handle.call(|vault| vault.total_holdings()).await.unwrap();
        assert_eq!(holdings, 400);
    }

    #[tokio::test]
    async fn test_vault_ignores_untrusted_sender() {
        let (bridge, handle, mut inbox, _controller) = vault_fixture(Duration::ZERO);
        bridge.handle(1, "mallory").send(10, instruction(1, 0)).unwrap();

        // the inbox is polled before jobs, so the forged instruction is seen first
        let applied = handle.call(|vault| vault.last_applied_round()).await.unwrap();
        assert_eq!(applied, 0);
        assert!(inbox.try_recv().is_err());
    }
}
