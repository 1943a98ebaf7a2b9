// src/net.rs
//
// UDP gossip for consensus snapshots. Each validator runs two tasks over
// one socket: a sender that pushes the current state snapshot to a few
// random peers every epoch, and a receiver that feeds inbound datagrams
// into the state machine. Gossip is fire-and-forget; lost datagrams are
// repaired by the next epoch's snapshots.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, warn};

use crate::consensus::{FaultPolicy, Validator};
use crate::message::ConsensusMsg;
use crate::registry::ValidatorRegistry;
use crate::types::{ValidatorId, MAX_PACKET_SIZE};

#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Gossip period. Every epoch each validator re-sends its snapshot.
    pub epoch: Duration,
    /// Number of peers contacted per epoch, sampled with replacement.
    pub branch_factor: usize,
    pub fault_policy: FaultPolicy,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            epoch: Duration::from_millis(100),
            branch_factor: 2,
            fault_policy: FaultPolicy::Halt,
        }
    }
}

/// Handle to one validator's running gossip tasks.
pub struct GossipNode {
    id: ValidatorId,
    shutdown: watch::Sender<bool>,
    recv_task: JoinHandle<()>,
    send_task: JoinHandle<()>,
}

impl GossipNode {
    /// Bind the validator's socket and start its send and receive loops.
    pub async fn spawn(
        validator: Arc<Mutex<Validator>>,
        registry: Arc<ValidatorRegistry>,
        config: GossipConfig,
    ) -> Result<Self> {
        let id = lock_validator(&validator).id();
        let addr = registry.addr(id);
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .with_context(|| format!("validator {id}: bind {addr}"))?,
        );
        let (shutdown, shutdown_rx) = watch::channel(false);

        let recv_task = tokio::spawn(recv_loop(
            id,
            socket.clone(),
            validator.clone(),
            registry.clone(),
            config.clone(),
            shutdown_rx.clone(),
        ));
        let send_task = tokio::spawn(send_loop(
            id,
            socket,
            validator,
            registry,
            config,
            shutdown_rx,
        ));

        debug!(validator = id, %addr, "gossip started");
        Ok(Self {
            id,
            shutdown,
            recv_task,
            send_task,
        })
    }

    pub fn id(&self) -> ValidatorId {
        self.id
    }

    /// Stop both loops and wait for them to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.recv_task.await;
        let _ = self.send_task.await;
        debug!(validator = self.id, "gossip stopped");
    }
}

fn lock_validator(v: &Mutex<Validator>) -> std::sync::MutexGuard<'_, Validator> {
    match v.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn recv_loop(
    id: ValidatorId,
    socket: Arc<UdpSocket>,
    validator: Arc<Mutex<Validator>>,
    registry: Arc<ValidatorRegistry>,
    config: GossipConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    // Bounded waits keep the loop responsive on a quiet socket; only the
    // shutdown channel ends it.
    let idle_limit = config.epoch * 10;

    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            r = timeout(idle_limit, socket.recv_from(&mut buf)) => r,
        };
        let (len, from) = match received {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                warn!(validator = id, error = %e, "recv failed");
                continue;
            }
            Err(_) => {
                debug!(validator = id, "no gossip for {idle_limit:?}");
                continue;
            }
        };

        let msg = match ConsensusMsg::decode(&buf[..len], registry.len()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(validator = id, %from, len, error = %e, "dropping undecodable datagram");
                continue;
            }
        };

        let outcome = lock_validator(&validator).handle_msg(&msg);
        if let Err(e) = outcome {
            match config.fault_policy {
                FaultPolicy::Halt => {
                    error!(validator = id, %from, error = %e, "protocol violation, halting");
                    break;
                }
                FaultPolicy::Continue => {
                    warn!(validator = id, %from, error = %e, "protocol violation, message dropped");
                }
            }
        }
    }
}

async fn send_loop(
    id: ValidatorId,
    socket: Arc<UdpSocket>,
    validator: Arc<Mutex<Validator>>,
    registry: Arc<ValidatorRegistry>,
    config: GossipConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = interval(config.epoch);
    let n = registry.len();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        // Encode outside the lock; only the snapshot itself needs it.
        let snapshot = lock_validator(&validator).snapshot_msg();
        let Some(msg) = snapshot else { continue };
        let bytes = msg.encode();

        for _ in 0..config.branch_factor {
            let Some(peer) = pick_peer(&mut rng, n, id) else { break };
            let addr = registry.addr(peer);
            if let Err(e) = socket.send_to(&bytes, addr).await {
                warn!(validator = id, peer, %addr, error = %e, "send failed");
            }
        }
    }
}

/// Uniformly random peer id, never our own. `None` when we are alone.
fn pick_peer(rng: &mut impl Rng, n: usize, own_id: ValidatorId) -> Option<ValidatorId> {
    if n < 2 {
        return None;
    }
    let r = rng.gen_range(0..n - 1) as ValidatorId;
    Some(if r >= own_id { r + 1 } else { r })
}
