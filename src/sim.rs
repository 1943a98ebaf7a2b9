// src/sim.rs
//
// Loopback simulation harness. Keys are derived deterministically so runs
// are reproducible; sockets bind consecutive localhost ports from
// `base_port`. Used by the localnet binary and the integration tests.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::info;

use crate::consensus::{FaultPolicy, Validator};
use crate::crypto::bls::BlsSigner;
use crate::crypto::hash_bytes_sha256;
use crate::net::{GossipConfig, GossipNode};
use crate::registry::{ValidatorEntry, ValidatorRegistry};
use crate::types::{PhaseMode, ValidatorId};

/// Mock payload carried by every simulated block.
pub const BLOCK_DATA: &[u8] = b"pairbft mock block payload";

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub num_validators: usize,
    /// First UDP port; validator i binds 127.0.0.1:(base_port + i).
    pub base_port: u16,
    pub gossip: GossipConfig,
    /// How many gossip epochs to run before shutting down.
    pub run_epochs: u32,
    pub mode: PhaseMode,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_validators: 4,
            base_port: 26657,
            gossip: GossipConfig::default(),
            run_epochs: 20,
            mode: PhaseMode::Standard,
        }
    }
}

fn sim_signer(i: usize) -> Result<BlsSigner> {
    let seed = hash_bytes_sha256(format!("pairbft sim validator {i}").as_bytes());
    BlsSigner::from_seed(&seed).with_context(|| format!("key derivation for validator {i}"))
}

/// Build the deterministic validator set for a simulation.
pub fn build_validators(
    cfg: &SimConfig,
) -> Result<(Vec<Arc<Mutex<Validator>>>, Arc<ValidatorRegistry>)> {
    let signers: Vec<BlsSigner> = (0..cfg.num_validators)
        .map(sim_signer)
        .collect::<Result<_>>()?;

    let entries = signers
        .iter()
        .enumerate()
        .map(|(i, s)| {
            Ok(ValidatorEntry {
                id: i as ValidatorId,
                addr: format!("127.0.0.1:{}", cfg.base_port + i as u16)
                    .parse()
                    .context("simulation listen address")?,
                pub_key: s.public_key_bytes(),
                pub_key_sig: s.possession_sig(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let registry = Arc::new(ValidatorRegistry::new(entries).context("building validator set")?);

    let validators = signers
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            Arc::new(Mutex::new(Validator::new(
                i as ValidatorId,
                s,
                registry.clone(),
                cfg.mode,
                BLOCK_DATA.to_vec(),
            )))
        })
        .collect();
    Ok((validators, registry))
}

/// Run a full local round: spawn every validator's gossip node, have the
/// designated proposer open block 1, gossip for `run_epochs` epochs, then
/// shut everything down and hand the validators back for inspection.
pub async fn run(cfg: SimConfig) -> Result<Vec<Arc<Mutex<Validator>>>> {
    let (validators, registry) = build_validators(&cfg)?;

    let mut nodes = Vec::with_capacity(validators.len());
    for v in &validators {
        nodes.push(GossipNode::spawn(v.clone(), registry.clone(), cfg.gossip.clone()).await?);
    }

    let proposer = registry.proposer_of(1);
    {
        let mut v = match validators[proposer as usize].lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cfg.mode {
            PhaseMode::Standard => v.propose_block(1)?,
            PhaseMode::CommitPrepare => v.commit_propose_block(1)?,
        }
    }
    info!(
        proposer,
        validators = cfg.num_validators,
        epoch = ?cfg.gossip.epoch,
        mode = ?cfg.mode,
        "simulation started"
    );

    tokio::time::sleep(cfg.gossip.epoch * cfg.run_epochs).await;

    for node in nodes {
        node.shutdown().await;
    }
    info!("simulation finished");
    Ok(validators)
}
