// src/consensus/mod.rs
//
// Per-validator PairBFT state machine. Handlers are synchronous and short:
// the caller locks the validator, feeds it one decoded message, and reacts
// to the returned ProtocolError according to its fault policy. No handler
// ever touches the network.

use std::mem;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::consensus::agg_sig::AggSig;
use crate::crypto::bls::{BlsError, BlsSigner, PreparedDigest};
use crate::crypto::{block_hash, DOM_COMMIT, DOM_COMMIT_PREPARE, DOM_PREPARE};
use crate::message::{ConsensusMsg, MsgPayload, MsgVerifyError};
use crate::registry::ValidatorRegistry;
use crate::types::{Hash, Phase, PhaseMode, ValidatorId};

pub mod agg_sig;

/// What a node does with a handler error.
///
/// `Halt` stops the validator on any protocol violation. `Continue` drops
/// the offending message and stays live, which is what a deployment facing
/// Byzantine peers wants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    #[default]
    Halt,
    Continue,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer is more than one block ahead (or sent a Commit we cannot
    /// adopt without its Prepare certificate). Recovering needs an explicit
    /// state-sync request, which this protocol does not implement.
    #[error("peer at height {remote} outruns local height {local}: state sync required")]
    SyncRequired { local: u64, remote: u64 },
    /// Two different hashes for the same height: fork or equivocating
    /// proposer.
    #[error("hash mismatch at height {height} (possible equivocation)")]
    Equivocation {
        height: u64,
        local_hash: Hash,
        msg_hash: Hash,
    },
    #[error("message verification failed: {0}")]
    Verification(#[from] MsgVerifyError),
    #[error(transparent)]
    Signature(#[from] BlsError),
}

pub struct Validator {
    id: ValidatorId,
    signer: BlsSigner,
    registry: Arc<ValidatorRegistry>,
    mode: PhaseMode,
    block_data: Vec<u8>,

    phase: Phase,
    height: u64,
    hash: Hash,
    prev_hash: Hash,
    agg_sig: AggSig,
    prev_agg_sig: AggSig,

    // Phase digests for the current height, computed once on every hash
    // change and reused for each incoming partial signature.
    p_digest: Option<PreparedDigest>,
    c_digest: Option<PreparedDigest>,
    prev_digest: Option<PreparedDigest>,

    finalized: Vec<(u64, Hash)>,
}

impl Validator {
    pub fn new(
        id: ValidatorId,
        signer: BlsSigner,
        registry: Arc<ValidatorRegistry>,
        mode: PhaseMode,
        block_data: Vec<u8>,
    ) -> Self {
        let n = registry.len();
        Self {
            id,
            signer,
            registry,
            mode,
            block_data,
            phase: Phase::Idle,
            height: 0,
            hash: [0u8; 32],
            prev_hash: [0u8; 32],
            agg_sig: AggSig::new(n),
            prev_agg_sig: AggSig::new(n),
            p_digest: None,
            c_digest: None,
            prev_digest: None,
            finalized: Vec::new(),
        }
    }

    pub fn id(&self) -> ValidatorId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Blocks this validator has finalized, in order.
    pub fn finalized(&self) -> &[(u64, Hash)] {
        &self.finalized
    }

    fn p_domain(&self) -> &'static [u8] {
        if self.mode.pipelined() {
            DOM_COMMIT_PREPARE
        } else {
            DOM_PREPARE
        }
    }

    /// Adopt a new block hash and refresh the cached phase digests. The
    /// digest of the outgoing block becomes `prev_digest` so that carried
    /// certificates for it stay cheap to check.
    fn update_hash(&mut self, hash: Hash) {
        self.prev_hash = self.hash;
        self.hash = hash;
        if self.mode.pipelined() {
            self.prev_digest = self.p_digest;
            self.p_digest = Some(PreparedDigest::new(&hash, DOM_COMMIT_PREPARE));
            self.c_digest = None;
        } else {
            self.p_digest = Some(PreparedDigest::new(&hash, DOM_PREPARE));
            self.prev_digest = self.c_digest;
            self.c_digest = Some(PreparedDigest::new(&hash, DOM_COMMIT));
        }
    }

    /// Start a fresh aggregate for the current phase, seeded with our own
    /// signature over the phase digest.
    fn seed_agg_sig(&mut self) -> Result<(), BlsError> {
        let digest = if self.phase == Phase::Committed {
            self.c_digest
                .unwrap_or_else(|| PreparedDigest::new(&self.hash, DOM_COMMIT))
        } else {
            self.p_digest
                .unwrap_or_else(|| PreparedDigest::new(&self.hash, self.p_domain()))
        };
        let mut agg = AggSig::new(self.registry.len());
        agg.add_one(self.id, &self.signer.sign_digest(&digest))?;
        self.agg_sig = agg;
        Ok(())
    }

    // --- transitions ---

    /// Propose the block at `height` (we are its designated proposer).
    pub fn propose_block(&mut self, height: u64) -> Result<(), BlsError> {
        self.phase = Phase::Prepared;
        let hash = if height == 1 {
            block_hash(&self.block_data, None)
        } else {
            block_hash(&self.block_data, Some(&self.hash))
        };
        self.height = height;
        self.update_hash(hash);
        self.prev_agg_sig = mem::replace(&mut self.agg_sig, AggSig::new(self.registry.len()));
        self.seed_agg_sig()?;
        info!(height = self.height, hash = %hex::encode(self.hash), "propose");
        Ok(())
    }

    fn prepare_block(
        &mut self,
        height: u64,
        hash: Hash,
        agg: &AggSig,
        prev: AggSig,
    ) -> Result<(), ProtocolError> {
        self.phase = Phase::Prepared;
        self.height = height;
        self.update_hash(hash);
        self.prev_agg_sig = prev;
        self.seed_agg_sig()?;
        self.agg_sig.aggregate(agg)?;
        debug!(height = self.height, counters = ?self.agg_sig.counters(), "prepared");
        Ok(())
    }

    fn commit_block(
        &mut self,
        height: u64,
        hash: Option<Hash>,
        agg: Option<&AggSig>,
        prev: AggSig,
    ) -> Result<(), ProtocolError> {
        if self.phase == Phase::Idle || height != self.height {
            self.height = height;
            if let Some(h) = hash {
                self.update_hash(h);
            }
        }
        self.phase = Phase::Committed;
        self.prev_agg_sig = prev;
        self.seed_agg_sig()?;
        if let Some(a) = agg {
            self.agg_sig.aggregate(a)?;
        }
        debug!(height = self.height, counters = ?self.agg_sig.counters(), "committed");
        Ok(())
    }

    fn finalize_block(&mut self) {
        self.phase = Phase::Final;
        self.finalized.push((self.height, self.hash));
        info!(height = self.height, counters = ?self.agg_sig.counters(), "finalized");
        // Todo: append the block to a local chain; slash the proposer if
        // that fails.
    }

    /// Pipelined variant of `propose_block`.
    pub fn commit_propose_block(&mut self, height: u64) -> Result<(), BlsError> {
        self.phase = Phase::CommitPrepared;
        let hash = if height == 1 {
            block_hash(&self.block_data, None)
        } else {
            block_hash(&self.block_data, Some(&self.hash))
        };
        self.height = height;
        self.update_hash(hash);
        self.prev_agg_sig = mem::replace(&mut self.agg_sig, AggSig::new(self.registry.len()));
        self.seed_agg_sig()?;
        info!(height = self.height, hash = %hex::encode(self.hash), "commit-propose");
        Ok(())
    }

    fn commit_prepare_block(
        &mut self,
        height: u64,
        hash: Hash,
        agg: &AggSig,
        prev: AggSig,
    ) -> Result<(), ProtocolError> {
        self.phase = Phase::CommitPrepared;
        self.height = height;
        self.update_hash(hash);
        self.prev_agg_sig = prev;
        self.seed_agg_sig()?;
        self.agg_sig.aggregate(agg)?;
        debug!(height = self.height, counters = ?self.agg_sig.counters(), "commit-prepared");
        Ok(())
    }

    fn finalize_prev_block(&mut self) {
        self.phase = Phase::FinalPrepared;
        if self.height <= 1 {
            // block 1 has no predecessor to finalize
            return;
        }
        self.finalized.push((self.height - 1, self.prev_hash));
        info!(height = self.height - 1, counters = ?self.agg_sig.counters(), "finalized");
        // Todo: append the block to a local chain; slash the proposer if
        // that fails.
    }

    // --- message handling ---

    pub fn handle_msg(&mut self, msg: &ConsensusMsg) -> Result<(), ProtocolError> {
        match msg {
            ConsensusMsg::Prepare(_) => self.handle_prepare(msg),
            ConsensusMsg::Commit(_) => self.handle_commit(msg),
            ConsensusMsg::CommitPrepare(_) => self.handle_commit_prepare(msg),
        }
    }

    fn check_hash(&self, body: &MsgPayload) -> Result<(), ProtocolError> {
        if self.phase != Phase::Idle && self.height == body.height && self.hash != body.hash {
            // Todo: slash every validator counted in the message
            return Err(ProtocolError::Equivocation {
                height: self.height,
                local_hash: self.hash,
                msg_hash: body.hash,
            });
        }
        Ok(())
    }

    fn verify_msg(
        &self,
        msg: &ConsensusMsg,
        p_digest: &PreparedDigest,
        c_digest: Option<&PreparedDigest>,
    ) -> Result<(), ProtocolError> {
        if let Err(e) = msg.verify(&self.registry, p_digest, c_digest) {
            self.log_verification_failure(msg, p_digest, c_digest);
            return Err(e.into());
        }
        Ok(())
    }

    fn handle_prepare(&mut self, msg: &ConsensusMsg) -> Result<(), ProtocolError> {
        let body = msg.payload();

        let obsolete = self.height > body.height
            || (self.height == body.height
                && matches!(self.phase, Phase::Final | Phase::Committed));
        if obsolete {
            debug!(height = body.height, "dropping obsolete prepare");
            return Ok(());
        }

        if body.height > self.height + 1 {
            // Todo: request state sync from the sender
            return Err(ProtocolError::SyncRequired {
                local: self.height,
                remote: body.height,
            });
        }

        self.check_hash(body)?;

        // Equal-height messages verify against our cached digests; a
        // height+1 message carries our current block's commit certificate,
        // so its CSig checks against our current commit digest.
        let (p_digest, c_digest) = if self.phase == Phase::Idle {
            (PreparedDigest::new(&body.hash, DOM_PREPARE), None)
        } else if body.height == self.height {
            (
                self.p_digest
                    .unwrap_or_else(|| PreparedDigest::new(&body.hash, DOM_PREPARE)),
                self.prev_digest,
            )
        } else {
            (PreparedDigest::new(&body.hash, DOM_PREPARE), self.c_digest)
        };
        self.verify_msg(msg, &p_digest, c_digest.as_ref())?;

        // A newer prepare proves the previous block committed: finalize it
        // from the carried certificate before moving on.
        if body.height > 1 && body.height > self.height && self.phase != Phase::Final {
            self.agg_sig = body.commit_sig.clone();
            self.finalize_block();
        }

        if self.phase == Phase::Idle || body.height > self.height {
            self.prepare_block(body.height, body.hash, &body.prepare_sig, body.commit_sig.clone())?;
        } else {
            self.agg_sig.aggregate(&body.prepare_sig)?;
        }

        if self.agg_sig.reach_quorum() {
            let prev = mem::replace(&mut self.agg_sig, AggSig::new(self.registry.len()));
            self.commit_block(self.height, None, None, prev)?;
        }
        Ok(())
    }

    fn handle_commit(&mut self, msg: &ConsensusMsg) -> Result<(), ProtocolError> {
        let body = msg.payload();

        let obsolete = self.height > body.height
            || (self.height == body.height && self.phase == Phase::Final);
        if obsolete {
            debug!(height = body.height, "dropping obsolete commit");
            return Ok(());
        }

        if body.height > self.height + 1 {
            // Todo: request state sync from the sender
            return Err(ProtocolError::SyncRequired {
                local: self.height,
                remote: body.height,
            });
        }

        // Adopting a commit for the next block needs the prepare
        // certificate for the one we are still on.
        if body.height > 1 && body.height > self.height && self.phase != Phase::Final {
            // Todo: request the missing aggregate from the sender
            return Err(ProtocolError::SyncRequired {
                local: self.height,
                remote: body.height,
            });
        }

        self.check_hash(body)?;

        let (p_digest, c_digest) = if self.phase != Phase::Idle && body.height == self.height {
            (
                self.p_digest
                    .unwrap_or_else(|| PreparedDigest::new(&body.hash, DOM_PREPARE)),
                self.c_digest,
            )
        } else {
            (
                PreparedDigest::new(&body.hash, DOM_PREPARE),
                Some(PreparedDigest::new(&body.hash, DOM_COMMIT)),
            )
        };
        self.verify_msg(msg, &p_digest, c_digest.as_ref())?;

        if self.phase == Phase::Idle || body.height > self.height {
            self.commit_block(
                body.height,
                Some(body.hash),
                Some(&body.commit_sig),
                body.prepare_sig.clone(),
            )?;
        } else if self.phase == Phase::Prepared {
            self.commit_block(
                self.height,
                None,
                Some(&body.commit_sig),
                body.prepare_sig.clone(),
            )?;
        } else {
            // already Committed: just fold in the new contributions
            self.agg_sig.aggregate(&body.commit_sig)?;
        }

        if self.agg_sig.reach_quorum() {
            self.finalize_block();
            if self.registry.proposer_of(self.height + 1) == self.id {
                self.propose_block(self.height + 1)?;
            }
        }
        Ok(())
    }

    fn handle_commit_prepare(&mut self, msg: &ConsensusMsg) -> Result<(), ProtocolError> {
        let body = msg.payload();

        let obsolete = self.height > body.height
            || (self.height == body.height && self.phase == Phase::FinalPrepared);
        if obsolete {
            debug!(height = body.height, "dropping obsolete commit-prepare");
            return Ok(());
        }

        if body.height > self.height + 1 {
            // Todo: request state sync from the sender
            return Err(ProtocolError::SyncRequired {
                local: self.height,
                remote: body.height,
            });
        }

        self.check_hash(body)?;

        // In the pipelined schedule both embedded sets certify
        // commit-prepare digests: PSig for the message's block, CSig for
        // the one before it (which is our current block when the message
        // is one ahead).
        let (p_digest, c_digest) = if self.phase == Phase::Idle {
            (PreparedDigest::new(&body.hash, DOM_COMMIT_PREPARE), None)
        } else if body.height == self.height {
            (
                self.p_digest
                    .unwrap_or_else(|| PreparedDigest::new(&body.hash, DOM_COMMIT_PREPARE)),
                self.prev_digest,
            )
        } else {
            (
                PreparedDigest::new(&body.hash, DOM_COMMIT_PREPARE),
                self.p_digest,
            )
        };
        self.verify_msg(msg, &p_digest, c_digest.as_ref())?;

        if body.height > self.height && self.phase != Phase::FinalPrepared {
            self.agg_sig = body.commit_sig.clone();
            self.finalize_prev_block();
        }

        if self.phase == Phase::Idle || body.height > self.height {
            self.commit_prepare_block(
                body.height,
                body.hash,
                &body.prepare_sig,
                body.commit_sig.clone(),
            )?;
        } else {
            self.agg_sig.aggregate(&body.prepare_sig)?;
        }

        if self.agg_sig.reach_quorum() {
            self.finalize_prev_block();
            if self.registry.proposer_of(self.height + 1) == self.id {
                self.commit_propose_block(self.height + 1)?;
            }
        }
        Ok(())
    }

    /// Snapshot of the current state as a gossip message, or `None` while
    /// idle. The embedded aggregates are defensive copies; the caller can
    /// serialize and send without holding the state lock.
    pub fn snapshot_msg(&self) -> Option<ConsensusMsg> {
        let payload = |commit_sig: &AggSig, prepare_sig: &AggSig| MsgPayload {
            height: self.height,
            hash: self.hash,
            commit_sig: commit_sig.clone(),
            prepare_sig: prepare_sig.clone(),
        };
        match self.phase {
            Phase::Idle => None,
            Phase::Prepared => Some(ConsensusMsg::Prepare(payload(
                &self.prev_agg_sig,
                &self.agg_sig,
            ))),
            Phase::Committed | Phase::Final => Some(ConsensusMsg::Commit(payload(
                &self.agg_sig,
                &self.prev_agg_sig,
            ))),
            Phase::CommitPrepared | Phase::FinalPrepared => Some(ConsensusMsg::CommitPrepare(
                payload(&self.prev_agg_sig, &self.agg_sig),
            )),
        }
    }

    /// Full-context dump for a rejected message; emitted before any fatal
    /// path so operators can reconstruct what was on both sides.
    fn log_verification_failure(
        &self,
        msg: &ConsensusMsg,
        p_digest: &PreparedDigest,
        c_digest: Option<&PreparedDigest>,
    ) {
        let body = msg.payload();
        error!(
            kind = msg.kind_name(),
            msg_height = body.height,
            msg_hash = %hex::encode(body.hash),
            local_height = self.height,
            local_phase = ?self.phase,
            local_hash = %hex::encode(self.hash),
            p_digest = %hex::encode(p_digest.as_bytes()),
            c_digest = %c_digest.map(|d| hex::encode(d.as_bytes())).unwrap_or_default(),
            psig_counters = ?body.prepare_sig.counters(),
            csig_counters = ?body.commit_sig.counters(),
            local_counters = ?self.agg_sig.counters(),
            "message verification failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ValidatorEntry;
    use crate::types::PhaseMode;

    const BLOCK_DATA: &[u8] = b"consensus unit test block payload";

    fn build(n: usize, mode: PhaseMode) -> Vec<Validator> {
        let signers: Vec<BlsSigner> = (0..n)
            .map(|i| BlsSigner::from_seed(&[i as u8 + 1; 32]).unwrap())
            .collect();
        let entries = signers
            .iter()
            .enumerate()
            .map(|(i, s)| ValidatorEntry {
                id: i as ValidatorId,
                addr: format!("127.0.0.1:{}", 6100 + i).parse().unwrap(),
                pub_key: s.public_key_bytes(),
                pub_key_sig: s.possession_sig(),
            })
            .collect();
        let registry = Arc::new(ValidatorRegistry::new(entries).unwrap());
        signers
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                Validator::new(
                    i as ValidatorId,
                    s,
                    registry.clone(),
                    mode,
                    BLOCK_DATA.to_vec(),
                )
            })
            .collect()
    }

    /// Deliver `from`'s snapshot to `to`.
    fn deliver(vals: &mut [Validator], from: usize, to: usize) {
        if let Some(msg) = vals[from].snapshot_msg() {
            vals[to].handle_msg(&msg).unwrap();
        }
    }

    #[test]
    fn full_round_all_to_all() {
        let n = 4;
        let mut vals = build(n, PhaseMode::Standard);
        vals[1].propose_block(1).unwrap();

        // three all-to-all exchanges cover prepare, commit, and finalize
        for _ in 0..3 {
            for from in 0..n {
                for to in 0..n {
                    if from != to {
                        deliver(&mut vals, from, to);
                    }
                }
            }
        }

        let expected = block_hash(BLOCK_DATA, None);
        for v in &vals {
            assert!(
                v.finalized().contains(&(1, expected)),
                "validator {} never finalized block 1 (phase {:?})",
                v.id(),
                v.phase()
            );
        }
    }

    #[test]
    fn obsolete_prepare_is_dropped_silently() {
        let mut vals = build(4, PhaseMode::Standard);
        vals[1].propose_block(1).unwrap();
        let stale = vals[1].snapshot_msg().unwrap();

        // drive validator 1 all the way to final at height 1
        for from in [0usize, 2, 3] {
            deliver(&mut vals, 1, from);
            deliver(&mut vals, from, 1);
        }
        assert_eq!(vals[1].phase(), Phase::Final);

        // replaying the old prepare is a no-op, not an error
        let before = vals[1].snapshot_msg();
        vals[1].handle_msg(&stale).unwrap();
        assert_eq!(vals[1].snapshot_msg(), before);
    }

    #[test]
    fn far_future_message_requires_sync() {
        let mut vals = build(4, PhaseMode::Standard);
        vals[1].propose_block(1).unwrap();
        let mut msg = vals[1].snapshot_msg().unwrap();
        if let ConsensusMsg::Prepare(body) = &mut msg {
            body.height = 5;
        }
        let err = vals[0].handle_msg(&msg).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::SyncRequired { local: 0, remote: 5 }
        ));
    }

    #[test]
    fn conflicting_hash_is_equivocation() {
        let mut vals = build(4, PhaseMode::Standard);
        vals[1].propose_block(1).unwrap();
        deliver(&mut vals, 1, 0);
        assert_eq!(vals[0].phase(), Phase::Prepared);

        let mut msg = vals[1].snapshot_msg().unwrap();
        if let ConsensusMsg::Prepare(body) = &mut msg {
            body.hash = [0xee; 32];
        }
        let err = vals[0].handle_msg(&msg).unwrap_err();
        assert!(matches!(err, ProtocolError::Equivocation { height: 1, .. }));
    }

    #[test]
    fn prepare_without_proposer_is_rejected() {
        let mut vals = build(4, PhaseMode::Standard);
        // validator 2 fabricates a prepare for height 1 without proposer 1
        vals[2].propose_block(1).unwrap();
        let msg = vals[2].snapshot_msg().unwrap();
        let err = vals[0].handle_msg(&msg).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Verification(MsgVerifyError::MissingProposer(1))
        ));
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let mut vals = build(4, PhaseMode::Standard);
        vals[1].propose_block(1).unwrap();
        let mut msg = vals[1].snapshot_msg().unwrap();
        if let ConsensusMsg::Prepare(body) = &mut msg {
            // claim validator 0 signed without its signature
            let mut forged = AggSig::new(4);
            forged
                .add_one(1, &vals[1].signer.sign_digest(&vals[1].p_digest.unwrap()))
                .unwrap();
            forged
                .add_one(0, &vals[1].signer.sign_digest(&vals[1].p_digest.unwrap()))
                .unwrap();
            body.prepare_sig = forged;
        }
        let err = vals[0].handle_msg(&msg).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Verification(MsgVerifyError::PrepareSig)
        ));
    }

    #[test]
    fn pipelined_round_finalizes_previous_block() {
        let n = 4;
        let mut vals = build(n, PhaseMode::CommitPrepare);
        vals[1].commit_propose_block(1).unwrap();

        for _round in 0..6 {
            for from in 0..n {
                for to in 0..n {
                    if from != to {
                        deliver(&mut vals, from, to);
                    }
                }
            }
        }

        let b1 = block_hash(BLOCK_DATA, None);
        for v in &vals {
            assert!(
                v.finalized().contains(&(1, b1)),
                "validator {} never finalized block 1 in pipelined mode",
                v.id()
            );
        }
    }
}
