// src/message.rs
//
// Wire messages. One fixed-layout payload shared by all three kinds:
//
//   [tag u8][block height u64 LE][block hash 32][CSig][PSig]
//
// where CSig/PSig are AggSig blocks of 4*N + 96 bytes each. The phase a
// given signature set certifies depends on the message kind; see
// consensus::Validator for the digest resolution rules.

use thiserror::Error;

use crate::codec::{put_u64, rd_fixed, rd_u64, rd_u8, CodecError};
use crate::consensus::agg_sig::AggSig;
use crate::crypto::bls::PreparedDigest;
use crate::registry::ValidatorRegistry;
use crate::types::{Hash, ValidatorId};

pub const TAG_PREPARE: u8 = 1;
pub const TAG_COMMIT: u8 = 2;
pub const TAG_COMMIT_PREPARE: u8 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgPayload {
    pub height: u64,
    pub hash: Hash,
    /// Commit-phase certificate. For Prepare/CommitPrepare messages this
    /// carries the *previous* block's quorum so laggards can catch up one
    /// block without an extra round.
    pub commit_sig: AggSig,
    /// Prepare-phase aggregate for the message's own block.
    pub prepare_sig: AggSig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusMsg {
    Prepare(MsgPayload),
    Commit(MsgPayload),
    CommitPrepare(MsgPayload),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MsgVerifyError {
    #[error("prepare signature lacks the designated proposer (validator {0})")]
    MissingProposer(ValidatorId),
    #[error("prepare aggregate signature does not verify")]
    PrepareSig,
    #[error("commit aggregate signature does not verify")]
    CommitSig,
    #[error("commit message carries a prepare set below quorum")]
    PrepareQuorum,
    #[error("carried commit certificate is below quorum")]
    CommitQuorum,
}

impl ConsensusMsg {
    pub fn payload(&self) -> &MsgPayload {
        match self {
            ConsensusMsg::Prepare(p) | ConsensusMsg::Commit(p) | ConsensusMsg::CommitPrepare(p) => {
                p
            }
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ConsensusMsg::Prepare(_) => "Prepare",
            ConsensusMsg::Commit(_) => "Commit",
            ConsensusMsg::CommitPrepare(_) => "CommitPrepare",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            ConsensusMsg::Prepare(_) => TAG_PREPARE,
            ConsensusMsg::Commit(_) => TAG_COMMIT,
            ConsensusMsg::CommitPrepare(_) => TAG_COMMIT_PREPARE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.payload();
        let n = body.commit_sig.counters().len();
        let mut b = Vec::with_capacity(1 + 8 + 32 + 2 * AggSig::len_bytes(n));
        b.push(self.tag());
        put_u64(&mut b, body.height);
        b.extend_from_slice(&body.hash);
        body.commit_sig.encode(&mut b);
        body.prepare_sig.encode(&mut b);
        b
    }

    pub fn decode(b: &[u8], num_validators: usize) -> Result<Self, CodecError> {
        let mut i = 0usize;
        let tag = rd_u8(&mut i, b)?;
        let height = rd_u64(&mut i, b)?;
        let hash = rd_fixed::<32>(&mut i, b)?;
        let commit_sig = AggSig::decode(&mut i, b, num_validators)?;
        let prepare_sig = AggSig::decode(&mut i, b, num_validators)?;
        if i != b.len() {
            return Err(CodecError::TrailingBytes(b.len() - i));
        }
        let payload = MsgPayload {
            height,
            hash,
            commit_sig,
            prepare_sig,
        };
        match tag {
            TAG_PREPARE => Ok(ConsensusMsg::Prepare(payload)),
            TAG_COMMIT => Ok(ConsensusMsg::Commit(payload)),
            TAG_COMMIT_PREPARE => Ok(ConsensusMsg::CommitPrepare(payload)),
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    /// Validate the embedded signature sets.
    ///
    /// - PSig must include the designated proposer for the message height
    ///   and verify against the phase digest `p_digest`.
    /// - CSig is checked against `c_digest` for Commit messages and for any
    ///   message past block 1 (block 1 has no predecessor certificate).
    /// - A Commit message must carry a prepare quorum; a Prepare or
    ///   CommitPrepare past block 1 must carry a commit quorum.
    pub fn verify(
        &self,
        registry: &ValidatorRegistry,
        p_digest: &PreparedDigest,
        c_digest: Option<&PreparedDigest>,
    ) -> Result<(), MsgVerifyError> {
        let body = self.payload();
        let pub_keys = registry.public_keys();

        let proposer = registry.proposer_of(body.height);
        if !body.prepare_sig.contains(proposer) {
            // Todo: slash every validator counted in this message
            return Err(MsgVerifyError::MissingProposer(proposer));
        }
        if !body.prepare_sig.verify(p_digest, pub_keys) {
            return Err(MsgVerifyError::PrepareSig);
        }

        let check_commit = matches!(self, ConsensusMsg::Commit(_)) || body.height > 1;
        if check_commit {
            match c_digest {
                Some(c) if body.commit_sig.verify(c, pub_keys) => {}
                _ => return Err(MsgVerifyError::CommitSig),
            }
        }

        match self {
            ConsensusMsg::Commit(_) => {
                if !body.prepare_sig.reach_quorum() {
                    return Err(MsgVerifyError::PrepareQuorum);
                }
            }
            _ if body.height > 1 => {
                if !body.commit_sig.reach_quorum() {
                    return Err(MsgVerifyError::CommitQuorum);
                }
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::bls::BlsSigner;
    use crate::crypto::{DOM_COMMIT, DOM_PREPARE};

    const N: usize = 4;

    fn sample_payload() -> MsgPayload {
        let signers: Vec<BlsSigner> = (0u8..N as u8)
            .map(|i| BlsSigner::from_seed(&[i + 10; 32]).unwrap())
            .collect();
        let hash = [0x5a; 32];
        let p_digest = PreparedDigest::new(&hash, DOM_PREPARE);
        let c_digest = PreparedDigest::new(&hash, DOM_COMMIT);

        let mut prepare_sig = AggSig::new(N);
        let mut commit_sig = AggSig::new(N);
        for (i, s) in signers.iter().enumerate() {
            prepare_sig.add_one(i as u32, &s.sign_digest(&p_digest)).unwrap();
        }
        for (i, s) in signers.iter().enumerate().take(3) {
            commit_sig.add_one(i as u32, &s.sign_digest(&c_digest)).unwrap();
        }

        MsgPayload {
            height: 7,
            hash,
            commit_sig,
            prepare_sig,
        }
    }

    #[test]
    fn roundtrip_all_kinds() {
        let payload = sample_payload();
        for msg in [
            ConsensusMsg::Prepare(payload.clone()),
            ConsensusMsg::Commit(payload.clone()),
            ConsensusMsg::CommitPrepare(payload.clone()),
        ] {
            let bytes = msg.encode();
            let back = ConsensusMsg::decode(&bytes, N).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let mut bytes = ConsensusMsg::Prepare(sample_payload()).encode();
        bytes[0] = 9;
        assert_eq!(
            ConsensusMsg::decode(&bytes, N),
            Err(CodecError::UnknownTag(9))
        );
    }

    #[test]
    fn decode_rejects_truncated() {
        let mut bytes = ConsensusMsg::Commit(sample_payload()).encode();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            ConsensusMsg::decode(&bytes, N),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = ConsensusMsg::Commit(sample_payload()).encode();
        bytes.push(0);
        assert_eq!(
            ConsensusMsg::decode(&bytes, N),
            Err(CodecError::TrailingBytes(1))
        );
    }
}
