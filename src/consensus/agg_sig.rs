// src/consensus/agg_sig.rs
//
// Per-(block, phase) aggregate signature: one counter per validator plus the
// combined G2 signature of everyone counted. Counters double as presence
// flags and as key weights; see crypto::bls for why the weighting matters.

use bitvec::vec::BitVec;

use crate::codec::{put_u32, rd_fixed, rd_u32, CodecError};
use crate::crypto::bls::{
    self, BlsError, BlsSignatureBytes, PreparedDigest, PK_LEN, SIG_IDENTITY, SIG_LEN,
};
use crate::types::ValidatorId;

const COUNTER_LEN: usize = 4;

#[derive(Clone, PartialEq, Eq)]
pub struct AggSig {
    counters: Vec<u32>,
    sig: [u8; SIG_LEN],
}

impl std::fmt::Debug for AggSig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggSig")
            .field("counters", &self.counters)
            .field("sig", &hex::encode(&self.sig[..8]))
            .finish()
    }
}

impl AggSig {
    /// Empty set: all counters zero, signature = group identity.
    pub fn new(num_validators: usize) -> Self {
        Self {
            counters: vec![0; num_validators],
            sig: SIG_IDENTITY,
        }
    }

    /// Serialized length for a validator set of size `n`.
    pub const fn len_bytes(n: usize) -> usize {
        COUNTER_LEN * n + SIG_LEN
    }

    pub fn counters(&self) -> &[u32] {
        &self.counters
    }

    pub fn sig_bytes(&self) -> BlsSignatureBytes {
        BlsSignatureBytes(self.sig)
    }

    pub fn contains(&self, id: ValidatorId) -> bool {
        self.counters[id as usize] > 0
    }

    /// Presence bitmap, index-aligned with the validator registry.
    pub fn presence(&self) -> BitVec {
        self.counters.iter().map(|&c| c > 0).collect()
    }

    pub fn contributors(&self) -> usize {
        self.presence().count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.iter().all(|&c| c == 0)
    }

    /// Fold in one validator's own signature. Idempotent: a validator that
    /// is already counted is left untouched.
    pub fn add_one(&mut self, id: ValidatorId, sig: &BlsSignatureBytes) -> Result<(), BlsError> {
        if self.counters[id as usize] != 0 {
            return Ok(());
        }
        if self.is_empty() {
            self.sig = sig.0;
        } else {
            self.sig = bls::combine(&self.sig, &sig.0)?;
        }
        self.counters[id as usize] = 1;
        Ok(())
    }

    /// Merge another aggregate over the same digest into this one.
    ///
    /// Three-way classification against the other side's presence set:
    /// a superset self keeps everything as-is, a subset self is replaced
    /// wholesale, and only incomparable sets pay for a group operation.
    ///
    /// Precondition: both aggregates were verified against the same phase
    /// digest before merging. The classification never re-verifies.
    pub fn aggregate(&mut self, other: &AggSig) -> Result<(), BlsError> {
        debug_assert_eq!(self.counters.len(), other.counters.len());
        let ours = self.presence();
        let theirs = other.presence();

        let is_superset = theirs.iter_ones().all(|i| ours[i]);
        if is_superset {
            return Ok(());
        }

        let is_subset = ours.iter_ones().all(|i| theirs[i]);
        if is_subset {
            self.sig = other.sig;
            self.counters.copy_from_slice(&other.counters);
            return Ok(());
        }

        self.sig = bls::combine(&self.sig, &other.sig)?;
        for (c, o) in self.counters.iter_mut().zip(&other.counters) {
            *c += o;
        }
        Ok(())
    }

    /// Strict two-thirds quorum: more than floor(2N/3) distinct contributors.
    pub fn reach_quorum(&self) -> bool {
        let n = self.counters.len();
        self.contributors() > (2 * n) / 3
    }

    /// Check the combined signature against the counter-weighted aggregate
    /// public key for `digest`.
    pub fn verify(&self, digest: &PreparedDigest, pub_keys: &[[u8; PK_LEN]]) -> bool {
        bls::verify_weighted_aggregate(&self.sig_bytes(), digest, pub_keys, &self.counters)
    }

    // --- wire format: [u32 LE counter; N] then the 96 signature bytes ---

    pub fn encode(&self, dst: &mut Vec<u8>) {
        for &c in &self.counters {
            put_u32(dst, c);
        }
        dst.extend_from_slice(&self.sig);
    }

    pub fn decode(i: &mut usize, b: &[u8], num_validators: usize) -> Result<Self, CodecError> {
        let mut counters = Vec::with_capacity(num_validators);
        for _ in 0..num_validators {
            counters.push(rd_u32(i, b)?);
        }
        let sig = rd_fixed::<SIG_LEN>(i, b)?;
        Ok(Self { counters, sig })
    }
}
