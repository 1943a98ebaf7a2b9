//! BLS helpers for PairBFT quorum certificates.
//!
//! - Uses blst::min_pk (PK=48B G1, SIG=96B G2).
//! - Every signature in this protocol covers a 32-byte domain-separated
//!   phase digest; all contributors to one aggregate sign the *same* digest,
//!   so verification is a single `fast_aggregate_verify`.
//! - The aggregate public key is weighted by the AggSig counters: the
//!   fallback merge path multiplies whole signature products, so a validator
//!   present in both operands ends up squared in the product and must also
//!   be squared in the key. Presence-only keys would reject valid merges.
//! - `PreparedDigest` pins the exact digest a phase verifies against; each
//!   validator computes it once per (height, phase) and reuses it for every
//!   incoming partial signature.

use blst::min_pk as mpk;
use blst::BLST_ERROR;
use thiserror::Error;

use crate::crypto::phase_digest;
use crate::types::Hash;

/// Domain separation tag handed to blst's hash-to-curve (<=255 bytes).
/// Change only with a network upgrade.
pub const BLS_DST: &[u8] = b"PAIRBFT-BLS-QUORUM-v1";

pub const PK_LEN: usize = 48;
pub const SIG_LEN: usize = 96;

/// Compressed encoding of the G2 identity. An AggSig with no contributors
/// carries these bytes; no blst operation is ever applied to them.
pub const SIG_IDENTITY: [u8; SIG_LEN] = {
    let mut b = [0u8; SIG_LEN];
    b[0] = 0xc0;
    b
};

/// Compressed BLS signature bytes (min_pk: G2 = 96 bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsSignatureBytes(pub [u8; SIG_LEN]);

impl std::fmt::Debug for BlsSignatureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlsSignatureBytes({})", hex::encode(&self.0[..8]))
    }
}

#[derive(Debug, Error)]
#[error("bls operation failed: {0:?}")]
pub struct BlsError(pub BLST_ERROR);

/// A phase digest fixed for repeated verification.
///
/// Computed once per (height, phase) and cached on the validator for the
/// prepare, commit, and previous phases; every partial signature for that
/// phase verifies against these exact bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreparedDigest(Hash);

impl PreparedDigest {
    pub fn new(block_hash: &Hash, domain: &[u8]) -> Self {
        Self(phase_digest(block_hash, domain))
    }

    /// Proof-of-possession digest for a validator public key.
    pub fn for_pubkey(pk: &[u8; PK_LEN]) -> Self {
        let mut buf = Vec::with_capacity(PK_LEN + crate::crypto::DOM_PUBKEY.len());
        buf.extend_from_slice(pk);
        buf.extend_from_slice(crate::crypto::DOM_PUBKEY);
        Self(crate::crypto::hash_bytes_sha256(&buf))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Validator BLS signer (keeps SecretKey in memory).
/// Use only inside validator processes; never serialize the secret key.
pub struct BlsSigner(mpk::SecretKey);

impl BlsSigner {
    /// Derive a keypair deterministically from 32 bytes of seed material.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, BlsError> {
        mpk::SecretKey::key_gen(seed, &[]).map(Self).map_err(BlsError)
    }

    /// Compressed 48-byte public key (min_pk).
    pub fn public_key_bytes(&self) -> [u8; PK_LEN] {
        self.0.sk_to_pk().to_bytes()
    }

    /// Sign a prepared phase digest.
    pub fn sign_digest(&self, digest: &PreparedDigest) -> BlsSignatureBytes {
        let sig = self.0.sign(digest.as_bytes(), BLS_DST, &[]);
        BlsSignatureBytes(sig.to_bytes())
    }

    /// Self-signature over this signer's public key (proof of possession).
    pub fn possession_sig(&self) -> BlsSignatureBytes {
        let digest = PreparedDigest::for_pubkey(&self.public_key_bytes());
        self.sign_digest(&digest)
    }
}

/// Verify a single signature against one public key.
pub fn verify_digest(
    pk_bytes: &[u8; PK_LEN],
    digest: &PreparedDigest,
    sig: &BlsSignatureBytes,
) -> bool {
    let pk = match mpk::PublicKey::from_bytes(pk_bytes) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let sig = match mpk::Signature::from_bytes(&sig.0) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    sig.verify(true, digest.as_bytes(), BLS_DST, &[], &pk, true) == BLST_ERROR::BLST_SUCCESS
}

/// Group-add two compressed signatures.
///
/// Precondition: both operands were verified upstream against the same
/// digest; neither is the identity encoding (callers short-circuit empty
/// sets before reaching this point).
pub fn combine(a: &[u8; SIG_LEN], b: &[u8; SIG_LEN]) -> Result<[u8; SIG_LEN], BlsError> {
    let agg = mpk::AggregateSignature::aggregate_serialized(&[&a[..], &b[..]], false)
        .map_err(BlsError)?;
    Ok(agg.to_signature().to_bytes())
}

/// Verify an aggregate signature where every contributor signed the same
/// digest, weighting each public key by its counter.
pub fn verify_weighted_aggregate(
    sig: &BlsSignatureBytes,
    digest: &PreparedDigest,
    pub_keys: &[[u8; PK_LEN]],
    counters: &[u32],
) -> bool {
    debug_assert_eq!(pub_keys.len(), counters.len());
    let sig = match mpk::Signature::from_bytes(&sig.0) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    let mut pks = Vec::new();
    for (pkb, &count) in pub_keys.iter().zip(counters) {
        // a key's multiplicity in the aggregate equals its counter
        for _ in 0..count {
            match mpk::PublicKey::from_bytes(pkb) {
                Ok(pk) => pks.push(pk),
                Err(_) => return false,
            }
        }
    }
    if pks.is_empty() {
        return false;
    }
    let pk_refs: Vec<&mpk::PublicKey> = pks.iter().collect();

    sig.fast_aggregate_verify(true, digest.as_bytes(), BLS_DST, &pk_refs)
        == BLST_ERROR::BLST_SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DOM_COMMIT, DOM_PREPARE};

    fn signer(i: u8) -> BlsSigner {
        BlsSigner::from_seed(&[i + 1; 32]).unwrap()
    }

    #[test]
    fn sign_verify_roundtrip() {
        let s = signer(0);
        let digest = PreparedDigest::new(&[7u8; 32], DOM_PREPARE);
        let sig = s.sign_digest(&digest);
        assert!(verify_digest(&s.public_key_bytes(), &digest, &sig));
    }

    #[test]
    fn wrong_digest_rejected() {
        let s = signer(0);
        let a = PreparedDigest::new(&[7u8; 32], DOM_PREPARE);
        let b = PreparedDigest::new(&[8u8; 32], DOM_PREPARE);
        let sig = s.sign_digest(&a);
        assert!(!verify_digest(&s.public_key_bytes(), &b, &sig));
    }

    #[test]
    fn phase_domains_prevent_cross_phase_replay() {
        let s = signer(0);
        let block = [9u8; 32];
        let prepare = PreparedDigest::new(&block, DOM_PREPARE);
        let commit = PreparedDigest::new(&block, DOM_COMMIT);

        let prepare_sig = s.sign_digest(&prepare);
        let commit_sig = s.sign_digest(&commit);

        assert!(verify_digest(&s.public_key_bytes(), &prepare, &prepare_sig));
        assert!(verify_digest(&s.public_key_bytes(), &commit, &commit_sig));
        assert!(!verify_digest(&s.public_key_bytes(), &commit, &prepare_sig));
        assert!(!verify_digest(&s.public_key_bytes(), &prepare, &commit_sig));
    }

    #[test]
    fn aggregate_verifies_against_exact_signer_set() {
        let signers: Vec<BlsSigner> = (0..5).map(signer).collect();
        let pks: Vec<[u8; PK_LEN]> = signers.iter().map(|s| s.public_key_bytes()).collect();
        let digest = PreparedDigest::new(&[3u8; 32], DOM_PREPARE);

        // validators 0, 2, 3 sign
        let mut agg = signers[0].sign_digest(&digest).0;
        for i in [2usize, 3] {
            agg = combine(&agg, &signers[i].sign_digest(&digest).0).unwrap();
        }
        let agg = BlsSignatureBytes(agg);

        let exact = [1u32, 0, 1, 1, 0];
        assert!(verify_weighted_aggregate(&agg, &digest, &pks, &exact));

        // strict subset and strict superset of the signer set both fail
        let subset = [1u32, 0, 1, 0, 0];
        let superset = [1u32, 1, 1, 1, 0];
        assert!(!verify_weighted_aggregate(&agg, &digest, &pks, &subset));
        assert!(!verify_weighted_aggregate(&agg, &digest, &pks, &superset));
    }

    #[test]
    fn doubled_contributor_needs_doubled_weight() {
        let signers: Vec<BlsSigner> = (0..3).map(signer).collect();
        let pks: Vec<[u8; PK_LEN]> = signers.iter().map(|s| s.public_key_bytes()).collect();
        let digest = PreparedDigest::new(&[4u8; 32], DOM_COMMIT);

        // validator 0 contributes twice, as after a fallback merge of two
        // overlapping partial aggregates
        let s0 = signers[0].sign_digest(&digest).0;
        let s1 = signers[1].sign_digest(&digest).0;
        let doubled = combine(&combine(&s0, &s0).unwrap(), &s1).unwrap();
        let doubled = BlsSignatureBytes(doubled);

        assert!(verify_weighted_aggregate(&doubled, &digest, &pks, &[2, 1, 0]));
        assert!(!verify_weighted_aggregate(&doubled, &digest, &pks, &[1, 1, 0]));
    }
}
