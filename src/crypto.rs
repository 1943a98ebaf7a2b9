// src/crypto.rs

use sha2::{Digest, Sha256};

use crate::types::Hash;

pub mod bls;

/// Phase-separation domains mixed into every digest a validator signs.
/// A Prepare-phase signature over a block hash can never be replayed as a
/// Commit-phase signature because the two digests differ.
pub const DOM_PREPARE: &[u8] = b"PAIRBFT_PREPARE_V1";
pub const DOM_COMMIT: &[u8] = b"PAIRBFT_COMMIT_V1";
pub const DOM_COMMIT_PREPARE: &[u8] = b"PAIRBFT_COMMIT_PREPARE_V1";
pub const DOM_PUBKEY: &[u8] = b"PAIRBFT_PUBKEY_V1";

pub fn hash_bytes_sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Block hash chain: `sha256(data || prev_hash)`, or `sha256(data)` for the
/// first block (which has no parent).
pub fn block_hash(data: &[u8], prev_hash: Option<&Hash>) -> Hash {
    match prev_hash {
        None => hash_bytes_sha256(data),
        Some(prev) => {
            let mut buf = Vec::with_capacity(data.len() + prev.len());
            buf.extend_from_slice(data);
            buf.extend_from_slice(prev);
            hash_bytes_sha256(&buf)
        }
    }
}

/// Domain-separated digest for one (block hash, phase) pair.
pub fn phase_digest(hash: &Hash, domain: &[u8]) -> Hash {
    let mut buf = Vec::with_capacity(hash.len() + domain.len());
    buf.extend_from_slice(hash);
    buf.extend_from_slice(domain);
    hash_bytes_sha256(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_hash_chains_parent() {
        let first = block_hash(b"block data", None);
        let second = block_hash(b"block data", Some(&first));
        assert_ne!(first, second);
        // chaining is positional: data then parent
        let mut buf = b"block data".to_vec();
        buf.extend_from_slice(&first);
        assert_eq!(second, hash_bytes_sha256(&buf));
    }

    #[test]
    fn phase_digests_are_domain_separated() {
        let h = block_hash(b"block data", None);
        assert_ne!(phase_digest(&h, DOM_PREPARE), phase_digest(&h, DOM_COMMIT));
        assert_ne!(
            phase_digest(&h, DOM_COMMIT),
            phase_digest(&h, DOM_COMMIT_PREPARE)
        );
    }
}
