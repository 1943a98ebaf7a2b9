// src/registry.rs
//
// Immutable validator set, shared via Arc and injected into every validator
// at construction. Index position is the validator id; every bitmap and
// counter vector in the protocol is aligned with this ordering.

use std::net::SocketAddr;

use thiserror::Error;

use crate::crypto::bls::{verify_digest, BlsSignatureBytes, PreparedDigest, PK_LEN};
use crate::types::ValidatorId;

#[derive(Clone, Debug)]
pub struct ValidatorEntry {
    pub id: ValidatorId,
    pub addr: SocketAddr,
    pub pub_key: [u8; PK_LEN],
    /// Self-signature over the public key (proof of possession).
    pub pub_key_sig: BlsSignatureBytes,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("validator set is empty")]
    Empty,
    #[error("entry at position {position} has id {id}; ids must equal their index")]
    OutOfOrder { position: usize, id: ValidatorId },
    #[error("proof-of-possession check failed for validator {0}")]
    BadPossessionProof(ValidatorId),
}

#[derive(Debug)]
pub struct ValidatorRegistry {
    entries: Vec<ValidatorEntry>,
    pub_keys: Vec<[u8; PK_LEN]>,
}

impl ValidatorRegistry {
    /// Build a registry, checking each entry's proof of possession.
    pub fn new(entries: Vec<ValidatorEntry>) -> Result<Self, RegistryError> {
        if entries.is_empty() {
            return Err(RegistryError::Empty);
        }
        for (position, e) in entries.iter().enumerate() {
            if e.id as usize != position {
                return Err(RegistryError::OutOfOrder { position, id: e.id });
            }
            let digest = PreparedDigest::for_pubkey(&e.pub_key);
            if !verify_digest(&e.pub_key, &digest, &e.pub_key_sig) {
                return Err(RegistryError::BadPossessionProof(e.id));
            }
        }
        let pub_keys = entries.iter().map(|e| e.pub_key).collect();
        Ok(Self { entries, pub_keys })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Round-robin proposer rotation over the block height.
    pub fn proposer_of(&self, height: u64) -> ValidatorId {
        (height % self.entries.len() as u64) as ValidatorId
    }

    /// Compressed public keys in id order.
    pub fn public_keys(&self) -> &[[u8; PK_LEN]] {
        &self.pub_keys
    }

    pub fn addr(&self, id: ValidatorId) -> SocketAddr {
        self.entries[id as usize].addr
    }
}
