//! Hashing primitives for block header work
//!
//! Double SHA-256 and the coinbase/merkle assembly a stratum job needs to
//! turn notify fields into an 80-byte header.

use crate::Result;
use sha2::{Digest, Sha256};

/// Incremental double SHA-256 hasher
pub struct Sha256dHasher {
    hasher: Sha256,
}

impl Sha256dHasher {
    /// Create a new hasher
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Hash data and return the result in the order SHA-256 emits it
    pub fn hash(&mut self, data: &[u8]) -> [u8; 32] {
        self.hasher.update(data);
        let first = self.hasher.finalize_reset();
        self.hasher.update(first);
        self.hasher.finalize_reset().into()
    }
}

impl Default for Sha256dHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot double SHA-256
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Concatenate the coinbase transaction from its stratum pieces
///
/// All inputs are hex strings as received from the pool.
pub fn build_coinbase(
    coinb1: &str,
    extranonce1: &str,
    extranonce2: &str,
    coinb2: &str,
) -> Result<Vec<u8>> {
    let mut coinbase = hex::decode(coinb1)?;
    coinbase.extend(hex::decode(extranonce1)?);
    coinbase.extend(hex::decode(extranonce2)?);
    coinbase.extend(hex::decode(coinb2)?);
    Ok(coinbase)
}

/// Climb the merkle branch starting from the coinbase hash
pub fn merkle_root(coinbase: &[u8], branches: &[String]) -> Result<[u8; 32]> {
    let mut root = sha256d(coinbase);
    let mut pair = [0u8; 64];

    for branch in branches {
        let sibling = hex::decode(branch)?;
        if sibling.len() != 32 {
            return Err(crate::Error::protocol(format!(
                "merkle branch must be 32 bytes, got {}",
                sibling.len()
            )));
        }
        pair[..32].copy_from_slice(&root);
        pair[32..].copy_from_slice(&sibling);
        root = sha256d(&pair);
    }

    Ok(root)
}
