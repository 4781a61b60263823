//! CPU double SHA-256 evaluator
//!
//! Each worker walks its own residue class of the 32-bit nonce space
//! (`worker_id, worker_id + stride, ...`), so workers sharing a job never
//! try the same nonce. Nonce state restarts whenever the header template
//! changes.

use super::{Evaluation, HashEvaluator};
use crate::crypto::Sha256dHasher;
use crate::job::{HEADER_LEN, NONCE_OFFSET};
use tracing::debug;

/// Default CPU evaluator
pub struct Sha256dEvaluator {
    hasher: Sha256dHasher,
    work: [u8; HEADER_LEN],
    start: u32,
    stride: u32,
    next_nonce: u32,
    primed: bool,
}

impl Sha256dEvaluator {
    /// Evaluator for `worker_id` out of `workers`
    pub fn new(worker_id: usize, workers: usize) -> Self {
        let workers = workers.max(1) as u32;
        let start = worker_id as u32 % workers;
        Self {
            hasher: Sha256dHasher::new(),
            work: [0u8; HEADER_LEN],
            start,
            stride: workers,
            next_nonce: start,
            primed: false,
        }
    }

    /// Nonce the next call will try
    pub fn next_nonce(&self) -> u32 {
        self.next_nonce
    }

    fn load(&mut self, header: &[u8; HEADER_LEN]) {
        if self.primed && self.work[..NONCE_OFFSET] == header[..NONCE_OFFSET] {
            return;
        }
        self.work.copy_from_slice(header);
        self.next_nonce = self.start;
        self.primed = true;
        debug!(start = self.start, stride = self.stride, "New header template");
    }
}

/// Top 16 bits of the little-endian hash are zero (difficulty >= 2^-16)
pub fn is_hit(hash: &[u8; 32]) -> bool {
    hash[30..].iter().all(|b| *b == 0)
}

impl HashEvaluator for Sha256dEvaluator {
    fn evaluate(&mut self, _worker_id: usize, header: &[u8; HEADER_LEN]) -> Evaluation {
        self.load(header);

        let nonce = self.next_nonce;
        self.work[NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());
        let hash = self.hasher.hash(&self.work);
        self.next_nonce = nonce.wrapping_add(self.stride);

        Evaluation {
            hash,
            nonce,
            hit: is_hit(&hash),
        }
    }
}
