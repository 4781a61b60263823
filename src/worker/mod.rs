//! Hash search workers
//!
//! A [`HashEvaluator`] does the raw proof-of-work step. The
//! [`HashSearchScheduler`] runs it in bounded slices against a snapshot of
//! the current job and hands found shares to a [`ShareSubmitter`].

use crate::job::HEADER_LEN;
use crate::stratum::{PoolConnection, Transport};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{warn, Span};

pub mod cpu;
pub mod scheduler;

pub use cpu::Sha256dEvaluator;
pub use scheduler::{HashSearchScheduler, SliceOutcome, SliceReport};

/// Result of one evaluator step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Candidate hash, little-endian
    pub hash: [u8; 32],
    /// Nonce that produced `hash`
    pub nonce: u32,
    /// Cheap pre-filter passed; the difficulty still has to be checked
    pub hit: bool,
}

/// Proof-of-work step over an 80-byte header template
///
/// Each call advances the evaluator's own nonce state and tries one nonce.
pub trait HashEvaluator: Send {
    fn evaluate(&mut self, worker_id: usize, header: &[u8; HEADER_LEN]) -> Evaluation;
}

/// A candidate ready to be submitted
#[derive(Debug, Clone, PartialEq)]
pub struct Share {
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: u32,
    pub hash: [u8; 32],
    pub difficulty: f64,
}

/// Sink for found shares
#[async_trait]
pub trait ShareSubmitter: Send {
    async fn submit_share(&mut self, share: Share);
}

#[async_trait]
impl<T: Transport> ShareSubmitter for PoolConnection<T> {
    async fn submit_share(&mut self, share: Share) {
        self.submit(&share.job_id, &share.extranonce2, &share.ntime, share.nonce)
            .await;
    }
}

/// Searcher side of the threaded mode; the connection task drains the receiver
///
/// Never waits: a full channel drops the share.
#[async_trait]
impl ShareSubmitter for mpsc::Sender<Share> {
    async fn submit_share(&mut self, share: Share) {
        match self.try_send(share) {
            Ok(()) => {}
            Err(TrySendError::Full(share)) => {
                warn!(job_id = %share.job_id, nonce = share.nonce, "Share channel full, dropping share");
            }
            Err(TrySendError::Closed(_)) => warn!("Share channel closed, dropping share"),
        }
    }
}

/// Create a tracing span for a search worker
pub fn search_span(worker_id: usize) -> Span {
    tracing::info_span!("search", worker_id)
}
