//! Time-sliced hash search over the current job
//!
//! One [`HashSearchScheduler::run_slice`] call snapshots the store's job,
//! evaluates nonces until the slice runs out, the job stops being valid,
//! the store installs a different job, or a share above the pool
//! difficulty turns up. The snapshot is never trusted past a failed
//! identity check.

use super::{HashEvaluator, Share, ShareSubmitter};
use crate::clock::Clock;
use crate::store::JobSessionStore;
use crate::types::difficulty_of;
use crate::utils::LogThrottle;
use std::sync::Arc;
use tracing::{debug, info};

/// Default slice length
pub const SLICE_MS: u64 = 8;

/// Yield to the runtime every 16384 evaluations
const YIELD_MASK: u64 = 0x3FFF;

const NO_JOB_LOG_MS: u64 = 2_000;

/// How a slice ended
#[derive(Debug, Clone, PartialEq)]
pub enum SliceOutcome {
    /// No job installed; nothing evaluated
    NoJob,
    /// Slice time used up
    Exhausted,
    /// Job invalidated or replaced mid-slice
    JobChanged,
    /// Share found and handed to the submitter
    Found(Share),
    /// Share found but its job was replaced before submission
    Discarded,
}

/// Summary of one slice
#[derive(Debug, Clone, PartialEq)]
pub struct SliceReport {
    pub hashes: u64,
    pub outcome: SliceOutcome,
}

/// Runs bounded search slices for one worker
pub struct HashSearchScheduler<E> {
    worker_id: usize,
    evaluator: E,
    store: Arc<JobSessionStore>,
    slice_ms: u64,
    no_job_log: LogThrottle,
}

impl<E: HashEvaluator> HashSearchScheduler<E> {
    pub fn new(worker_id: usize, evaluator: E, store: Arc<JobSessionStore>, slice_ms: u64) -> Self {
        Self {
            worker_id,
            evaluator,
            store,
            slice_ms,
            no_job_log: LogThrottle::new(NO_JOB_LOG_MS),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    /// Run one slice, submitting a found share through `submitter`
    pub async fn run_slice<S>(&mut self, submitter: &mut S) -> SliceReport
    where
        S: ShareSubmitter + ?Sized,
    {
        let clock = Arc::clone(self.store.clock());

        let Some(job) = self.store.current_job() else {
            if self.no_job_log.allow(clock.now_ms()) {
                debug!(worker_id = self.worker_id, "No job to mine");
            }
            return SliceReport {
                hashes: 0,
                outcome: SliceOutcome::NoJob,
            };
        };

        let start = clock.now_ms();
        let mut hashes = 0u64;
        let mut found = None;
        let mut changed = false;

        loop {
            if clock.now_ms().saturating_sub(start) >= self.slice_ms {
                break;
            }
            if !self.store.is_job_valid() || !self.store.is_current(&job) {
                changed = true;
                break;
            }

            let evaluation = self.evaluator.evaluate(self.worker_id, job.header());
            hashes += 1;

            if evaluation.hit {
                let difficulty = difficulty_of(&evaluation.hash);
                if difficulty > self.store.difficulty() {
                    found = Some((evaluation, difficulty));
                    break;
                }
            }

            if hashes & YIELD_MASK == 0 {
                tokio::task::yield_now().await;
            }
        }

        self.store.increment_hashes_by(hashes);
        self.store.update_hashrate();

        let Some((evaluation, difficulty)) = found else {
            let outcome = if changed {
                SliceOutcome::JobChanged
            } else {
                SliceOutcome::Exhausted
            };
            return SliceReport { hashes, outcome };
        };

        if !self.store.is_current(&job) {
            debug!(job_id = %job.job_id(), "Job replaced, discarding share");
            return SliceReport {
                hashes,
                outcome: SliceOutcome::Discarded,
            };
        }

        let share = Share {
            job_id: job.job_id().to_string(),
            extranonce2: job.extranonce2().to_string(),
            ntime: job.ntime().to_string(),
            nonce: evaluation.nonce,
            hash: evaluation.hash,
            difficulty,
        };
        debug!(job_id = %share.job_id, nonce = share.nonce, "Share difficulty {:.12}", difficulty);

        submitter.submit_share(share.clone()).await;
        self.store.note_highest_difficulty(difficulty);

        if job.block_target().is_met_by(&evaluation.hash) {
            info!(job_id = %share.job_id, nonce = share.nonce, "Block found");
            self.store.increment_block_found();
        }

        SliceReport {
            hashes,
            outcome: SliceOutcome::Found(share),
        }
    }
}
