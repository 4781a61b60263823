//! Job and session state shared between the pool connection and searchers
//!
//! # Consistency contract
//!
//! The store is single-writer, many-reader for the job, session and
//! difficulty slots: only the connection task installs or clears them.
//! Searchers never hold a reference into the slot itself. They take an
//! `Arc<Job>` snapshot at slice start and re-check, on every iteration,
//! that the job is still marked valid and that the store's current job is
//! the same allocation ([`JobSessionStore::is_current`]). A reader may see a
//! stale value for at most one slice; that is accepted behaviour.
//!
//! The slot locks guard only the pointer clone or swap and are never held
//! across work. All counters are relaxed atomics. The lifetime hash counter
//! is the one field with several concurrent writers and uses `fetch_add`.

use crate::clock::Clock;
use crate::job::{Job, Notification, Session};
use crate::types::{HashRate, DIFFICULTY_UNSET};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Default no-result interval after which the run is considered stale
pub const STALE_TIMEOUT_MS: u64 = 200_000;

/// Minimum window length before the hashrate is recomputed
const HASHRATE_WINDOW_MS: u64 = 1_000;

const WINDOW_UNSET: u64 = u64::MAX;

/// Point-in-time copy of the store's counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MinerStats {
    pub total_hashes: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub blocks_found: u64,
    pub jobs_processed: u64,
    /// Thousands of hashes per second over the last completed window
    pub hashrate_khs: f64,
    pub highest_difficulty: f64,
    pub current_difficulty: f64,
}

impl fmt::Display for MinerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | accepted {} rejected {} | blocks {} | jobs {} | best {:.4} | hashes {}",
            HashRate::from_khs(self.hashrate_khs),
            self.accepted,
            self.rejected,
            self.blocks_found,
            self.jobs_processed,
            self.highest_difficulty,
            self.total_hashes,
        )
    }
}

/// Owner of the active job, active session, difficulty and lifetime counters
pub struct JobSessionStore {
    clock: Arc<dyn Clock>,
    stale_timeout_ms: u64,

    session: RwLock<Option<Arc<Session>>>,
    job: RwLock<Option<Arc<Job>>>,
    job_valid: AtomicBool,

    // f64 bit patterns
    current_difficulty: AtomicU64,
    highest_difficulty: AtomicU64,
    hashrate_khs: AtomicU64,

    total_hashes: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    blocks_found: AtomicU64,
    jobs_processed: AtomicU64,

    window_hashes: AtomicU64,
    window_start_ms: AtomicU64,

    last_result_ms: AtomicU64,
    stale_signalled: AtomicBool,
}

impl JobSessionStore {
    /// Create an empty store with the default staleness timeout
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_stale_timeout(clock, STALE_TIMEOUT_MS)
    }

    /// Create an empty store with a custom staleness timeout
    pub fn with_stale_timeout(clock: Arc<dyn Clock>, stale_timeout_ms: u64) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            stale_timeout_ms,
            session: RwLock::new(None),
            job: RwLock::new(None),
            job_valid: AtomicBool::new(false),
            current_difficulty: AtomicU64::new(DIFFICULTY_UNSET.to_bits()),
            highest_difficulty: AtomicU64::new(0f64.to_bits()),
            hashrate_khs: AtomicU64::new(0f64.to_bits()),
            total_hashes: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            blocks_found: AtomicU64::new(0),
            jobs_processed: AtomicU64::new(0),
            window_hashes: AtomicU64::new(0),
            window_start_ms: AtomicU64::new(WINDOW_UNSET),
            last_result_ms: AtomicU64::new(now),
            stale_signalled: AtomicBool::new(false),
        }
    }

    /// Clock shared with the rest of the client
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // Session

    /// Replace the current session unconditionally
    pub fn set_session(&self, session: Session) {
        info!(session_id = %session.id, extranonce1 = %session.extranonce1, "New session id");
        *self.session.write() = Some(Arc::new(session));
    }

    pub fn clear_session(&self) {
        *self.session.write() = None;
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    pub fn has_session(&self) -> bool {
        self.session.read().is_some()
    }

    // Job

    pub fn clear_job(&self) {
        *self.job.write() = None;
    }

    /// Build and install a job from `notification`
    ///
    /// Fails with [`Error::NoSession`] without touching the job slot when no
    /// session exists. On a construction failure the previous job is already
    /// gone and the error is returned for the caller to decide on a reset.
    pub fn set_job(&self, notification: &Notification) -> Result<Arc<Job>> {
        let session = self.session().ok_or(Error::NoSession)?;

        if notification.clean_jobs {
            self.job_valid.store(false, Ordering::Relaxed);
            info!(job_id = %notification.job_id, "Clean jobs: replacing current job");
        }

        self.clear_job();
        let job = Arc::new(Job::build(notification, &session)?);

        *self.job.write() = Some(Arc::clone(&job));
        self.job_valid.store(true, Ordering::Relaxed);
        self.increment_jobs_processed();
        info!(job_id = %job.job_id(), "Job: {} ready to be mined", job.job_id());
        Ok(job)
    }

    /// Snapshot of the current job
    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.job.read().clone()
    }

    /// Id of the current job, if any
    pub fn current_job_id(&self) -> Option<String> {
        self.job.read().as_ref().map(|job| job.job_id().to_string())
    }

    /// True when `snapshot` is still the installed job (same allocation)
    pub fn is_current(&self, snapshot: &Arc<Job>) -> bool {
        self.job
            .read()
            .as_ref()
            .is_some_and(|job| Arc::ptr_eq(job, snapshot))
    }

    pub fn has_job(&self) -> bool {
        self.job.read().is_some()
    }

    pub fn is_job_valid(&self) -> bool {
        self.job_valid.load(Ordering::Relaxed)
    }

    /// Keep the job but stop searching it until the next notify
    pub fn invalidate_job(&self) {
        self.job_valid.store(false, Ordering::Relaxed);
    }

    /// Destroy job and session after a protocol-level failure
    pub fn reset_session(&self) {
        info!("Session reset");
        self.job_valid.store(false, Ordering::Relaxed);
        self.clear_job();
        self.clear_session();
    }

    /// Clear job and session after a failed state mutation
    pub fn defensive_reset(&self, cause: &Error) {
        warn!(category = cause.category(), error = %cause, "Clearing job and session");
        self.job_valid.store(false, Ordering::Relaxed);
        self.clear_job();
        self.clear_session();
    }

    // Difficulty

    /// Current pool difficulty
    pub fn difficulty(&self) -> f64 {
        f64::from_bits(self.current_difficulty.load(Ordering::Relaxed))
    }

    pub fn set_difficulty(&self, value: f64) {
        self.current_difficulty
            .store(value.to_bits(), Ordering::Relaxed);
        info!("New difficulty: {:.12}", value);
    }

    pub fn highest_difficulty(&self) -> f64 {
        f64::from_bits(self.highest_difficulty.load(Ordering::Relaxed))
    }

    /// Raise the highest observed difficulty if `value` is strictly greater
    pub fn note_highest_difficulty(&self, value: f64) {
        let updated = self
            .highest_difficulty
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                (value > f64::from_bits(bits)).then_some(value.to_bits())
            })
            .is_ok();

        if updated {
            debug!("New highest difficulty: {:.12}", value);
        }
    }

    // Counters

    /// Add a batch of evaluated hashes
    pub fn increment_hashes_by(&self, n: u64) {
        let _ = self.window_start_ms.compare_exchange(
            WINDOW_UNSET,
            self.clock.now_ms(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        self.window_hashes.fetch_add(n, Ordering::Relaxed);
        self.total_hashes.fetch_add(n, Ordering::Relaxed);
    }

    /// Recompute the hashrate when the window is older than one second
    pub fn update_hashrate(&self) {
        let start = self.window_start_ms.load(Ordering::Relaxed);
        if start == WINDOW_UNSET {
            return;
        }

        let now = self.clock.now_ms();
        let elapsed = now.saturating_sub(start);
        if elapsed <= HASHRATE_WINDOW_MS {
            return;
        }

        let count = self.window_hashes.swap(0, Ordering::Relaxed);
        let rate = (count as f64 / (elapsed as f64 / 1000.0)) / 1000.0;
        self.hashrate_khs.store(rate.to_bits(), Ordering::Relaxed);
        self.window_start_ms.store(now, Ordering::Relaxed);
    }

    /// Current hashrate in kH/s
    pub fn hashrate(&self) -> f64 {
        f64::from_bits(self.hashrate_khs.load(Ordering::Relaxed))
    }

    pub fn increment_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.stamp_result();
    }

    pub fn increment_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.stamp_result();
    }

    pub fn increment_block_found(&self) {
        self.blocks_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_processed(&self) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn stamp_result(&self) {
        self.last_result_ms
            .store(self.clock.now_ms(), Ordering::Relaxed);
    }

    /// Fail once when no share result arrived within the staleness timeout
    ///
    /// Returns [`Error::Stale`] on the first detection only; later calls
    /// return `Ok` so the fatal path fires exactly once per store.
    pub fn check_stale(&self, now_ms: u64) -> Result<()> {
        let idle_ms = now_ms.saturating_sub(self.last_result_ms.load(Ordering::Relaxed));
        if idle_ms < self.stale_timeout_ms {
            return Ok(());
        }

        if self.stale_signalled.swap(true, Ordering::Relaxed) {
            return Ok(());
        }

        error!(idle_ms, "No share results, restarting");
        Err(Error::Stale { idle_ms })
    }

    /// Snapshot all counters
    pub fn stats(&self) -> MinerStats {
        MinerStats {
            total_hashes: self.total_hashes.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            blocks_found: self.blocks_found.load(Ordering::Relaxed),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            hashrate_khs: self.hashrate(),
            highest_difficulty: self.highest_difficulty(),
            current_difficulty: self.difficulty(),
        }
    }
}
