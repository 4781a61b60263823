//! Mining coordinator
//!
//! Drives one of two execution models over a shared [`JobSessionStore`]:
//!
//! - cooperative: a single task alternates connection polling and search
//!   slices
//! - threaded: one search task per worker, one connection task, and a
//!   watchdog running in the calling task
//!
//! [`Coordinator::supervise`] rebuilds every piece of state after the
//! staleness watchdog fires and stops on ctrl-c.

use crate::clock::Clock;
use crate::config::{Config, ExecutionMode};
use crate::status::StatusIndicator;
use crate::store::JobSessionStore;
use crate::stratum::{JobRequest, PoolConnection, PoolSettings, Transport};
use crate::utils::{acceptance_rate, format_duration, ExponentialBackoff, LogThrottle};
use crate::worker::{search_span, HashEvaluator, HashSearchScheduler, Share, ShareSubmitter};
use crate::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Pause of a searcher whose slice evaluated nothing
const NO_JOB_BACKOFF: Duration = Duration::from_millis(5);
/// Found shares waiting for the connection task
pub const SHARE_CHANNEL_CAPACITY: usize = 8;
/// Connection task poll period in threaded mode
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Staleness check period in threaded mode
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(50);
/// Upper bound of the reconnect backoff
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Run-loop knobs derived from the configuration
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub mode: ExecutionMode,
    pub workers: usize,
    pub slice_ms: u64,
    pub stale_timeout_ms: u64,
    pub stats_interval_ms: u64,
    pub watchdog_interval: Duration,
    pub retry_delay: Duration,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.mode,
            workers: config.worker_count(),
            slice_ms: config.slice.as_millis() as u64,
            stale_timeout_ms: config.stale_timeout.as_millis() as u64,
            stats_interval_ms: config.stats_interval.as_millis() as u64,
            watchdog_interval: WATCHDOG_INTERVAL,
            retry_delay: config.connect_retry_delay,
        }
    }
}

/// Periodic statistics line
struct StatsReporter {
    throttle: LogThrottle,
    started_ms: u64,
}

impl StatsReporter {
    fn new(interval_ms: u64, now_ms: u64) -> Self {
        let mut throttle = LogThrottle::new(interval_ms);
        // First line after one full interval
        throttle.allow(now_ms);
        Self {
            throttle,
            started_ms: now_ms,
        }
    }

    fn maybe_log(&mut self, store: &JobSessionStore, now_ms: u64) {
        if !self.throttle.allow(now_ms) {
            return;
        }
        let stats = store.stats();
        info!(
            uptime = %format_duration(now_ms.saturating_sub(self.started_ms) / 1000),
            acceptance = %format!("{:.1}%", acceptance_rate(stats.accepted, stats.rejected)),
            "{}",
            stats
        );
    }
}

/// Wait `delay` unless cancelled first; true when cancelled
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        tokio::task::yield_now().await;
        return cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = sleep(delay) => false,
    }
}

/// Single task alternating connection work and search slices
///
/// Returns `Ok(())` once cancelled and [`Error::Stale`](crate::Error::Stale) when the store
/// has seen no share result for too long.
pub async fn run_cooperative<T, E>(
    conn: &mut PoolConnection<T>,
    scheduler: &mut HashSearchScheduler<E>,
    run: &RunSettings,
    cancel: &CancellationToken,
) -> Result<()>
where
    T: Transport,
    E: HashEvaluator,
{
    let store = Arc::clone(conn.store());
    let clock = Arc::clone(store.clock());
    let mut stats = StatsReporter::new(run.stats_interval_ms, clock.now_ms());
    let mut backoff = ExponentialBackoff::new(
        run.retry_delay.as_millis() as u64,
        MAX_RETRY_DELAY_MS,
        2.0,
    );

    info!(slice_ms = run.slice_ms, "Cooperative mining loop started");

    while !cancel.is_cancelled() {
        if conn.get_job().await == JobRequest::Failed {
            let delay = Duration::from_millis(backoff.next_delay());
            warn!(attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "Pool unreachable, backing off");
            if pause(delay, cancel).await {
                break;
            }
            continue;
        }
        backoff.reset();

        conn.poll().await;

        let report = scheduler.run_slice(&mut *conn).await;
        if report.hashes == 0 {
            // No job or an invalidated one; keep polling without spinning
            if pause(NO_JOB_BACKOFF, cancel).await {
                break;
            }
        } else {
            tokio::task::yield_now().await;
        }

        let now = clock.now_ms();
        store.check_stale(now)?;
        stats.maybe_log(&store, now);
    }

    info!("Cooperative mining loop stopped");
    Ok(())
}

async fn search_loop<E>(
    mut scheduler: HashSearchScheduler<E>,
    mut shares: mpsc::Sender<Share>,
    cancel: CancellationToken,
) where
    E: HashEvaluator,
{
    while !cancel.is_cancelled() {
        let report = scheduler.run_slice(&mut shares).await;
        if report.hashes == 0 {
            if pause(NO_JOB_BACKOFF, &cancel).await {
                break;
            }
        } else {
            tokio::task::yield_now().await;
        }
    }
}

/// Submit `share` unless its job was replaced while it waited in the channel
async fn forward_share<T: Transport>(conn: &mut PoolConnection<T>, share: Share) -> bool {
    let current = conn.store().current_job_id();
    if current.as_deref() != Some(share.job_id.as_str()) {
        debug!(job_id = %share.job_id, current = ?current, "Job replaced while share was queued, dropping");
        return false;
    }
    conn.submit_share(share).await;
    true
}

async fn connection_loop<T>(
    mut conn: PoolConnection<T>,
    mut shares: mpsc::Receiver<Share>,
    retry_delay: Duration,
    cancel: CancellationToken,
) where
    T: Transport,
{
    let mut tick = interval(POLL_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut backoff =
        ExponentialBackoff::new(retry_delay.as_millis() as u64, MAX_RETRY_DELAY_MS, 2.0);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(share) = shares.recv() => {
                forward_share(&mut conn, share).await;
            }
            _ = tick.tick() => {
                if conn.get_job().await == JobRequest::Failed {
                    let delay = Duration::from_millis(backoff.next_delay());
                    warn!(attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "Pool unreachable, backing off");
                    if pause(delay, &cancel).await {
                        break;
                    }
                    continue;
                }
                backoff.reset();
                conn.poll().await;
            }
        }
    }
}

/// Searcher tasks plus a connection task, watched from the calling task
///
/// The staleness watchdog cancels every task before returning
/// [`Error::Stale`](crate::Error::Stale).
pub async fn run_threaded<T, E>(
    conn: PoolConnection<T>,
    schedulers: Vec<HashSearchScheduler<E>>,
    run: &RunSettings,
    cancel: CancellationToken,
) -> Result<()>
where
    T: Transport + 'static,
    E: HashEvaluator + 'static,
{
    let store = Arc::clone(conn.store());
    let clock = Arc::clone(store.clock());
    let (share_tx, share_rx) = mpsc::channel::<Share>(SHARE_CHANNEL_CAPACITY);

    info!(workers = schedulers.len(), slice_ms = run.slice_ms, "Threaded mining started");

    let mut handles = Vec::with_capacity(schedulers.len() + 1);
    for scheduler in schedulers {
        let span = search_span(scheduler.worker_id());
        handles.push(tokio::spawn(
            search_loop(scheduler, share_tx.clone(), cancel.clone()).instrument(span),
        ));
    }
    drop(share_tx);

    handles.push(tokio::spawn(connection_loop(
        conn,
        share_rx,
        run.retry_delay,
        cancel.clone(),
    )));

    let mut watchdog = interval(run.watchdog_interval);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats = StatsReporter::new(run.stats_interval_ms, clock.now_ms());

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            _ = watchdog.tick() => {
                let now = clock.now_ms();
                if let Err(e) = store.check_stale(now) {
                    break Err(e);
                }
                stats.maybe_log(&store, now);
            }
        }
    };

    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Mining task failed");
        }
    }

    info!("Threaded mining stopped");
    outcome
}

/// Builds and rebuilds a complete mining client
pub struct Coordinator<F, G> {
    pool: PoolSettings,
    run: RunSettings,
    clock: Arc<dyn Clock>,
    indicator: Arc<dyn StatusIndicator>,
    transports: F,
    evaluators: G,
}

impl<F, G, T, E> Coordinator<F, G>
where
    F: Fn() -> T,
    G: Fn(usize, usize) -> E,
    T: Transport + 'static,
    E: HashEvaluator + 'static,
{
    /// `transports` opens a fresh transport per run; `evaluators` gets
    /// `(worker_id, workers)`
    pub fn new(
        pool: PoolSettings,
        run: RunSettings,
        clock: Arc<dyn Clock>,
        indicator: Arc<dyn StatusIndicator>,
        transports: F,
        evaluators: G,
    ) -> Self {
        Self {
            pool,
            run,
            clock,
            indicator,
            transports,
            evaluators,
        }
    }

    /// One run over freshly built state
    pub async fn run_once(&self, cancel: CancellationToken) -> Result<()> {
        let store = Arc::new(JobSessionStore::with_stale_timeout(
            Arc::clone(&self.clock),
            self.run.stale_timeout_ms,
        ));
        let mut conn = PoolConnection::new(
            (self.transports)(),
            self.pool.clone(),
            Arc::clone(&store),
            Arc::clone(&self.indicator),
        );

        match self.run.mode {
            ExecutionMode::Cooperative => {
                let evaluator = (self.evaluators)(0, 1);
                let mut scheduler =
                    HashSearchScheduler::new(0, evaluator, Arc::clone(&store), self.run.slice_ms);
                run_cooperative(&mut conn, &mut scheduler, &self.run, &cancel)
                    .instrument(search_span(0))
                    .await
            }
            ExecutionMode::Threaded => {
                let workers = self.run.workers.max(1);
                let schedulers = (0..workers)
                    .map(|worker_id| {
                        HashSearchScheduler::new(
                            worker_id,
                            (self.evaluators)(worker_id, workers),
                            Arc::clone(&store),
                            self.run.slice_ms,
                        )
                    })
                    .collect();
                run_threaded(conn, schedulers, &self.run, cancel).await
            }
        }
    }

    /// Run until ctrl-c, rebuilding everything after a staleness restart
    pub async fn supervise(&self) -> Result<()> {
        self.supervise_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Unable to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` completes
    pub async fn supervise_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut restarts = 0u64;

        loop {
            let cancel = CancellationToken::new();
            let result = tokio::select! {
                result = self.run_once(cancel.clone()) => result,
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    cancel.cancel();
                    return Ok(());
                }
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => {
                    restarts += 1;
                    error!(restarts, error = %e, "Restarting with fresh state");
                    cancel.cancel();
                    tokio::select! {
                        _ = &mut shutdown => return Ok(()),
                        _ = sleep(self.run.retry_delay) => {}
                    }
                }
                Err(e) => {
                    error!(category = e.category(), error = %e, "Mining stopped");
                    return Err(e);
                }
            }
        }
    }
}

/// Coordinator over TCP with the CPU evaluator
pub fn from_config(
    config: &Config,
    clock: Arc<dyn Clock>,
    indicator: Arc<dyn StatusIndicator>,
) -> Coordinator<
    impl Fn() -> crate::stratum::TcpTransport,
    impl Fn(usize, usize) -> crate::worker::Sha256dEvaluator,
> {
    let connect_timeout = config.connect_timeout;
    Coordinator::new(
        config.pool_settings(),
        RunSettings::from_config(config),
        clock,
        indicator,
        move || crate::stratum::TcpTransport::new(connect_timeout),
        crate::worker::Sha256dEvaluator::new,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SubmitMode;
    use crate::job::fixtures::{notification, session};
    use crate::stratum::messages::lines;
    use crate::testing::{MockTransport, RecordingIndicator, ScriptedEvaluator};
    use crate::Error;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool() -> PoolSettings {
        PoolSettings {
            host: "pool.test".to_string(),
            port: 3333,
            user: "wallet.w1".to_string(),
            password: "x".to_string(),
            agent: "LeafLine/test".to_string(),
            suggest_difficulty: 0.001,
            submit_mode: SubmitMode::Backpressure,
            submit_timeout_ms: 10_000,
            rx_idle_timeout_ms: 600_000,
            network_attempts: 1,
            connect_attempts: 1,
            connect_retry_delay: Duration::ZERO,
        }
    }

    fn run(mode: ExecutionMode, stale_timeout_ms: u64) -> RunSettings {
        RunSettings {
            mode,
            workers: 2,
            slice_ms: 8,
            stale_timeout_ms,
            stats_interval_ms: 30_000,
            watchdog_interval: Duration::from_millis(1),
            retry_delay: Duration::ZERO,
        }
    }

    fn script_pool(transport: &MockTransport) {
        transport.push_line(lines::SUBSCRIBE_OK);
        transport.push_line(&lines::result(2, true));
        transport.push_line(&lines::result(3, true));
        transport.push_line(&lines::notify("j1", true));
    }

    #[derive(Default)]
    struct CountingClock {
        reads: AtomicUsize,
    }

    impl Clock for CountingClock {
        fn now_ms(&self) -> u64 {
            self.reads.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    fn share(job_id: &str) -> Share {
        Share {
            job_id: job_id.to_string(),
            extranonce2: "00000000".to_string(),
            ntime: "5f5e1000".to_string(),
            nonce: 9,
            hash: [0u8; 32],
            difficulty: 1.0,
        }
    }

    fn ticking(clock: &Arc<ManualClock>) -> ScriptedEvaluator {
        let clock = Arc::clone(clock);
        ScriptedEvaluator::misses().with_hook(move |_| clock.advance(1))
    }

    #[tokio::test]
    async fn test_cooperative_mines_until_stale() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(JobSessionStore::with_stale_timeout(clock.clone(), 5_000));
        let transport = MockTransport::new();
        script_pool(&transport);

        let indicator = Arc::new(RecordingIndicator::default());
        let mut conn = PoolConnection::new(transport.clone(), pool(), store.clone(), indicator);
        let mut scheduler = HashSearchScheduler::new(0, ticking(&clock), store.clone(), 8);

        let cancel = CancellationToken::new();
        let result = run_cooperative(
            &mut conn,
            &mut scheduler,
            &run(ExecutionMode::Cooperative, 5_000),
            &cancel,
        )
        .await;

        assert_matches!(result, Err(Error::Stale { idle_ms }) if idle_ms >= 5_000);
        assert_eq!(store.current_job_id().as_deref(), Some("j1"));
        assert!(store.stats().total_hashes >= 5_000);
        assert_eq!(scheduler.evaluator().calls, store.stats().total_hashes);
    }

    #[tokio::test]
    async fn test_cooperative_stops_on_cancel() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(JobSessionStore::new(clock.clone()));
        let transport = MockTransport::new();
        let indicator = Arc::new(RecordingIndicator::default());
        let mut conn = PoolConnection::new(transport, pool(), store.clone(), indicator);
        let mut scheduler = HashSearchScheduler::new(0, ScriptedEvaluator::misses(), store, 8);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_cooperative(
            &mut conn,
            &mut scheduler,
            &run(ExecutionMode::Cooperative, 200_000),
            &cancel,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(scheduler.evaluator().calls, 0);
    }

    #[tokio::test]
    async fn test_threaded_watchdog_cancels_tasks() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(JobSessionStore::with_stale_timeout(clock.clone(), 2_000));
        let transport = MockTransport::new();
        script_pool(&transport);

        let indicator = Arc::new(RecordingIndicator::default());
        let conn = PoolConnection::new(transport.clone(), pool(), store.clone(), indicator);
        let schedulers = (0..2)
            .map(|id| HashSearchScheduler::new(id, ticking(&clock), store.clone(), 8))
            .collect();

        let cancel = CancellationToken::new();
        let result = run_threaded(
            conn,
            schedulers,
            &run(ExecutionMode::Threaded, 2_000),
            cancel.clone(),
        )
        .await;

        assert_matches!(result, Err(Error::Stale { .. }));
        assert!(cancel.is_cancelled());
        assert!(store.stats().total_hashes > 0);
        let methods: Vec<_> = transport
            .written_requests()
            .into_iter()
            .map(|r| r.method.as_str().to_string())
            .collect();
        assert_eq!(methods[0], "mining.subscribe");
    }

    #[tokio::test]
    async fn test_searcher_backs_off_on_invalid_job() {
        let clock = Arc::new(CountingClock::default());
        let store = Arc::new(JobSessionStore::new(clock.clone()));
        store.set_session(session());
        store.set_job(&notification("j1", false)).unwrap();
        store.invalidate_job();

        let scheduler = HashSearchScheduler::new(0, ScriptedEvaluator::misses(), store, 8);
        let (tx, _rx) = mpsc::channel::<Share>(SHARE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(search_loop(scheduler, tx, cancel.clone()));

        sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        // About ten empty slices, not a busy loop
        let reads = clock.reads.load(Ordering::SeqCst);
        assert!(reads < 1_000, "{} clock reads", reads);
    }

    #[tokio::test]
    async fn test_queued_share_for_replaced_job_dropped() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(JobSessionStore::new(clock));
        let transport = MockTransport::new();
        script_pool(&transport);
        let indicator = Arc::new(RecordingIndicator::default());
        let mut conn = PoolConnection::new(transport.clone(), pool(), store.clone(), indicator);
        conn.get_job().await;
        conn.poll().await;
        assert_eq!(store.current_job_id().as_deref(), Some("j1"));
        transport.take_written();

        assert!(!forward_share(&mut conn, share("j0")).await);
        assert!(transport.written_requests().is_empty());

        assert!(forward_share(&mut conn, share("j1")).await);
        let submits = transport.written_requests();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].method.as_str(), "mining.submit");
        assert_eq!(submits[0].params[1], "j1");
    }

    #[tokio::test]
    async fn test_supervise_rebuilds_after_stale() {
        let clock = Arc::new(ManualClock::new(0));
        let builds = Arc::new(AtomicUsize::new(0));
        let restarted = Arc::new(tokio::sync::Notify::new());

        let transports = {
            let builds = builds.clone();
            let restarted = restarted.clone();
            move || {
                if builds.fetch_add(1, Ordering::SeqCst) == 1 {
                    restarted.notify_one();
                }
                MockTransport::new()
            }
        };

        // Zero timeout: every run is stale on its first check
        let coordinator = Coordinator::new(
            pool(),
            run(ExecutionMode::Cooperative, 0),
            clock,
            Arc::new(RecordingIndicator::default()),
            transports,
            |_, _| ScriptedEvaluator::misses(),
        );

        let waiter = restarted.clone();
        let result = coordinator
            .supervise_until(async move { waiter.notified().await })
            .await;

        assert!(result.is_ok());
        assert!(builds.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_run_settings_from_config() {
        use clap::Parser;

        let config = Config::try_parse_from([
            "leafline", "-o", "pool.test", "-u", "w", "-m", "threaded", "-t", "3",
            "--slice", "16ms",
        ])
        .unwrap();
        let settings = RunSettings::from_config(&config);
        assert_eq!(settings.mode, ExecutionMode::Threaded);
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.slice_ms, 16);
        assert_eq!(settings.stale_timeout_ms, 200_000);
        assert_eq!(settings.watchdog_interval, WATCHDOG_INTERVAL);
    }
}
