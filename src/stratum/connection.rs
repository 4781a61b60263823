//! Pool connection state machine
//!
//! [`PoolConnection`] owns the transport and drives the stratum session:
//! connect with bounded retries, subscribe/authorize/suggest handshake,
//! line framing and dispatch of inbound messages, single in-flight submit
//! backpressure, and the RX-idle and submit-reply watchdogs that fall back
//! to a full handshake restart.
//!
//! Nothing here blocks waiting for pool data. [`PoolConnection::drain`]
//! consumes whatever bytes are already available and returns.

use super::framing::LineBuffer;
use super::messages::{classify, Inbound, StratumRequest, SubmitFailure};
use super::queue::SubmitQueue;
use super::transport::{ReadOutcome, Transport};
use crate::clock::Clock;
use crate::config::SubmitMode;
use crate::job::Notification;
use crate::status::{StatusEvent, StatusIndicator};
use crate::store::JobSessionStore;
use crate::utils::LogThrottle;
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default time to wait for a submit reply
pub const SUBMIT_TIMEOUT_MS: u64 = 10_000;
/// Default silence after which the handshake is restarted
pub const RX_IDLE_TIMEOUT_MS: u64 = 60_000;
/// Silence after which an idle line is logged
const QUIET_LOG_MS: u64 = 60_000;
/// Interval between backpressure log lines
const BUSY_LOG_MS: u64 = 1_000;
/// Low-difficulty rejections in a row that trigger a focus window
const LOW_DIFF_STREAK: u32 = 3;
/// Focus window: `FOCUS_ROUNDS` drains `FOCUS_INTERVAL` apart (~100 ms)
const FOCUS_ROUNDS: u32 = 20;
const FOCUS_INTERVAL: Duration = Duration::from_millis(5);
const READ_CHUNK: usize = 1024;

/// Everything the connection needs to know about the pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub host: String,
    pub port: u16,
    /// Wallet address or worker name
    pub user: String,
    pub password: String,
    /// Subscribe agent, e.g. `LeafLine/0.3.0`
    pub agent: String,
    pub suggest_difficulty: f64,
    pub submit_mode: SubmitMode,
    pub submit_timeout_ms: u64,
    pub rx_idle_timeout_ms: u64,
    pub network_attempts: u32,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
}

/// Monotonic request ids, never zero
#[derive(Debug, Default)]
pub struct RequestIds {
    last: u64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id; wraps from `u64::MAX` back to 1
    pub fn next(&mut self) -> u64 {
        self.last = if self.last == u64::MAX { 1 } else { self.last + 1 };
        self.last
    }
}

/// Observable connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    ConnectedNoSession,
    Handshaking,
    Ready,
}

/// Outcome of [`PoolConnection::get_job`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRequest {
    /// A valid job is already installed
    Ready,
    /// A request is already outstanding
    Pending,
    /// Connectivity ensured and work requested
    Requested,
    /// Could not reach the pool
    Failed,
}

/// Outcome of a submit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Sent with this request id; now pending
    Sent(u64),
    /// Appended to the submit queue with this request id
    Queued(u64),
    /// Dropped because another submit is pending
    Busy,
    /// Dropped by the queue or the transport
    Dropped,
}

#[derive(Debug, Clone, Copy)]
struct PendingSubmit {
    id: u64,
    sent_at_ms: u64,
}

/// Stratum v1 client connection
pub struct PoolConnection<T> {
    transport: T,
    settings: PoolSettings,
    store: Arc<JobSessionStore>,
    indicator: Arc<dyn StatusIndicator>,

    ids: RequestIds,
    lines: LineBuffer,
    queue: SubmitQueue,

    connecting: bool,
    authorized: bool,
    authorize_id: Option<u64>,
    suggest_id: Option<u64>,
    requesting: bool,
    request_job_id: u64,
    pending: Option<PendingSubmit>,
    consecutive_low_diff: u32,
    focus_requested: bool,
    last_rx_ms: u64,

    busy_log: LogThrottle,
    idle_log: LogThrottle,
}

impl<T: Transport> PoolConnection<T> {
    pub fn new(
        transport: T,
        settings: PoolSettings,
        store: Arc<JobSessionStore>,
        indicator: Arc<dyn StatusIndicator>,
    ) -> Self {
        let now = store.clock().now_ms();
        Self {
            transport,
            settings,
            store,
            indicator,
            ids: RequestIds::new(),
            lines: LineBuffer::new(),
            queue: SubmitQueue::new(),
            connecting: false,
            authorized: false,
            authorize_id: None,
            suggest_id: None,
            requesting: false,
            request_job_id: 0,
            pending: None,
            consecutive_low_diff: 0,
            focus_requested: false,
            last_rx_ms: now,
            busy_log: LogThrottle::new(BUSY_LOG_MS),
            idle_log: LogThrottle::new(QUIET_LOG_MS),
        }
    }

    pub fn store(&self) -> &Arc<JobSessionStore> {
        &self.store
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn phase(&self) -> ConnectionPhase {
        if self.connecting {
            ConnectionPhase::Connecting
        } else if !self.transport.is_connected() {
            ConnectionPhase::Disconnected
        } else if self.store.has_session() && self.authorized {
            ConnectionPhase::Ready
        } else if self.authorize_id.is_some() {
            ConnectionPhase::Handshaking
        } else {
            ConnectionPhase::ConnectedNoSession
        }
    }

    /// Ready but with a submit outstanding or the pool gone quiet
    pub fn is_degraded(&self) -> bool {
        if self.phase() != ConnectionPhase::Ready {
            return false;
        }
        let idle = self.now().saturating_sub(self.last_rx_ms);
        self.pending.is_some() || idle >= self.settings.rx_idle_timeout_ms
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    /// Request id of the outstanding submit, if any
    pub fn pending_submit(&self) -> Option<u64> {
        self.pending.map(|p| p.id)
    }

    pub fn queued_submits(&self) -> usize {
        self.queue.len()
    }

    fn now(&self) -> u64 {
        self.store.clock().now_ms()
    }

    // Connectivity

    /// Open the transport if needed
    ///
    /// Returns `Ok(true)` when a new stream was opened and `Ok(false)` when
    /// one was already open.
    pub async fn connect(&mut self) -> Result<bool> {
        if self.transport.is_connected() {
            return Ok(false);
        }

        self.connecting = true;
        let result = self.open().await;
        self.connecting = false;
        result.map(|()| true)
    }

    async fn open(&mut self) -> Result<()> {
        let host = self.settings.host.clone();
        let port = self.settings.port;

        let mut network = Err(Error::transport("no network attempts configured"));
        for attempt in 1..=self.settings.network_attempts {
            network = self.transport.ensure_network(&host, port).await;
            match &network {
                Ok(()) => break,
                Err(e) => warn!(attempt, error = %e, "Network not reachable"),
            }
            if attempt < self.settings.network_attempts {
                tokio::time::sleep(self.settings.connect_retry_delay / 2).await;
            }
        }
        network?;

        let mut last_err = Error::transport("no connect attempts configured");
        for attempt in 1..=self.settings.connect_attempts {
            match self.transport.connect(&host, port).await {
                Ok(()) => {
                    info!(%host, port, attempt, "Connected to pool");
                    return Ok(());
                }
                Err(e) => {
                    warn!(%host, port, attempt, error = %e, "Pool connect failed");
                    last_err = e;
                }
            }
            if attempt < self.settings.connect_attempts {
                tokio::time::sleep(self.settings.connect_retry_delay).await;
            }
        }
        Err(last_err)
    }

    /// Connect if needed; a fresh stream gets a clean session and a handshake
    async fn ensure_connected(&mut self) -> bool {
        match self.connect().await {
            Ok(false) => true,
            Ok(true) => {
                self.on_connected().await;
                true
            }
            Err(e) => {
                error!(category = e.category(), error = %e, "Unable to reach pool");
                self.pending = None;
                self.requesting = false;
                self.store.reset_session();
                self.indicator.notify(StatusEvent::Disconnected);
                false
            }
        }
    }

    async fn on_connected(&mut self) {
        self.pending = None;
        self.queue.clear();
        self.lines.reset();
        self.last_rx_ms = self.now();
        if self.store.has_session() {
            self.store.reset_session();
        }
        self.indicator.notify(StatusEvent::Connected);
        self.request_handshake().await;
    }

    /// Send the handshake and hold `requesting` until the first notify
    async fn request_handshake(&mut self) {
        match self.send_handshake().await {
            Ok(()) => self.requesting = true,
            Err(e) => {
                warn!(error = %e, "Handshake send failed");
                self.requesting = false;
            }
        }
    }

    /// Send subscribe, authorize and suggest_difficulty with fresh ids
    pub async fn send_handshake(&mut self) -> Result<()> {
        self.authorized = false;

        let id = self.ids.next();
        let request = StratumRequest::subscribe(id, &self.settings.agent);
        self.send(&request).await?;

        let id = self.ids.next();
        self.authorize_id = Some(id);
        let request = StratumRequest::authorize(id, &self.settings.user, &self.settings.password);
        self.send(&request).await?;

        let id = self.ids.next();
        self.suggest_id = Some(id);
        let request = StratumRequest::suggest_difficulty(id, self.settings.suggest_difficulty);
        self.send(&request).await
    }

    async fn send(&mut self, request: &StratumRequest) -> Result<()> {
        let line = request.to_line()?;
        self.send_line(&line).await
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        debug!(">>> {}", line.trim_end());
        self.transport.write_all(line.as_bytes()).await
    }

    /// Tear down the session and reconnect with a full handshake
    pub async fn restart_handshake(&mut self, reason: &str) {
        error!(reason, "Restarting handshake");

        self.pending = None;
        self.queue.clear();
        self.requesting = false;
        self.authorized = false;
        self.authorize_id = None;
        self.suggest_id = None;
        self.consecutive_low_diff = 0;
        self.focus_requested = false;

        self.store.reset_session();
        self.indicator.notify(StatusEvent::SessionReset);
        self.transport.close();

        if !self.store.has_session() {
            self.ensure_connected().await;
        }
    }

    /// Ask for work unless a valid job exists or a request is outstanding
    pub async fn get_job(&mut self) -> JobRequest {
        if self.store.is_job_valid() {
            return JobRequest::Ready;
        }
        if self.requesting {
            return JobRequest::Pending;
        }

        self.requesting = true;
        match self.connect().await {
            Ok(true) => self.on_connected().await,
            Ok(false) => {
                if !self.store.has_session() {
                    self.request_handshake().await;
                }
            }
            Err(e) => {
                error!(category = e.category(), error = %e, "Unable to reach pool");
                self.requesting = false;
                self.pending = None;
                self.store.reset_session();
                self.indicator.notify(StatusEvent::Disconnected);
                return JobRequest::Failed;
            }
        }
        JobRequest::Requested
    }

    // Receive path

    /// Run the watchdogs, then consume and dispatch available data
    pub async fn poll(&mut self) {
        if !self.transport.is_connected() && !self.ensure_connected().await {
            return;
        }

        let now = self.now();
        let idle = now.saturating_sub(self.last_rx_ms);
        if idle >= self.settings.rx_idle_timeout_ms {
            error!(idle_ms = idle, pending = ?self.pending_submit(), "RX silent");
            self.restart_handshake("rx idle").await;
            return;
        }

        if let Some(pending) = self.pending {
            let waited = now.saturating_sub(pending.sent_at_ms);
            if waited >= self.settings.submit_timeout_ms {
                error!(id = pending.id, waited_ms = waited, "Submit reply timeout");
                self.pending = None;
                self.restart_handshake("submit reply timeout").await;
                return;
            }
        }

        let received = self.drain().await;

        if self.focus_requested {
            self.focus_window().await;
        }

        if self.settings.submit_mode == SubmitMode::Queued {
            self.flush_queue().await;
        }

        if !received {
            let now = self.now();
            let idle = now.saturating_sub(self.last_rx_ms);
            if idle > QUIET_LOG_MS && self.idle_log.allow(now) {
                debug!(idle_secs = idle / 1000, "Idle, still connected");
            }
        }
    }

    /// Consume every byte available right now; true if any arrived
    pub async fn drain(&mut self) -> bool {
        let mut buf = [0u8; READ_CHUNK];
        let mut received = false;

        loop {
            match self.transport.try_read(&mut buf) {
                Ok(ReadOutcome::Data(n)) => {
                    received = true;
                    self.last_rx_ms = self.now();
                    for line in self.lines.push(&buf[..n]) {
                        self.dispatch(&line).await;
                    }
                }
                Ok(ReadOutcome::Empty) => break,
                Ok(ReadOutcome::Closed) => {
                    if received {
                        warn!("Pool closed the connection");
                    }
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Read failed");
                    break;
                }
            }
        }
        received
    }

    /// Short burst of drains to catch a delayed difficulty change
    async fn focus_window(&mut self) {
        debug!("Listening for difficulty update");
        for _ in 0..FOCUS_ROUNDS {
            self.drain().await;
            tokio::time::sleep(FOCUS_INTERVAL).await;
        }
        self.consecutive_low_diff = 0;
        self.focus_requested = false;
    }

    async fn dispatch(&mut self, line: &str) {
        let inbound = match classify(line, self.authorize_id) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(category = e.category(), error = %e, "<<< dropped: {}", line);
                return;
            }
        };
        debug!(kind = inbound.kind(), "<<< {}", line);

        match inbound {
            Inbound::Subscribe(session) => self.store.set_session(session),
            Inbound::Notify(notification) => self.on_notify(notification),
            Inbound::SetDifficulty(value) => self.store.set_difficulty(value),
            Inbound::Authorize { id, result } => self.on_authorize(id, &result),
            Inbound::SubmitAccepted { id } | Inbound::SubmitRejected { id, .. }
                if Some(id) == self.suggest_id =>
            {
                debug!(id, "suggest_difficulty acknowledged");
            }
            Inbound::SubmitAccepted { id } => self.on_submit_accepted(id),
            Inbound::SubmitRejected { id, code, failure } => {
                self.on_submit_rejected(id, code, failure).await
            }
            Inbound::Unknown => debug!("Ignoring unrecognised message"),
        }
    }

    fn on_authorize(&mut self, id: u64, result: &Value) {
        self.authorized = true;
        if result.as_bool() == Some(true) {
            info!(id, user = %self.settings.user, "Authorized");
        } else {
            warn!(id, %result, "Authorization not confirmed by pool");
        }
    }

    fn on_notify(&mut self, notification: Notification) {
        if !self.store.has_session() {
            warn!(job_id = %notification.job_id, "Notify without session");
            return;
        }

        if self.store.current_job_id().as_deref() == Some(notification.job_id.as_str()) {
            debug!(job_id = %notification.job_id, "Duplicate notify");
            return;
        }

        if notification.clean_jobs {
            if let Some(pending) = self.pending.take() {
                info!(id = pending.id, "Clean jobs: abandoning pending submit");
            }
        }

        self.request_job_id = self.ids.next();
        if let Err(e) = self.store.set_job(&notification) {
            error!(job_id = %notification.job_id, error = %e, "Job construction failed");
            self.store.defensive_reset(&e);
        }
        self.requesting = false;
    }

    fn release_pending(&mut self, id: u64) {
        if self.pending.is_some_and(|p| p.id == id) {
            self.pending = None;
        }
    }

    fn on_submit_accepted(&mut self, id: u64) {
        self.release_pending(id);
        self.store.increment_accepted();
        self.consecutive_low_diff = 0;
        self.indicator.notify(StatusEvent::ShareAccepted);
        info!(id, "Share accepted");
    }

    async fn on_submit_rejected(&mut self, id: u64, code: Option<i64>, failure: SubmitFailure) {
        self.release_pending(id);
        let rejection = rejection_error(id, code, failure);

        match failure {
            SubmitFailure::LowDifficulty => {
                self.store.increment_rejected();
                self.consecutive_low_diff += 1;
                warn!(category = rejection.category(), streak = self.consecutive_low_diff, "{}", rejection);
                if self.consecutive_low_diff >= LOW_DIFF_STREAK {
                    self.focus_requested = true;
                }
            }
            SubmitFailure::Unauthorized => {
                self.store.increment_rejected();
                error!(category = rejection.category(), "{}", rejection);
                self.restart_handshake("unauthorized").await;
            }
            SubmitFailure::JobNotFound | SubmitFailure::Other => {
                if id < self.request_job_id {
                    info!(request_job_id = self.request_job_id, "Late reply for previous job ignored: {}", rejection);
                    return;
                }
                error!(category = rejection.category(), "{}", rejection);
                self.store.invalidate_job();
                self.store.increment_rejected();
            }
        }
    }

    // Submit path

    /// Submit a share under the configured submit mode
    pub async fn submit(&mut self, job_id: &str, extranonce2: &str, ntime: &str, nonce: u32) -> SubmitOutcome {
        if self.settings.submit_mode == SubmitMode::Queued {
            return self.enqueue_submit(job_id, extranonce2, ntime, nonce);
        }

        if let Some(pending) = self.pending {
            let now = self.now();
            if self.busy_log.allow(now) {
                debug!(pending_id = pending.id, "Backpressure: awaiting submit reply");
            }
            self.drain().await;
            return SubmitOutcome::Busy;
        }

        let id = self.ids.next();
        let request = StratumRequest::submit(id, &self.settings.user, job_id, extranonce2, ntime, nonce);
        if let Err(e) = self.send(&request).await {
            warn!(id, error = %e, "Submit send failed");
            return SubmitOutcome::Dropped;
        }

        // Track before draining so an immediate reply releases it
        self.pending = Some(PendingSubmit {
            id,
            sent_at_ms: self.now(),
        });
        info!(id, job_id, nonce = %format!("{:08x}", nonce), "Share submitted");
        self.drain().await;
        SubmitOutcome::Sent(id)
    }

    /// Append a submit to the bounded queue
    pub fn enqueue_submit(&mut self, job_id: &str, extranonce2: &str, ntime: &str, nonce: u32) -> SubmitOutcome {
        let id = self.ids.next();
        let request = StratumRequest::submit(id, &self.settings.user, job_id, extranonce2, ntime, nonce);
        let payload = match request.to_line() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id, error = %e, "Submit encoding failed");
                return SubmitOutcome::Dropped;
            }
        };

        match self.queue.push(id, payload) {
            Ok(()) => SubmitOutcome::Queued(id),
            Err(_) => SubmitOutcome::Dropped,
        }
    }

    /// Send every queued submit, oldest first
    pub async fn flush_queue(&mut self) {
        while let Some(entry) = self.queue.front().cloned() {
            if let Err(e) = self.send_line(&entry.payload).await {
                warn!(id = entry.id, error = %e, "Queued submit send failed");
                break;
            }
            self.queue.remove(entry.id);
        }
    }
}

/// Rejection as an error value; code -1 when the pool sent none
fn rejection_error(id: u64, code: Option<i64>, failure: SubmitFailure) -> Error {
    Error::pool_rejection(id, code.unwrap_or(-1), failure.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::stratum::messages::lines;
    use crate::testing::{MockTransport, RecordingIndicator};
    use assert_matches::assert_matches;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<JobSessionStore>,
        transport: MockTransport,
        indicator: Arc<RecordingIndicator>,
        conn: PoolConnection<MockTransport>,
    }

    fn settings() -> PoolSettings {
        PoolSettings {
            host: "pool.test".to_string(),
            port: 3333,
            user: "wallet.w1".to_string(),
            password: "x".to_string(),
            agent: "LeafLine/test".to_string(),
            suggest_difficulty: 0.001,
            submit_mode: SubmitMode::Backpressure,
            submit_timeout_ms: SUBMIT_TIMEOUT_MS,
            rx_idle_timeout_ms: RX_IDLE_TIMEOUT_MS,
            network_attempts: 2,
            connect_attempts: 2,
            connect_retry_delay: Duration::ZERO,
        }
    }

    fn harness_with(settings: PoolSettings) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(JobSessionStore::new(clock.clone()));
        let transport = MockTransport::new();
        let indicator = Arc::new(RecordingIndicator::default());
        let conn = PoolConnection::new(transport.clone(), settings, store.clone(), indicator.clone());
        Harness {
            clock,
            store,
            transport,
            indicator,
            conn,
        }
    }

    /// Handshake ids 1..=3, first notify takes request id 4
    async fn ready() -> Harness {
        let mut h = harness_with(settings());
        assert_eq!(h.conn.get_job().await, JobRequest::Requested);
        h.transport.push_line(lines::SUBSCRIBE_OK);
        h.transport.push_line(&lines::result(2, true));
        h.transport.push_line(&lines::result(3, true));
        h.transport.push_line(&lines::notify("j1", false));
        h.conn.poll().await;
        assert_eq!(h.conn.phase(), ConnectionPhase::Ready);
        assert!(h.store.is_job_valid());
        h.transport.take_written();
        h
    }

    #[test]
    fn test_request_ids_wrap_to_one() {
        let mut ids = RequestIds { last: u64::MAX - 1 };
        assert_eq!(ids.next(), u64::MAX);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[tokio::test]
    async fn test_handshake_order_and_ids() {
        let mut h = harness_with(settings());
        assert_eq!(h.conn.phase(), ConnectionPhase::Disconnected);
        assert_eq!(h.conn.get_job().await, JobRequest::Requested);
        assert_eq!(h.conn.phase(), ConnectionPhase::Handshaking);

        let written = h.transport.written_requests();
        let methods: Vec<_> = written.iter().map(|r| r.method.as_str()).collect();
        assert_eq!(
            methods,
            vec!["mining.subscribe", "mining.authorize", "mining.suggest_difficulty"]
        );
        assert_eq!(written.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(written[0].params[0], "LeafLine/test");
        assert_eq!(h.indicator.events(), vec![StatusEvent::Connected]);

        // Outstanding request, no duplicate handshake
        assert_eq!(h.conn.get_job().await, JobRequest::Pending);
        assert_eq!(h.transport.written_requests().len(), 3);
    }

    #[tokio::test]
    async fn test_connect_failure_resets_and_signals() {
        let mut h = harness_with(settings());
        h.transport.fail_connects(2);
        assert_eq!(h.conn.get_job().await, JobRequest::Failed);
        assert_eq!(h.transport.connect_attempts(), 2);
        assert_eq!(h.indicator.events(), vec![StatusEvent::Disconnected]);
        assert!(!h.store.has_session());

        // Not left requesting, so the next call retries
        assert_eq!(h.conn.get_job().await, JobRequest::Requested);
    }

    #[tokio::test]
    async fn test_network_retry_then_connects() {
        let mut h = harness_with(settings());
        h.transport.fail_network(1);
        assert_eq!(h.conn.get_job().await, JobRequest::Requested);
        assert_eq!(h.transport.connect_attempts(), 1);
        assert_eq!(h.conn.phase(), ConnectionPhase::Handshaking);
    }

    #[tokio::test]
    async fn test_unreachable_network_skips_connect() {
        let mut h = harness_with(settings());
        h.transport.fail_network(2);
        assert_eq!(h.conn.get_job().await, JobRequest::Failed);
        assert_eq!(h.transport.connect_attempts(), 0);
        assert_eq!(h.indicator.events(), vec![StatusEvent::Disconnected]);
        assert!(h.transport.written_requests().is_empty());
    }

    #[tokio::test]
    async fn test_ready_flow() {
        let h = ready().await;
        assert!(h.conn.is_authorized());
        assert_eq!(h.store.session().unwrap().extranonce1, "f000000f");
        assert_eq!(h.store.current_job_id().as_deref(), Some("j1"));
        // Reply to suggest_difficulty is not a share result
        assert_eq!(h.store.stats().accepted, 0);
        assert!(!h.conn.is_degraded());
    }

    #[tokio::test]
    async fn test_notify_with_eight_params_dropped() {
        let mut h = ready().await;
        let before = h.store.current_job().unwrap();
        h.transport.push_line(
            r#"{"id":null,"method":"mining.notify","params":["j2","00","01","ff",[],"20000000","1d00ffff","5f5e1000"]}"#,
        );
        h.conn.poll().await;
        assert!(h.store.is_current(&before));
        assert_eq!(h.store.stats().jobs_processed, 1);
    }

    #[tokio::test]
    async fn test_duplicate_notify_ignored() {
        let mut h = ready().await;
        let before = h.store.current_job().unwrap();
        h.transport.push_line(&lines::notify("j1", true));
        h.conn.poll().await;
        assert!(h.store.is_current(&before));
    }

    #[tokio::test]
    async fn test_notify_without_session_dropped() {
        let mut h = harness_with(settings());
        h.conn.get_job().await;
        h.transport.push_line(&lines::notify("j1", false));
        h.conn.poll().await;
        assert!(!h.store.has_job());
    }

    #[tokio::test]
    async fn test_set_difficulty() {
        let mut h = ready().await;
        h.transport
            .push_line(r#"{"id":null,"method":"mining.set_difficulty","params":[0.000244140625]}"#);
        h.conn.poll().await;
        assert_eq!(h.store.difficulty(), 0.000244140625);
    }

    #[tokio::test]
    async fn test_submit_backpressure() {
        let mut h = ready().await;
        assert_eq!(h.conn.submit("j1", "00000000", "5f5e1000", 7).await, SubmitOutcome::Sent(5));
        assert_eq!(h.conn.pending_submit(), Some(5));
        assert!(h.conn.is_degraded());

        assert_eq!(h.conn.submit("j1", "00000000", "5f5e1000", 8).await, SubmitOutcome::Busy);
        let submits = h.transport.written_requests();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].params[4], "00000007");

        h.transport.push_line(&lines::result(5, true));
        h.conn.poll().await;
        assert_eq!(h.conn.pending_submit(), None);
        assert_eq!(h.store.stats().accepted, 1);
        assert_eq!(h.indicator.events().last(), Some(&StatusEvent::ShareAccepted));
    }

    #[tokio::test]
    async fn test_immediate_reply_releases_pending() {
        let mut h = ready().await;
        h.transport.push_line(&lines::result(5, true));
        assert_eq!(h.conn.submit("j1", "00000000", "5f5e1000", 7).await, SubmitOutcome::Sent(5));
        assert_eq!(h.conn.pending_submit(), None);
        assert_eq!(h.store.stats().accepted, 1);
    }

    #[tokio::test]
    async fn test_low_difficulty_keeps_job() {
        let mut h = ready().await;
        h.conn.submit("j1", "00000000", "5f5e1000", 7).await;
        h.transport.push_line(&lines::error(5, 23));
        h.conn.poll().await;

        assert_eq!(h.store.stats().rejected, 1);
        assert_eq!(h.conn.pending_submit(), None);
        assert!(h.store.is_job_valid());
    }

    #[tokio::test]
    async fn test_low_difficulty_streak_opens_focus_window() {
        let mut h = ready().await;
        for _ in 0..LOW_DIFF_STREAK {
            let SubmitOutcome::Sent(id) = h.conn.submit("j1", "00000000", "5f5e1000", 7).await else {
                panic!("submit not sent");
            };
            h.transport.push_line(&lines::error(id, 23));
            h.conn.drain().await;
        }
        assert!(h.conn.focus_requested);

        h.transport
            .push_line(r#"{"id":null,"method":"mining.set_difficulty","params":[2]}"#);
        h.conn.poll().await;
        assert!(!h.conn.focus_requested);
        assert_eq!(h.conn.consecutive_low_diff, 0);
        assert_eq!(h.store.difficulty(), 2.0);
        assert_eq!(h.store.stats().rejected, 3);
    }

    #[test]
    fn test_rejection_error() {
        let err = rejection_error(5, Some(23), SubmitFailure::LowDifficulty);
        assert_eq!(err.category(), "pool_rejection");
        assert_eq!(err.to_string(), "Pool rejected request 5 with code 23: difficulty too low");

        let err = rejection_error(6, None, SubmitFailure::Other);
        assert_matches!(err, Error::PoolRejection { id: 6, code: -1, .. });
    }

    #[tokio::test]
    async fn test_late_job_not_found_ignored() {
        let mut h = ready().await;
        // Request id 5 for the submit, then a new job takes id 6
        h.conn.submit("j1", "00000000", "5f5e1000", 7).await;
        h.transport.push_line(&lines::notify("j2", false));
        h.transport.push_line(&lines::error(5, 21));
        h.conn.poll().await;

        assert!(h.store.is_job_valid());
        assert_eq!(h.store.current_job_id().as_deref(), Some("j2"));
        assert_eq!(h.store.stats().rejected, 0);
        assert_eq!(h.conn.pending_submit(), None);
    }

    #[tokio::test]
    async fn test_current_job_not_found_invalidates() {
        let mut h = ready().await;
        h.conn.submit("j1", "00000000", "5f5e1000", 7).await;
        h.transport.push_line(&lines::error(5, 21));
        h.conn.poll().await;

        assert!(h.store.has_job());
        assert!(!h.store.is_job_valid());
        assert_eq!(h.store.stats().rejected, 1);
        assert_eq!(h.conn.get_job().await, JobRequest::Requested);
    }

    #[tokio::test]
    async fn test_unauthorized_restarts_handshake() {
        let mut h = ready().await;
        h.conn.submit("j1", "00000000", "5f5e1000", 7).await;
        h.transport.take_written();
        h.transport.push_line(&lines::error(5, 24));
        h.conn.poll().await;

        assert_eq!(h.store.stats().rejected, 1);
        assert!(!h.store.has_job());
        assert_eq!(h.conn.pending_submit(), None);
        assert_eq!(h.transport.connect_attempts(), 2);

        let methods: Vec<_> = h
            .transport
            .written_requests()
            .into_iter()
            .map(|r| r.method)
            .collect();
        assert_eq!(
            methods,
            vec!["mining.subscribe", "mining.authorize", "mining.suggest_difficulty"]
        );
        assert_eq!(h.conn.phase(), ConnectionPhase::Handshaking);
    }

    #[tokio::test]
    async fn test_clean_jobs_abandons_pending() {
        let mut h = ready().await;
        h.conn.submit("j1", "00000000", "5f5e1000", 7).await;
        h.transport.push_line(&lines::notify("j2", true));
        h.conn.poll().await;

        assert_eq!(h.conn.pending_submit(), None);
        assert_eq!(h.store.stats().accepted, 0);
        assert_eq!(h.store.stats().rejected, 0);
        assert_eq!(h.store.current_job_id().as_deref(), Some("j2"));
    }

    #[tokio::test]
    async fn test_submit_timeout_restarts() {
        let mut h = ready().await;
        h.conn.submit("j1", "00000000", "5f5e1000", 7).await;
        h.clock.advance(SUBMIT_TIMEOUT_MS - 1);
        h.conn.poll().await;
        assert_eq!(h.conn.pending_submit(), Some(5));

        h.clock.advance(1);
        h.conn.poll().await;
        assert_eq!(h.conn.pending_submit(), None);
        assert!(!h.store.has_session());
        assert!(h.indicator.events().contains(&StatusEvent::SessionReset));
    }

    #[tokio::test]
    async fn test_rx_idle_restarts() {
        let mut h = ready().await;
        h.transport.take_written();
        h.clock.advance(RX_IDLE_TIMEOUT_MS);
        h.conn.poll().await;

        assert!(!h.store.has_job());
        assert_eq!(h.transport.written_requests().len(), 3);

        // Fresh RX timestamp, no immediate second restart
        h.transport.take_written();
        h.conn.poll().await;
        assert!(h.transport.written_requests().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_replies_after_restart_not_counted() {
        let mut h = ready().await;
        h.clock.advance(RX_IDLE_TIMEOUT_MS);
        h.conn.poll().await;

        // Handshake already outstanding, no second set
        assert_eq!(h.conn.get_job().await, JobRequest::Pending);
        let ids: Vec<_> = h.transport.written_requests().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 6, 7]);

        h.transport.push_line(lines::SUBSCRIBE_OK);
        h.transport.push_line(&lines::result(6, true));
        h.transport.push_line(&lines::result(7, true));
        h.conn.poll().await;

        assert!(h.conn.is_authorized());
        assert_eq!(h.store.stats().accepted, 0);
        assert_eq!(h.store.stats().rejected, 0);
        assert!(!h.indicator.events().contains(&StatusEvent::ShareAccepted));
        assert_eq!(h.conn.get_job().await, JobRequest::Pending);

        h.transport.push_line(&lines::notify("j2", false));
        h.conn.poll().await;
        assert!(h.store.is_job_valid());
        assert_eq!(h.conn.get_job().await, JobRequest::Ready);
    }

    #[tokio::test]
    async fn test_peer_hangup_reconnects_on_poll() {
        let mut h = ready().await;
        h.transport.hang_up();
        h.conn.poll().await;

        assert!(!h.store.has_session());
        assert_eq!(h.transport.connect_attempts(), 2);
        assert_eq!(h.conn.phase(), ConnectionPhase::Handshaking);

        assert_eq!(h.conn.get_job().await, JobRequest::Pending);
        assert_eq!(h.transport.written_requests().len(), 3);
    }

    #[tokio::test]
    async fn test_queued_submits_flush_in_order() {
        let mut settings = settings();
        settings.submit_mode = SubmitMode::Queued;
        let mut h = harness_with(settings);
        h.conn.get_job().await;
        h.transport.take_written();

        assert_matches!(h.conn.submit("j1", "00", "5f5e1000", 1).await, SubmitOutcome::Queued(4));
        assert_matches!(h.conn.submit("j1", "00", "5f5e1000", 1).await, SubmitOutcome::Queued(5));
        assert_eq!(h.conn.queued_submits(), 2);

        h.conn.poll().await;
        assert_eq!(h.conn.queued_submits(), 0);
        let ids: Vec<_> = h.transport.written_requests().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_queue_drops_when_full() {
        let mut settings = settings();
        settings.submit_mode = SubmitMode::Queued;
        let mut h = harness_with(settings);
        for _ in 0..crate::stratum::queue::QUEUE_CAPACITY {
            assert_matches!(h.conn.enqueue_submit("j1", "00", "5f5e1000", 1), SubmitOutcome::Queued(_));
        }
        assert_eq!(h.conn.enqueue_submit("j1", "00", "5f5e1000", 1), SubmitOutcome::Dropped);
    }
}
