//! Test doubles shared across module tests

use crate::job::HEADER_LEN;
use crate::status::{StatusEvent, StatusIndicator};
use crate::stratum::messages::StratumRequest;
use crate::stratum::transport::{ReadOutcome, Transport};
use crate::worker::{Evaluation, HashEvaluator};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct MockState {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<String>,
    connected: bool,
    connect_failures: usize,
    network_failures: usize,
    connect_attempts: usize,
}

/// Scripted transport; clones share state so a test keeps a handle
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one inbound line; a newline is appended
    pub fn push_line(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.push_bytes(&bytes);
    }

    pub fn push_bytes(&self, bytes: &[u8]) {
        self.state.lock().inbound.push_back(bytes.to_vec());
    }

    /// Written lines since the last take
    pub fn take_written(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().written)
    }

    /// Written lines parsed as requests
    pub fn written_requests(&self) -> Vec<StratumRequest> {
        self.state
            .lock()
            .written
            .iter()
            .map(|line| serde_json::from_str(line.trim_end()).unwrap())
            .collect()
    }

    pub fn fail_connects(&self, n: usize) {
        self.state.lock().connect_failures = n;
    }

    pub fn fail_network(&self, n: usize) {
        self.state.lock().network_failures = n;
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Simulate the peer dropping the stream
    pub fn hang_up(&self) {
        self.state.lock().connected = false;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn ensure_network(&mut self, host: &str, _port: u16) -> Result<()> {
        let mut state = self.state.lock();
        if state.network_failures > 0 {
            state.network_failures -= 1;
            return Err(Error::transport(format!("{} unreachable", host)));
        }
        Ok(())
    }

    async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(Error::transport(format!("{}:{} refused", host, port)));
        }
        state.connected = true;
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn try_read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let mut state = self.state.lock();
        if !state.connected {
            return Ok(ReadOutcome::Closed);
        }
        let Some(mut chunk) = state.inbound.pop_front() else {
            return Ok(ReadOutcome::Empty);
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            state.inbound.push_front(chunk.split_off(n));
        }
        Ok(ReadOutcome::Data(n))
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(Error::transport("write on closed stream"));
        }
        state.written.push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }
}

/// Indicator that records every event
#[derive(Default)]
pub(crate) struct RecordingIndicator {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingIndicator {
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().clone()
    }
}

impl StatusIndicator for RecordingIndicator {
    fn notify(&self, event: StatusEvent) {
        self.events.lock().push(event);
    }
}

type EvalHook = Box<dyn FnMut(u64) + Send>;

/// Evaluator returning a fixed hash, reporting a hit on chosen calls
///
/// Calls are counted from 1. An optional hook runs before each evaluation
/// with the call number, which lets a test mutate the store mid-slice.
pub(crate) struct ScriptedEvaluator {
    pub calls: u64,
    hit_on: Option<u64>,
    hash: [u8; 32],
    hook: Option<EvalHook>,
}

impl ScriptedEvaluator {
    /// Never hits
    pub fn misses() -> Self {
        Self {
            calls: 0,
            hit_on: None,
            hash: [0xff; 32],
            hook: None,
        }
    }

    /// Hits on call `n` with `hash`
    pub fn hit_on(n: u64, hash: [u8; 32]) -> Self {
        Self {
            calls: 0,
            hit_on: Some(n),
            hash,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: impl FnMut(u64) + Send + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }
}

impl HashEvaluator for ScriptedEvaluator {
    fn evaluate(&mut self, _worker_id: usize, _header: &[u8; HEADER_LEN]) -> Evaluation {
        self.calls += 1;
        if let Some(hook) = self.hook.as_mut() {
            hook(self.calls);
        }
        Evaluation {
            hash: self.hash,
            nonce: self.calls as u32,
            hit: self.hit_on == Some(self.calls),
        }
    }
}
