//! Bounded submit FIFO for transports that accept several in-flight writes
//!
//! Entries are keyed by request id, so two byte-identical payloads are
//! still distinct entries.

use std::collections::VecDeque;
use tracing::warn;

/// Default number of queued submissions
pub const QUEUE_CAPACITY: usize = 10;

/// Largest payload accepted into the queue, in bytes
pub const MAX_PAYLOAD_LEN: usize = 384;

/// A serialized submit waiting to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedSubmit {
    pub id: u64,
    pub payload: String,
}

/// Why an entry was not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    Full,
    TooLarge(usize),
}

#[derive(Debug)]
pub struct SubmitQueue {
    entries: VecDeque<QueuedSubmit>,
    capacity: usize,
}

impl SubmitQueue {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a payload; a full queue drops the new entry
    pub fn push(&mut self, id: u64, payload: String) -> Result<(), EnqueueError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            warn!(id, len = payload.len(), "Submit payload too large for queue");
            return Err(EnqueueError::TooLarge(payload.len()));
        }
        if self.entries.len() >= self.capacity {
            warn!(id, capacity = self.capacity, "Submit queue full, dropping");
            return Err(EnqueueError::Full);
        }
        self.entries.push_back(QueuedSubmit { id, payload });
        Ok(())
    }

    /// Oldest entry without removing it
    pub fn front(&self) -> Option<&QueuedSubmit> {
        self.entries.front()
    }

    /// Remove the entry with request id `id`
    pub fn remove(&mut self, id: u64) -> Option<QueuedSubmit> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        self.entries.remove(index)
    }

    /// Ids in send order
    pub fn ids(&self) -> Vec<u64> {
        self.entries.iter().map(|entry| entry.id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for SubmitQueue {
    fn default() -> Self {
        Self::new()
    }
}
