//! Utility functions and helpers
//!
//! Log rate limiting, restart backoff and formatting used by the
//! connection, the search scheduler and the coordinator.

/// Allows one event per interval, measured on the caller's clock
#[derive(Debug, Clone)]
pub struct LogThrottle {
    interval_ms: u64,
    last_ms: Option<u64>,
}

impl LogThrottle {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_ms: None,
        }
    }

    /// True when the event at `now_ms` should be emitted
    pub fn allow(&mut self, now_ms: u64) -> bool {
        match self.last_ms {
            Some(last) if now_ms.saturating_sub(last) < self.interval_ms => false,
            _ => {
                self.last_ms = Some(now_ms);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_ms = None;
    }
}

/// Exponential backoff for restart delays
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
    current_delay_ms: u64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
            current_delay_ms: initial_delay_ms,
            attempt: 0,
        }
    }

    /// Delay for this attempt; the next one grows up to the cap
    pub fn next_delay(&mut self) -> u64 {
        let delay = self.current_delay_ms;
        self.attempt += 1;
        self.current_delay_ms =
            ((self.current_delay_ms as f64 * self.multiplier) as u64).min(self.max_delay_ms);
        delay
    }

    pub fn reset(&mut self) {
        self.current_delay_ms = self.initial_delay_ms;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Format duration as a human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!(
            "{}h {}m {}s",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}

/// Share of accepted results, 0 when nothing was answered yet
pub fn acceptance_rate(accepted: u64, rejected: u64) -> f64 {
    let total = accepted + rejected;
    if total == 0 {
        0.0
    } else {
        accepted as f64 * 100.0 / total as f64
    }
}
