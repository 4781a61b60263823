//! Discrete status events for displays and indicator lights

use std::fmt;
use tracing::info;

/// Event emitted by the connection for an external indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// The pool accepted a share
    ShareAccepted,
    /// Transport connected and handshake sent
    Connected,
    /// Transport could not be (re)established
    Disconnected,
    /// Job and session were torn down
    SessionReset,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusEvent::ShareAccepted => "share_accepted",
            StatusEvent::Connected => "connected",
            StatusEvent::Disconnected => "disconnected",
            StatusEvent::SessionReset => "session_reset",
        };
        f.write_str(name)
    }
}

/// Consumer of status events (display, LED, ...)
pub trait StatusIndicator: Send + Sync {
    fn notify(&self, event: StatusEvent);
}

/// Indicator that only writes the event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIndicator;

impl StatusIndicator for LogIndicator {
    fn notify(&self, event: StatusEvent) {
        info!(event = %event, "status");
    }
}
