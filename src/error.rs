//! Error handling for the stratum mining client
//!
//! Error types covering transport, protocol, pool rejection and state
//! failures. None of these cross the core's public operations as panics;
//! callers get either a `Result` or a simple outcome value.

use thiserror::Error;

/// Result type alias for mining client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the mining client
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Hex decoding errors
    #[error("Hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Connect/read/write failures on the pool transport
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Malformed or unexpected message shape from the pool
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The pool rejected a submission or authorization
    #[error("Pool rejected request {id} with code {code}: {message}")]
    PoolRejection { id: u64, code: i64, message: String },

    /// No accepted or rejected share for too long
    #[error("No share result for {idle_ms} ms")]
    Stale { idle_ms: u64 },

    /// A job was offered while no session exists
    #[error("No active session")]
    NoSession,

    /// Unexpected failure while building job or session state
    #[error("Internal error in {context}: {message}")]
    Internal { context: String, message: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a pool rejection error
    pub fn pool_rejection(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self::PoolRejection {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Check if the failed operation may succeed when retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Transport { .. } | Error::PoolRejection { .. }
        )
    }

    /// Whether this error ends the current mining run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Stale { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Hex(_) => "hex",
            Error::Config { .. } => "config",
            Error::Transport { .. } => "transport",
            Error::Protocol { .. } => "protocol",
            Error::PoolRejection { .. } => "pool_rejection",
            Error::Stale { .. } => "stale",
            Error::NoSession => "no_session",
            Error::Internal { .. } => "internal",
        }
    }
}
