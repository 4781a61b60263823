//! LeafLine Stratum Mining Client
//!
//! A lightweight stratum v1 pool-mining client for small CPUs:
//! - Subscribe/authorize/suggest handshake with watchdog-driven recovery
//! - Time-sliced double SHA-256 search against a lock-free job snapshot
//! - Cooperative single-task and threaded execution models
//! - Restart supervision when the pool stops answering shares

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod job;
pub mod logging;
pub mod status;
pub mod store;
pub mod stratum;
pub mod types;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use job::{Job, Notification, Session};
pub use store::{JobSessionStore, MinerStats};
pub use types::*;

/// Application information
pub const APP_NAME: &str = "leafline";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
