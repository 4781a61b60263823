//! Stratum v1 client plumbing
//!
//! Message builders and the inbound classifier, line framing, the byte
//! transport, the bounded submit queue and the connection state machine.

pub mod connection;
pub mod framing;
pub mod messages;
pub mod queue;
pub mod transport;

pub use connection::{
    ConnectionPhase, JobRequest, PoolConnection, PoolSettings, RequestIds, SubmitOutcome,
};
pub use messages::{Inbound, StratumMethod, StratumRequest, SubmitFailure};
pub use transport::{ReadOutcome, TcpTransport, Transport};
