//! Byte transport to the pool
//!
//! The connection state machine only needs a non-blocking read, a write
//! and connect/close. [`TcpTransport`] provides them over tokio's
//! `TcpStream`; tests substitute a scripted transport.

use crate::{Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Result of a non-blocking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the buffer
    Data(usize),
    /// Nothing available right now
    Empty,
    /// Peer closed the stream
    Closed,
}

/// Stream transport consumed by the pool connection
#[async_trait]
pub trait Transport: Send {
    /// Check that the pool host is reachable at the network level
    async fn ensure_network(&mut self, host: &str, port: u16) -> Result<()>;

    /// Open the stream; a single attempt
    async fn connect(&mut self, host: &str, port: u16) -> Result<()>;

    /// Drop the stream if open
    fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Copy whatever bytes are immediately available, never waiting
    fn try_read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome>;

    /// Write `data` completely
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;
}

/// TCP transport with a per-attempt connect timeout
pub struct TcpTransport {
    stream: Option<TcpStream>,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            stream: None,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn ensure_network(&mut self, host: &str, port: u16) -> Result<()> {
        let mut addrs = lookup_host((host, port))
            .await
            .map_err(|e| Error::transport(format!("cannot resolve {}: {}", host, e)))?;
        match addrs.next() {
            Some(addr) => {
                debug!(%addr, "Resolved pool host");
                Ok(())
            }
            None => Err(Error::transport(format!("no addresses for {}", host))),
        }
    }

    async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.close();
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::transport(format!("connect to {}:{} timed out", host, port)))?
            .map_err(|e| Error::transport(format!("connect to {}:{} failed: {}", host, port, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Failed to set TCP_NODELAY");
        }
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed pool stream");
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn try_read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(ReadOutcome::Closed);
        };

        match stream.try_read(buf) {
            Ok(0) => {
                self.stream = None;
                Ok(ReadOutcome::Closed)
            }
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(ReadOutcome::Empty),
            Err(e) => {
                self.stream = None;
                Err(Error::transport(format!("read failed: {}", e)))
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::transport("write on closed stream"));
        };

        if let Err(e) = stream.write_all(data).await {
            self.stream = None;
            return Err(Error::transport(format!("write failed: {}", e)));
        }
        Ok(())
    }
}
