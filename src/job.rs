//! Session and job records
//!
//! A [`Session`] is the subscription context of one pool connection. A
//! [`Job`] is one notify worth of work, bound at construction to the session
//! whose extranonce1 it embeds.

use crate::crypto::{build_coinbase, merkle_root};
use crate::types::Target;
use crate::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fmt;

/// Length of a serialized block header
pub const HEADER_LEN: usize = 80;

/// Offset of the nonce within the header
pub const NONCE_OFFSET: usize = 76;

/// Subscription context returned by `mining.subscribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Subscription identifier
    pub id: String,
    /// Pool-assigned extranonce1 (hex)
    pub extranonce1: String,
    /// Byte length of the miner-chosen extranonce2
    pub extranonce2_size: usize,
}

impl Session {
    /// Create a session record
    pub fn new(id: impl Into<String>, extranonce1: impl Into<String>, extranonce2_size: usize) -> Self {
        Self {
            id: id.into(),
            extranonce1: extranonce1.into(),
            extranonce2_size,
        }
    }
}

/// Parameters of a validated `mining.notify`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub job_id: String,
    pub prevhash: String,
    pub coinb1: String,
    pub coinb2: String,
    pub merkle_branch: Vec<String>,
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    pub clean_jobs: bool,
}

/// A unit of work ready to be searched
///
/// Immutable after construction. Searchers hold it through an `Arc` for the
/// duration of one slice.
pub struct Job {
    job_id: String,
    ntime: String,
    extranonce2: String,
    header: [u8; HEADER_LEN],
    block_target: Target,
}

impl Job {
    /// Derive the header template and targets for `notification`
    pub fn build(notification: &Notification, session: &Session) -> Result<Self> {
        let extranonce2 = "00".repeat(session.extranonce2_size);
        let coinbase = build_coinbase(
            &notification.coinb1,
            &session.extranonce1,
            &extranonce2,
            &notification.coinb2,
        )?;
        let root = merkle_root(&coinbase, &notification.merkle_branch)?;

        let version = parse_u32_hex("version", &notification.version)?;
        let nbits = parse_u32_hex("nbits", &notification.nbits)?;
        let ntime = parse_u32_hex("ntime", &notification.ntime)?;
        let prevhash = decode_prevhash(&notification.prevhash)?;

        let mut writer = Vec::with_capacity(HEADER_LEN);
        writer.write_u32::<LittleEndian>(version)?;
        writer.extend_from_slice(&prevhash);
        writer.extend_from_slice(&root);
        writer.write_u32::<LittleEndian>(ntime)?;
        writer.write_u32::<LittleEndian>(nbits)?;
        writer.write_u32::<LittleEndian>(0)?;

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&writer);

        Ok(Self {
            job_id: notification.job_id.clone(),
            ntime: notification.ntime.clone(),
            extranonce2,
            header,
            block_target: Target::from_compact(nbits),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Time field as sent by the pool, echoed back on submit
    pub fn ntime(&self) -> &str {
        &self.ntime
    }

    /// Extranonce2 used for this job's coinbase (hex)
    pub fn extranonce2(&self) -> &str {
        &self.extranonce2
    }

    /// Header template with a zero nonce
    pub fn header(&self) -> &[u8; HEADER_LEN] {
        &self.header
    }

    /// Block-level target decoded from nbits
    pub fn block_target(&self) -> &Target {
        &self.block_target
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("job_id", &self.job_id)
            .field("ntime", &self.ntime)
            .field("header", &hex::encode(self.header))
            .finish()
    }
}

/// Write `nonce` into a copy of `header`
pub fn header_with_nonce(header: &[u8; HEADER_LEN], nonce: u32) -> [u8; HEADER_LEN] {
    let mut out = *header;
    out[NONCE_OFFSET..].copy_from_slice(&nonce.to_le_bytes());
    out
}

fn parse_u32_hex(field: &str, value: &str) -> Result<u32> {
    u32::from_str_radix(value, 16)
        .map_err(|e| Error::protocol(format!("invalid {} {:?}: {}", field, value, e)))
}

/// Stratum sends prevhash as eight 32-bit words, each byte-swapped
fn decode_prevhash(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)?;
    if bytes.len() != 32 {
        return Err(Error::protocol(format!(
            "prevhash must be 32 bytes, got {}",
            bytes.len()
        )));
    }

    let mut out = [0u8; 32];
    for (dst, src) in out.chunks_exact_mut(4).zip(bytes.chunks_exact(4)) {
        dst.copy_from_slice(src);
        dst.reverse();
    }
    Ok(out)
}
