//! Stratum v1 message definitions
//!
//! Outbound requests are built as [`StratumRequest`] values and written as
//! one JSON object per line. Inbound lines are classified into [`Inbound`]
//! with a fixed precedence: subscribe reply shape first, then `method`
//! dispatch, then generic `{id, result, error}` replies.

use crate::job::{Notification, Session};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Error code sent for a share on an unknown job
pub const CODE_JOB_NOT_FOUND: i64 = 21;
/// Error code sent for a share below the pool difficulty
pub const CODE_LOW_DIFFICULTY: i64 = 23;
/// Error code sent when the worker is not authorized
pub const CODE_UNAUTHORIZED: i64 = 24;

/// Number of positional parameters in `mining.notify`
const NOTIFY_PARAMS: usize = 9;

/// Stratum protocol methods used by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumMethod {
    Subscribe,
    Authorize,
    SuggestDifficulty,
    Submit,
    Notify,
    SetDifficulty,
    Unknown(String),
}

impl StratumMethod {
    /// Parse method from string
    pub fn parse_method(s: &str) -> Self {
        match s {
            "mining.subscribe" => Self::Subscribe,
            "mining.authorize" => Self::Authorize,
            "mining.suggest_difficulty" => Self::SuggestDifficulty,
            "mining.submit" => Self::Submit,
            "mining.notify" => Self::Notify,
            "mining.set_difficulty" => Self::SetDifficulty,
            _ => Self::Unknown(s.to_string()),
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::Subscribe => "mining.subscribe",
            Self::Authorize => "mining.authorize",
            Self::SuggestDifficulty => "mining.suggest_difficulty",
            Self::Submit => "mining.submit",
            Self::Notify => "mining.notify",
            Self::SetDifficulty => "mining.set_difficulty",
            Self::Unknown(s) => s,
        }
    }
}

/// Outbound request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumRequest {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

impl StratumRequest {
    /// Create a new request
    pub fn new(id: u64, method: StratumMethod, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.as_str().to_string(),
            params,
        }
    }

    /// `mining.subscribe` with a `null` session to resume
    pub fn subscribe(id: u64, agent: &str) -> Self {
        Self::new(id, StratumMethod::Subscribe, vec![json!(agent), Value::Null])
    }

    pub fn authorize(id: u64, user: &str, password: &str) -> Self {
        Self::new(id, StratumMethod::Authorize, vec![json!(user), json!(password)])
    }

    pub fn suggest_difficulty(id: u64, difficulty: f64) -> Self {
        Self::new(id, StratumMethod::SuggestDifficulty, vec![json!(difficulty)])
    }

    /// `mining.submit`, nonce rendered as 8 lowercase hex digits
    pub fn submit(id: u64, user: &str, job_id: &str, extranonce2: &str, ntime: &str, nonce: u32) -> Self {
        Self::new(
            id,
            StratumMethod::Submit,
            vec![
                json!(user),
                json!(job_id),
                json!(extranonce2),
                json!(ntime),
                json!(format!("{:08x}", nonce)),
            ],
        )
    }

    /// Serialize as one line terminated by exactly one `\n`
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Classified submit failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitFailure {
    JobNotFound,
    LowDifficulty,
    Unauthorized,
    Other,
}

impl SubmitFailure {
    /// Map a pool error code to a failure kind
    pub fn from_code(code: Option<i64>) -> Self {
        match code {
            Some(CODE_JOB_NOT_FOUND) => Self::JobNotFound,
            Some(CODE_LOW_DIFFICULTY) => Self::LowDifficulty,
            Some(CODE_UNAUTHORIZED) => Self::Unauthorized,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for SubmitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::JobNotFound => "job not found",
            Self::LowDifficulty => "difficulty too low",
            Self::Unauthorized => "unauthorized",
            Self::Other => "rejected",
        };
        f.write_str(text)
    }
}

/// A classified inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to `mining.subscribe`
    Subscribe(Session),
    /// `mining.notify` with well-formed parameters
    Notify(Notification),
    /// `mining.set_difficulty`
    SetDifficulty(f64),
    /// Reply to the outstanding authorize request
    Authorize { id: u64, result: Value },
    /// Submit reply with `result: true`
    SubmitAccepted { id: u64 },
    /// Any other submit reply
    SubmitRejected {
        id: u64,
        code: Option<i64>,
        failure: SubmitFailure,
    },
    /// Anything else
    Unknown,
}

impl Inbound {
    /// Short name used in receive logs
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Subscribe(_) => "subscribe",
            Inbound::Notify(_) => "notify",
            Inbound::SetDifficulty(_) => "set_difficulty",
            Inbound::Authorize { .. } => "authorize",
            Inbound::SubmitAccepted { .. } => "submit_ok",
            Inbound::SubmitRejected { .. } => "submit_fail",
            Inbound::Unknown => "unknown",
        }
    }
}

/// Parse and classify one line
///
/// `authorize_id` is the id of the outstanding authorize request, if any.
/// Malformed subscribe replies and notify or set_difficulty messages with
/// the wrong parameter shape yield [`Error::Protocol`].
pub fn classify(line: &str, authorize_id: Option<u64>) -> Result<Inbound> {
    let value: Value = serde_json::from_str(line)?;
    let result = value.get("result");

    if let Some(result) = result {
        if is_subscribe_shape(result) {
            return parse_subscribe(result).map(Inbound::Subscribe);
        }
    }

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let params = value.get("params").and_then(Value::as_array);
        return match StratumMethod::parse_method(method) {
            StratumMethod::Notify => parse_notify(params).map(Inbound::Notify),
            StratumMethod::SetDifficulty => parse_set_difficulty(params).map(Inbound::SetDifficulty),
            _ => Ok(Inbound::Unknown),
        };
    }

    let Some(result) = result else {
        return Ok(Inbound::Unknown);
    };

    // Non-empty arrays that are not subscribe replies are not share results
    if result.as_array().is_some_and(|items| !items.is_empty()) {
        return Ok(Inbound::Unknown);
    }

    let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);
    if Some(id) == authorize_id {
        return Ok(Inbound::Authorize {
            id,
            result: result.clone(),
        });
    }

    if result.as_bool() == Some(true) {
        return Ok(Inbound::SubmitAccepted { id });
    }

    let code = value.get("error").and_then(error_code);
    Ok(Inbound::SubmitRejected {
        id,
        code,
        failure: SubmitFailure::from_code(code),
    })
}

/// `[[[...], ...], extranonce1, extranonce2_size]`
fn is_subscribe_shape(result: &Value) -> bool {
    result
        .as_array()
        .and_then(|items| items.first())
        .and_then(Value::as_array)
        .and_then(|subs| subs.first())
        .is_some_and(Value::is_array)
}

fn parse_subscribe(result: &Value) -> Result<Session> {
    let malformed = || Error::protocol(format!("malformed subscribe reply: {}", result));

    let id = result
        .get(0)
        .and_then(|subs| subs.get(0))
        .and_then(|sub| sub.get(1))
        .and_then(Value::as_str)
        .ok_or_else(malformed)?;
    let extranonce1 = result.get(1).and_then(Value::as_str).ok_or_else(malformed)?;
    let extranonce2_size = result.get(2).and_then(Value::as_u64).ok_or_else(malformed)?;

    Ok(Session::new(id, extranonce1, extranonce2_size as usize))
}

fn parse_notify(params: Option<&Vec<Value>>) -> Result<Notification> {
    let params = params.ok_or_else(|| Error::protocol("mining.notify without params"))?;
    if params.len() != NOTIFY_PARAMS {
        return Err(Error::protocol(format!(
            "mining.notify expects {} params, got {}",
            NOTIFY_PARAMS,
            params.len()
        )));
    }

    let string_at = |index: usize, name: &str| -> Result<String> {
        params[index]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::protocol(format!("mining.notify {} must be a string", name)))
    };

    let merkle_branch = params[4]
        .as_array()
        .ok_or_else(|| Error::protocol("mining.notify merkle_branch must be an array"))?
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::protocol("mining.notify merkle_branch items must be strings"))
        })
        .collect::<Result<Vec<_>>>()?;

    let clean_jobs = match &params[8] {
        Value::Bool(flag) => *flag,
        Value::Number(n) if n.as_u64() == Some(0) => false,
        Value::Number(n) if n.as_u64() == Some(1) => true,
        other => {
            return Err(Error::protocol(format!(
                "mining.notify clean_jobs must be a bool, got {}",
                other
            )))
        }
    };

    Ok(Notification {
        job_id: string_at(0, "job_id")?,
        prevhash: string_at(1, "prevhash")?,
        coinb1: string_at(2, "coinb1")?,
        coinb2: string_at(3, "coinb2")?,
        merkle_branch,
        version: string_at(5, "version")?,
        nbits: string_at(6, "nbits")?,
        ntime: string_at(7, "ntime")?,
        clean_jobs,
    })
}

fn parse_set_difficulty(params: Option<&Vec<Value>>) -> Result<f64> {
    match params.map(Vec::as_slice) {
        Some([value]) => value
            .as_f64()
            .ok_or_else(|| Error::protocol("mining.set_difficulty param must be numeric")),
        _ => Err(Error::protocol("mining.set_difficulty expects exactly one param")),
    }
}

/// Error code from `[code, message, data]` or `{"code": n, ...}`
fn error_code(error: &Value) -> Option<i64> {
    match error {
        Value::Array(items) => items.first().and_then(Value::as_i64),
        Value::Object(map) => map.get("code").and_then(Value::as_i64),
        _ => None,
    }
}
