//! Serialized form of a [`CacheEntry`] for stores that hold bytes.
//!
//! A JSON object with the body in standard base64 and timestamps as
//! fractional Unix seconds:
//!
//! ```json
//! {"etag":"W/\"...\"","content":"aGVsbG8=","expires_at":1700000060.0,
//!  "stored_at":1700000000.0,"status":200,"headers":[["content-type","text/plain"]],
//!  "directives":{...}}
//! ```
//!
//! Only `etag`, `content` and `expires_at` are required; records written by
//! older producers decode with defaults for the rest.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::{BackendError, CacheEntry};
use crate::directive::CachePolicy;
use crate::http::{Headers, StatusCode};

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    etag: String,
    content: String,
    expires_at: Option<f64>,
    #[serde(default)]
    stored_at: f64,
    #[serde(default = "default_status")]
    status: StatusCode,
    #[serde(default)]
    headers: Headers,
    #[serde(default)]
    directives: CachePolicy,
}

fn default_status() -> StatusCode {
    StatusCode::Ok
}

pub(crate) fn encode(entry: &CacheEntry) -> Result<Vec<u8>, BackendError> {
    let record = Record {
        etag: entry.etag.clone(),
        content: STANDARD.encode(&entry.content),
        expires_at: entry.expires_at.map(to_epoch),
        stored_at: to_epoch(entry.stored_at),
        status: entry.status,
        headers: entry.headers.clone(),
        directives: entry.directives.clone(),
    };
    Ok(serde_json::to_vec(&record)?)
}

pub(crate) fn decode(raw: &[u8]) -> Result<CacheEntry, BackendError> {
    let record: Record = serde_json::from_slice(raw)?;
    Ok(CacheEntry {
        content: STANDARD.decode(record.content.as_bytes())?.into(),
        expires_at: record.expires_at.map(from_epoch).transpose()?,
        stored_at: from_epoch(record.stored_at)?,
        etag: record.etag,
        status: record.status,
        headers: record.headers,
        directives: record.directives,
    })
}

fn to_epoch(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn from_epoch(secs: f64) -> Result<SystemTime, BackendError> {
    let offset = Duration::try_from_secs_f64(secs)
        .map_err(|err| BackendError::Serialization(format!("bad timestamp {secs}: {err}")))?;
    UNIX_EPOCH
        .checked_add(offset)
        .ok_or_else(|| BackendError::Serialization(format!("timestamp {secs} is out of range")))
}
