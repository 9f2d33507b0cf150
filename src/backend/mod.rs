//! Storage backends for cached responses.
//!
//! Every backend implements the narrow [`CacheBackend`] contract and owns its
//! entries outright; callers only ever receive copies. Three variants ship:
//!
//! | Backend                         | Expiry              | `delete_path` / `delete_pattern` |
//! |---------------------------------|---------------------|----------------------------------|
//! | [`memory::MemoryBackend`]       | periodic sweep      | yes                              |
//! | [`kv::KvBackend`]               | native (store TTL)  | yes, via incremental `SCAN`      |
//! | [`memcache::MemcacheBackend`]   | native (exptime)    | no: [`BackendError::Unsupported`] |
//!
//! All physical keys live under a [`Namespace`] prefix. Invalidation and
//! `clear` only ever touch keys under that prefix, so several engines (or
//! unrelated applications) can share one store.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::directive::CachePolicy;
use crate::http::{Headers, StatusCode};
use crate::key::CacheKey;

pub mod kv;
pub mod memcache;
pub mod memory;
mod record;

pub use kv::{KvBackend, KvClient};
pub use memcache::{MemcacheBackend, MemcacheClient};
pub use memory::{MemoryBackend, SweepHandle};

/// Default namespace prefix.
pub const DEFAULT_NAMESPACE: &str = "cachex:";

/// Errors produced by storage backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The store could not be reached or refused the command.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// The variant has no primitive for the requested operation.
    #[error("`{operation}` is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// An entry could not be encoded for, or decoded from, the store.
    #[error("cache entry could not be serialized: {0}")]
    Serialization(String),

    #[error("invalid key pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for BackendError {
    fn from(err: base64::DecodeError) -> Self {
        BackendError::Serialization(err.to_string())
    }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub etag: String,
    pub content: Bytes,
    pub status: StatusCode,
    pub headers: Headers,
    pub stored_at: SystemTime,
    /// End of freshness; `None` means fresh until invalidated.
    pub expires_at: Option<SystemTime>,
    /// Policy the response was stored under.
    pub directives: CachePolicy,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.expires_at.is_none_or(|expires_at| now < expires_at)
    }

    /// Time since the entry was stored (zero if the clock went backwards).
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.stored_at).unwrap_or_default()
    }

    /// Freshness left, `None` for non-expiring entries.
    pub fn ttl_remaining(&self, now: SystemTime) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.duration_since(now).unwrap_or_default())
    }

    /// `true` when `now` falls before `expires_at + window`. A window
    /// reaching past the representable range never closes.
    pub fn within_grace(&self, window: Option<Duration>, now: SystemTime) -> bool {
        match (self.expires_at, window) {
            (Some(expires_at), Some(window)) => expires_at
                .checked_add(window)
                .is_none_or(|closes_at| now < closes_at),
            _ => false,
        }
    }
}

/// Prefix separating this engine's keys from co-tenants of a shared store.
///
/// Ownership is a plain prefix test, so a prefix should end in a delimiter:
/// `"app"` would also own every `"app2:..."` key, `"app:"` does not.
/// [`CacheConfig::validate`](crate::config::CacheConfig::validate) rejects
/// prefixes that don't.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    /// `true` when the prefix ends in a non-alphanumeric delimiter such as
    /// `:` or `/`, so it cannot swallow a sibling namespace.
    pub fn is_delimited(prefix: &str) -> bool {
        prefix
            .chars()
            .next_back()
            .is_some_and(|c| !c.is_alphanumeric())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key as written to the store.
    pub fn physical(&self, key: &CacheKey) -> String {
        format!("{}{}", self.0, key.as_str())
    }

    /// The cache key behind a physical key, or `None` for foreign keys.
    pub fn logical(&self, physical: &str) -> Option<CacheKey> {
        physical.strip_prefix(&self.0).map(CacheKey::from_raw)
    }

    pub fn owns(&self, physical: &str) -> bool {
        physical.starts_with(&self.0)
    }

    /// Drops the namespace from a caller's pattern if they already included it.
    pub fn relative<'a>(&self, pattern: &'a str) -> &'a str {
        pattern.strip_prefix(&self.0).unwrap_or(pattern)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

/// Capability contract shared by every storage variant.
///
/// Keys passed in and out are logical [`CacheKey`]s; namespacing is the
/// backend's concern. Patterns for [`delete_pattern`](Self::delete_pattern)
/// are globs over logical keys (`*`, `?`, `[...]`); a pattern that already
/// starts with the namespace is accepted too.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short variant name used in logs and errors.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError>;

    /// Writes an entry. With `ttl` set the store expires it on its own;
    /// without, the entry stays until invalidated.
    async fn set(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError>;

    /// Removes one entry, reporting whether it existed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, BackendError>;

    /// Removes every entry whose key path equals `path`, across methods,
    /// hosts and query strings.
    async fn delete_path(&self, path: &str) -> Result<usize, BackendError>;

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, BackendError>;

    /// Removes every entry under this backend's namespace.
    async fn clear(&self) -> Result<usize, BackendError>;

    /// Lists live entries under the namespace, ordered by key.
    async fn entries(&self) -> Result<Vec<(CacheKey, CacheEntry)>, BackendError> {
        Err(BackendError::Unsupported {
            backend: self.name(),
            operation: "entries",
        })
    }
}
