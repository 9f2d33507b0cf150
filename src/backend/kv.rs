//! Backend over a networked key-value store with native TTLs and cursor
//! scans (Redis, Valkey, KeyDB and friends).
//!
//! The wire protocol stays behind [`KvClient`]; this module only decides
//! which keys to read, write and scan. Entries are stored in the record
//! format of [`super::record`], and expiry is left to the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{BackendError, CacheBackend, CacheEntry, Namespace, record};
use crate::config::CacheConfig;
use crate::key::{self, CacheKey, SEPARATOR};

/// Default number of keys requested per `SCAN` round trip.
pub const DEFAULT_SCAN_BATCH: usize = 100;

/// Primitive commands of the store.
///
/// Patterns use the store's glob dialect (`*`, `?`, `[...]`, `\` escapes).
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// `SET key value [EX ttl]`.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError>;

    /// Deletes the keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<usize, BackendError>;

    /// One `SCAN cursor MATCH pattern COUNT count` step. A returned cursor of
    /// zero ends the iteration.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), BackendError>;
}

#[async_trait]
impl<T: KvClient + ?Sized> KvClient for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        (**self).get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        (**self).set(key, value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> Result<usize, BackendError> {
        (**self).del(keys).await
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), BackendError> {
        (**self).scan(cursor, pattern, count).await
    }
}

/// [`CacheBackend`] over a [`KvClient`].
pub struct KvBackend<C> {
    client: C,
    namespace: Namespace,
    scan_batch: usize,
}

impl<C: KvClient> KvBackend<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            namespace: Namespace::default(),
            scan_batch: DEFAULT_SCAN_BATCH,
        }
    }

    pub fn from_config(client: C, config: &CacheConfig) -> Self {
        Self::new(client)
            .namespace(config.namespace.as_str())
            .scan_batch_size(config.scan_batch_size)
    }

    #[must_use]
    pub fn namespace(mut self, prefix: impl Into<String>) -> Self {
        self.namespace = Namespace::new(prefix);
        self
    }

    #[must_use]
    pub fn scan_batch_size(mut self, count: usize) -> Self {
        self.scan_batch = count.max(1);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Store-side pattern for a glob over logical keys.
    fn scan_pattern(&self, relative: &str) -> String {
        format!("{}{}", escape_glob(self.namespace.as_str()), relative)
    }

    /// Walks the whole keyspace matching `pattern` and collects the logical
    /// keys accepted by `keep`.
    async fn scan_keys<F>(&self, pattern: &str, keep: F) -> Result<Vec<String>, BackendError>
    where
        F: Fn(&CacheKey) -> bool + Send + Sync,
    {
        let mut cursor = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch) = self.client.scan(cursor, pattern, self.scan_batch).await?;
            found.extend(batch.into_iter().filter(|physical| {
                self.namespace
                    .logical(physical)
                    .is_some_and(|key| keep(&key))
            }));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    async fn delete_matching<F>(&self, pattern: &str, keep: F) -> Result<usize, BackendError>
    where
        F: Fn(&CacheKey) -> bool + Send + Sync,
    {
        let doomed = self.scan_keys(pattern, keep).await?;
        if doomed.is_empty() {
            return Ok(0);
        }
        let mut removed = 0;
        for chunk in doomed.chunks(self.scan_batch) {
            removed += self.client.del(chunk).await?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl<C: KvClient> CacheBackend for KvBackend<C> {
    fn name(&self) -> &'static str {
        "kv"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError> {
        match self.client.get(&self.namespace.physical(key)).await? {
            Some(raw) => record::decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        let raw = record::encode(&entry)?;
        self.client
            .set(&self.namespace.physical(key), raw, ttl)
            .await
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, BackendError> {
        let removed = self.client.del(&[self.namespace.physical(key)]).await?;
        Ok(removed > 0)
    }

    async fn delete_path(&self, path: &str) -> Result<usize, BackendError> {
        let encoded = key::encode_component(path);
        let pattern = self.scan_pattern(&format!(
            "*{SEPARATOR}*{SEPARATOR}{}{SEPARATOR}*",
            escape_glob(&encoded)
        ));
        self.delete_matching(&pattern, |key| key.parts().path == path)
            .await
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, BackendError> {
        let pattern = self.scan_pattern(self.namespace.relative(pattern));
        self.delete_matching(&pattern, |_| true).await
    }

    async fn clear(&self) -> Result<usize, BackendError> {
        let pattern = self.scan_pattern("*");
        self.delete_matching(&pattern, |_| true).await
    }

    async fn entries(&self) -> Result<Vec<(CacheKey, CacheEntry)>, BackendError> {
        let pattern = self.scan_pattern("*");
        let physical_keys = self.scan_keys(&pattern, |_| true).await?;

        let mut live = Vec::with_capacity(physical_keys.len());
        for physical in physical_keys {
            let Some(key) = self.namespace.logical(&physical) else {
                continue;
            };
            // keys can expire between the scan and the read
            let Some(raw) = self.client.get(&physical).await? else {
                continue;
            };
            match record::decode(&raw) {
                Ok(entry) => live.push((key, entry)),
                Err(e) => warn!(key = %key, error = %e, "skipping undecodable entry"),
            }
        }
        live.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(live)
    }
}

fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
