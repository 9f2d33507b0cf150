//! Backend over a simple network cache with per-key expiry and no key
//! enumeration (memcached and protocol-compatible servers).
//!
//! Without a scan primitive, path and pattern invalidation cannot be
//! expressed and fail with [`BackendError::Unsupported`]. [`clear`] removes
//! the keys this handle wrote that have not expired yet; entries written by
//! other processes under the same namespace are left to expire.
//!
//! [`clear`]: CacheBackend::clear

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::{BackendError, CacheBackend, CacheEntry, Namespace, record};
use crate::clock::{self, Clock};
use crate::config::CacheConfig;
use crate::key::CacheKey;

/// Longest key the protocol accepts.
pub const MAX_KEY_LEN: usize = 250;

/// Relative expiry times above this are read by the server as Unix
/// timestamps.
const RELATIVE_EXPIRY_LIMIT: u64 = 60 * 60 * 24 * 30;

/// Written-key index size below which expired keys are not pruned.
const PRUNE_FLOOR: usize = 64;

/// Primitive commands of the store.
#[async_trait]
pub trait MemcacheClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// `set <key> 0 <exptime>`; an `exptime` of zero never expires.
    async fn set(&self, key: &str, value: Vec<u8>, exptime: u32) -> Result<(), BackendError>;

    async fn delete(&self, key: &str) -> Result<bool, BackendError>;
}

#[async_trait]
impl<T: MemcacheClient + ?Sized> MemcacheClient for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, exptime: u32) -> Result<(), BackendError> {
        (**self).set(key, value, exptime).await
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        (**self).delete(key).await
    }
}

/// Wire keys this handle wrote, with the instant the server drops each one
/// (`None` for keys without expiry).
#[derive(Debug)]
struct WrittenKeys {
    deadlines: HashMap<String, Option<SystemTime>>,
    prune_at: usize,
}

impl Default for WrittenKeys {
    fn default() -> Self {
        Self {
            deadlines: HashMap::new(),
            prune_at: PRUNE_FLOOR,
        }
    }
}

impl WrittenKeys {
    /// Records a write. Once the index reaches `prune_at`, keys the server
    /// has already expired are dropped and the threshold doubles from the
    /// surviving size, so pruning stays amortized O(1) per write.
    fn insert(&mut self, wire_key: String, deadline: Option<SystemTime>, now: SystemTime) {
        self.deadlines.insert(wire_key, deadline);
        if self.deadlines.len() >= self.prune_at {
            self.prune(now);
            self.prune_at = (self.deadlines.len() * 2).max(PRUNE_FLOOR);
        }
    }

    fn prune(&mut self, now: SystemTime) {
        self.deadlines
            .retain(|_, deadline| deadline.is_none_or(|at| now < at));
    }
}

/// [`CacheBackend`] over a [`MemcacheClient`].
pub struct MemcacheBackend<C> {
    client: C,
    namespace: Namespace,
    clock: Arc<dyn Clock>,
    written: Mutex<WrittenKeys>,
}

impl<C: MemcacheClient> MemcacheBackend<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            namespace: Namespace::default(),
            clock: clock::system(),
            written: Mutex::default(),
        }
    }

    pub fn from_config(client: C, config: &CacheConfig) -> Self {
        Self::new(client).namespace(config.namespace.as_str())
    }

    #[must_use]
    pub fn namespace(mut self, prefix: impl Into<String>) -> Self {
        self.namespace = Namespace::new(prefix);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Number of keys `clear` would currently try to delete.
    pub async fn tracked_keys(&self) -> usize {
        self.written.lock().await.deadlines.len()
    }

    /// The key sent over the wire. Keys the protocol would reject are
    /// replaced by the namespace plus the hex SHA-256 of the logical key.
    fn wire_key(&self, key: &CacheKey) -> String {
        let physical = self.namespace.physical(key);
        if is_valid_key(&physical) {
            return physical;
        }
        let digest = Sha256::digest(key.as_str().as_bytes());
        format!("{}{digest:x}", self.namespace.as_str())
    }

    fn exptime(&self, ttl: Option<Duration>) -> u32 {
        let Some(ttl) = ttl else {
            return 0;
        };
        // round up: a sub-second TTL must not become "never"
        let secs = ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0));
        let secs = if secs <= RELATIVE_EXPIRY_LIMIT {
            secs
        } else {
            let now = self
                .clock
                .now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            now.saturating_add(secs)
        };
        u32::try_from(secs).unwrap_or(u32::MAX)
    }

    fn unsupported(operation: &'static str) -> BackendError {
        BackendError::Unsupported {
            backend: "memcache",
            operation,
        }
    }
}

fn is_valid_key(key: &str) -> bool {
    key.len() <= MAX_KEY_LEN && !key.bytes().any(|b| b <= b' ' || b == 0x7f)
}

#[async_trait]
impl<C: MemcacheClient> CacheBackend for MemcacheBackend<C> {
    fn name(&self) -> &'static str {
        "memcache"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError> {
        match self.client.get(&self.wire_key(key)).await? {
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
        let wire_key = self.wire_key(key);
        let raw = record::encode(&entry)?;
        self.client.set(&wire_key, raw, self.exptime(ttl)).await?;
        let now = self.clock.now();
        let deadline = ttl.and_then(|ttl| now.checked_add(ttl));
        self.written.lock().await.insert(wire_key, deadline, now);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, BackendError> {
        let wire_key = self.wire_key(key);
        let existed = self.client.delete(&wire_key).await?;
        self.written.lock().await.deadlines.remove(&wire_key);
        Ok(existed)
    }

    async fn delete_path(&self, _path: &str) -> Result<usize, BackendError> {
        Err(Self::unsupported("delete_path"))
    }

    async fn delete_pattern(&self, _pattern: &str) -> Result<usize, BackendError> {
        Err(Self::unsupported("delete_pattern"))
    }

    async fn clear(&self) -> Result<usize, BackendError> {
        let written: Vec<(String, Option<SystemTime>)> = {
            let mut index = self.written.lock().await;
            index.prune(self.clock.now());
            index.deadlines.drain().collect()
        };
        let mut removed = 0;
        for (i, (wire_key, _)) in written.iter().enumerate() {
            match self.client.delete(wire_key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    // keep what was not attempted so a retry can finish
                    self.written
                        .lock()
                        .await
                        .deadlines
                        .extend(written[i..].iter().cloned());
                    return Err(e);
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::SystemTime;

    use super::*;
    use crate::backend::test_support::entry;
    use crate::clock::ManualClock;
    use crate::http::Method;
    use crate::key::derive;

    #[derive(Default)]
    struct FakeMemcache {
        data: Mutex<HashMap<String, (Vec<u8>, u32)>>,
    }

    impl FakeMemcache {
        async fn exptime_of(&self, key: &str) -> Option<u32> {
            self.data.lock().await.get(key).map(|(_, exp)| *exp)
        }

        async fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.data.lock().await.keys().cloned().collect();
            keys.sort();
            keys
        }
    }

    #[async_trait]
    impl MemcacheClient for FakeMemcache {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            assert!(is_valid_key(key), "invalid memcache key {key:?}");
            Ok(self.data.lock().await.get(key).map(|(v, _)| v.clone()))
        }

        async fn set(&self, key: &str, value: Vec<u8>, exptime: u32) -> Result<(), BackendError> {
            assert!(is_valid_key(key), "invalid memcache key {key:?}");
            self.data
                .lock()
                .await
                .insert(key.to_owned(), (value, exptime));
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<bool, BackendError> {
            Ok(self.data.lock().await.remove(key).is_some())
        }
    }

    fn key(path: &str) -> CacheKey {
        derive(&Method::Get, "localhost", path, &[])
    }

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn backend(fake: &Arc<FakeMemcache>) -> MemcacheBackend<Arc<FakeMemcache>> {
        MemcacheBackend::new(Arc::clone(fake)).with_clock(Arc::new(ManualClock::at(now())))
    }

    #[tokio::test]
    async fn round_trip_with_relative_expiry() {
        let fake = Arc::new(FakeMemcache::default());
        let backend = backend(&fake);
        let e = entry("hello", now(), Some(Duration::from_secs(60)));

        backend
            .set(&key("/a"), e.clone(), Some(Duration::from_secs(90)))
            .await
            .unwrap();
        assert_eq!(
            fake.exptime_of("cachex:GET|||localhost|||/a|||").await,
            Some(90)
        );
        assert_eq!(backend.get(&key("/a")).await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn expiry_encoding() {
        let fake = Arc::new(FakeMemcache::default());
        let backend = backend(&fake);

        assert_eq!(backend.exptime(None), 0);
        assert_eq!(backend.exptime(Some(Duration::from_millis(200))), 1);
        assert_eq!(
            backend.exptime(Some(Duration::from_secs(RELATIVE_EXPIRY_LIMIT))),
            2_592_000
        );
        assert_eq!(
            backend.exptime(Some(Duration::from_secs(RELATIVE_EXPIRY_LIMIT + 1))),
            1_700_000_000 + 2_592_001
        );
    }

    #[tokio::test]
    async fn out_of_range_ttls_saturate() {
        let fake = Arc::new(FakeMemcache::default());
        let backend = backend(&fake);

        assert_eq!(backend.exptime(Some(Duration::MAX)), u32::MAX);
        backend
            .set(&key("/far"), entry("x", now(), None), Some(Duration::MAX))
            .await
            .unwrap();
        assert_eq!(backend.tracked_keys().await, 1);
    }

    #[tokio::test]
    async fn expired_keys_leave_the_written_index() {
        let fake = Arc::new(FakeMemcache::default());
        let clock = ManualClock::at(now());
        let backend = MemcacheBackend::new(Arc::clone(&fake)).with_clock(Arc::new(clock.clone()));

        for i in 0..PRUNE_FLOOR - 1 {
            backend
                .set(&key(&format!("/short/{i}")), entry("x", now(), None), Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        assert_eq!(backend.tracked_keys().await, PRUNE_FLOOR - 1);

        clock.advance(Duration::from_secs(2));
        backend
            .set(&key("/kept"), entry("x", now(), None), None)
            .await
            .unwrap();
        assert_eq!(backend.tracked_keys().await, 1);

        // only the live key is deleted
        assert_eq!(backend.clear().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unusable_keys_are_hashed() {
        let fake = Arc::new(FakeMemcache::default());
        let backend = backend(&fake);
        let long = key(&format!("/{}", "x".repeat(300)));
        let spaced = key("/with space");

        for k in [&long, &spaced] {
            backend
                .set(k, entry("x", now(), None), None)
                .await
                .unwrap();
            assert!(backend.get(k).await.unwrap().is_some());
        }

        for stored in fake.keys().await {
            assert!(stored.starts_with("cachex:"));
            assert_eq!(stored.len(), "cachex:".len() + 64);
        }
    }

    #[tokio::test]
    async fn path_and_pattern_invalidation_are_unsupported() {
        let fake = Arc::new(FakeMemcache::default());
        let backend = backend(&fake);

        assert!(matches!(
            backend.delete_path("/a").await,
            Err(BackendError::Unsupported { operation: "delete_path", .. })
        ));
        assert!(matches!(
            backend.delete_pattern("*").await,
            Err(BackendError::Unsupported { operation: "delete_pattern", .. })
        ));
        assert!(matches!(
            backend.entries().await,
            Err(BackendError::Unsupported { operation: "entries", .. })
        ));
    }

    #[tokio::test]
    async fn clear_removes_only_keys_this_handle_wrote() {
        let fake = Arc::new(FakeMemcache::default());
        fake.set("cachex:someone-else", b"x".to_vec(), 0).await.unwrap();
        let backend = backend(&fake);
        for p in ["/a", "/b"] {
            backend.set(&key(p), entry("x", now(), None), None).await.unwrap();
        }
        backend.delete(&key("/b")).await.unwrap();

        assert_eq!(backend.clear().await.unwrap(), 1);
        assert_eq!(fake.keys().await, ["cachex:someone-else"]);
        assert_eq!(backend.clear().await.unwrap(), 0);
    }
}
