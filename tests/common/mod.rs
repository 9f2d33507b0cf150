#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use cachex::backend::{BackendError, KvClient, MemcacheClient};
use cachex::clock::ManualClock;
use tokio::sync::Mutex;

static TRACING: Once = Once::new();

/// Routes engine logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

pub fn t0() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

pub fn clock() -> ManualClock {
    ManualClock::at(t0())
}

/// Key-value store with redis-flavoured glob scans, paged two keys at a time.
#[derive(Default)]
pub struct FakeKv {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    pub sets: AtomicUsize,
    pub down: std::sync::atomic::AtomicBool,
}

impl FakeKv {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put_raw(&self, key: &str, value: &[u8]) {
        self.data.lock().await.insert(key.to_owned(), value.to_vec());
    }

    pub async fn keys(&self) -> Vec<String> {
        self.data.lock().await.keys().cloned().collect()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

fn redis_glob(pattern: &str, key: &str) -> bool {
    let mut translated = String::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    translated.push_str(&glob::Pattern::escape(&next.to_string()));
                }
            }
            _ => translated.push(c),
        }
    }
    glob::Pattern::new(&translated).is_ok_and(|p| p.matches(key))
}

#[async_trait]
impl KvClient for FakeKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.check()?;
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        _ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        self.check()?;
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.data.lock().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<usize, BackendError> {
        self.check()?;
        let mut data = self.data.lock().await;
        Ok(keys.iter().filter(|k| data.remove(*k).is_some()).count())
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        _count: usize,
    ) -> Result<(u64, Vec<String>), BackendError> {
        self.check()?;
        let data = self.data.lock().await;
        let start = usize::try_from(cursor).unwrap();
        let page: Vec<String> = data
            .keys()
            .skip(start)
            .take(2)
            .filter(|k| redis_glob(pattern, k))
            .cloned()
            .collect();
        let next = if start + 2 >= data.len() { 0 } else { cursor + 2 };
        Ok((next, page))
    }
}

#[derive(Default)]
pub struct FakeMemcache {
    data: Mutex<BTreeMap<String, (Vec<u8>, u32)>>,
}

impl FakeMemcache {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn keys(&self) -> Vec<String> {
        self.data.lock().await.keys().cloned().collect()
    }

    pub async fn exptime(&self, key: &str) -> Option<u32> {
        self.data.lock().await.get(key).map(|(_, exp)| *exp)
    }
}

#[async_trait]
impl MemcacheClient for FakeMemcache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.data.lock().await.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, exptime: u32) -> Result<(), BackendError> {
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
