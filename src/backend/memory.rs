//! In-process backend.
//!
//! Entries live in a `HashMap` behind a [`tokio::sync::RwLock`]. Expired
//! entries are invisible to [`get`](CacheBackend::get) as soon as their
//! deadline passes, but only leave memory when [`MemoryBackend::sweep`] runs,
//! either on demand or from the task started by
//! [`MemoryBackend::start_sweep`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use glob::Pattern;
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BackendError, CacheBackend, CacheEntry, Namespace};
use crate::clock::{self, Clock};
use crate::config::CacheConfig;
use crate::key::CacheKey;

#[derive(Debug, Clone)]
struct Slot {
    entry: CacheEntry,
    evict_at: Option<SystemTime>,
}

impl Slot {
    fn is_live(&self, now: SystemTime) -> bool {
        self.evict_at.is_none_or(|at| now < at)
    }
}

type Store = Arc<RwLock<HashMap<String, Slot>>>;

/// In-memory [`CacheBackend`].
///
/// Cloning is cheap and yields a handle onto the same map.
/// [`with_namespace`](Self::with_namespace) also shares the map but scopes
/// every operation to a different prefix.
///
/// # Examples
///
/// ```
/// use cachex::backend::{CacheBackend, MemoryBackend};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let a = MemoryBackend::new().with_namespace("ns-a:");
/// let b = a.with_namespace("ns-b:");
/// assert_eq!(a.clear().await.unwrap(), 0);
/// assert_eq!(b.len().await, 0);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    store: Store,
    namespace: Namespace,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            store: Store::default(),
            namespace: Namespace::default(),
            clock: clock::system(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new().with_namespace(config.namespace.as_str())
    }

    /// A handle onto the same map under another prefix.
    #[must_use]
    pub fn with_namespace(&self, prefix: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: Namespace::new(prefix),
            clock: Arc::clone(&self.clock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Number of slots held under this namespace, including expired ones not
    /// yet swept.
    pub async fn len(&self) -> usize {
        let store = self.store.read().await;
        store.keys().filter(|k| self.namespace.owns(k)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every expired slot under this namespace. Returns how many went.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        self.remove_where(|_, slot| !slot.is_live(now)).await
    }

    /// Starts a background task that calls [`sweep`](Self::sweep) every
    /// `interval`. The first sweep happens one interval from now.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn start_sweep(&self, interval: Duration) -> SweepHandle {
        let backend = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let removed = backend.sweep().await;
                        if removed > 0 {
                            debug!(
                                namespace = backend.namespace.as_str(),
                                removed,
                                "swept expired entries"
                            );
                        }
                    }
                }
            }
            debug!(namespace = backend.namespace.as_str(), "sweep task stopped");
        });

        SweepHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn remove_where<F>(&self, mut doomed: F) -> usize
    where
        F: FnMut(&CacheKey, &Slot) -> bool,
    {
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|physical, slot| match self.namespace.logical(physical) {
            Some(key) => !doomed(&key, slot),
            None => true,
        });
        before - store.len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, BackendError> {
        let now = self.clock.now();
        let store = self.store.read().await;
        Ok(store
            .get(&self.namespace.physical(key))
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.entry.clone()))
    }

    async fn set(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        // a deadline past the representable range means never evict
        let now = self.clock.now();
        let evict_at = ttl.and_then(|ttl| now.checked_add(ttl));
        let mut store = self.store.write().await;
        store.insert(self.namespace.physical(key), Slot { entry, evict_at });
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, BackendError> {
        let mut store = self.store.write().await;
        Ok(store.remove(&self.namespace.physical(key)).is_some())
    }

    async fn delete_path(&self, path: &str) -> Result<usize, BackendError> {
        Ok(self.remove_where(|key, _| key.parts().path == path).await)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, BackendError> {
        let relative = self.namespace.relative(pattern);
        let glob = Pattern::new(relative).map_err(|err| BackendError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: err.to_string(),
        })?;
        Ok(self.remove_where(|key, _| glob.matches(key.as_str())).await)
    }

    async fn clear(&self) -> Result<usize, BackendError> {
        Ok(self.remove_where(|_, _| true).await)
    }

    async fn entries(&self) -> Result<Vec<(CacheKey, CacheEntry)>, BackendError> {
        let now = self.clock.now();
        let store = self.store.read().await;
        let mut live: Vec<(CacheKey, CacheEntry)> = store
            .iter()
            .filter(|(_, slot)| slot.is_live(now))
            .filter_map(|(physical, slot)| {
                self.namespace
                    .logical(physical)
                    .map(|key| (key, slot.entry.clone()))
            })
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(live)
    }
}

/// Handle to a running sweep task.
///
/// [`stop`](Self::stop) shuts the task down and waits for it. Dropping the
/// handle without stopping aborts the task.
#[derive(Debug)]
pub struct SweepHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // Err means the task already exited.
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                warn!(error = %e, "sweep task ended abnormally");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}
