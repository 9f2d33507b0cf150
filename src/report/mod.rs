//! Inspection report over a backend's contents.
//!
//! Meant for operator-facing monitoring endpoints: the report serializes to
//! JSON and lists every entry with its decoded key parts and freshness.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::Serialize;

use crate::backend::{BackendError, CacheBackend};

/// Routes listed in [`ReportSummary::frequently_cached_routes`].
const TOP_ROUTES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedHit {
    pub cache_key: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub query_params: String,
    pub etag: String,
    pub status: u16,
    pub is_expired: bool,
    /// Seconds of freshness left; `None` for entries without `max-age`.
    pub ttl_remaining: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub total_cached_entries: usize,
    pub active_entries: usize,
    pub expired_entries: usize,
    /// Paths with the most entries, most first.
    pub frequently_cached_routes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheReport {
    pub cached_hits: Vec<CachedHit>,
    pub total_hits: usize,
    pub valid_hits: usize,
    pub expired_hits: usize,
    pub unique_routes: usize,
    pub summary: ReportSummary,
}

impl CacheReport {
    /// Builds a report from everything `backend` holds at `now`.
    ///
    /// # Errors
    ///
    /// Propagates the backend's error, including
    /// [`BackendError::Unsupported`] for backends that cannot list entries.
    pub async fn collect(backend: &dyn CacheBackend, now: SystemTime) -> Result<Self, BackendError> {
        let entries = backend.entries().await?;

        let cached_hits: Vec<CachedHit> = entries
            .into_iter()
            .map(|(key, entry)| {
                let parts = key.parts();
                CachedHit {
                    cache_key: key.as_str().to_owned(),
                    method: parts.method,
                    host: parts.host,
                    path: parts.path,
                    query_params: parts.query,
                    is_expired: !entry.is_fresh(now),
                    ttl_remaining: entry.ttl_remaining(now).map(|d| d.as_secs_f64()),
                    status: entry.status.as_u16(),
                    etag: entry.etag,
                }
            })
            .collect();

        let mut per_route: BTreeMap<&str, usize> = BTreeMap::new();
        for hit in &cached_hits {
            *per_route.entry(hit.path.as_str()).or_default() += 1;
        }
        let unique_routes = per_route.len();
        let mut ranked: Vec<(&str, usize)> = per_route.into_iter().collect();
        // BTreeMap order breaks ties by path
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        let frequently_cached_routes = ranked
            .into_iter()
            .take(TOP_ROUTES)
            .map(|(path, _)| path.to_owned())
            .collect();

        let total_hits = cached_hits.len();
        let expired_hits = cached_hits.iter().filter(|hit| hit.is_expired).count();
        let valid_hits = total_hits - expired_hits;

        Ok(Self {
            summary: ReportSummary {
                total_cached_entries: total_hits,
                active_entries: valid_hits,
                expired_entries: expired_hits,
                frequently_cached_routes,
            },
            cached_hits,
            total_hits,
            valid_hits,
            expired_hits,
            unique_routes,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
