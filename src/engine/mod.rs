//! The cache decision engine.
//!
//! For each request the engine derives a key, looks it up and settles on an
//! [`Outcome`]:
//!
//! ```text
//! request ─► key ─► lookup ─┬─► ServeCached   entry replayed, handler skipped
//!                           ├─► NotModified   304, handler skipped
//!                           ├─► Bypass        handler runs, nothing looked up
//!                           └─► Miss          handler runs, response written back
//! ```
//!
//! Framework integrations can drive the two halves themselves with
//! [`CacheEngine::decide`] and [`CacheEngine::commit`], or hand the handler
//! to [`CacheEngine::execute`], which runs the whole cycle including the
//! stale-if-error fallback and conditional 304s on fresh responses.
//!
//! `stale-while-revalidate` is honoured by serving the stale entry inside its
//! window. No background refresh is scheduled; the entry is replaced the next
//! time a request misses.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::backend::{BackendError, CacheBackend, CacheEntry};
use crate::clock::{self, Clock};
use crate::config::CacheConfig;
use crate::directive::{self, RequestConditionals, RoutePolicy};
use crate::etag;
use crate::http::{Headers, Method, Request, Response, StatusCode};
use crate::key::{CacheKey, DefaultKeyBuilder, KeyBuilder};

/// Why the lookup was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// The request method is not cacheable.
    Method,
    /// The route declared `no-store` or `no-cache`.
    Declared,
}

/// What the engine does with a request; carried by [`Decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Serve the cached entry with a 200-class replay.
    ServeCached,
    /// Serve a bodiless 304.
    NotModified,
    /// Run the handler without consulting the cache.
    Bypass(BypassReason),
    /// Run the handler and write its response back.
    Miss,
}

/// Result of [`CacheEngine::decide`].
#[derive(Debug, Clone)]
pub struct Decision {
    pub outcome: Outcome,
    pub key: CacheKey,
    /// The entry found by the lookup. Also set on a [`Outcome::Miss`] when
    /// an expired or `no-cache` entry was found, for the stale-if-error
    /// fallback.
    pub cached: Option<CacheEntry>,
    /// `true` when a [`Outcome::ServeCached`] entry is past its freshness
    /// and served under `stale-while-revalidate`.
    pub stale: bool,
}

impl Decision {
    /// `true` when the handler has to run.
    pub fn needs_handler(&self) -> bool {
        matches!(self.outcome, Outcome::Miss | Outcome::Bypass(_))
    }

    /// `true` when the handler's response should go to [`CacheEngine::commit`].
    pub fn writes_back(&self) -> bool {
        matches!(
            self.outcome,
            Outcome::Miss | Outcome::Bypass(BypassReason::Declared)
        )
    }

    /// The response to send for [`Outcome::ServeCached`] and
    /// [`Outcome::NotModified`]; `None` when the handler has to run.
    pub fn cached_response(&self, now: SystemTime) -> Option<Response> {
        let entry = self.cached.as_ref()?;
        match self.outcome {
            Outcome::ServeCached => Some(replay(entry, now)),
            Outcome::NotModified => Some(not_modified(&entry.etag, &entry.headers)),
            Outcome::Bypass(_) | Outcome::Miss => None,
        }
    }

    /// The entry to fall back on if the handler fails at `now`.
    pub fn stale_if_error(&self, now: SystemTime) -> Option<&CacheEntry> {
        self.cached.as_ref().filter(|entry| {
            let policy = &entry.directives;
            !policy.must_revalidate && entry.within_grace(policy.stale_if_error, now)
        })
    }
}

/// Why a handler response was not written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The response policy says `no-store`.
    NoStore,
    /// Only 2xx responses are written.
    Status(StatusCode),
    /// `max-age=0` with no stale window; nothing would ever be served.
    Expired,
}

/// Result of [`CacheEngine::commit`].
#[derive(Debug)]
pub enum WriteResult {
    /// Written with this backend TTL; `None` keeps it until invalidated.
    Stored { ttl: Option<Duration> },
    /// The response policy or status rules out storage.
    Skipped(SkipReason),
    /// The backend rejected the write. The response is unaffected.
    Failed(BackendError),
}

impl WriteResult {
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

/// HTTP response cache in front of request handlers.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use cachex::backend::MemoryBackend;
/// use cachex::directive::RoutePolicy;
/// use cachex::engine::CacheEngine;
/// use cachex::http::{Method, Request, Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let engine = CacheEngine::new(Arc::new(MemoryBackend::new()));
/// let route = RoutePolicy::new().public().ttl(Duration::from_secs(60));
/// let request = Request::new(Method::Get, "localhost", "/hello");
///
/// let first = engine
///     .execute(&request, &route, || async {
///         Ok::<_, std::io::Error>(Response::new(StatusCode::Ok).body("hi"))
///     })
///     .await
///     .unwrap();
/// assert_eq!(first.headers().get("cache-control"), Some("public, max-age=60"));
///
/// let second = engine
///     .execute(&request, &route, || async {
///         Err::<Response, _>(std::io::Error::other("not called"))
///     })
///     .await
///     .unwrap();
/// assert_eq!(second.body_bytes(), first.body_bytes());
/// # }
/// ```
pub struct CacheEngine {
    backend: Arc<dyn CacheBackend>,
    keys: Arc<dyn KeyBuilder>,
    clock: Arc<dyn Clock>,
    cacheable_methods: Vec<Method>,
}

impl CacheEngine {
    /// Engine over `backend` with the default configuration: `GET` only,
    /// default key layout, system clock.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self::with_config(backend, &CacheConfig::default())
    }

    /// Engine over `backend` caching `config.cacheable_methods`.
    pub fn with_config(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        debug!(
            backend = backend.name(),
            namespace = %config.namespace,
            "cache engine configured"
        );
        Self {
            backend,
            keys: Arc::new(DefaultKeyBuilder),
            clock: clock::system(),
            cacheable_methods: config.cacheable_methods.clone(),
        }
    }

    #[must_use]
    pub fn key_builder(mut self, builder: impl KeyBuilder + 'static) -> Self {
        self.keys = Arc::new(builder);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// The cache key the configured [`KeyBuilder`] derives for `request`.
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use cachex::backend::MemoryBackend;
    /// use cachex::engine::CacheEngine;
    /// use cachex::http::{Method, Request};
    ///
    /// let engine = CacheEngine::new(Arc::new(MemoryBackend::new()));
    /// let key = engine.key_for(&Request::new(Method::Get, "localhost", "/a"));
    /// assert_eq!(key.as_str(), "GET|||localhost|||/a|||");
    /// ```
    pub fn key_for(&self, request: &Request) -> CacheKey {
        self.keys.build(request)
    }

    /// Looks the request up and decides how to answer it.
    ///
    /// Never fails: a backend that cannot be read is treated as a miss.
    pub async fn decide(&self, request: &Request, route: &RoutePolicy) -> Decision {
        let key = self.key_for(request);

        if !self.cacheable_methods.contains(request.method()) {
            return Decision::skip(key, BypassReason::Method);
        }
        if route.bypasses_lookup() {
            return Decision::skip(key, BypassReason::Declared);
        }

        let cached = match self.backend.get(&key).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(key = %key, backend = self.backend.name(), error = %e, "cache lookup failed, treating as miss");
                None
            }
        };
        let Some(entry) = cached else {
            debug!(key = %key, "cache miss");
            return Decision {
                outcome: Outcome::Miss,
                key,
                cached: None,
                stale: false,
            };
        };

        let conditionals = directive::parse_request_conditionals(request.headers());
        let decision = classify(key, entry, &conditionals, self.clock.now());
        debug!(key = %decision.key, outcome = ?decision.outcome, stale = decision.stale, "cache lookup");
        decision
    }

    /// Applies the route's declared directives and an ETag to a fresh
    /// handler response. Non-2xx responses pass through untouched.
    pub fn stamp(&self, mut response: Response, route: &RoutePolicy) -> Response {
        if !response.status().is_success() {
            return response;
        }
        let tag = etag::generate(response.body_bytes());
        let headers = response.headers_mut();
        headers.set("ETag", tag);
        if let Some(cache_control) = route.cache_control() {
            headers.set("Cache-Control", cache_control);
        }
        response
    }

    /// Writes a handler response back under `key`.
    ///
    /// The policy comes from `hint`'s rendering when it declares anything,
    /// else from the response's own `Cache-Control`. The write runs on its
    /// own task, so it completes even if the caller is dropped mid-await.
    pub async fn commit(
        &self,
        key: &CacheKey,
        response: &Response,
        hint: Option<&RoutePolicy>,
    ) -> WriteResult {
        let policy = match hint.and_then(RoutePolicy::cache_control) {
            Some(declared) => directive::parse_cache_control(&declared),
            None => directive::parse_response(response.headers()),
        };

        if policy.no_store {
            return WriteResult::Skipped(SkipReason::NoStore);
        }
        if !response.status().is_success() {
            return WriteResult::Skipped(SkipReason::Status(response.status()));
        }
        let ttl = policy.storage_ttl();
        if ttl == Some(Duration::ZERO) {
            return WriteResult::Skipped(SkipReason::Expired);
        }

        let now = self.clock.now();
        let entry = CacheEntry {
            etag: response
                .headers()
                .get("etag")
                .map_or_else(|| etag::generate(response.body_bytes()), str::to_owned),
            content: response.body_bytes().clone(),
            status: response.status(),
            headers: response.headers().clone(),
            stored_at: now,
            // past the representable range counts as non-expiring
            expires_at: policy.ttl.and_then(|max_age| now.checked_add(max_age)),
            directives: policy,
        };

        let backend = Arc::clone(&self.backend);
        let write_key = key.clone();
        let written = tokio::spawn(async move { backend.set(&write_key, entry, ttl).await }).await;

        match written {
            Ok(Ok(())) => {
                debug!(key = %key, ttl = ?ttl, "response stored");
                WriteResult::Stored { ttl }
            }
            Ok(Err(e)) => {
                warn!(key = %key, backend = self.backend.name(), error = %e, "cache write-back failed");
                WriteResult::Failed(e)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache write-back task failed");
                WriteResult::Failed(BackendError::Unavailable(e.to_string()))
            }
        }
    }

    /// Runs the full cache cycle around `handler`.
    ///
    /// The handler is invoked at most once, and only when the cache cannot
    /// answer. Its error is returned unchanged unless a stale entry within
    /// its `stale-if-error` window can be served instead.
    pub async fn execute<F, Fut, E>(
        &self,
        request: &Request,
        route: &RoutePolicy,
        handler: F,
    ) -> Result<Response, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Response, E>>,
        E: fmt::Display,
    {
        let decision = self.decide(request, route).await;
        if let Some(response) = decision.cached_response(self.clock.now()) {
            return Ok(response);
        }

        let response = match handler().await {
            Ok(response) => self.stamp(response, route),
            Err(error) => {
                let now = self.clock.now();
                return match decision.stale_if_error(now) {
                    Some(entry) => {
                        warn!(key = %decision.key, error = %error, "handler failed, serving stale entry");
                        Ok(replay(entry, now))
                    }
                    None => Err(error),
                };
            }
        };

        if decision.writes_back() {
            self.commit(&decision.key, &response, Some(route)).await;
        }

        let conditionals = directive::parse_request_conditionals(request.headers());
        if response.status().is_success() && revalidated(&conditionals, &response) {
            debug!(key = %decision.key, "fresh response matches client validator");
            return Ok(not_modified_from(&response));
        }
        Ok(response)
    }
}

impl fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("backend", &self.backend.name())
            .field("clock", &self.clock)
            .field("cacheable_methods", &self.cacheable_methods)
            .finish_non_exhaustive()
    }
}

impl Decision {
    fn skip(key: CacheKey, reason: BypassReason) -> Self {
        debug!(key = %key, reason = ?reason, "cache bypassed");
        Self {
            outcome: Outcome::Bypass(reason),
            key,
            cached: None,
            stale: false,
        }
    }
}

fn classify(
    key: CacheKey,
    entry: CacheEntry,
    conditionals: &RequestConditionals,
    now: SystemTime,
) -> Decision {
    let policy = &entry.directives;
    let fresh = entry.is_fresh(now);

    let servable = if policy.requires_revalidation() {
        false
    } else if policy.no_cache {
        // immutable lifts no-cache for the max-age window only
        fresh
    } else {
        fresh || (!policy.must_revalidate && entry.within_grace(policy.stale_while_revalidate, now))
    };

    let outcome = if !servable {
        Outcome::Miss
    } else if conditionals
        .if_none_match
        .as_deref()
        .is_some_and(|inm| etag::matches(inm, &entry.etag))
    {
        Outcome::NotModified
    } else {
        Outcome::ServeCached
    };

    Decision {
        outcome,
        key,
        stale: servable && !fresh,
        cached: Some(entry),
    }
}

fn revalidated(conditionals: &RequestConditionals, response: &Response) -> bool {
    match (
        conditionals.if_none_match.as_deref(),
        response.headers().get("etag"),
    ) {
        (Some(inm), Some(tag)) => etag::matches(inm, tag),
        _ => false,
    }
}

fn replay(entry: &CacheEntry, now: SystemTime) -> Response {
    let mut headers = entry.headers.clone();
    headers.set("ETag", entry.etag.as_str());
    headers.set("Age", entry.age(now).as_secs().to_string());
    Response::from_parts(entry.status, headers, entry.content.clone())
}

fn not_modified(tag: &str, source: &Headers) -> Response {
    let mut response = Response::new(StatusCode::NotModified).header("ETag", tag);
    if let Some(cache_control) = source.get_joined("cache-control") {
        response = response.header("Cache-Control", cache_control);
    }
    response
}

fn not_modified_from(response: &Response) -> Response {
    let tag = response.headers().get("etag").unwrap_or_default();
    not_modified(tag, response.headers())
}
