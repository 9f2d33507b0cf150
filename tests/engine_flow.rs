mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cachex::backend::{CacheBackend, KvBackend, MemoryBackend};
use cachex::clock::ManualClock;
use cachex::directive::RoutePolicy;
use cachex::engine::{CacheEngine, Outcome};
use cachex::etag;
use cachex::http::{Method, Request, Response, StatusCode};

use common::{FakeKv, clock, init_tracing, t0};

struct Harness {
    engine: CacheEngine,
    backend: MemoryBackend,
    clock: ManualClock,
    calls: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let clock = clock();
        let backend = MemoryBackend::new().with_clock(Arc::new(clock.clone()));
        let engine = CacheEngine::new(Arc::new(backend.clone())).clock(Arc::new(clock.clone()));
        Self {
            engine,
            backend,
            clock,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Runs a handler that answers `body` with the given `Cache-Control`.
    async fn run(
        &self,
        request: &Request,
        route: &RoutePolicy,
        body: &'static str,
        cache_control: &'static str,
    ) -> Response {
        let calls = Arc::clone(&self.calls);
        self.engine
            .execute(request, route, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut response = Response::new(StatusCode::Ok).body(body);
                if !cache_control.is_empty() {
                    response = response.header("Cache-Control", cache_control);
                }
                Ok::<_, String>(response)
            })
            .await
            .unwrap()
    }

    async fn fail(&self, request: &Request, route: &RoutePolicy) -> Result<Response, String> {
        let calls = Arc::clone(&self.calls);
        self.engine
            .execute(request, route, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Response, _>("upstream timed out".to_owned())
            })
            .await
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn get(path: &str) -> Request {
    Request::new(Method::Get, "localhost:8000", path)
}

#[tokio::test]
async fn max_age_response_is_served_from_cache_within_lifetime() {
    let h = Harness::new();
    let request = get("/api/items");
    let route = RoutePolicy::new();

    let first = h.run(&request, &route, r#"{"items":[]}"#, "max-age=60").await;
    assert_eq!(first.status(), StatusCode::Ok);
    assert_eq!(h.calls(), 1);

    let key = h.engine.key_for(&request);
    let stored = h.backend.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.expires_at, Some(t0() + Duration::from_secs(60)));

    h.clock.advance(Duration::from_secs(10));
    let second = h.run(&request, &route, "changed", "max-age=60").await;
    assert_eq!(h.calls(), 1);
    assert_eq!(second.body_bytes(), first.body_bytes());
    assert_eq!(second.headers().get("age"), Some("10"));
    assert_eq!(second.headers().get("etag"), first.headers().get("etag"));
}

#[tokio::test]
async fn freshness_boundary() {
    let h = Harness::new();
    let request = get("/fresh");
    h.run(&request, &RoutePolicy::new(), "v1", "max-age=60").await;

    h.clock.advance(Duration::from_secs(59));
    let decision = h.engine.decide(&request, &RoutePolicy::new()).await;
    assert_eq!(decision.outcome, Outcome::ServeCached);

    h.clock.advance(Duration::from_secs(2));
    let decision = h.engine.decide(&request, &RoutePolicy::new()).await;
    assert_eq!(decision.outcome, Outcome::Miss);

    let refreshed = h.run(&request, &RoutePolicy::new(), "v2", "max-age=60").await;
    assert_eq!(&refreshed.body_bytes()[..], b"v2");
    assert_eq!(h.calls(), 2);
}

#[tokio::test]
async fn if_none_match_yields_304_only_on_match() {
    let h = Harness::new();
    let route = RoutePolicy::new().ttl(Duration::from_secs(60));
    let first = h.run(&get("/doc"), &route, "abc", "").await;
    let tag = first.headers().get("etag").unwrap().to_owned();
    assert_eq!(tag, etag::generate(b"abc"));

    let revalidate = get("/doc").header("If-None-Match", tag.as_str());
    let response = h.run(&revalidate, &route, "abc", "").await;
    assert_eq!(response.status(), StatusCode::NotModified);
    assert!(response.body_bytes().is_empty());

    let mismatch = get("/doc").header("If-None-Match", "\"xyz\"");
    let response = h.run(&mismatch, &route, "abc", "").await;
    assert_eq!(response.status(), StatusCode::Ok);
    assert_eq!(&response.body_bytes()[..], b"abc");

    assert_eq!(h.calls(), 1);
}

#[tokio::test]
async fn no_store_route_never_writes() {
    init_tracing();
    let kv = FakeKv::shared();
    let engine = CacheEngine::new(Arc::new(KvBackend::new(Arc::clone(&kv))));
    let route = RoutePolicy::new().no_store().ttl(Duration::from_secs(60));

    for _ in 0..5 {
        let response = engine
            .execute(&get("/secret"), &route, || async {
                Ok::<_, String>(Response::new(StatusCode::Ok).body("token"))
            })
            .await
            .unwrap();
        assert_eq!(response.headers().get("cache-control"), Some("no-store"));
    }

    assert_eq!(kv.sets.load(Ordering::SeqCst), 0);
    assert!(kv.keys().await.is_empty());
}

#[tokio::test]
async fn handler_declaring_no_store_is_not_written_either() {
    let h = Harness::new();
    h.run(&get("/private"), &RoutePolicy::new(), "x", "private, no-store").await;
    assert!(h.backend.is_empty().await);
}

#[tokio::test]
async fn stale_if_error_serves_expired_entry() {
    let h = Harness::new();
    let request = get("/feed");
    let route = RoutePolicy::new()
        .ttl(Duration::from_secs(60))
        .stale_if_error(Duration::from_secs(30));
    h.run(&request, &route, "cached feed", "").await;

    // expired at t0 + 60, handler fails at t0 + 70
    h.clock.advance(Duration::from_secs(70));
    let response = h.fail(&request, &route).await.unwrap();
    assert_eq!(&response.body_bytes()[..], b"cached feed");
    assert_eq!(h.calls(), 2);

    h.clock.advance(Duration::from_secs(25));
    assert_eq!(h.fail(&request, &route).await.unwrap_err(), "upstream timed out");
}

#[tokio::test]
async fn handler_error_without_fallback_propagates() {
    let h = Harness::new();
    let request = get("/strict");
    let route = RoutePolicy::new()
        .ttl(Duration::from_secs(60))
        .stale_if_error(Duration::from_secs(30))
        .must_revalidate();
    h.run(&request, &route, "v1", "").await;

    h.clock.advance(Duration::from_secs(61));
    assert!(h.fail(&request, &route).await.is_err());
}

#[tokio::test]
async fn no_cache_route_runs_every_time_but_still_answers_304() {
    let h = Harness::new();
    let route = RoutePolicy::new().no_cache();

    let first = h.run(&get("/live"), &route, "same", "").await;
    assert_eq!(first.headers().get("cache-control"), Some("no-cache"));
    let tag = first.headers().get("etag").unwrap().to_owned();

    let conditional = get("/live").header("If-None-Match", tag);
    let second = h.run(&conditional, &route, "same", "").await;
    assert_eq!(second.status(), StatusCode::NotModified);

    let third = h.run(&get("/live"), &route, "different", "").await;
    assert_eq!(&third.body_bytes()[..], b"different");
    assert_eq!(h.calls(), 3);
}

#[tokio::test]
async fn query_order_hits_the_same_entry() {
    let h = Harness::new();
    let route = RoutePolicy::new().ttl(Duration::from_secs(60));
    let a = get("/search").query("q", "rust").query("page", "2");
    let b = get("/search").query("page", "2").query("q", "rust");

    h.run(&a, &route, "results", "").await;
    h.run(&b, &route, "results", "").await;
    assert_eq!(h.calls(), 1);

    h.run(&get("/search").query("q", "go"), &route, "other", "").await;
    assert_eq!(h.calls(), 2);
}

#[tokio::test]
async fn only_get_is_cached() {
    let h = Harness::new();
    let route = RoutePolicy::new().ttl(Duration::from_secs(60));
    let post = Request::new(Method::Post, "localhost:8000", "/items");

    h.run(&post, &route, "created", "").await;
    h.run(&post, &route, "created", "").await;
    assert_eq!(h.calls(), 2);
    assert!(h.backend.is_empty().await);
}

#[tokio::test]
async fn error_responses_are_not_cached() {
    let h = Harness::new();
    let route = RoutePolicy::new().ttl(Duration::from_secs(60));
    let response = h
        .engine
        .execute(&get("/flaky"), &route, || async {
            Ok::<_, String>(Response::new(StatusCode::ServiceUnavailable))
        })
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ServiceUnavailable);
    assert!(response.headers().get("cache-control").is_none());
    assert!(h.backend.is_empty().await);
}

#[tokio::test]
async fn unreadable_entries_count_as_misses() {
    init_tracing();
    let kv = FakeKv::shared();
    let engine = CacheEngine::new(Arc::new(KvBackend::new(Arc::clone(&kv))));
    let request = get("/corrupt");
    kv.put_raw(&format!("cachex:{}", engine.key_for(&request)), b"invalid json{{{")
        .await;

    let decision = engine.decide(&request, &RoutePolicy::new()).await;
    assert_eq!(decision.outcome, Outcome::Miss);

    let response = engine
        .execute(&request, &RoutePolicy::new().ttl(Duration::from_secs(60)), || async {
            Ok::<_, String>(Response::new(StatusCode::Ok).body("rebuilt"))
        })
        .await
        .unwrap();
    assert_eq!(&response.body_bytes()[..], b"rebuilt");
    assert_eq!(
        engine.decide(&request, &RoutePolicy::new()).await.outcome,
        Outcome::ServeCached
    );
}

#[tokio::test]
async fn unavailable_store_does_not_break_requests() {
    init_tracing();
    let kv = FakeKv::shared();
    kv.set_down(true);
    let engine = CacheEngine::new(Arc::new(KvBackend::new(Arc::clone(&kv))));

    let response = engine
        .execute(&get("/down"), &RoutePolicy::new().ttl(Duration::from_secs(60)), || async {
            Ok::<_, String>(Response::new(StatusCode::Ok).body("served anyway"))
        })
        .await
        .unwrap();
    assert_eq!(&response.body_bytes()[..], b"served anyway");
}

#[tokio::test]
async fn custom_key_builder_is_used() {
    init_tracing();
    let backend = MemoryBackend::new();
    let engine = CacheEngine::new(Arc::new(backend.clone())).key_builder(|req: &Request| {
        cachex::key::derive(req.method(), "any-host", req.path(), &[])
    });
    let route = RoutePolicy::new().ttl(Duration::from_secs(60));

    let counter = AtomicUsize::new(0);
    let calls = &counter;
    for host in ["a.example", "b.example"] {
        engine
            .execute(&Request::new(Method::Get, host, "/shared"), &route, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(Response::new(StatusCode::Ok).body("x"))
            })
            .await
            .unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(backend.len().await, 1);
}
