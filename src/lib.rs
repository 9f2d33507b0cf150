//! # cachex
//!
//! An HTTP response cache that sits in front of request handlers.
//!
//! For each request the engine derives a stable key, consults a storage
//! backend and either answers from cache (200 replay or 304) or runs the
//! handler and writes its response back under the response's
//! `Cache-Control` policy.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cachex::backend::MemoryBackend;
//! use cachex::directive::RoutePolicy;
//! use cachex::engine::CacheEngine;
//! use cachex::http::{Method, Request, Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!     let sweeper = backend.start_sweep(Duration::from_secs(60));
//!     let engine = CacheEngine::new(Arc::new(backend));
//!
//!     let route = RoutePolicy::new().public().ttl(Duration::from_secs(60));
//!     let request = Request::new(Method::Get, "localhost:8000", "/api/items").query("page", "1");
//!
//!     let response = engine
//!         .execute(&request, &route, || async {
//!             Ok::<_, std::io::Error>(Response::new(StatusCode::Ok).body("[]"))
//!         })
//!         .await?;
//!     println!("{} {:?}", response.status(), response.headers().get("etag"));
//!
//!     sweeper.stop().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod directive;
pub mod engine;
pub mod etag;
pub mod http;
pub mod key;
pub mod report;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use backend::{BackendError, CacheBackend, CacheEntry, MemoryBackend};
pub use config::{CacheConfig, ConfigError};
pub use directive::{CachePolicy, RoutePolicy};
pub use engine::{CacheEngine, Decision, Outcome, WriteResult};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use key::CacheKey;
