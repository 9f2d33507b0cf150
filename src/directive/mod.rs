//! `Cache-Control` interpretation.
//!
//! [`parse_response`] turns a response's `Cache-Control` field into a
//! [`CachePolicy`]; [`parse_request_conditionals`] extracts the validator a
//! client sent. [`RoutePolicy`] goes the other way: it is what a route
//! declares up front, rendered into a `Cache-Control` value.
//!
//! | Directive                  | Effect on the engine                                   |
//! |----------------------------|--------------------------------------------------------|
//! | `no-store`                 | never written to a backend; overrides everything       |
//! | `no-cache`                 | stored, but every reuse goes back to the handler       |
//! | `public` / `private`       | carried through as [`Visibility`]                      |
//! | `max-age=N`                | freshness lifetime                                     |
//! | `immutable`                | fresh entries are served even under `no-cache`         |
//! | `must-revalidate`          | expired entries are never served, not even stale       |
//! | `stale-while-revalidate=N` | expired entries served for N more seconds              |
//! | `stale-if-error=N`         | expired entries served for N more seconds on failure   |
//!
//! Unknown directives and malformed values are ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::http::Headers;

mod route;

pub use route::RoutePolicy;

/// Who may store a response. Informational only: the engine keeps no
/// separate shared/private stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
    #[default]
    Unspecified,
}

/// Parsed `Cache-Control` of a single response. Never mutated after parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub ttl: Option<Duration>,
    pub visibility: Visibility,
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub immutable: bool,
    pub stale_while_revalidate: Option<Duration>,
    pub stale_if_error: Option<Duration>,
}

impl CachePolicy {
    /// How long past `max-age` an entry may still be useful.
    ///
    /// Zero under `must-revalidate`, otherwise the wider of the two stale
    /// windows.
    pub fn stale_extension(&self) -> Duration {
        if self.must_revalidate {
            return Duration::ZERO;
        }
        self.stale_while_revalidate
            .unwrap_or_default()
            .max(self.stale_if_error.unwrap_or_default())
    }

    /// TTL to hand a backend: `max-age` plus the stale extension, or `None`
    /// when the response carried no `max-age`.
    pub fn storage_ttl(&self) -> Option<Duration> {
        self.ttl
            .map(|ttl| ttl.saturating_add(self.stale_extension()))
    }

    /// `true` when a fresh hit must still go back to the handler.
    pub fn requires_revalidation(&self) -> bool {
        self.no_cache && !self.immutable
    }
}

/// Parses a raw `Cache-Control` field value.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use cachex::directive::{parse_cache_control, Visibility};
///
/// let policy = parse_cache_control("public, max-age=60, stale-if-error=30, x-unknown");
/// assert_eq!(policy.ttl, Some(Duration::from_secs(60)));
/// assert_eq!(policy.visibility, Visibility::Public);
/// assert_eq!(policy.stale_if_error, Some(Duration::from_secs(30)));
/// ```
pub fn parse_cache_control(value: &str) -> CachePolicy {
    let mut policy = CachePolicy::default();

    for directive in value.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        let (name, arg) = match directive.split_once('=') {
            Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
            None => (directive, None),
        };

        match name.to_ascii_lowercase().as_str() {
            "no-store" => policy.no_store = true,
            "no-cache" => policy.no_cache = true,
            "must-revalidate" => policy.must_revalidate = true,
            "immutable" => policy.immutable = true,
            "public" => {
                if policy.visibility != Visibility::Private {
                    policy.visibility = Visibility::Public;
                }
            }
            "private" => policy.visibility = Visibility::Private,
            // first occurrence wins for repeated delta-seconds directives
            "max-age" => {
                if policy.ttl.is_none() {
                    policy.ttl = seconds(arg);
                }
            }
            "stale-while-revalidate" => {
                if policy.stale_while_revalidate.is_none() {
                    policy.stale_while_revalidate = seconds(arg);
                }
            }
            "stale-if-error" => {
                if policy.stale_if_error.is_none() {
                    policy.stale_if_error = seconds(arg);
                }
            }
            other => trace!(directive = other, "ignoring cache-control directive"),
        }
    }

    policy
}

/// Largest delta-seconds value kept; bigger ones are clamped to it
/// (RFC 9111 §1.2.2).
pub const MAX_DELTA_SECONDS: u64 = 1 << 31;

fn seconds(arg: Option<&str>) -> Option<Duration> {
    let arg = arg?;
    if arg.is_empty() || !arg.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // all digits, so a parse failure can only be overflow
    let secs = arg.parse::<u64>().map_or(MAX_DELTA_SECONDS, |s| s.min(MAX_DELTA_SECONDS));
    Some(Duration::from_secs(secs))
}

/// Builds the policy of a response from every `Cache-Control` field it carries.
pub fn parse_response(headers: &Headers) -> CachePolicy {
    headers
        .get_joined("cache-control")
        .map(|value| parse_cache_control(&value))
        .unwrap_or_default()
}

/// Validators a client sent with its request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestConditionals {
    /// `If-None-Match`, with repeated fields folded into one list.
    pub if_none_match: Option<String>,
}

pub fn parse_request_conditionals(headers: &Headers) -> RequestConditionals {
    RequestConditionals {
        if_none_match: headers.get_joined("if-none-match"),
    }
}
