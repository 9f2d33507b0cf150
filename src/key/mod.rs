//! Cache key derivation.
//!
//! A [`CacheKey`] is built from four request components joined by
//! [`SEPARATOR`]:
//!
//! ```text
//! GET|||localhost:8000|||/api/items|||page=2&sort=asc
//! ```
//!
//! Every component is percent-escaped for `%` and `|` before joining, so the
//! separator can never occur inside a component and distinct inputs can never
//! produce the same key. Query parameters are escaped again for `&` and `=`,
//! de-duplicated and sorted, which makes the key independent of the order
//! parameters arrived in. Hosts keep their port (and IPv6 brackets) verbatim.

use std::fmt;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use crate::http::{Method, Request};

/// Delimiter between key components.
pub const SEPARATOR: &str = "|||";

// `%` must be escaped for the encoding to stay injective; `|` keeps the
// separator out of component values.
const COMPONENT: &AsciiSet = &CONTROLS.add(b'%').add(b'|');
const QUERY_PART: &AsciiSet = &COMPONENT.add(b'&').add(b'=');

/// A canonical, deterministic cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps an already-built key string, e.g. one read back from a backend.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the key back into its components.
    pub fn parts(&self) -> KeyParts {
        KeyParts::parse(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives the cache key for a request's method, host, path and query.
///
/// Pure: identical inputs always yield identical keys.
///
/// # Examples
///
/// ```
/// use cachex::http::Method;
/// use cachex::key::derive;
///
/// let a = derive(&Method::Get, "h", "/p", &[("b".into(), "2".into()), ("a".into(), "1".into())]);
/// let b = derive(&Method::Get, "h", "/p", &[("a".into(), "1".into()), ("b".into(), "2".into())]);
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "GET|||h|||/p|||a=1&b=2");
/// ```
pub fn derive(method: &Method, host: &str, path: &str, query: &[(String, String)]) -> CacheKey {
    let mut pairs: Vec<String> = query
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(name, QUERY_PART),
                utf8_percent_encode(value, QUERY_PART)
            )
        })
        .collect();
    pairs.sort_unstable();
    pairs.dedup();

    CacheKey(
        [
            encode_component(method.as_str()),
            encode_component(host),
            encode_component(path),
            pairs.join("&"),
        ]
        .join(SEPARATOR),
    )
}

/// Decoded components of a [`CacheKey`].
///
/// `query` stays in its canonical serialized form (`a=1&b=2`) since decoding
/// it would lose pair boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyParts {
    pub method: String,
    pub host: String,
    pub path: String,
    pub query: String,
}

impl KeyParts {
    /// Parses a key string. Anything that is not exactly four
    /// separator-delimited components yields all-empty parts.
    ///
    /// ```
    /// use cachex::key::KeyParts;
    ///
    /// let parts = KeyParts::parse("GET|||[::1]:8000|||/api/data|||");
    /// assert_eq!(parts.host, "[::1]:8000");
    /// assert_eq!(parts.query, "");
    /// assert_eq!(KeyParts::parse("invalid_key"), KeyParts::default());
    /// ```
    pub fn parse(raw: &str) -> Self {
        let fields: Vec<&str> = raw.split(SEPARATOR).collect();
        let [method, host, path, query] = fields.as_slice() else {
            return Self::default();
        };
        Self {
            method: decode(method),
            host: decode(host),
            path: decode(path),
            query: (*query).to_owned(),
        }
    }
}

/// A single component as it appears inside a key.
pub(crate) fn encode_component(component: &str) -> String {
    utf8_percent_encode(component, COMPONENT).to_string()
}

fn decode(component: &str) -> String {
    percent_decode_str(component).decode_utf8_lossy().into_owned()
}

/// Strategy for turning a request into a cache key.
///
/// The engine uses [`DefaultKeyBuilder`] unless given another builder; any
/// `Fn(&Request) -> CacheKey` closure also works.
pub trait KeyBuilder: Send + Sync {
    fn build(&self, request: &Request) -> CacheKey;
}

/// Keys on method, host, path and the query-parameter set.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyBuilder;

impl KeyBuilder for DefaultKeyBuilder {
    fn build(&self, request: &Request) -> CacheKey {
        derive(
            request.method(),
            request.host(),
            request.path(),
            request.query_params(),
        )
    }
}

impl<F> KeyBuilder for F
where
    F: Fn(&Request) -> CacheKey + Send + Sync,
{
    fn build(&self, request: &Request) -> CacheKey {
        self(request)
    }
}
