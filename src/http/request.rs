//! Normalized request descriptor.
//!
//! Carries exactly what the cache engine reads from an inbound request:
//! method, host, path, query parameters and headers. Integrations either
//! build one directly or parse it from raw HTTP/1.1 bytes with
//! [`Request::parse`].

use percent_encoding::percent_decode_str;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request head is incomplete")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// A request as seen by the cache engine.
///
/// # Examples
///
/// ```
/// use cachex::http::{Method, Request};
///
/// let request = Request::new(Method::Get, "localhost:8000", "/items")
///     .query("page", "2")
///     .header("If-None-Match", "W/\"abc\"");
///
/// assert_eq!(request.path(), "/items");
/// assert_eq!(request.query_param("page"), Some("2"));
/// assert_eq!(request.headers().get("if-none-match"), Some("W/\"abc\""));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    host: String,
    path: String,
    query: Vec<(String, String)>,
    headers: Headers,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Creates a descriptor with no query parameters and no headers.
    pub fn new(method: Method, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            host: host.into(),
            path: path.into(),
            query: Vec::new(),
            headers: Headers::new(),
        }
    }

    /// Appends a query parameter. Repeated names keep every value.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Parses the head of a raw HTTP/1.1 request.
    ///
    /// The host is taken from the `Host` header (empty when absent) and the
    /// query string is split and percent-decoded into parameters. The body,
    /// if any, is ignored: the cache engine never keys on it.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request head.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: the method or path is absent.
    pub fn parse(buf: &[u8]) -> Result<Self, RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        if raw_req.parse(buf)?.is_partial() {
            return Err(RequestError::Incomplete);
        }

        let method: Method = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .to_owned()
            .into();

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query_string(query)),
            None => (target, Vec::new()),
        };

        let header_map: Headers = raw_req
            .headers
            .iter()
            .filter_map(|h| std::str::from_utf8(h.value).ok().map(|v| (h.name, v)))
            .collect();

        Ok(Self {
            method,
            host: header_map.get("host").unwrap_or_default().to_owned(),
            path: path.to_owned(),
            query,
            headers: header_map,
        })
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the host, including the port when one was given.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns every query parameter in arrival order.
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }

    /// Returns the first value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Splits a URL query string (`a=1&b=2`) into decoded pairs.
///
/// `+` decodes to a space and `%XX` escapes are decoded (lossy on invalid
/// UTF-8). Empty segments are skipped; a name without `=` gets an empty value.
fn parse_query_string(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(name), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}
