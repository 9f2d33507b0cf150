//! Normalized response descriptor.
//!
//! Produced by the wrapped handler and handed to the engine for write-back,
//! or produced by the engine itself when serving from cache.

use bytes::Bytes;

use super::{Headers, StatusCode};

/// A response as seen by the cache engine.
///
/// # Examples
///
/// ```
/// use cachex::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.body_bytes().len(), 15);
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Assembles a response from already-owned parts.
    pub fn from_parts(status: StatusCode, headers: Headers, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the response body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response headers for in-place decoration.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body bytes.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_parts() {
        let r = Response::new(StatusCode::Created)
            .header("X-Request-Id", "abc-123")
            .body("ok");
        assert_eq!(r.status(), StatusCode::Created);
        assert_eq!(r.headers().get("x-request-id"), Some("abc-123"));
        assert_eq!(r.body_bytes().as_ref(), b"ok");
    }

    #[test]
    fn headers_mut_decorates_in_place() {
        let mut r = Response::default();
        r.headers_mut().set("ETag", "W/\"1\"");
        assert_eq!(r.headers().get("etag"), Some("W/\"1\""));
        assert!(r.body_bytes().is_empty());
    }
}
