//! Content-addressed entity tags.
//!
//! Tags are weak validators over the SHA-256 of the body, truncated to 128
//! bits: `W/"<32 hex digits>"`. Collision resistance is best-effort; a tag is
//! a validator, not a security boundary.

use sha2::{Digest, Sha256};

/// Hex digits kept from the digest.
const TAG_HEX_LEN: usize = 32;

/// Computes the entity tag of a body. The empty body has a tag like any other.
///
/// # Examples
///
/// ```
/// use cachex::etag;
///
/// let tag = etag::generate(b"hello");
/// assert!(tag.starts_with("W/\""));
/// assert_eq!(tag, etag::generate(b"hello"));
/// assert_ne!(tag, etag::generate(b"hello!"));
/// ```
pub fn generate(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let hex = format!("{digest:x}");
    format!("W/\"{}\"", &hex[..TAG_HEX_LEN])
}

/// Evaluates an `If-None-Match` value against a current tag.
///
/// Uses the weak comparison of RFC 9110 §8.8.3.2: `W/` prefixes are ignored.
/// Accepts `*` and comma-separated lists.
///
/// ```
/// use cachex::etag::matches;
///
/// assert!(matches("\"abc\"", "\"abc\""));
/// assert!(matches("W/\"abc\"", "\"abc\""));
/// assert!(matches("\"xyz\", W/\"abc\"", "W/\"abc\""));
/// assert!(matches("*", "\"anything\""));
/// assert!(!matches("\"xyz\"", "\"abc\""));
/// ```
pub fn matches(if_none_match: &str, etag: &str) -> bool {
    let current = opaque(etag);
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || opaque(candidate) == current)
}

fn opaque(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix("W/").unwrap_or(tag)
}
