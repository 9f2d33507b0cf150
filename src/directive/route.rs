//! Per-route declared caching directives.

use std::time::Duration;

/// Directives a route declares at registration time.
///
/// The declaration matters twice. Before the handler runs, `no-store` and
/// `no-cache` routes skip the lookup entirely. After it runs, the rendered
/// [`cache_control`](Self::cache_control) value replaces whatever
/// `Cache-Control` the handler produced.
///
/// Rendering follows a fixed precedence: `no-store` stands alone, `no-cache`
/// only carries `must-revalidate` along, and everything else renders as
/// visibility, `max-age`, `must-revalidate`, stale windows, `immutable`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use cachex::directive::RoutePolicy;
///
/// let route = RoutePolicy::new()
///     .public()
///     .ttl(Duration::from_secs(60))
///     .stale_if_error(Duration::from_secs(30));
///
/// assert_eq!(
///     route.cache_control().as_deref(),
///     Some("public, max-age=60, stale-if-error=30")
/// );
/// assert_eq!(RoutePolicy::new().no_store().ttl(Duration::from_secs(5)).cache_control().as_deref(), Some("no-store"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutePolicy {
    ttl: Option<Duration>,
    stale_while_revalidate: Option<Duration>,
    stale_if_error: Option<Duration>,
    no_cache: bool,
    no_store: bool,
    public: bool,
    private: bool,
    immutable: bool,
    must_revalidate: bool,
}

impl RoutePolicy {
    /// A route with no declared directives; the handler's own
    /// `Cache-Control` is used as-is.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn stale_while_revalidate(mut self, window: Duration) -> Self {
        self.stale_while_revalidate = Some(window);
        self
    }

    #[must_use]
    pub fn stale_if_error(mut self, window: Duration) -> Self {
        self.stale_if_error = Some(window);
        self
    }

    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    #[must_use]
    pub fn no_store(mut self) -> Self {
        self.no_store = true;
        self
    }

    /// Marks the response `public`. Takes precedence over [`private`](Self::private).
    #[must_use]
    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    #[must_use]
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    #[must_use]
    pub fn must_revalidate(mut self) -> Self {
        self.must_revalidate = true;
        self
    }

    /// `true` when the route opts out of serving from cache before the
    /// handler has run.
    pub fn bypasses_lookup(&self) -> bool {
        self.no_store || self.no_cache
    }

    /// Renders the declaration as a `Cache-Control` value, or `None` when
    /// nothing was declared.
    pub fn cache_control(&self) -> Option<String> {
        let mut directives: Vec<String> = Vec::new();

        if self.no_store {
            return Some("no-store".to_owned());
        }

        if self.no_cache {
            directives.push("no-cache".to_owned());
            if self.must_revalidate {
                directives.push("must-revalidate".to_owned());
            }
            return Some(directives.join(", "));
        }

        if self.public {
            directives.push("public".to_owned());
        } else if self.private {
            directives.push("private".to_owned());
        }
        if let Some(ttl) = self.ttl {
            directives.push(format!("max-age={}", ttl.as_secs()));
        }
        if self.must_revalidate {
            directives.push("must-revalidate".to_owned());
        }
        if let Some(window) = self.stale_while_revalidate {
            directives.push(format!("stale-while-revalidate={}", window.as_secs()));
        }
        if let Some(window) = self.stale_if_error {
            directives.push(format!("stale-if-error={}", window.as_secs()));
        }
        if self.immutable {
            directives.push("immutable".to_owned());
        }

        if directives.is_empty() {
            None
        } else {
            Some(directives.join(", "))
        }
    }
}
