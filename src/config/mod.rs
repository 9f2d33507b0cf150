//! Engine and backend settings.
//!
//! Everything has a default, so an empty JSON object is a valid config:
//!
//! ```
//! use cachex::config::CacheConfig;
//!
//! let config = CacheConfig::from_json(r#"{"namespace": "shop:", "sweep_interval_secs": 30}"#).unwrap();
//! assert_eq!(config.namespace, "shop:");
//! assert_eq!(config.scan_batch_size, 100);
//! ```

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::backend::{DEFAULT_NAMESPACE, Namespace};
use crate::backend::kv::DEFAULT_SCAN_BATCH;
use crate::http::Method;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid cache configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },

    /// The prefix would also own keys of a sibling namespace.
    #[error("namespace `{namespace}` must end with a delimiter such as `:`")]
    Namespace { namespace: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Prefix for every key a backend writes.
    pub namespace: String,
    /// Period of the in-memory backend's expiry sweep.
    pub sweep_interval_secs: u64,
    /// Methods eligible for caching; everything else bypasses the cache.
    pub cacheable_methods: Vec<Method>,
    /// Keys requested per scan step when invalidating a key-value store.
    pub scan_batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_owned(),
            sweep_interval_secs: 60,
            cacheable_methods: vec![Method::Get],
            scan_batch_size: DEFAULT_SCAN_BATCH,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed JSON, unknown fields or wrong
    /// types; [`ConfigError::Zero`] for a zero interval or batch size;
    /// [`ConfigError::Namespace`] for a prefix without a trailing delimiter.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !Namespace::is_delimited(&self.namespace) {
            return Err(ConfigError::Namespace {
                namespace: self.namespace.clone(),
            });
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Zero {
                field: "sweep_interval_secs",
            });
        }
        if self.scan_batch_size == 0 {
            return Err(ConfigError::Zero {
                field: "scan_batch_size",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn namespace(mut self, prefix: impl Into<String>) -> Self {
        self.namespace = prefix.into();
        self
    }

    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs();
        self
    }

    #[must_use]
    pub fn cacheable_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.cacheable_methods = methods.into_iter().collect();
        self
    }

    #[must_use]
    pub fn scan_batch_size(mut self, count: usize) -> Self {
        self.scan_batch_size = count;
        self
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
