use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 500;
pub const DEFAULT_MAX_CONCURRENT_PREFETCHES: usize = 4;
pub const DEFAULT_ASSET_CACHE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_ASSET_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_ASSET_DIMENSION: u32 = 8192;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid base url '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Tuning for page fetches, request timeouts and the cover-image cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub page_size: u32,
    pub max_concurrent_prefetches: usize,
    pub asset_cache_capacity: usize,
    pub max_asset_bytes: usize,
    pub max_asset_dimension: u32,
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_concurrent_prefetches: DEFAULT_MAX_CONCURRENT_PREFETCHES,
            asset_cache_capacity: DEFAULT_ASSET_CACHE_CAPACITY,
            max_asset_bytes: DEFAULT_MAX_ASSET_BYTES,
            max_asset_dimension: DEFAULT_MAX_ASSET_DIMENSION,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::invalid("page_size", "must be > 0"));
        }
        if self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::invalid(
                "page_size",
                format!("must be <= {MAX_PAGE_SIZE}"),
            ));
        }
        if self.max_concurrent_prefetches == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_prefetches",
                "must be > 0",
            ));
        }
        if self.asset_cache_capacity == 0 {
            return Err(ConfigError::invalid("asset_cache_capacity", "must be > 0"));
        }
        if self.max_asset_bytes == 0 {
            return Err(ConfigError::invalid("max_asset_bytes", "must be > 0"));
        }
        if self.max_asset_dimension == 0 {
            return Err(ConfigError::invalid("max_asset_dimension", "must be > 0"));
        }
        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_REQUEST_TIMEOUT_MS {
            return Err(ConfigError::invalid(
                "request_timeout_ms",
                format!("must be in 1..={MAX_REQUEST_TIMEOUT_MS}"),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_asset_cache_capacity(mut self, capacity: usize) -> Self {
        self.asset_cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_prefetches(mut self, max: usize) -> Self {
        self.max_concurrent_prefetches = max;
        self
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Cache capacity, never zero even if `validate` was skipped.
    #[must_use]
    pub fn asset_cache_capacity_nonzero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.asset_cache_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = SyncConfig::default().with_page_size(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "page_size", .. })
        ));

        let config = SyncConfig::default().with_max_concurrent_prefetches(0);
        assert!(config.validate().is_err());

        let config = SyncConfig::default().with_asset_cache_capacity(0);
        assert!(config.validate().is_err());
        assert_eq!(config.asset_cache_capacity_nonzero().get(), 1);
    }

    #[test]
    fn test_timeout_bounds() {
        let config = SyncConfig {
            request_timeout_ms: MAX_REQUEST_TIMEOUT_MS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"page_size": 50}"#).unwrap();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.asset_cache_capacity, DEFAULT_ASSET_CACHE_CAPACITY);
        assert!(config.validate().is_ok());
    }
}
