//! Client configuration.

use std::env;
use std::time::Duration;

use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default freshness window for persisted aggregate cache entries.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Configuration for [`ApiClient`](crate::ApiClient).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the fintrack API, without a trailing slash.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Freshness window for aggregate cache entries.
    pub cache_ttl: Duration,
}

impl ClientConfig {
    /// Create a configuration for the given base URL. A trailing slash is
    /// stripped so request paths can always start with `/`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// Set the per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the aggregate cache TTL.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Create from environment variables.
    ///
    /// `FINTRACK_API_BASE_URL` is required; `FINTRACK_API_TIMEOUT_SECS` and
    /// `FINTRACK_CACHE_TTL_SECS` override the defaults when set.
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("FINTRACK_API_BASE_URL")
            .map_err(|_| Error::config("FINTRACK_API_BASE_URL is not set"))?;

        let mut config = Self::new(base_url);

        if let Ok(secs) = env::var("FINTRACK_API_TIMEOUT_SECS")
            && let Ok(secs) = secs.parse()
        {
            config.timeout = Duration::from_secs(secs);
        }

        if let Ok(secs) = env::var("FINTRACK_CACHE_TTL_SECS")
            && let Ok(secs) = secs.parse()
        {
            config.cache_ttl = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_stripped() {
        let config = ClientConfig::new("https://api.fintrack.example/");
        assert_eq!(config.base_url, "https://api.fintrack.example");
    }

    #[test]
    fn test_builder_overrides() {
        let config = ClientConfig::new("https://api.fintrack.example")
            .timeout(Duration::from_secs(5))
            .cache_ttl(Duration::from_secs(60));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("http://localhost:3000");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.cache_ttl, DEFAULT_CACHE_TTL);
    }
}
