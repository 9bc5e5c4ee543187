//! # fintrack-client
//!
//! Network core for the fintrack personal finance tracker: an authenticated
//! request pipeline with transparent single-flight token refresh, and a
//! stale-while-revalidate cache for derived aggregates such as the account
//! balance.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fintrack_client::{ApiClient, ApiRequest, ClientConfig, SessionStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fintrack_client::Error> {
//!     let config = ClientConfig::new("https://api.fintrack.example");
//!     let client = ApiClient::new(config, SessionStore::in_memory())?;
//!
//!     client.login("user@example.com", "hunter2").await?;
//!     let wallets: serde_json::Value = client.request(ApiRequest::get("/wallets")).await?;
//!     println!("{wallets}");
//!     Ok(())
//! }
//! ```
//!
//! ## Balance cache
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use fintrack_client::{ApiClient, ClientConfig, SessionStore, storage::MemoryStorage};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), fintrack_client::Error> {
//! let client = ApiClient::new(
//!     ClientConfig::new("https://api.fintrack.example"),
//!     SessionStore::in_memory(),
//! )?;
//! let cache = client.balance_cache(Arc::new(MemoryStorage::new()), Duration::from_secs(300));
//!
//! // Paints instantly from cache when fresh, revalidates in the background.
//! let painted = cache.activate().await;
//! let mut updates = cache.subscribe();
//! # let _ = (painted, updates.borrow());
//! # Ok(())
//! # }
//! ```

#![deny(rustdoc::broken_intra_doc_links)]

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod session;

pub use auth::RefreshCoordinator;
pub use cache::{AggregateCache, BalanceSummary, CacheSnapshot, WalletBalance, DEFAULT_CACHE_TTL};
pub use client::{ApiClient, ApiRequest, FormData};
pub use config::ClientConfig;
pub use session::{SessionStore, SessionUpdate};

/// Re-export of the storage backends shared by the session store and the
/// aggregate cache.
pub mod storage {
    pub use crate::session::storage::{FileStorage, MemoryStorage, Storage};
}

/// Error type for fintrack-client operations.
///
/// All errors include actionable context to help diagnose and resolve issues.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No HTTP response was obtained (DNS/connection failure).
    #[error("Network request to {base_url} failed: {source}")]
    Network {
        base_url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        body: serde_json::Value,
    },

    /// The refresh token is absent or the refresh attempt failed. The
    /// session has been cleared by the time this error is observed.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Background aggregate fetch failed; any previously cached value is
    /// still served alongside this error.
    #[error("Aggregate fetch failed: {0}")]
    Fetch(String),

    /// Durable storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// True when no HTTP response was received at all, as opposed to an
    /// HTTP-level failure.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network { .. })
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Http { status: 401, .. } | Error::SessionExpired(_))
    }

    /// HTTP status code, when the server produced a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        let err = Error::Http {
            status: 401,
            message: "Unauthorized".into(),
            body: serde_json::Value::Null,
        };
        assert!(err.is_unauthorized());
        assert!(!err.is_network());
        assert_eq!(err.status(), Some(401));

        let expired = Error::SessionExpired("refresh rejected".into());
        assert!(expired.is_unauthorized());
        assert_eq!(expired.status(), None);
    }

    #[test]
    fn test_error_display_includes_status() {
        let err = Error::Http {
            status: 404,
            message: "wallet not found".into(),
            body: serde_json::Value::Null,
        };
        assert_eq!(err.to_string(), "HTTP 404: wallet not found");
    }
}
