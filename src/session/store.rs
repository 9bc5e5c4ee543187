//! Durable session state: tokens and the signed-in user record.

use std::sync::Arc;

use serde_json::Value;

use super::storage::{MemoryStorage, Storage};
use crate::Result;

const ACCESS_TOKEN_KEY: &str = "auth.access_token";
const REFRESH_TOKEN_KEY: &str = "auth.refresh_token";
const USER_KEY: &str = "auth.user";

/// Partial session write. Only the supplied fields are written, each
/// overwriting its prior value wholesale; there is no nested merge.
#[derive(Clone, Debug, Default)]
pub struct SessionUpdate {
    access_token: Option<String>,
    refresh_token: Option<String>,
    user: Option<Value>,
}

impl SessionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn user(mut self, user: Value) -> Self {
        self.user = Some(user);
        self
    }
}

/// Holder of the durable session: access token, refresh token, and the
/// opaque user record. Pure storage, no network calls.
///
/// Constructed explicitly and passed by reference so tests can run isolated
/// instances; there is no process-wide singleton.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn Storage>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Store backed by [`MemoryStorage`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The held access token, if any. `None` means unauthenticated for
    /// request purposes; an empty stored string is treated the same way.
    pub async fn access_token(&self) -> Option<String> {
        self.read_key(ACCESS_TOKEN_KEY)
            .await
            .filter(|token| !token.is_empty())
    }

    /// The held refresh token, if any. Absence makes any refresh attempt
    /// fail immediately without a network call.
    pub async fn refresh_token(&self) -> Option<String> {
        self.read_key(REFRESH_TOKEN_KEY)
            .await
            .filter(|token| !token.is_empty())
    }

    /// The stored user record, if any.
    pub async fn stored_user(&self) -> Option<Value> {
        let raw = self.read_key(USER_KEY).await?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unparseable stored user record");
                None
            }
        }
    }

    /// Write the supplied fields. Fields absent from the update keep their
    /// current values.
    pub async fn set_session(&self, update: SessionUpdate) -> Result<()> {
        if let Some(token) = update.access_token {
            self.storage.set(ACCESS_TOKEN_KEY, &token).await?;
        }
        if let Some(token) = update.refresh_token {
            self.storage.set(REFRESH_TOKEN_KEY, &token).await?;
        }
        if let Some(user) = update.user {
            self.storage
                .set(USER_KEY, &serde_json::to_string(&user)?)
                .await?;
        }
        Ok(())
    }

    /// Remove all three session keys in one atomic storage operation.
    pub async fn clear_session(&self) -> Result<()> {
        self.storage
            .remove_many(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY])
            .await
    }

    async fn read_key(&self, key: &str) -> Option<String> {
        match self.storage.get(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "Session storage read failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("storage", &self.storage.name())
            .finish()
    }
}
