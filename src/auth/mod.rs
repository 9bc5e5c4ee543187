//! Single-flight token refresh.
//!
//! Any number of callers that hit a 401 while one refresh is already in
//! flight clone the same shared future and observe the identical outcome:
//! one new access token, or one shared failure. Exactly one network call is
//! issued per refresh window.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::session::{SessionStore, SessionUpdate};
use crate::{Error, Result};

/// Outcome shared between all waiters of one refresh window. The error side
/// is a message rather than [`Error`] so the future's output is `Clone`.
type RefreshOutcome = std::result::Result<String, String>;

type RefreshFuture = Shared<BoxFuture<'static, RefreshOutcome>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
}

/// Coordinates access-token refresh against `POST /auth/refresh`.
pub struct RefreshCoordinator {
    http: reqwest::Client,
    base_url: String,
    store: SessionStore,
    in_flight: Mutex<Option<RefreshFuture>>,
}

impl RefreshCoordinator {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, store: SessionStore) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            store,
            in_flight: Mutex::new(None),
        }
    }

    /// Obtain a fresh access token, joining an in-flight refresh if one
    /// exists.
    ///
    /// On any failure the session is cleared and [`Error::SessionExpired`]
    /// is returned; an absent refresh token fails without a network call.
    pub async fn refresh_access_token(&self) -> Result<String> {
        let fut = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let Some(refresh_token) = self.store.refresh_token().await else {
                        let _ = self.store.clear_session().await;
                        return Err(Error::SessionExpired("no refresh token held".into()));
                    };

                    let fut = perform_refresh(
                        self.http.clone(),
                        self.base_url.clone(),
                        self.store.clone(),
                        refresh_token,
                    )
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        let outcome = fut.clone().await;

        // Clear the settled handle before this caller's continuation runs,
        // so an immediately-following 401 starts a fresh refresh instead of
        // being served a stale settled handle.
        {
            let mut slot = self.in_flight.lock().await;
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&fut)) {
                *slot = None;
            }
        }

        outcome.map_err(Error::SessionExpired)
    }

    /// Whether a refresh is currently in flight.
    pub async fn is_refreshing(&self) -> bool {
        self.in_flight.lock().await.is_some()
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("base_url", &self.base_url)
            .finish()
    }
}

async fn perform_refresh(
    http: reqwest::Client,
    base_url: String,
    store: SessionStore,
    refresh_token: String,
) -> RefreshOutcome {
    match issue_refresh(&http, &base_url, &refresh_token).await {
        Ok(tokens) => {
            let mut update = SessionUpdate::new().access_token(tokens.access_token.clone());
            if let Some(rotated) = tokens.refresh_token {
                update = update.refresh_token(rotated);
            }
            // A good token beats a failed write; the next process start
            // falls back to this same refresh path.
            if let Err(e) = store.set_session(update).await {
                tracing::warn!(error = %e, "Failed to persist refreshed tokens");
            }
            tracing::debug!("Access token refreshed");
            Ok(tokens.access_token)
        }
        Err(reason) => {
            tracing::warn!(%reason, "Token refresh failed, tearing down session");
            let _ = store.clear_session().await;
            Err(reason)
        }
    }
}

async fn issue_refresh(
    http: &reqwest::Client,
    base_url: &str,
    refresh_token: &str,
) -> std::result::Result<RefreshResponse, String> {
    let response = http
        .post(format!("{base_url}/auth/refresh"))
        .json(&serde_json::json!({ "refreshToken": refresh_token }))
        .send()
        .await
        .map_err(|e| {
            // Transport failure: no response at all. Wrapped for the log,
            // still a failed refresh for every waiter.
            let wrapped = Error::Network {
                base_url: base_url.to_string(),
                source: e,
            };
            wrapped.to_string()
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("refresh rejected with HTTP {}", status.as_u16()));
    }

    let tokens: RefreshResponse = response
        .json()
        .await
        .map_err(|e| format!("malformed refresh payload: {e}"))?;

    if tokens.access_token.is_empty() {
        return Err("refresh payload carried an empty accessToken".into());
    }

    Ok(tokens)
}
