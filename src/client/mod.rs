//! Authenticated request pipeline.
//!
//! Every call attaches the bearer token when one is held, recovers from an
//! expired token through the single-flight [`RefreshCoordinator`], retries
//! exactly once, and classifies failures into [`Error`] variants. Multipart
//! uploads go through the same machinery via [`FormData`].

use std::path::Path;
use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::auth::RefreshCoordinator;
use crate::config::ClientConfig;
use crate::session::{SessionStore, SessionUpdate};
use crate::{Error, Result};

/// A single logical API call.
///
/// The retried flag is owned by the pipeline: it is set only when a call is
/// reissued after a refresh, and never twice for the same logical call.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body. The content type defaults to `application/json`
    /// unless a caller header overrides it.
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Rebuildable multipart payload.
///
/// `reqwest::multipart::Form` is consumed on send, so the pipeline keeps
/// this descriptor and rebuilds the form for the retried attempt.
#[derive(Clone, Debug, Default)]
pub struct FormData {
    parts: Vec<FormPart>,
}

#[derive(Clone, Debug)]
enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        filename: String,
        mime_type: String,
        bytes: Vec<u8>,
    },
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(FormPart::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn file_bytes(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.parts.push(FormPart::File {
            name: name.into(),
            filename: filename.into(),
            mime_type: mime_type.into(),
            bytes,
        });
        self
    }

    /// Read a file part from disk, sniffing the mime type from the path.
    pub async fn file_from_path(self, name: impl Into<String>, path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();
        let bytes = tokio::fs::read(path).await?;
        Ok(self.file_bytes(name, filename, mime_type, bytes))
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn to_form(&self) -> Result<reqwest::multipart::Form> {
        let mut form = reqwest::multipart::Form::new();
        for part in &self.parts {
            form = match part {
                FormPart::Text { name, value } => form.text(name.clone(), value.clone()),
                FormPart::File {
                    name,
                    filename,
                    mime_type,
                    bytes,
                } => {
                    let part = reqwest::multipart::Part::bytes(bytes.clone())
                        .file_name(filename.clone())
                        .mime_str(mime_type)
                        .map_err(|e| Error::config(format!("invalid mime type: {e}")))?;
                    form.part(name.clone(), part)
                }
            };
        }
        Ok(form)
    }
}

enum RequestBody<'a> {
    Empty,
    Json(&'a Value),
    Form(&'a FormData),
}

/// The fintrack API client.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ClientConfig,
    store: SessionStore,
    refresh: Arc<RefreshCoordinator>,
}

impl ApiClient {
    pub fn new(config: ClientConfig, store: SessionStore) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        let refresh = Arc::new(RefreshCoordinator::new(
            http.clone(),
            config.base_url.clone(),
            store.clone(),
        ));

        Ok(Self {
            http,
            config,
            store,
            refresh,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn refresh_coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.refresh
    }

    /// Execute a request and deserialize the success payload.
    pub async fn request<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let payload = self.execute(request).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Execute a request, returning the parsed success payload.
    pub async fn execute(&self, request: ApiRequest) -> Result<Value> {
        let body = match request.body.as_ref() {
            Some(value) => RequestBody::Json(value),
            None => RequestBody::Empty,
        };
        self.run(
            &request.method,
            &request.path,
            &request.headers,
            &body,
            request.retried,
        )
        .await
    }

    /// Execute a multipart request through the same retry/error pipeline.
    ///
    /// The JSON content-type default is omitted so the transport can set the
    /// multipart boundary itself.
    pub async fn execute_form(
        &self,
        method: Method,
        path: &str,
        form: &FormData,
    ) -> Result<Value> {
        self.run(&method, path, &[], &RequestBody::Form(form), false)
            .await
    }

    /// `POST /auth/login`, persisting the returned tokens and user record.
    pub async fn login(&self, email: &str, password: &str) -> Result<Value> {
        let payload = self
            .execute(
                ApiRequest::post("/auth/login")
                    .body(json!({ "email": email, "password": password })),
            )
            .await?;
        self.persist_credentials(&payload).await?;
        Ok(payload)
    }

    /// `POST /auth/register`, persisting the returned tokens and user record.
    pub async fn register(&self, profile: Value) -> Result<Value> {
        let payload = self
            .execute(ApiRequest::post("/auth/register").body(profile))
            .await?;
        self.persist_credentials(&payload).await?;
        Ok(payload)
    }

    /// Tear down the local session.
    pub async fn logout(&self) -> Result<()> {
        self.store.clear_session().await
    }

    async fn persist_credentials(&self, payload: &Value) -> Result<()> {
        let mut update = SessionUpdate::new();
        if let Some(token) = payload.get("accessToken").and_then(Value::as_str) {
            update = update.access_token(token);
        }
        if let Some(token) = payload.get("refreshToken").and_then(Value::as_str) {
            update = update.refresh_token(token);
        }
        if let Some(user) = payload.get("user") {
            update = update.user(user.clone());
        }
        self.store.set_session(update).await
    }

    async fn run(
        &self,
        method: &Method,
        path: &str,
        headers: &[(String, String)],
        body: &RequestBody<'_>,
        already_retried: bool,
    ) -> Result<Value> {
        let response = self.send_once(method, path, headers, body, None).await?;
        let status = response.status();
        let payload = read_payload(response).await;

        if status == StatusCode::UNAUTHORIZED
            && !already_retried
            && self.store.refresh_token().await.is_some()
        {
            match self.refresh.refresh_access_token().await {
                Ok(token) => {
                    tracing::debug!(path, "Received 401, retrying once with refreshed token");
                    // The retried call uses the token produced by the
                    // refresh that unblocked it, never a later one.
                    let response = self
                        .send_once(method, path, headers, body, Some(&token))
                        .await?;
                    let status = response.status();
                    let payload = read_payload(response).await;
                    return finish(status, payload);
                }
                Err(e) => {
                    // The caller sees the original 401, not a masked
                    // refresh-specific error.
                    tracing::debug!(path, error = %e, "Refresh failed, surfacing original 401");
                }
            }
        }

        finish(status, payload)
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        headers: &[(String, String)],
        body: &RequestBody<'_>,
        token_override: Option<&str>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut builder = self.http.request(method.clone(), url);

        let token = match token_override {
            Some(token) => Some(token.to_string()),
            None => self.store.access_token().await,
        };
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => {
                let has_content_type = headers
                    .iter()
                    .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
                if !has_content_type {
                    builder = builder.header("content-type", "application/json");
                }
                builder.body(serde_json::to_vec(value)?)
            }
            RequestBody::Form(form) => builder.multipart(form.to_form()?),
        };

        for (name, value) in headers {
            builder = builder.header(name, value);
        }

        builder.send().await.map_err(|e| Error::Network {
            base_url: self.config.base_url.clone(),
            source: e,
        })
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

fn finish(status: StatusCode, payload: Value) -> Result<Value> {
    if status.is_success() {
        Ok(payload)
    } else {
        Err(build_http_error(status, payload))
    }
}

async fn read_payload(response: reqwest::Response) -> Value {
    let text = response.text().await.unwrap_or_default();
    parse_payload(&text)
}

/// Parse a response body, falling back to a raw-text payload object so
/// malformed server output never crashes the caller.
fn parse_payload(text: &str) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "raw": text }))
}

type MessageExtractor = fn(&Value) -> Option<&str>;

/// Ordered extractors over the error body; the first hit wins.
const MESSAGE_EXTRACTORS: &[MessageExtractor] = &[
    |body| body.get("error").and_then(Value::as_str),
    |body| body.get("message").and_then(Value::as_str),
    |body| body.get("Message").and_then(Value::as_str),
];

fn resolve_error_message(status: StatusCode, body: &Value) -> String {
    for extract in MESSAGE_EXTRACTORS {
        if let Some(message) = extract(body)
            && !message.is_empty()
        {
            return message.to_string();
        }
    }
    status
        .canonical_reason()
        .unwrap_or("Request failed")
        .to_string()
}

fn build_http_error(status: StatusCode, body: Value) -> Error {
    let mut message = resolve_error_message(status, &body);
    if status == StatusCode::FORBIDDEN
        && matches!(message.as_str(), "Forbidden" | "Request failed")
    {
        message = "Insufficient permission to perform this action".to_string();
    }
    Error::Http {
        status: status.as_u16(),
        message,
        body,
    }
}
