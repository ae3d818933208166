//! Low-level API client.
//!
//! Three request shapes against the backend: JSON call, multipart file
//! upload, and binary download. The client owns the cross-cutting behavior:
//! waiting for authentication, attaching the bearer token (read fresh from
//! the session store at call time), racing requests against a timeout,
//! recovering from 401s by forcing logout and retrying once re-authentication
//! arrives, and publishing non-suppressed failures to the store's error slot.
//!
//! The wire itself sits behind the `Transport` trait so the status-code
//! handling above is testable with scripted responses.

use crate::error::ApiError;
use crate::lock::KeyedLock;
use crate::session::SessionStore;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// One part of a multipart upload.
pub struct FilePart {
    pub name: String,
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Multipart body for the attachment upload endpoint: `db`, `table`, `row`
/// identify the target record, files are appended as `file0`, `file1`, ...
pub struct UploadRequest {
    pub db: String,
    pub table: String,
    pub row: String,
    pub files: Vec<FilePart>,
}

pub enum RequestSpec {
    JsonCall { path: String, body: Value },
    Upload { path: String, request: UploadRequest },
    Download { path: String },
}

impl RequestSpec {
    pub fn path(&self) -> &str {
        match self {
            RequestSpec::JsonCall { path, .. } => path,
            RequestSpec::Upload { path, .. } => path,
            RequestSpec::Download { path } => path,
        }
    }
}

/// Transport-level response: status plus raw body and the two headers the
/// client cares about. Status-code semantics live in `ApiClient`, not here.
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

impl RawResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            body: body.to_string().into_bytes(),
            content_type: Some("application/json".to_string()),
            content_disposition: None,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        spec: RequestSpec,
        bearer: Option<String>,
    ) -> Result<RawResponse, ApiError>;
}

// --- production transport ---------------------------------------------------

static HTTP: OnceLock<reqwest::Client> = OnceLock::new();

fn http_client() -> &'static reqwest::Client {
    HTTP.get_or_init(|| {
        reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .tcp_nodelay(true)
            .build()
            .expect("reqwest client")
    })
}

/// Reqwest-backed transport. Paths are resolved against the configured
/// backend origin.
pub struct HttpTransport {
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        spec: RequestSpec,
        bearer: Option<String>,
    ) -> Result<RawResponse, ApiError> {
        let url = self.url(spec.path());
        let mut req = match spec {
            RequestSpec::JsonCall { body, .. } => http_client().post(&url).json(&body),
            RequestSpec::Upload { request, .. } => {
                let mut form = reqwest::multipart::Form::new()
                    .text("db", request.db)
                    .text("table", request.table)
                    .text("row", request.row);
                for (i, file) in request.files.into_iter().enumerate() {
                    let part = reqwest::multipart::Part::bytes(file.bytes)
                        .file_name(file.name)
                        .mime_str(&file.mime)
                        .map_err(|e| ApiError::Transport(e.to_string()))?;
                    form = form.part(format!("file{i}"), part);
                }
                http_client().post(&url).multipart(form)
            }
            RequestSpec::Download { .. } => http_client().get(&url),
        };
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }

        let res = req
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = res.status().as_u16();
        let (content_type, content_disposition) = {
            let get = |name: &str| {
                res.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string())
            };
            (get("content-type"), get("content-disposition"))
        };
        let body = res
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?
            .to_vec();

        Ok(RawResponse {
            status,
            body,
            content_type,
            content_disposition,
        })
    }
}

// --- client -----------------------------------------------------------------

/// Parsed success payload: `{ok, data, messages}`.
#[derive(Clone, Debug, Default)]
pub struct ApiResponse {
    pub ok: bool,
    pub data: Value,
    pub messages: Vec<String>,
}

/// Completed binary download held in memory. Cached per URL for the process
/// lifetime with no eviction (open question inherited from the design: admin
/// sessions are short-lived, so the cache is allowed to grow).
#[derive(Debug)]
pub struct Download {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Download {
    pub fn write_to(&self, path: &std::path::Path) -> std::io::Result<()> {
        std::fs::write(path, &self.bytes)
    }
}

#[derive(Clone, Debug)]
pub struct CallOptions {
    /// Wait for an authenticated session before sending.
    pub auth: bool,
    /// Skip publishing failures to the store's error slot.
    pub suppress_dialog: bool,
    pub timeout: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            auth: true,
            suppress_dialog: false,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct ApiClientOptions {
    /// Bound on waiting for authentication (default 2 minutes).
    pub auth_wait: Duration,
    /// Hard cap on 401-triggered retries of a single call.
    pub auth_retry_max: u32,
    /// How long a download may hold the per-URL lock.
    pub lock_timeout: Duration,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            auth_wait: Duration::from_secs(120),
            auth_retry_max: 3,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

pub struct ApiClient {
    transport: Arc<dyn Transport>,
    store: Arc<SessionStore>,
    opts: ApiClientOptions,
    url_lock: KeyedLock,
    downloads: Mutex<HashMap<String, Arc<Download>>>,
}

impl ApiClient {
    pub fn new(
        store: Arc<SessionStore>,
        transport: Arc<dyn Transport>,
        opts: ApiClientOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            store,
            opts,
            url_lock: KeyedLock::new(),
            downloads: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    fn publish(&self, err: &ApiError, suppress: bool) {
        if !suppress {
            self.store.set_error_message(&err.to_string());
        }
    }

    /// JSON call: `POST path` with `body`, bearer token attached.
    ///
    /// A 401 forces logout and retries the call from the top, re-waiting for
    /// authentication, with linear backoff and a hard cap on attempts. Callers
    /// never see a 401 as terminal unless the cap is exhausted. A 403 fails
    /// immediately and is never retried.
    pub async fn call_json(
        &self,
        path: &str,
        body: Value,
        opts: &CallOptions,
    ) -> Result<ApiResponse, ApiError> {
        let mut attempt = 0u32;
        loop {
            if opts.auth {
                if let Err(e) = self.store.wait_for_authenticated(self.opts.auth_wait).await {
                    self.publish(&e, opts.suppress_dialog);
                    return Err(e);
                }
            }
            let bearer = self.store.token();

            log::debug!("api: POST {path}");
            let spec = RequestSpec::JsonCall {
                path: path.to_string(),
                body: body.clone(),
            };
            let raw = match tokio::time::timeout(opts.timeout, self.transport.execute(spec, bearer))
                .await
            {
                Err(_) => {
                    log::warn!("api: request timed out: {path}");
                    let e = ApiError::Timeout(opts.timeout.as_millis() as u64);
                    self.publish(&e, opts.suppress_dialog);
                    return Err(e);
                }
                Ok(Err(e)) => {
                    self.publish(&e, opts.suppress_dialog);
                    return Err(e);
                }
                Ok(Ok(raw)) => raw,
            };

            match raw.status {
                401 => {
                    self.store.logout();
                    attempt += 1;
                    if attempt > self.opts.auth_retry_max {
                        let e = ApiError::AuthRetriesExhausted(self.opts.auth_retry_max);
                        self.publish(&e, opts.suppress_dialog);
                        return Err(e);
                    }
                    log::warn!("api: received 401 on {path}, waiting for re-authentication (attempt {attempt})");
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                    continue;
                }
                403 => {
                    let e = ApiError::PermissionDenied;
                    self.publish(&e, opts.suppress_dialog);
                    return Err(e);
                }
                200 => {
                    let payload: Value = serde_json::from_slice(&raw.body).map_err(|e| {
                        let e = ApiError::InvalidPayload(e.to_string());
                        self.publish(&e, opts.suppress_dialog);
                        e
                    })?;
                    let response = parse_response(payload);
                    for message in &response.messages {
                        self.store.toast(message);
                    }
                    return Ok(response);
                }
                status => {
                    let e = error_from_body(status, &raw.body);
                    self.publish(&e, opts.suppress_dialog);
                    return Err(e);
                }
            }
        }
    }

    /// Multipart upload. Same auth gate as JSON calls, but a 401 here logs
    /// out and fails instead of looping; the caller re-drives the upload.
    pub async fn upload(
        &self,
        path: &str,
        request: UploadRequest,
        opts: &CallOptions,
    ) -> Result<ApiResponse, ApiError> {
        if opts.auth {
            if let Err(e) = self.store.wait_for_authenticated(self.opts.auth_wait).await {
                self.publish(&e, opts.suppress_dialog);
                return Err(e);
            }
        }
        let bearer = self.store.token();

        log::debug!("api: upload {} file(s) to {path}", request.files.len());
        let spec = RequestSpec::Upload {
            path: path.to_string(),
            request,
        };
        let raw = match self.transport.execute(spec, bearer).await {
            Ok(raw) => raw,
            Err(e) => {
                self.publish(&e, opts.suppress_dialog);
                return Err(e);
            }
        };

        match raw.status {
            401 => {
                self.store.logout();
                let e = ApiError::AuthRequired;
                self.publish(&e, opts.suppress_dialog);
                Err(e)
            }
            200 => {
                let payload: Value = serde_json::from_slice(&raw.body).map_err(|e| {
                    let e = ApiError::InvalidPayload(e.to_string());
                    self.publish(&e, opts.suppress_dialog);
                    e
                })?;
                Ok(parse_response(payload))
            }
            status => {
                let e = error_from_body(status, &raw.body);
                self.publish(&e, opts.suppress_dialog);
                Err(e)
            }
        }
    }

    /// Binary download, deduplicated per URL.
    ///
    /// The per-URL lock collapses concurrent requests for the same resource
    /// into one GET; later callers hit the in-memory cache and receive the
    /// same handle. `filename` overrides the `Content-Disposition` name.
    pub async fn download(
        &self,
        path: &str,
        filename: Option<&str>,
        opts: &CallOptions,
    ) -> Result<Arc<Download>, ApiError> {
        if opts.auth {
            if let Err(e) = self.store.wait_for_authenticated(self.opts.auth_wait).await {
                self.publish(&e, opts.suppress_dialog);
                return Err(e);
            }
        }
        let bearer = self.store.token();

        let guard = self.url_lock.acquire(path, self.opts.lock_timeout).await;

        if let Some(hit) = self.downloads.lock().expect("download cache poisoned").get(path) {
            log::debug!("api: download cache hit: {path}");
            let hit = Arc::clone(hit);
            guard.release();
            return Ok(hit);
        }

        log::debug!("api: download cache miss: {path}");
        let spec = RequestSpec::Download {
            path: path.to_string(),
        };
        let raw = match self.transport.execute(spec, bearer).await {
            Ok(raw) => raw,
            Err(e) => {
                self.publish(&e, opts.suppress_dialog);
                return Err(e);
            }
        };

        match raw.status {
            401 => {
                self.store.logout();
                let e = ApiError::AuthRequired;
                self.publish(&e, opts.suppress_dialog);
                Err(e)
            }
            200 => {
                let filename = filename
                    .map(|f| f.to_string())
                    .or_else(|| {
                        raw.content_disposition
                            .as_deref()
                            .and_then(content_disposition_filename)
                    })
                    .unwrap_or_else(|| "download".to_string());
                let download = Arc::new(Download {
                    filename,
                    content_type: raw.content_type,
                    bytes: raw.body,
                });
                self.downloads
                    .lock()
                    .expect("download cache poisoned")
                    .insert(path.to_string(), Arc::clone(&download));
                guard.release();
                Ok(download)
            }
            status => {
                let e = ApiError::Http(status);
                self.publish(&e, opts.suppress_dialog);
                Err(e)
            }
        }
    }
}

fn parse_response(payload: Value) -> ApiResponse {
    let messages = payload["messages"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|m| match m.as_str() {
                    Some(s) => s.to_string(),
                    None => m.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    let data = payload.get("data").cloned().unwrap_or(Value::Null);
    ApiResponse {
        ok: true,
        data,
        messages,
    }
}

/// Application error extraction for non-2xx responses: prefer the JSON
/// `error` field, then `message`, then fall back to the bare status.
fn error_from_body(status: u16, body: &[u8]) -> ApiError {
    if let Ok(json) = serde_json::from_slice::<Value>(body) {
        if let Some(error) = json["error"].as_str() {
            return ApiError::Backend(error.to_string());
        }
        if let Some(message) = json["message"].as_str() {
            return ApiError::Backend(message.to_string());
        }
    }
    ApiError::Http(status)
}

/// Pull a filename out of a `Content-Disposition` header value,
/// e.g. `attachment; filename="report.pdf"`.
fn content_disposition_filename(header: &str) -> Option<String> {
    let lower = header.to_ascii_lowercase();
    let idx = lower.find("filename=")?;
    let rest = &header[idx + "filename=".len()..];
    let rest = rest.split(';').next().unwrap_or(rest).trim();
    let name = rest.trim_matches('"').trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
