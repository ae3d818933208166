//! Backend-call layer: the declarative entry point UI and CLI code use.
//!
//! A `MethodDescriptor` goes in, at most one deduplicated request comes out.
//! One-shot calls optionally go through a TTL response cache keyed by the
//! descriptor's canonical form; the cache is cleared wholesale on every
//! session transition so data fetched under one identity is never served
//! under another. `BackendQuery` is the subscribing form: it re-resolves as
//! its args change, dedupes deep-equal args, supports forced reloads, and
//! queues at most one pending request behind an in-flight one.

use crate::api::{ApiClient, ApiResponse, CallOptions, UploadRequest};
use crate::descriptor::MethodDescriptor;
use crate::error::ApiError;
use crate::session::SessionStore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Clone)]
struct CacheEntry {
    stored_at: Instant,
    response: ApiResponse,
}

#[derive(Clone, Debug)]
pub struct BackendCallOptions {
    pub auth: bool,
    pub suppress_dialog: bool,
    /// Treat the result as slow-changing: serve from the TTL cache when fresh.
    pub cache: bool,
    /// Override the backend-wide default TTL for this call.
    pub ttl: Option<Duration>,
    pub timeout: Duration,
}

impl Default for BackendCallOptions {
    fn default() -> Self {
        Self {
            auth: true,
            suppress_dialog: false,
            cache: false,
            ttl: None,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct Backend {
    api: Arc<ApiClient>,
    store: Arc<SessionStore>,
    cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
    default_ttl: Duration,
}

impl Backend {
    pub fn new(api: Arc<ApiClient>, store: Arc<SessionStore>, default_ttl: Duration) -> Arc<Self> {
        let cache = Arc::new(Mutex::new(HashMap::new()));
        let hook_cache = Arc::clone(&cache);
        // Session transitions invalidate the whole cache, synchronously.
        store.on_session_change(move || {
            let mut cache = hook_cache.lock().expect("response cache poisoned");
            if !cache.is_empty() {
                log::debug!("backend: clearing {} cached response(s)", cache.len());
                cache.clear();
            }
        });
        Arc::new(Self {
            api,
            store,
            cache,
            default_ttl,
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    /// One-shot call of a remote method.
    pub async fn call(
        &self,
        descriptor: &MethodDescriptor,
        opts: &BackendCallOptions,
    ) -> Result<ApiResponse, ApiError> {
        let call_opts = CallOptions {
            auth: opts.auth,
            suppress_dialog: opts.suppress_dialog,
            timeout: opts.timeout,
        };

        if !opts.cache {
            return self
                .api
                .call_json(&descriptor.path(), descriptor.args.clone(), &call_opts)
                .await;
        }

        let key = descriptor.cache_key();
        let ttl = opts.ttl.unwrap_or(self.default_ttl);
        {
            let cache = self.cache.lock().expect("response cache poisoned");
            if let Some(entry) = cache.get(&key) {
                if entry.stored_at.elapsed() < ttl {
                    log::debug!("backend: cache hit for {}", descriptor.label());
                    return Ok(entry.response.clone());
                }
            }
        }

        let response = self
            .api
            .call_json(&descriptor.path(), descriptor.args.clone(), &call_opts)
            .await?;
        self.cache.lock().expect("response cache poisoned").insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                response: response.clone(),
            },
        );
        Ok(response)
    }

    /// Upload attachments for one record.
    pub async fn upload(
        &self,
        request: UploadRequest,
        opts: &BackendCallOptions,
    ) -> Result<ApiResponse, ApiError> {
        let call_opts = CallOptions {
            auth: opts.auth,
            suppress_dialog: opts.suppress_dialog,
            timeout: opts.timeout,
        };
        self.api
            .upload("/api/core/attachment/upload", request, &call_opts)
            .await
    }

    /// Download an attachment by record id; collapses concurrent requests.
    pub async fn download(
        &self,
        record_id: &str,
        filename: Option<&str>,
    ) -> Result<Arc<crate::api::Download>, ApiError> {
        let path = format!("/api/core/attachment/download/{record_id}");
        self.api
            .download(&path, filename, &CallOptions::default())
            .await
    }

    /// Log in via `core.login.getToken`. A response without a token is not an
    /// error; the session simply stays unauthenticated. Returns whether the
    /// session ended up authenticated.
    pub async fn login(&self, email: &str, password: &str) -> Result<bool, ApiError> {
        let descriptor = MethodDescriptor::new("core", "login", "getToken")
            .with_args(json!({"email": email, "password": password}));
        let response = self
            .call(
                &descriptor,
                &BackendCallOptions {
                    auth: false,
                    ..Default::default()
                },
            )
            .await?;

        match response.data.get("token").and_then(|t| t.as_str()) {
            Some(token) => {
                self.store.set_token(token);
                Ok(self.store.authenticated())
            }
            None => {
                log::warn!("backend: login response carried no token");
                Ok(false)
            }
        }
    }

    pub fn logout(&self) {
        self.store.logout();
    }
}

// --- subscribing query ------------------------------------------------------

/// Snapshot published to subscribers after every completed attempt.
#[derive(Clone, Debug, Default)]
pub struct QueryState {
    pub data: Option<ApiResponse>,
    pub loading: bool,
    pub error: Option<String>,
    /// Bumped once per completed attempt; lets subscribers distinguish
    /// "same data again" from "nothing happened".
    pub generation: u64,
}

struct QueryInner {
    last_key: Option<String>,
    last_args: Option<Value>,
    skip: bool,
    in_flight: bool,
    pending: Option<MethodDescriptor>,
}

/// Long-lived binding of one remote method to a stream of states.
///
/// Guarantees, per instance: deep-equal args never trigger a second request;
/// at most one request is in flight; args arriving while a request is in
/// flight are queued with last-write-wins; errors surface in the state's
/// `error` slot and never cross the subscription boundary as panics.
pub struct BackendQuery {
    backend: Arc<Backend>,
    package_name: String,
    class_name: String,
    method_name: String,
    record_id: Option<String>,
    opts: BackendCallOptions,
    state_tx: watch::Sender<QueryState>,
    inner: Mutex<QueryInner>,
}

impl BackendQuery {
    pub fn new(
        backend: Arc<Backend>,
        package_name: &str,
        class_name: &str,
        method_name: &str,
    ) -> Arc<Self> {
        Self::with_options(
            backend,
            package_name,
            class_name,
            method_name,
            None,
            BackendCallOptions::default(),
        )
    }

    pub fn with_options(
        backend: Arc<Backend>,
        package_name: &str,
        class_name: &str,
        method_name: &str,
        record_id: Option<String>,
        opts: BackendCallOptions,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(QueryState::default());
        Arc::new(Self {
            backend,
            package_name: package_name.to_string(),
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            record_id,
            opts,
            state_tx,
            inner: Mutex::new(QueryInner {
                last_key: None,
                last_args: None,
                skip: false,
                in_flight: false,
                pending: None,
            }),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> QueryState {
        self.state_tx.borrow().clone()
    }

    fn descriptor(&self, args: Value) -> MethodDescriptor {
        let mut descriptor = MethodDescriptor::new(
            &self.package_name,
            &self.class_name,
            &self.method_name,
        )
        .with_args(args);
        descriptor.record_id = self.record_id.clone();
        descriptor
    }

    /// Update the arguments. Deep-equal args are a no-op regardless of how
    /// the value was built; changed args either start a request or replace
    /// the queued one.
    pub fn set_args(self: &Arc<Self>, args: Value) {
        let descriptor = self.descriptor(args.clone());
        let key = descriptor.cache_key();

        let mut inner = self.inner.lock().expect("query state poisoned");
        if inner.skip {
            return;
        }
        if inner.last_key.as_deref() == Some(key.as_str()) {
            return;
        }
        inner.last_key = Some(key);
        inner.last_args = Some(args);
        self.schedule(inner, descriptor);
    }

    /// Force a refetch with the current args, even if unchanged. A reload
    /// before any args were set is a no-op.
    pub fn reload(self: &Arc<Self>) {
        let inner = self.inner.lock().expect("query state poisoned");
        if inner.skip {
            return;
        }
        let Some(args) = inner.last_args.clone() else {
            return;
        };
        let descriptor = self.descriptor(args);
        self.schedule(inner, descriptor);
    }

    /// While skipped, `set_args` and `reload` are ignored and the current
    /// state stays as-is.
    pub fn set_skip(&self, skip: bool) {
        self.inner.lock().expect("query state poisoned").skip = skip;
    }

    /// Drop the held data without issuing a request.
    pub fn clear(&self) {
        self.state_tx.send_modify(|state| {
            state.data = None;
            state.error = None;
        });
    }

    fn schedule(
        self: &Arc<Self>,
        mut inner: std::sync::MutexGuard<'_, QueryInner>,
        descriptor: MethodDescriptor,
    ) {
        if inner.in_flight {
            // Last write wins: a newer descriptor replaces any queued one.
            inner.pending = Some(descriptor);
            return;
        }
        inner.in_flight = true;
        drop(inner);

        let query = Arc::clone(self);
        tokio::spawn(async move {
            query.run(descriptor).await;
        });
    }

    async fn run(self: Arc<Self>, mut descriptor: MethodDescriptor) {
        loop {
            self.state_tx.send_modify(|state| state.loading = true);

            let started = Instant::now();
            let result = self.backend.call(&descriptor, &self.opts).await;
            log::debug!(
                "backend: {} completed in {}ms",
                descriptor.label(),
                started.elapsed().as_millis()
            );

            self.state_tx.send_modify(|state| {
                state.loading = false;
                state.generation += 1;
                match &result {
                    Ok(response) => {
                        state.data = Some(response.clone());
                        state.error = None;
                    }
                    Err(e) => {
                        state.error = Some(e.to_string());
                    }
                }
            });

            let mut inner = self.inner.lock().expect("query state poisoned");
            match inner.pending.take() {
                Some(next) => descriptor = next,
                None => {
                    inner.in_flight = false;
                    return;
                }
            }
        }
    }
}
