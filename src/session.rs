//! Process-wide session state: bearer token, decoded claims, authenticated
//! flag, plus the two app-wide slots the API client needs (toast callback and
//! current error message).
//!
//! The store is an explicit, injected dependency rather than a global. Token
//! changes and cache clears are atomic from a caller's point of view: the
//! registered invalidation hooks run synchronously inside `set_token` and
//! `logout`, so no code can observe a new identity with a stale cache.
//!
//! Tokens are JWTs decoded without signature verification (the server is the
//! authority; the client only needs the claims and the expiry). A token past
//! its `exp` is treated as absent, independent of server state.

use crate::error::ApiError;
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;

type ToastFn = Box<dyn Fn(&str) + Send + Sync>;
type InvalidationHook = Box<dyn Fn() + Send + Sync>;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SessionState {
    token: Option<String>,
    #[serde(default)]
    claims: Value,
    authenticated: bool,
    #[serde(default)]
    user_id: Value,
}

pub struct SessionStore {
    state: RwLock<SessionState>,
    auth_tx: watch::Sender<bool>,
    error_message: Mutex<Option<String>>,
    toast: RwLock<Option<ToastFn>>,
    invalidation_hooks: Mutex<Vec<InvalidationHook>>,
    persist_path: Option<PathBuf>,
}

impl SessionStore {
    /// In-memory store with no persistence (tests, throwaway sessions).
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(SessionState::default(), None))
    }

    /// Store backed by a JSON file, restored verbatim if the file exists.
    pub fn with_persistence(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<SessionState>(&raw) {
                Ok(state) => state,
                Err(e) => {
                    log::warn!("session: ignoring unreadable state file: {e}");
                    SessionState::default()
                }
            },
            Err(_) => SessionState::default(),
        };
        Arc::new(Self::build(state, Some(path)))
    }

    /// Default session file location under the platform data dir.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| Path::new(".").to_path_buf())
            .join("adminbase")
            .join("session.json")
    }

    fn build(state: SessionState, persist_path: Option<PathBuf>) -> Self {
        let (auth_tx, _) = watch::channel(state.authenticated);
        Self {
            state: RwLock::new(state),
            auth_tx,
            error_message: Mutex::new(None),
            toast: RwLock::new(None),
            invalidation_hooks: Mutex::new(Vec::new()),
            persist_path,
        }
    }

    // --- token lifecycle ----------------------------------------------------

    /// Install a token. On decode failure the store resets to defaults; an
    /// already-expired token is stored but leaves the session unauthenticated.
    pub fn set_token(&self, token: &str) {
        match decode_claims(token) {
            Ok(claims) => {
                let expired = claims_expired(&claims);
                if expired {
                    log::warn!("session: token already expired");
                }
                let user_id = claims.get("id").cloned().unwrap_or(Value::Null);
                {
                    let mut state = self.state.write().expect("session state poisoned");
                    state.token = Some(token.to_string());
                    state.claims = claims;
                    state.authenticated = !expired;
                    state.user_id = user_id;
                }
                log::info!("session: token set, authenticated={}", !expired);
                self.after_transition();
            }
            Err(e) => {
                log::error!("session: failed to decode token: {e}");
                self.reset();
            }
        }
    }

    /// Clear the session. Invalidation hooks fire before the caller regains
    /// control, same as on login.
    pub fn logout(&self) {
        log::info!("session: logout");
        self.reset();
    }

    fn reset(&self) {
        {
            let mut state = self.state.write().expect("session state poisoned");
            *state = SessionState::default();
        }
        self.after_transition();
    }

    fn after_transition(&self) {
        let authenticated = self.authenticated();
        self.run_invalidation_hooks();
        self.persist();
        self.auth_tx.send_replace(authenticated);
    }

    fn run_invalidation_hooks(&self) {
        let hooks = self.invalidation_hooks.lock().expect("hooks poisoned");
        for hook in hooks.iter() {
            hook();
        }
    }

    fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let state = self.state.read().expect("session state poisoned").clone();
        if let Err(e) = write_state(path, &state) {
            log::warn!("session: failed to persist state: {e}");
        }
    }

    // --- accessors ----------------------------------------------------------

    /// The raw flag, without re-checking expiry.
    pub fn authenticated(&self) -> bool {
        self.state.read().expect("session state poisoned").authenticated
    }

    /// Expiry-checked authentication state. A token found to be expired here
    /// demotes the session to unauthenticated as a side effect.
    pub fn is_authenticated(&self) -> bool {
        let (has_token, expired) = {
            let state = self.state.read().expect("session state poisoned");
            match &state.token {
                Some(_) => (true, claims_expired(&state.claims)),
                None => (false, false),
            }
        };
        if !has_token {
            return false;
        }
        if expired {
            log::info!("session: token expired");
            self.reset();
            return false;
        }
        self.authenticated()
    }

    pub fn token(&self) -> Option<String> {
        self.state.read().expect("session state poisoned").token.clone()
    }

    pub fn claims(&self) -> Value {
        self.state.read().expect("session state poisoned").claims.clone()
    }

    pub fn user_id(&self) -> Value {
        self.state.read().expect("session state poisoned").user_id.clone()
    }

    pub fn has_role(&self, role: &str) -> bool {
        let state = self.state.read().expect("session state poisoned");
        state.claims["roles"]
            .as_array()
            .map(|roles| roles.iter().any(|r| r.as_str() == Some(role)))
            .unwrap_or(false)
    }

    // --- waiting ------------------------------------------------------------

    /// Block until the session is authenticated, or fail after `bound`.
    pub async fn wait_for_authenticated(&self, bound: Duration) -> Result<(), ApiError> {
        if self.is_authenticated() {
            return Ok(());
        }
        log::info!("session: not authenticated, waiting for authentication");

        let mut rx = self.auth_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        match tokio::time::timeout(bound, wait).await {
            Ok(()) => Ok(()),
            Err(_) => {
                log::warn!("session: timeout waiting for authentication");
                Err(ApiError::AuthWaitTimeout)
            }
        }
    }

    // --- app-wide slots -----------------------------------------------------

    /// Register the notification callback the API client forwards backend
    /// `messages` to. A single slot; setting replaces the previous callback.
    pub fn set_toast(&self, toast: impl Fn(&str) + Send + Sync + 'static) {
        *self.toast.write().expect("toast poisoned") = Some(Box::new(toast));
    }

    pub fn toast(&self, message: &str) {
        if let Some(toast) = self.toast.read().expect("toast poisoned").as_ref() {
            toast(message);
        }
    }

    /// A single current-error value, not a queue: later errors overwrite.
    pub fn set_error_message(&self, message: &str) {
        *self.error_message.lock().expect("error slot poisoned") = Some(message.to_string());
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_message.lock().expect("error slot poisoned").clone()
    }

    pub fn clear_error_message(&self) {
        *self.error_message.lock().expect("error slot poisoned") = None;
    }

    /// Register a hook run synchronously on every session transition
    /// (login and logout). The backend layer clears its response cache here.
    pub fn on_session_change(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.invalidation_hooks
            .lock()
            .expect("hooks poisoned")
            .push(Box::new(hook));
    }
}

fn write_state(path: &Path, state: &SessionState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(state)?;
    std::fs::write(path, raw)?;
    Ok(())
}

/// Decode the claims segment of a JWT without verifying the signature.
fn decode_claims(token: &str) -> Result<Value> {
    let mut parts = token.split('.');
    let _header = parts.next().ok_or_else(|| anyhow!("empty token"))?;
    let payload = parts.next().ok_or_else(|| anyhow!("token has no payload segment"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("payload is not base64url")?;
    serde_json::from_slice(&bytes).context("payload is not JSON")
}

fn claims_expired(claims: &Value) -> bool {
    match claims.get("exp").and_then(|v| v.as_i64()) {
        Some(exp) => exp <= Utc::now().timestamp(),
        // No expiry claim: treat as non-expiring, as the original decoder did.
        None => false,
    }
}

#[cfg(test)]
pub(crate) fn make_test_jwt(id: i64, roles: &[&str], exp_offset_secs: i64) -> String {
    let header = serde_json::json!({"alg": "HS256", "typ": "JWT"});
    let payload = serde_json::json!({
        "id": id,
        "roles": roles,
        "exp": Utc::now().timestamp() + exp_offset_secs,
    });
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(payload.to_string()),
    )
}
