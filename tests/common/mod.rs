//! Shared test fixtures: a scripted transport and JWT construction.

use adminbase::api::{RawResponse, RequestSpec, Transport};
use adminbase::error::ApiError;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Scripted = (Option<Duration>, Result<RawResponse, ApiError>);

/// Transport that replays a scripted sequence of responses, optionally
/// delaying each one, and records what was asked of it.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Scripted>>,
    paths: Mutex<Vec<String>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: RawResponse) {
        self.responses
            .lock()
            .unwrap()
            .push_back((None, Ok(response)));
    }

    pub fn push_delayed(&self, delay: Duration, response: RawResponse) {
        self.responses
            .lock()
            .unwrap()
            .push_back((Some(delay), Ok(response)));
    }

    pub fn push_json(&self, status: u16, body: serde_json::Value) {
        self.push(RawResponse::json(status, &body));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(
        &self,
        spec: RequestSpec,
        _bearer: Option<String>,
    ) -> Result<RawResponse, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().unwrap().push(spec.path().to_string());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let (delay, result) = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("mock transport ran out of scripted responses");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Unsigned-but-well-formed JWT with an `id` claim and relative expiry.
pub fn make_jwt(id: i64, exp_offset_secs: i64) -> String {
    let header = serde_json::json!({"alg": "HS256", "typ": "JWT"});
    let payload = serde_json::json!({
        "id": id,
        "roles": ["admin"],
        "exp": chrono::Utc::now().timestamp() + exp_offset_secs,
    });
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(payload.to_string()),
    )
}
