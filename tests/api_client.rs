//! Status-code and recovery behavior of the low-level API client, exercised
//! against a scripted transport.

mod common;

use adminbase::api::{ApiClient, ApiClientOptions, CallOptions, RawResponse, Transport};
use adminbase::error::ApiError;
use adminbase::session::SessionStore;
use common::{make_jwt, MockTransport};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn client_with(
    store: Arc<SessionStore>,
    transport: Arc<MockTransport>,
    auth_retry_max: u32,
) -> Arc<ApiClient> {
    ApiClient::new(
        store,
        transport,
        ApiClientOptions {
            auth_wait: Duration::from_secs(2),
            auth_retry_max,
            lock_timeout: Duration::from_secs(5),
        },
    )
}

fn authed_store() -> Arc<SessionStore> {
    let store = SessionStore::new();
    store.set_token(&make_jwt(1, 3600));
    store
}

#[tokio::test]
async fn success_returns_data_and_forwards_messages() {
    let store = authed_store();
    let toasts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let toasts_clone = Arc::clone(&toasts);
    store.set_toast(move |m| toasts_clone.lock().unwrap().push(m.to_string()));

    let transport = Arc::new(MockTransport::new());
    transport.push_json(200, json!({"data": {"rows": [1, 2]}, "messages": ["saved"]}));

    let api = client_with(store, Arc::clone(&transport), 3);
    let response = api
        .call_json("/api/core/table/rows", json!({}), &CallOptions::default())
        .await
        .unwrap();

    assert!(response.ok);
    assert_eq!(response.data, json!({"rows": [1, 2]}));
    assert_eq!(toasts.lock().unwrap().as_slice(), ["saved"]);
}

#[tokio::test]
async fn retries_401_transparently_after_relogin() {
    let store = authed_store();
    let transport = Arc::new(MockTransport::new());
    transport.push_json(401, json!({}));
    transport.push_json(200, json!({"data": {"x": 1}}));

    // Track unauthenticated -> authenticated transitions during the call.
    let transitions = Arc::new(Mutex::new(0usize));
    let transitions_clone = Arc::clone(&transitions);
    let was_authed = Arc::new(Mutex::new(true));
    let was_clone = Arc::clone(&was_authed);
    let store_watch = Arc::clone(&store);
    store.on_session_change(move || {
        let now = store_watch.authenticated();
        let mut was = was_clone.lock().unwrap();
        if !*was && now {
            *transitions_clone.lock().unwrap() += 1;
        }
        *was = now;
    });

    // Re-login arrives while the client is waiting out the 401.
    let store_login = Arc::clone(&store);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        store_login.set_token(&make_jwt(1, 3600));
    });

    let api = client_with(Arc::clone(&store), Arc::clone(&transport), 3);
    let response = api
        .call_json("/api/core/table/rows", json!({}), &CallOptions::default())
        .await
        .unwrap();

    assert_eq!(response.data, json!({"x": 1}));
    assert_eq!(transport.calls(), 2);
    assert!(store.authenticated());
    assert_eq!(*transitions.lock().unwrap(), 1);
}

#[tokio::test]
async fn gives_up_after_the_401_retry_cap() {
    let store = SessionStore::new();
    let transport = Arc::new(MockTransport::new());
    transport.push_json(401, json!({}));
    transport.push_json(401, json!({}));

    let api = client_with(store, Arc::clone(&transport), 1);
    let opts = CallOptions {
        auth: false,
        ..Default::default()
    };
    let err = api
        .call_json("/api/core/table/rows", json!({}), &opts)
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::AuthRetriesExhausted(1)));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn permission_denied_is_terminal_and_never_retried() {
    let store = authed_store();
    let transport = Arc::new(MockTransport::new());
    transport.push_json(403, json!({}));

    let api = client_with(Arc::clone(&store), Arc::clone(&transport), 3);
    let err = api
        .call_json("/api/core/table/rows", json!({}), &CallOptions::default())
        .await
        .unwrap_err();

    assert!(err.is_permission_denied());
    assert_eq!(transport.calls(), 1);
    // Still published app-wide.
    assert!(store.error_message().unwrap().contains("Access Denied"));
}

#[tokio::test]
async fn application_error_message_is_extracted_from_the_body() {
    let store = authed_store();
    let transport = Arc::new(MockTransport::new());
    transport.push_json(500, json!({"error": "Row is locked"}));

    let api = client_with(Arc::clone(&store), transport, 3);
    let err = api
        .call_json("/api/core/row/update", json!({}), &CallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Row is locked");
    assert_eq!(store.error_message().as_deref(), Some("Row is locked"));
}

#[tokio::test]
async fn suppressed_failures_skip_the_global_error_slot() {
    let store = authed_store();
    let transport = Arc::new(MockTransport::new());
    transport.push_json(500, json!({"error": "quiet failure"}));

    let api = client_with(Arc::clone(&store), transport, 3);
    let opts = CallOptions {
        suppress_dialog: true,
        ..Default::default()
    };
    let err = api
        .call_json("/api/core/row/update", json!({}), &opts)
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "quiet failure");
    assert_eq!(store.error_message(), None);
}

#[tokio::test]
async fn slow_responses_lose_the_timeout_race() {
    let store = authed_store();
    let transport = Arc::new(MockTransport::new());
    transport.push_delayed(
        Duration::from_millis(300),
        RawResponse::json(200, &json!({"data": {}})),
    );

    let api = client_with(store, transport, 3);
    let opts = CallOptions {
        timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let err = api
        .call_json("/api/core/table/rows", json!({}), &opts)
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Timeout(50)));
}

#[tokio::test]
async fn waiting_for_auth_times_out_when_nobody_logs_in() {
    let store = SessionStore::new();
    let transport = Arc::new(MockTransport::new());
    let api = ApiClient::new(
        store,
        Arc::clone(&transport) as Arc<dyn Transport>,
        ApiClientOptions {
            auth_wait: Duration::from_millis(50),
            auth_retry_max: 3,
            lock_timeout: Duration::from_secs(5),
        },
    );

    let err = api
        .call_json("/api/core/table/rows", json!({}), &CallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::AuthWaitTimeout));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn out_of_order_completion_on_the_unqueued_path() {
    // Without queueing, the last response to arrive wins over the last
    // request issued. This documents the race rather than hiding it.
    let store = authed_store();
    let transport = Arc::new(MockTransport::new());
    transport.push_delayed(
        Duration::from_millis(200),
        RawResponse::json(200, &json!({"data": {"v": 1}})),
    );
    transport.push_json(200, json!({"data": {"v": 2}}));

    let api = client_with(store, transport, 3);
    let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

    let first = {
        let api = Arc::clone(&api);
        let order = Arc::clone(&order);
        tokio::spawn(async move {
            let r = api
                .call_json("/api/core/table/rows", json!({"page": 1}), &CallOptions::default())
                .await
                .unwrap();
            order.lock().unwrap().push(r.data["v"].as_i64().unwrap());
        })
    };
    // Issue the second call after the first is in flight.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = {
        let api = Arc::clone(&api);
        let order = Arc::clone(&order);
        tokio::spawn(async move {
            let r = api
                .call_json("/api/core/table/rows", json!({"page": 2}), &CallOptions::default())
                .await
                .unwrap();
            order.lock().unwrap().push(r.data["v"].as_i64().unwrap());
        })
    };

    first.await.unwrap();
    second.await.unwrap();
    // The later request's response arrived first.
    assert_eq!(order.lock().unwrap().as_slice(), [2, 1]);
}

#[tokio::test]
async fn concurrent_downloads_of_one_url_collapse_to_a_single_get() {
    let store = authed_store();
    let transport = Arc::new(MockTransport::new());
    transport.push_delayed(
        Duration::from_millis(100),
        RawResponse {
            status: 200,
            body: b"binary".to_vec(),
            content_type: Some("image/png".to_string()),
            content_disposition: Some(r#"attachment; filename="pic.png""#.to_string()),
        },
    );

    let api = client_with(store, Arc::clone(&transport), 3);
    let path = "/api/core/attachment/download/42";

    let a = {
        let api = Arc::clone(&api);
        tokio::spawn(async move { api.download(path, None, &CallOptions::default()).await })
    };
    let b = {
        let api = Arc::clone(&api);
        tokio::spawn(async move { api.download(path, None, &CallOptions::default()).await })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert_eq!(transport.calls(), 1);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.filename, "pic.png");
    assert_eq!(a.bytes, b"binary");
}

#[tokio::test]
async fn download_401_logs_out_and_fails() {
    let store = authed_store();
    let transport = Arc::new(MockTransport::new());
    transport.push(RawResponse {
        status: 401,
        body: Vec::new(),
        content_type: None,
        content_disposition: None,
    });

    let api = client_with(Arc::clone(&store), transport, 3);
    let err = api
        .download("/api/core/attachment/download/42", None, &CallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::AuthRequired));
    assert!(!store.authenticated());
}
