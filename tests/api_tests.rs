use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use evently_api::api;
use evently_api::db::Db;
use evently_api::ledger::event_id::{EventId, LedgerId};
use evently_api::ledger::events::PersistedEvent;
use evently_api::AppState;
use serde_json::json;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

const LEDGER: LedgerId = LedgerId(0x2a);

/// Helper: start a test server and return its base URL plus the shared
/// state. The pool connects lazily to a port nothing listens on, so every
/// path that does not need the database runs for real.
async fn start_test_server() -> (String, Arc<AppState>) {
    let options = PgConnectOptions::new()
        .host("127.0.0.1")
        .port(59_999)
        .username("unused")
        .database("unused");
    let pool = PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(200))
        .connect_lazy_with(options);
    let state = AppState::new(Db::new(pool));

    let app = api::router(Arc::clone(&state), None);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("failed to get addr");
    let base_url = format!("http://{}", addr);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (base_url, state)
}

fn bearer(claims: serde_json::Value) -> String {
    format!(
        "Bearer {}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap())
    )
}

fn client_token() -> String {
    bearer(json!({"ledger": LEDGER.to_string(), "roles": ["client"]}))
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let (base, _state) = start_test_server().await;
    let res = reqwest::get(format!("{base}/")).await.unwrap();
    assert_eq!(res.status(), 401);
    assert_eq!(
        res.headers().get("www-authenticate").unwrap(),
        "Bearer realm=\"evently\""
    );
}

#[tokio::test]
async fn test_invalid_token_is_unauthorized() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let res = client
        .get(format!("{base}/"))
        .header("authorization", "Bearer not-base64!!!")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
}

#[tokio::test]
async fn test_root_hypermedia() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let res = client
        .get(format!("{base}/"))
        .header("authorization", client_token())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    // Security headers ride on every response.
    assert_eq!(
        res.headers().get("content-security-policy").unwrap(),
        "upgrade-insecure-requests; default-src https:"
    );
    assert_eq!(res.headers().get("x-content-type-options").unwrap(), "nosniff");

    let body: serde_json::Value = res.json().await.unwrap();
    for rel in ["ledgers", "registry", "selectors", "append", "notify"] {
        assert!(body["_links"][rel]["href"].is_string(), "missing link {rel}");
    }
}

#[tokio::test]
async fn test_health() {
    let (base, _state) = start_test_server().await;
    let res = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_rbac_denies_wrong_role() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();

    // A reader cannot append.
    let res = client
        .post(format!("{base}/append"))
        .header(
            "authorization",
            bearer(json!({"ledger": LEDGER.to_string(), "roles": ["reader"]})),
        )
        .json(&json!({"event": "x", "entities": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 403);

    // A client cannot manage the registry.
    let res = client
        .get(format!("{base}/registry"))
        .header("authorization", client_token())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 403);

    // A client cannot administer ledgers.
    let res = client
        .get(format!("{base}/ledgers"))
        .header("authorization", client_token())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 403);
}

#[tokio::test]
async fn test_invalid_selector_token_is_bad_request() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let res = client
        .get(format!("{base}/selectors/%21%21garbage.ndjson"))
        .header("authorization", client_token())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["message"], "invalid URI part");
}

#[tokio::test]
async fn test_selector_without_ndjson_suffix_is_not_found() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let res = client
        .get(format!("{base}/selectors/sometoken"))
        .header("authorization", client_token())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn test_selector_lookup_rejects_plain_selector() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let res = client
        .post(format!("{base}/selectors"))
        .header("authorization", client_token())
        .json(&json!({"limit": 5}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 422);
}

#[tokio::test]
async fn test_open_channel_and_subscribe_idempotently() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{base}/notify/open-channel"))
        .header("authorization", client_token())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);
    let body: serde_json::Value = res.json().await.unwrap();
    let channel = body["channelId"].as_str().unwrap().to_string();

    let subscribe = |selector: serde_json::Value| {
        let client = client.clone();
        let url = format!("{base}/notify/{channel}/subscribe");
        async move {
            let res = client
                .post(url)
                .header("authorization", client_token())
                .json(&selector)
                .send()
                .await
                .unwrap();
            assert_eq!(res.status(), 201);
            let body: serde_json::Value = res.json().await.unwrap();
            body["subscriptionId"].as_str().unwrap().to_string()
        }
    };

    // Same canonical selector (limit stripped, key order neutral) -> same id.
    let first = subscribe(json!({"entities": {"order": ["o-1"]}, "limit": 5})).await;
    let second = subscribe(json!({"entities": {"order": ["o-1"]}})).await;
    assert_eq!(first, second);

    let res = client
        .get(format!("{base}/notify/{channel}/subscriptions/{first}"))
        .header("authorization", client_token())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["selector"]["entities"]["order"][0], "o-1");
    // The stored subscription has no limit.
    assert!(body["selector"].get("limit").is_none());

    let res = client
        .delete(format!("{base}/notify/{channel}/subscriptions/{first}"))
        .header("authorization", client_token())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 204);

    let res = client
        .get(format!("{base}/notify/{channel}/subscriptions/{first}"))
        .header("authorization", client_token())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn test_unknown_channel_is_not_found() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let res = client
        .get(format!("{base}/notify/nope"))
        .header("authorization", client_token())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn test_sse_rejects_last_event_id() {
    let (base, state) = start_test_server().await;
    let channel = state.channels.open(LEDGER);
    let client = reqwest::Client::new();
    let res = client
        .get(format!("{base}/notify/{channel}/sse"))
        .header("authorization", client_token())
        .header("last-event-id", "00000000000000010000000200000003")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
}

fn order_event(key: &str, timestamp: u64) -> Arc<PersistedEvent> {
    Arc::new(PersistedEvent::new(
        EventId::new(timestamp, 7, LEDGER),
        "order-placed".to_string(),
        json!({"order": [key]}),
        serde_json::Value::Null,
        json!({"total": 42}),
    ))
}

#[tokio::test]
async fn test_sse_fan_out() {
    let (base, state) = start_test_server().await;
    let client = reqwest::Client::new();

    let channel = state.channels.open(LEDGER);
    let res = client
        .post(format!("{base}/notify/{channel}/subscribe"))
        .header("authorization", client_token())
        .json(&json!({"entities": {"order": ["o-1"]}}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);
    let body: serde_json::Value = res.json().await.unwrap();
    let sub_id = body["subscriptionId"].as_str().unwrap().to_string();

    let mut res = client
        .get(format!("{base}/notify/{channel}/sse"))
        .header("authorization", client_token())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert!(res
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    // Give the handler a moment to attach the stream before dispatching.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A non-matching event first: it must produce no message.
    state.channels.dispatch(LEDGER, order_event("o-9", 1));
    // Then a matching event.
    let matching = order_event("o-1", 2);
    state.channels.dispatch(LEDGER, Arc::clone(&matching));

    let chunk = tokio::time::timeout(Duration::from_secs(5), res.chunk())
        .await
        .expect("timed out waiting for SSE message")
        .unwrap()
        .expect("stream ended early");
    let text = String::from_utf8_lossy(&chunk).to_string();
    assert!(text.contains("event: Subscriptions Triggered"), "got: {text}");
    assert!(text.contains(&format!("data: {sub_id}")), "got: {text}");
    assert!(text.contains(&format!("id: {}", matching.event_id)), "got: {text}");
    assert!(text.contains("retry: 10000"), "got: {text}");
    // The non-matching event produced nothing ahead of this message.
    assert!(!text.contains("o-9"));

    // Closing the channel ends the stream.
    let res_close = client
        .delete(format!("{base}/notify/{channel}"))
        .header("authorization", client_token())
        .send()
        .await
        .unwrap();
    assert_eq!(res_close.status(), 204);

    let end = tokio::time::timeout(Duration::from_secs(5), res.chunk())
        .await
        .expect("timed out waiting for stream end")
        .unwrap();
    assert!(end.is_none(), "stream should have ended");
}

#[tokio::test]
async fn test_append_requires_ledger_scoped_token() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let res = client
        .post(format!("{base}/append"))
        .header("authorization", bearer(json!({"roles": ["appender"]})))
        .json(&json!({"event": "x", "entities": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 403);
}

#[tokio::test]
async fn test_database_down_surfaces_as_service_unavailable() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    // The notify surface is process-local, but registry reads hit the
    // database; with nothing listening the pool fails to connect.
    let res = client
        .get(format!("{base}/registry/events"))
        .header(
            "authorization",
            bearer(json!({"ledger": LEDGER.to_string(), "roles": ["registrar"]})),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 503);
}
