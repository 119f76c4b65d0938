//! Integration tests for the todod JSON-RPC server.
//! Spins up a real daemon on a free port and tests every RPC method over a
//! live WebSocket connection.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use todod::cli::client::DaemonClient;
use todod::config::{ConfigWatcher, DaemonConfig, RecoveryPolicy};
use todod::ipc::event::EventBroadcaster;
use todod::store::TaskStore;
use todod::AppContext;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Start a daemon on a random port and return the WebSocket URL.
///
/// `auth_token` is empty (auth disabled) unless a token is passed.
async fn start_test_daemon(auth_token: &str) -> (String, PathBuf, Arc<AppContext>) {
    let data_dir = tempfile::tempdir().unwrap().keep();
    let port = get_free_port();

    let config = Arc::new(DaemonConfig::new(
        Some(port),
        Some(data_dir.clone()),
        Some("warn".to_string()),
        None,
    ));
    let store = Arc::new(
        TaskStore::open(&data_dir, RecoveryPolicy::Permissive)
            .await
            .unwrap(),
    );
    let ctx = Arc::new(AppContext {
        config,
        store,
        broadcaster: Arc::new(EventBroadcaster::new()),
        started_at: std::time::Instant::now(),
        auth_token: auth_token.to_string(),
        hot_config: None,
    });

    let ctx_server = ctx.clone();
    tokio::spawn(async move {
        todod::ipc::run(ctx_server).await.ok();
    });

    // Give server a moment to bind
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let url = format!("ws://127.0.0.1:{port}");
    (url, data_dir, ctx)
}

fn get_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// One-shot RPC call on a fresh connection; returns the whole response object.
async fn ws_rpc_raw(url: &str, method: &str, params: Value) -> Value {
    let (mut ws, _) = connect_async(url).await.expect("ws connect failed");

    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params
    });
    ws.send(Message::Text(serde_json::to_string(&request).unwrap()))
        .await
        .unwrap();

    loop {
        let msg = ws.next().await.expect("ws closed").expect("ws error");
        if let Message::Text(text) = msg {
            let v: Value = serde_json::from_str(&text).unwrap();
            // Skip notifications (no id)
            if v.get("id").and_then(|x| x.as_i64()) == Some(1) {
                return v;
            }
        }
    }
}

/// One-shot RPC call; panics on RPC error, returns the result.
async fn ws_rpc(url: &str, method: &str, params: Value) -> Value {
    let v = ws_rpc_raw(url, method, params).await;
    assert!(
        v.get("error").is_none(),
        "unexpected RPC error: {}",
        v["error"]
    );
    v["result"].clone()
}

fn texts(collection: &Value) -> Vec<&str> {
    collection
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["text"].as_str().unwrap())
        .collect()
}

#[tokio::test]
async fn ping_and_status() {
    let (url, _dir, _ctx) = start_test_daemon("").await;

    let pong = ws_rpc(&url, "daemon.ping", json!({})).await;
    assert_eq!(pong["pong"], true);

    let status = ws_rpc(&url, "daemon.status", json!({})).await;
    assert_eq!(status["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(status["todos"], 0);
    // No hot-config watcher in the test harness — status falls back to the
    // level the daemon was configured with.
    assert_eq!(status["logLevel"], "warn");
}

#[tokio::test]
async fn reachability_probe_detects_a_running_daemon() {
    let (_url, _dir, ctx) = start_test_daemon("").await;

    let client = DaemonClient::new(ctx.config.port, String::new());
    assert!(client.is_reachable().await);

    // Nothing listens on a freshly allocated port.
    let dead = DaemonClient::new(get_free_port(), String::new());
    assert!(!dead.is_reachable().await);
}

#[tokio::test]
async fn status_reports_the_cli_resolved_log_level() {
    // `todod serve --log debug` with no config.toml: daemon.status must
    // report "debug", not the config-file default.
    let data_dir = tempfile::tempdir().unwrap().keep();
    let port = get_free_port();

    let config = Arc::new(DaemonConfig::new(
        Some(port),
        Some(data_dir.clone()),
        Some("debug".to_string()),
        None,
    ));
    let store = Arc::new(
        TaskStore::open(&data_dir, RecoveryPolicy::Permissive)
            .await
            .unwrap(),
    );
    let watcher = ConfigWatcher::start(&data_dir, &config.log).expect("watcher should start");
    let ctx = Arc::new(AppContext {
        config,
        store,
        broadcaster: Arc::new(EventBroadcaster::new()),
        started_at: std::time::Instant::now(),
        auth_token: String::new(),
        hot_config: Some(watcher.hot.clone()),
    });

    let ctx_server = ctx.clone();
    tokio::spawn(async move {
        todod::ipc::run(ctx_server).await.ok();
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let url = format!("ws://127.0.0.1:{port}");
    let status = ws_rpc(&url, "daemon.status", json!({})).await;
    assert_eq!(status["logLevel"], "debug");
}

#[tokio::test]
async fn full_todo_scenario() {
    let (url, _dir, _ctx) = start_test_daemon("").await;

    // Empty at start
    let todos = ws_rpc(&url, "get-todos", json!({})).await;
    assert_eq!(todos.as_array().unwrap().len(), 0);

    // add("buy milk") → 1 record, completed = false
    let todos = ws_rpc(&url, "add-todo", json!({ "text": "buy milk" })).await;
    assert_eq!(texts(&todos), ["buy milk"]);
    assert_eq!(todos[0]["completed"], false);
    let milk_id = todos[0]["id"].as_i64().unwrap();

    // add("walk dog") → 2 records in insertion order
    let todos = ws_rpc(&url, "add-todo", json!({ "text": "walk dog" })).await;
    assert_eq!(texts(&todos), ["buy milk", "walk dog"]);
    let dog_id = todos[1]["id"].as_i64().unwrap();
    assert!(dog_id > milk_id);

    // toggle("buy milk") → completed flips, other record untouched
    let todos = ws_rpc(&url, "toggle-todo", json!({ "id": milk_id })).await;
    assert_eq!(todos[0]["completed"], true);
    assert_eq!(todos[1]["completed"], false);

    // delete("walk dog") → only the completed "buy milk" remains
    let todos = ws_rpc(&url, "delete-todo", json!({ "id": dog_id })).await;
    assert_eq!(texts(&todos), ["buy milk"]);
    assert_eq!(todos[0]["completed"], true);
}

#[tokio::test]
async fn missing_ids_are_noops_not_errors() {
    let (url, _dir, _ctx) = start_test_daemon("").await;

    ws_rpc(&url, "add-todo", json!({ "text": "only one" })).await;

    let after_toggle = ws_rpc(&url, "toggle-todo", json!({ "id": 12345 })).await;
    assert_eq!(texts(&after_toggle), ["only one"]);
    assert_eq!(after_toggle[0]["completed"], false);

    let after_delete = ws_rpc(&url, "delete-todo", json!({ "id": 12345 })).await;
    assert_eq!(texts(&after_delete), ["only one"]);
}

#[tokio::test]
async fn mutations_are_visible_after_a_store_reopen() {
    let (url, dir, _ctx) = start_test_daemon("").await;

    let returned = ws_rpc(&url, "add-todo", json!({ "text": "persist me" })).await;

    // Reload from disk as a fresh process would.
    let reopened = TaskStore::open(&dir, RecoveryPolicy::Permissive)
        .await
        .unwrap();
    let tasks = reopened.list().await;
    assert_eq!(serde_json::to_value(tasks).unwrap(), returned);
}

#[tokio::test]
async fn unknown_method_returns_method_not_found() {
    let (url, _dir, _ctx) = start_test_daemon("").await;

    let v = ws_rpc_raw(&url, "drop-all-todos", json!({})).await;
    assert_eq!(v["error"]["code"], -32601);
}

#[tokio::test]
async fn bad_params_return_invalid_params() {
    let (url, _dir, _ctx) = start_test_daemon("").await;

    // add-todo requires a "text" field
    let v = ws_rpc_raw(&url, "add-todo", json!({})).await;
    assert_eq!(v["error"]["code"], -32602);

    // toggle-todo requires an integer id
    let v = ws_rpc_raw(&url, "toggle-todo", json!({ "id": "not-a-number" })).await;
    assert_eq!(v["error"]["code"], -32602);
}

#[tokio::test]
async fn wrong_jsonrpc_version_is_rejected() {
    let (url, _dir, _ctx) = start_test_daemon("").await;
    let (mut ws, _) = connect_async(&url).await.unwrap();

    let request = json!({ "jsonrpc": "1.0", "id": 1, "method": "daemon.ping" });
    ws.send(Message::Text(request.to_string())).await.unwrap();

    if let Some(Ok(Message::Text(text))) = ws.next().await {
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["error"]["code"], -32600);
    } else {
        panic!("expected a response frame");
    }
}

#[tokio::test]
async fn auth_gates_every_method() {
    let (url, _dir, _ctx) = start_test_daemon("secret-token").await;

    // Calling without auth first is rejected.
    let v = ws_rpc_raw(&url, "get-todos", json!({})).await;
    assert_eq!(v["error"]["code"], -32004);

    // Wrong token is rejected.
    let v = ws_rpc_raw(&url, "daemon.auth", json!({ "token": "wrong" })).await;
    assert_eq!(v["error"]["code"], -32004);

    // Correct token unlocks the connection.
    let (mut ws, _) = connect_async(&url).await.unwrap();
    let auth = json!({
        "jsonrpc": "2.0", "id": 1,
        "method": "daemon.auth", "params": { "token": "secret-token" }
    });
    ws.send(Message::Text(auth.to_string())).await.unwrap();
    let resp = ws.next().await.unwrap().unwrap();
    if let Message::Text(text) = resp {
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["result"]["authenticated"], true);
    } else {
        panic!("expected auth response");
    }

    let req = json!({ "jsonrpc": "2.0", "id": 2, "method": "get-todos", "params": {} });
    ws.send(Message::Text(req.to_string())).await.unwrap();
    loop {
        let msg = ws.next().await.unwrap().unwrap();
        if let Message::Text(text) = msg {
            let v: Value = serde_json::from_str(&text).unwrap();
            if v.get("id").and_then(|x| x.as_i64()) == Some(2) {
                assert!(v["result"].is_array());
                break;
            }
        }
    }
}

#[tokio::test]
async fn mutation_broadcasts_todos_changed() {
    let (url, _dir, _ctx) = start_test_daemon("").await;

    // Listener connection — just subscribes and waits.
    let (mut listener, _) = connect_async(&url).await.unwrap();
    // Let the server task register its broadcast subscription.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // Mutate from a second connection.
    ws_rpc(&url, "add-todo", json!({ "text": "notify me" })).await;

    let deadline = std::time::Duration::from_secs(5);
    let notification = tokio::time::timeout(deadline, async {
        loop {
            if let Some(Ok(Message::Text(text))) = listener.next().await {
                let v: Value = serde_json::from_str(&text).unwrap();
                if v["method"] == "todos.changed" {
                    return v;
                }
            }
        }
    })
    .await
    .expect("no todos.changed notification received");

    assert_eq!(notification["params"]["count"], 1);
}

#[tokio::test]
async fn health_endpoint_answers_plain_http() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (url, _dir, _ctx) = start_test_daemon("").await;
    let addr = url.strip_prefix("ws://").unwrap();

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf);

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let v: Value = serde_json::from_str(body).unwrap();
    assert_eq!(v["status"], "ok");
    assert_eq!(v["todos"], 0);
}
