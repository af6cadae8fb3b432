//! Integration tests for the HTTP gateway and the WebSocket push channel

mod common;

use axum::{http::header, routing::post, Json, Router};
use common::{eventually, orchestrator, spawn_server, tab, ScriptedAgent, TestServer};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tabvox::storage::SnapshotStore;
use tempfile::TempDir;
use tokio_tungstenite::tungstenite::Message;

const NO_TTS: &str = "http://127.0.0.1:1/tts";

async fn server(max_sessions: usize, dir: &TempDir) -> TestServer {
    let orch = orchestrator(Arc::new(ScriptedAgent::new()), max_sessions);
    spawn_server(orch, &dir.path().join("sessions.json"), NO_TTS).await
}

async fn post_json(url: String, body: Value) -> (u16, Value) {
    let res = reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = res.status().as_u16();
    (status, res.json().await.unwrap())
}

async fn get_json(url: String) -> (u16, Value) {
    let res = reqwest::get(url).await.unwrap();
    let status = res.status().as_u16();
    (status, res.json().await.unwrap())
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(server: &TestServer) -> Socket {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();
    socket
}

/// Next event of `kind` on the socket
async fn next_event(socket: &mut Socket, kind: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let event: Value = serde_json::from_str(&text).unwrap();
                    if event["type"] == kind {
                        return event;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_health_reports_sessions() {
    let dir = TempDir::new().unwrap();
    let server = server(4, &dir).await;

    let (status, body) = get_json(server.url("/health")).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_send_command_pushes_response_to_socket() {
    let dir = TempDir::new().unwrap();
    let server = server(4, &dir).await;
    let mut socket = connect(&server).await;

    let (status, created) = post_json(
        server.url("/create_session"),
        json!({"tab_id": "tab-1", "project_name": "Alpha"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(created["success"], true);
    let event = next_event(&mut socket, "session_created").await;
    assert_eq!(event["tab_id"], "tab_1");

    let (_, sent) = post_json(
        server.url("/send_command"),
        json!({"tab_id": "tab_1", "command": "Hi, I'm Bob and I like pizza."}),
    )
    .await;
    assert_eq!(sent["success"], true);
    assert_eq!(sent["session_id"], created["session_id"]);

    let response = next_event(&mut socket, "response").await;
    assert_eq!(response["tab_id"], "tab_1");
    assert_eq!(response["text"], "reply 1");

    let (_, count) = get_json(server.url("/session_count")).await;
    assert_eq!(count["count"], 1);
}

#[tokio::test]
async fn test_realtime_stats_are_pushed() {
    let dir = TempDir::new().unwrap();
    let server = server(4, &dir).await;
    let mut socket = connect(&server).await;

    post_json(server.url("/create_session"), json!({"tab_id": "tab_3"})).await;
    let stats = next_event(&mut socket, "realtime_stats").await;
    assert_eq!(stats["tab_id"], "tab_3");
    assert_eq!(stats["is_processing"], false);
    assert!(stats["duration"].is_number());
    assert!(stats["tokens"].is_number());
}

#[tokio::test]
async fn test_switch_tab_over_socket() {
    let dir = TempDir::new().unwrap();
    let server = server(4, &dir).await;
    let mut socket = connect(&server).await;

    socket
        .send(Message::Text(
            json!({"type": "switch_tab", "tab_id": "tab-2"}).to_string(),
        ))
        .await
        .unwrap();

    let event = next_event(&mut socket, "tab_switched").await;
    assert_eq!(event["tab_id"], "tab_2");
    assert_eq!(server.state.orchestrator.active_tab(), Some(tab("tab_2")));

    let (_, listing) = get_json(server.url("/sessions")).await;
    assert_eq!(listing["active_tab"], "tab_2");
    assert_eq!(listing["sessions"][0]["project_name"], "Tab tab_2");
}

#[tokio::test]
async fn test_invalid_tab_id_is_rejected() {
    let dir = TempDir::new().unwrap();
    let server = server(4, &dir).await;

    let (status, body) = post_json(
        server.url("/send_command"),
        json!({"tab_id": "  ", "command": "hello"}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_malformed_bodies_get_failure_shape() {
    let dir = TempDir::new().unwrap();
    let server = server(4, &dir).await;

    let (status, body) = post_json(server.url("/create_session"), json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("tab_id"));

    let (status, body) = post_json(server.url("/send_command"), json!({"tab_id": "tab_1"})).await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("command"));

    let (status, body) = post_json(
        server.url("/send_command"),
        json!({"tab_id": "tab_1", "command": "   "}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Empty command");

    let res = reqwest::Client::new()
        .post(server.url("/switch_tab"))
        .header(header::CONTENT_TYPE, "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);

    assert_eq!(server.state.orchestrator.session_count(), 0);
}

#[tokio::test]
async fn test_admission_failure_is_structured() {
    let dir = TempDir::new().unwrap();
    let server = server(0, &dir).await;

    let (status, body) = post_json(
        server.url("/create_session"),
        json!({"tab_id": "tab_1", "project_name": "Alpha"}),
    )
    .await;
    assert_eq!(status, 500);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Maximum number of sessions reached");
}

#[tokio::test]
async fn test_session_info_and_close() {
    let dir = TempDir::new().unwrap();
    let server = server(4, &dir).await;
    post_json(
        server.url("/create_session"),
        json!({"tab_id": "tab-1", "project_name": "Alpha"}),
    )
    .await;

    let (status, info) = get_json(server.url("/sessions/tab-1")).await;
    assert_eq!(status, 200);
    assert_eq!(info["project_name"], "Alpha");
    assert_eq!(info["is_processing"], false);

    let (status, _) = get_json(server.url("/sessions/tab_9")).await;
    assert_eq!(status, 404);

    let (_, closed) = post_json(server.url("/close_session"), json!({"tab_id": "tab_1"})).await;
    assert_eq!(closed["success"], true);
    assert_eq!(closed["closed"], true);
    let (_, count) = get_json(server.url("/session_count")).await;
    assert_eq!(count["count"], 0);
}

#[tokio::test]
async fn test_persistence_survives_restart() {
    let dir = TempDir::new().unwrap();
    let first = server(4, &dir).await;

    for (tab_id, text) in [("tab_1", "hello one"), ("tab_2", "hello two")] {
        first
            .state
            .orchestrator
            .route_message(&tab(tab_id), text)
            .await
            .unwrap();
    }
    let snapshot = first.state.orchestrator.snapshot().await;
    let mut body = serde_json::to_value(&snapshot).unwrap();
    body["tabNames"] = json!({"tab_1": "Alpha", "tab_2": "Beta"});
    body.as_object_mut().unwrap().remove("tab_names");
    body["activeTab"] = json!("tab_2");

    let (status, saved) = post_json(first.url("/save_sessions"), body).await;
    assert_eq!(status, 200);
    assert_eq!(saved["success"], true);

    // A fresh server over the same blob
    let second = server(4, &dir).await;
    let (_, loaded) = get_json(second.url("/load_sessions")).await;
    assert_eq!(loaded["success"], true);
    assert_eq!(loaded["hasData"], true);
    assert_eq!(loaded["tabNames"]["tab_1"], "Alpha");
    assert_eq!(loaded["tabNames"]["tab_2"], "Beta");
    assert_eq!(loaded["conversations"]["tab_1"][0]["text"], "hello one");
    assert_eq!(loaded["conversations"]["tab_2"][1]["role"], "assistant");
    assert_eq!(loaded["activeTab"], "tab_2");

    let stored = SnapshotStore::new(dir.path().join("sessions.json"))
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(stored.conversations, snapshot.conversations);
    assert_eq!(second.state.orchestrator.restore(&stored).await, 2);
    assert_eq!(
        second
            .state
            .orchestrator
            .get_session_info(&tab("tab_2"))
            .unwrap()
            .project_name,
        "Beta"
    );
}

#[tokio::test]
async fn test_ui_conversations_read_back_unchanged() {
    let dir = TempDir::new().unwrap();
    let server = server(4, &dir).await;

    let conversations = json!({
        "tab_1": [
            {"role": "user", "content": "hi", "timestamp": 1700000000000i64},
            {"role": "assistant", "content": "hello", "timestamp": 1700000001000i64, "spoken": true}
        ],
        "tab_2": [
            {"role": "user", "text": "plain"},
            {"role": "assistant", "text": "iso", "timestamp": "2024-01-02T03:04:05Z"}
        ]
    });
    let (status, saved) = post_json(
        server.url("/save_sessions"),
        json!({"conversations": conversations, "tabNames": {"tab_1": "Alpha"}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(saved["success"], true);

    let (_, loaded) = get_json(server.url("/load_sessions")).await;
    assert_eq!(loaded["conversations"]["tab_1"], conversations["tab_1"]);
    assert_eq!(loaded["conversations"]["tab_2"][0], conversations["tab_2"][0]);
    assert_eq!(loaded["conversations"]["tab_2"][1]["text"], "iso");
    assert!(loaded["conversations"]["tab_2"][1]["timestamp"]
        .as_str()
        .unwrap()
        .starts_with("2024-01-02T03:04:05"));
    assert_eq!(loaded["tabNames"]["tab_1"], "Alpha");
}

#[tokio::test]
async fn test_autosave_keeps_saved_names_and_idle_tabs() {
    let dir = TempDir::new().unwrap();
    let server = server(4, &dir).await;

    let idle = json!([{"role": "user", "content": "old", "timestamp": 1700000000000i64}]);
    post_json(
        server.url("/save_sessions"),
        json!({
            "conversations": {"tab_9": idle},
            "tabNames": {"tab_1": "Alpha", "tab_9": "Archive"},
            "activeTab": "tab_1"
        }),
    )
    .await;
    post_json(server.url("/settings"), json!({"save_mode": true})).await;
    post_json(
        server.url("/send_command"),
        json!({"tab_id": "tab_1", "command": "remember this"}),
    )
    .await;

    let store = SnapshotStore::new(dir.path().join("sessions.json"));
    eventually(|| {
        store
            .load()
            .ok()
            .flatten()
            .is_some_and(|s| s.conversations.get(&tab("tab_1")).is_some_and(|t| t.len() == 2))
    })
    .await;

    let (_, loaded) = get_json(server.url("/load_sessions")).await;
    assert_eq!(loaded["tabNames"]["tab_1"], "Alpha");
    assert_eq!(loaded["tabNames"]["tab_9"], "Archive");
    assert_eq!(loaded["conversations"]["tab_9"], idle);
    assert_eq!(loaded["conversations"]["tab_1"][0]["text"], "remember this");
    assert_eq!(loaded["cumulative"]["tab_1"]["message_count"], 1);
    assert_eq!(loaded["activeTab"], "tab_1");
}

#[tokio::test]
async fn test_clear_sessions_removes_blob() {
    let dir = TempDir::new().unwrap();
    let server = server(4, &dir).await;

    let (_, empty) = get_json(server.url("/load_sessions")).await;
    assert_eq!(empty["hasData"], false);

    post_json(
        server.url("/save_sessions"),
        json!({"conversations": {"tab_1": [{"role": "user", "content": "hi"}]}}),
    )
    .await;
    let (_, loaded) = get_json(server.url("/load_sessions")).await;
    assert_eq!(loaded["hasData"], true);

    let (_, cleared) = post_json(server.url("/clear_sessions"), json!({})).await;
    assert_eq!(cleared["success"], true);
    let (_, after) = get_json(server.url("/load_sessions")).await;
    assert_eq!(after["hasData"], false);
}

#[tokio::test]
async fn test_save_mode_persists_each_reply() {
    let dir = TempDir::new().unwrap();
    let server = server(4, &dir).await;

    let (_, settings) = get_json(server.url("/settings")).await;
    assert_eq!(settings["save_mode"], false);
    let (_, updated) = post_json(server.url("/settings"), json!({"save_mode": true})).await;
    assert_eq!(updated["save_mode"], true);

    post_json(
        server.url("/send_command"),
        json!({"tab_id": "tab_1", "command": "remember this"}),
    )
    .await;

    let store = SnapshotStore::new(dir.path().join("sessions.json"));
    eventually(|| {
        store
            .load()
            .ok()
            .flatten()
            .is_some_and(|s| s.conversations.get(&tab("tab_1")).is_some_and(|t| t.len() == 2))
    })
    .await;
    let saved = store.load().unwrap().unwrap();
    assert_eq!(saved.cumulative[&tab("tab_1")].message_count, 1);
    assert_eq!(saved.tab_names[&tab("tab_1")], "Tab tab_1");
}

#[tokio::test]
async fn test_tts_is_proxied() {
    let fake_tts = Router::new().route(
        "/tts",
        post(|Json(body): Json<Value>| async move {
            let audio = format!(
                "AUDIO:{}:{}",
                body["voice"].as_str().unwrap_or_default(),
                body["text"].as_str().unwrap_or_default()
            );
            ([(header::CONTENT_TYPE, "audio/mpeg")], audio)
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tts_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, fake_tts).await.unwrap();
    });

    let dir = TempDir::new().unwrap();
    let orch = orchestrator(Arc::new(ScriptedAgent::new()), 4);
    let server = spawn_server(
        orch,
        &dir.path().join("sessions.json"),
        &format!("http://{tts_addr}/tts"),
    )
    .await;

    let res = reqwest::Client::new()
        .post(server.url("/tts"))
        .json(&json!({"text": "hello", "voice": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.headers()[reqwest::header::CONTENT_TYPE], "audio/mpeg");
    assert_eq!(res.text().await.unwrap(), "AUDIO:default:hello");
}

#[tokio::test]
async fn test_tts_failure_is_structured() {
    let dir = TempDir::new().unwrap();
    let server = server(4, &dir).await;

    let (status, body) = post_json(server.url("/tts"), json!({"text": "hello"})).await;
    assert_eq!(status, 500);
    assert_eq!(body["success"], false);
}
