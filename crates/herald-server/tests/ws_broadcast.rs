//! End-to-end push tests over a real listener: audited HTTP calls reach
//! connected WebSocket observers, and the endpoint honors the registry's
//! capacity and lifecycle rules.

use axum::body::Body;
use axum::http::Request;
use futures_util::{SinkExt, StreamExt};
use herald_db::{create_pool, run_migrations, DbRuntimeSettings};
use herald_notify::{BroadcastDispatcher, ConnectionStatus, DispatchTimeouts};
use herald_server::config::Config;
use herald_server::{app, AppState, WS_PATH};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(config: Config) -> (TempDir, SocketAddr, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("herald.db");
    let pool = create_pool(db_path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();
    let state = AppState::new(pool, &config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (dir, addr, state)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}{WS_PATH}")).await.unwrap();
    ws
}

async fn wait_for_connections(state: &AppState, expected: usize) {
    for _ in 0..100 {
        if state.registry().len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "registry holds {} connections, expected {expected}",
        state.registry().len()
    );
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(ws: &mut Client) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for a push")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn get(state: &AppState, uri: &str) {
    app(state.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn audited_request_is_pushed() {
    let (_dir, addr, state) = start_server(Config::default()).await;
    let mut ws = connect(addr).await;
    wait_for_connections(&state, 1).await;

    get(&state, "/health").await;

    let pushed = next_json(&mut ws).await;
    assert_eq!(pushed["method"], "GET");
    assert_eq!(pushed["path"], "/health");
    assert!(pushed["user_id"].is_null());
    assert_eq!(pushed["status_code"], 200);
    let id = pushed["id"].as_i64().expect("pushed record carries its id");
    let stored = herald_notify::get_notification(&state.pool.get().unwrap(), id)
        .unwrap()
        .expect("pushed id is a stored row");
    assert_eq!(stored.record.path, "/health");
    assert!(pushed["timestamp"].is_string());
}

#[tokio::test]
async fn every_observer_receives_the_record() {
    let (_dir, addr, state) = start_server(Config::default()).await;
    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    wait_for_connections(&state, 2).await;

    get(&state, "/api/connections").await;

    let a = next_json(&mut first).await;
    let b = next_json(&mut second).await;
    assert_eq!(a["path"], "/api/connections");
    assert_eq!(a, b);
}

#[tokio::test]
async fn system_event_is_pushed() {
    let (_dir, addr, state) = start_server(Config::default()).await;
    let mut ws = connect(addr).await;
    wait_for_connections(&state, 1).await;

    let result = state
        .pipeline
        .on_system_event("startup", "listening")
        .await
        .unwrap();
    assert!(result.persisted);
    assert_eq!(result.delivered(), 1);

    let pushed = next_json(&mut ws).await;
    assert_eq!(pushed["method"], "SYSTEM");
    assert_eq!(pushed["path"], "startup");
    assert_eq!(pushed["request_body"], "listening");
}

#[tokio::test]
async fn malformed_client_frames_keep_the_connection() {
    let (_dir, addr, state) = start_server(Config::default()).await;
    let mut ws = connect(addr).await;
    wait_for_connections(&state, 1).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    ws.send(Message::Binary(vec![0xff, 0x00].into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.registry().len(), 1);

    get(&state, "/health").await;
    let pushed = next_json(&mut ws).await;
    assert_eq!(pushed["path"], "/health");
}

#[tokio::test]
async fn acknowledgement_marks_connection_active() {
    let (_dir, addr, state) = start_server(Config::default()).await;
    let mut ws = connect(addr).await;
    wait_for_connections(&state, 1).await;
    assert_eq!(state.registry().status()[0].status, ConnectionStatus::Connected);

    ws.send(Message::Text(
        r#"{"status":"received","notification_id":1}"#.into(),
    ))
    .await
    .unwrap();

    for _ in 0..100 {
        if state.registry().status()[0].status == ConnectionStatus::Active {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("acknowledgement did not mark the connection active");
}

#[tokio::test]
async fn registry_full_closes_with_policy() {
    let mut config = Config::default();
    config.notify.max_connections = 1;
    let (_dir, addr, state) = start_server(config).await;

    let _first = connect(addr).await;
    wait_for_connections(&state, 1).await;

    let mut second = connect(addr).await;
    let msg = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended")
        .expect("websocket error");
    match msg {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected close frame, got {other:?}"),
    }
    assert_eq!(state.registry().len(), 1);
}

#[tokio::test]
async fn client_close_unregisters() {
    let (_dir, addr, state) = start_server(Config::default()).await;
    let mut ws = connect(addr).await;
    wait_for_connections(&state, 1).await;

    ws.close(None).await.unwrap();
    wait_for_connections(&state, 0).await;
}

#[tokio::test]
async fn peer_that_stops_reading_is_dropped() {
    let mut config = Config::default();
    config.notify.send_timeout_ms = 200;
    let (_dir, addr, state) = start_server(config).await;

    // Connected but never polled, so socket buffers fill up.
    let _silent = connect(addr).await;
    wait_for_connections(&state, 1).await;

    // Fewer messages than the channel holds: only the socket write can stall.
    let dispatcher = BroadcastDispatcher::new(
        state.registry().clone(),
        DispatchTimeouts {
            per_send: Duration::from_secs(1),
            per_broadcast: Duration::from_secs(2),
        },
    );
    let payload = "x".repeat(1024 * 1024);
    for _ in 0..64 {
        if state.registry().is_empty() {
            break;
        }
        dispatcher.broadcast_message(payload.clone()).await;
    }

    wait_for_connections(&state, 0).await;
}
