use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use futures_util::StreamExt;
use gamelink_sdk::realtime::{
    ClientEvent, ConnectError, ConnectionState, DisconnectReason, RtEvent,
};
use gamelink_sdk::{Listeners, RealtimeClient, Session, SessionHolder};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Script {
    EchoRpcThenEvent,
    CloseWithHeartbeatCode,
}

#[derive(Clone)]
struct WsState {
    expected_auth: String,
    expected_token: String,
    script: Script,
    observed_tx: Arc<Mutex<Option<oneshot::Sender<Result<Vec<Value>, String>>>>>,
}

fn token(claims: Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}

fn sessions(token: &str) -> SessionHolder {
    SessionHolder::new(Session::restore(token, None).expect("test session"))
}

fn client_for(addr: SocketAddr) -> RealtimeClient {
    RealtimeClient::new("unused")
        .with_endpoint(format!("ws://{addr}/ws?status=false&format=json"))
        .with_heartbeat_interval(None)
        .with_auto_reconnect(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_connect_rpc_and_event() {
    let token = token(json!({"uid": "user-1", "usn": "alice", "exp": 4_102_444_800i64}));
    let (observed_tx, observed_rx) = oneshot::channel();
    let state = WsState {
        expected_auth: format!("Bearer {token}"),
        expected_token: token.clone(),
        script: Script::EchoRpcThenEvent,
        observed_tx: Arc::new(Mutex::new(Some(observed_tx))),
    };
    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let (listeners, mut events) = Listeners::channel();
    let connection = timeout(
        Duration::from_secs(2),
        client_for(addr).connect(sessions(&token), listeners),
    )
    .await
    .expect("timed out connecting")
    .expect("connect should succeed");
    assert_eq!(connection.state(), ConnectionState::Connected);

    let rpc = timeout(
        Duration::from_secs(2),
        connection.rpc("echo", Some(r#"{"x":1}"#.to_string())),
    )
    .await
    .expect("timed out waiting for rpc")
    .expect("rpc should succeed");
    assert_eq!(rpc.id, "echo");
    assert_eq!(rpc.payload.as_deref(), Some(r#"{"x":1}"#));

    assert_eq!(
        timeout(Duration::from_secs(2), events.recv()).await.expect("event"),
        Some(ClientEvent::Connected)
    );
    match timeout(Duration::from_secs(2), events.recv()).await.expect("event") {
        Some(ClientEvent::Event(RtEvent::MatchData(data))) => {
            assert_eq!(data.match_id, "m1");
            assert_eq!(data.op_code, 3);
            assert_eq!(data.data, b"hi".to_vec());
        }
        other => panic!("expected match data, got {other:?}"),
    }

    connection.close().await;
    let observed = timeout(Duration::from_secs(2), observed_rx)
        .await
        .expect("timed out waiting for server observations")
        .expect("server should report")
        .expect("server script should pass");
    assert_eq!(observed[0], json!({"cid": "0", "ping": {}}));
    assert_eq!(
        observed[1],
        json!({"cid": "1", "rpc": {"id": "echo", "payload": "{\"x\":1}"}})
    );

    let _ = shutdown_tx.send(());
    let _ = timeout(Duration::from_secs(2), server_task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_remote_close_is_reported() {
    let token = token(json!({"uid": "user-1", "exp": 4_102_444_800i64}));
    let (observed_tx, _observed_rx) = oneshot::channel();
    let state = WsState {
        expected_auth: format!("Bearer {token}"),
        expected_token: token.clone(),
        script: Script::CloseWithHeartbeatCode,
        observed_tx: Arc::new(Mutex::new(Some(observed_tx))),
    };
    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let (listeners, mut events) = Listeners::channel();
    let connection = timeout(
        Duration::from_secs(2),
        client_for(addr).connect(sessions(&token), listeners),
    )
    .await
    .expect("timed out connecting")
    .expect("connect should succeed");

    assert_eq!(events.recv().await, Some(ClientEvent::Connected));
    match timeout(Duration::from_secs(2), events.recv()).await.expect("event") {
        Some(ClientEvent::Disconnected(info)) => {
            assert_eq!(info.code, 4000);
            assert!(info.remote);
            assert_eq!(info.reason, DisconnectReason::NetworkError);
        }
        other => panic!("expected disconnect, got {other:?}"),
    }
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    connection.close().await;
    let _ = shutdown_tx.send(());
    let _ = timeout(Duration::from_secs(2), server_task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_rejects_wrong_token() {
    let (observed_tx, _observed_rx) = oneshot::channel();
    let state = WsState {
        expected_auth: "Bearer someone-else".to_string(),
        expected_token: "someone-else".to_string(),
        script: Script::EchoRpcThenEvent,
        observed_tx: Arc::new(Mutex::new(Some(observed_tx))),
    };
    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let token = token(json!({"uid": "user-1", "exp": 4_102_444_800i64}));
    let result = timeout(
        Duration::from_secs(2),
        client_for(addr).connect(sessions(&token), Listeners::new()),
    )
    .await
    .expect("timed out connecting");
    assert!(matches!(result, Err(ConnectError::WebSocket(_))));

    let _ = shutdown_tx.send(());
    let _ = timeout(Duration::from_secs(2), server_task).await;
}

async fn ws_handler(
    State(state): State<WsState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if auth != state.expected_auth {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if params.get("token") != Some(&state.expected_token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if params.get("format").map(String::as_str) != Some("json") {
        return StatusCode::BAD_REQUEST.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let result = run_script(socket, state.script).await;
        if let Some(tx) = state.observed_tx.lock().await.take() {
            let _ = tx.send(result);
        }
    })
}

async fn run_script(mut socket: WebSocket, script: Script) -> Result<Vec<Value>, String> {
    let mut observed = Vec::new();

    let ping = recv_client_json(&mut socket).await?;
    if ping.get("ping").is_none() {
        return Err(format!("expected handshake ping, got {ping}"));
    }
    let cid = ping.get("cid").cloned().unwrap_or(Value::Null);
    observed.push(ping);
    send_json(&mut socket, json!({"cid": cid, "pong": {}})).await?;

    match script {
        Script::EchoRpcThenEvent => {
            let rpc = recv_client_json(&mut socket).await?;
            let reply = json!({"cid": rpc["cid"].clone(), "rpc": rpc["rpc"].clone()});
            observed.push(rpc);
            send_json(&mut socket, reply).await?;
            send_json(
                &mut socket,
                json!({
                    "match_data": {
                        "match_id": "m1",
                        "op_code": 3,
                        "data": "aGk=",
                        "reliable": true
                    }
                }),
            )
            .await?;
            // Drain until the client closes.
            while let Some(Ok(message)) = socket.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        }
        Script::CloseWithHeartbeatCode => {
            socket
                .send(Message::Close(Some(CloseFrame {
                    code: 4000,
                    reason: "idle".into(),
                })))
                .await
                .map_err(|err| format!("failed to send close: {err}"))?;
        }
    }

    Ok(observed)
}

async fn recv_client_json(socket: &mut WebSocket) -> Result<Value, String> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_ref())
                    .map_err(|err| format!("failed to decode client frame: {err}"));
            }
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err("websocket closed before expected client frame".to_string());
            }
            Some(Ok(_)) => return Err("received unexpected non-text websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
            None => return Err("websocket stream ended unexpectedly".to_string()),
        }
    }
}

async fn send_json(socket: &mut WebSocket, value: Value) -> Result<(), String> {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .map_err(|err| format!("failed to send server frame: {err}"))
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
