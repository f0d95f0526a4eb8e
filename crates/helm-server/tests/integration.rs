//! End-to-end tests against a real server using WebSocket agents.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use helm_core::ConnectionId;
use helm_server::config::{BrokerConfig, ServerConfig};
use helm_server::server::HelmServer;
use helm_server::{AgentHandle, Broker, BrokerError, RpcCall};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> ServerConfig {
    ServerConfig {
        broker: BrokerConfig {
            call_timeout: Duration::from_secs(2),
            grace_period: Duration::from_secs(30),
            connect_timeout: TIMEOUT,
        },
        ..ServerConfig::default()
    }
}

async fn boot_with(broker: Broker, config: ServerConfig) -> (Arc<HelmServer>, SocketAddr) {
    let server = Arc::new(HelmServer::new(config, broker));
    let (addr, _handle) = server.listen().await.unwrap();
    (server, addr)
}

async fn boot() -> (Arc<HelmServer>, SocketAddr) {
    let config = test_config();
    boot_with(Broker::new(config.broker.clone()), config).await
}

async fn connect(addr: SocketAddr, path: &str) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    ws
}

/// Connect as `id` and wait until the broker reports it live.
async fn connect_agent(server: &HelmServer, addr: SocketAddr, id: &str) -> (WsStream, AgentHandle) {
    let pending = server.broker().expect_connection(id);
    let ws = connect(addr, &format!("/{id}")).await;
    let handle = pending.wait(TIMEOUT).await.unwrap();
    (ws, handle)
}

/// Next text frame as JSON, skipping control frames.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

async fn send_json(ws: &mut WsStream, value: &Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Answer every request with `answer(method, params)` until the socket closes.
fn spawn_responder(mut ws: WsStream, answer: fn(&str, &Value) -> Value) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(text) = msg else { continue };
            let request: Value = serde_json::from_str(text.as_str()).unwrap();
            let Some(method) = request["method"].as_str() else { continue };
            let result = answer(method, &request["params"]);
            let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": result});
            if ws.send(Message::text(reply.to_string())).await.is_err() {
                break;
            }
        }
    })
}

fn world_agent(method: &str, params: &Value) -> Value {
    match method {
        "getWorld" => json!(305),
        "getStat" => json!({"skill": params[1], "level": 99}),
        _ => Value::Null,
    }
}

async fn expect_signal(rx: &mut mpsc::UnboundedReceiver<&'static str>, expected: &str) {
    let got = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, expected);
}

// ── Calls ──

#[tokio::test]
async fn typed_call_over_the_wire() {
    let (server, addr) = boot().await;
    let (ws, handle) = connect_agent(&server, addr, "abc").await;
    let _agent = spawn_responder(ws, world_agent);

    let world = handle.call(RpcCall::<i32>::new("getWorld", vec![json!(-1)])).await.unwrap();
    assert_eq!(world, Some(305));

    let stat: Value = handle
        .call_or_default("getStat", vec![json!(-1), json!("ATTACK")])
        .await
        .unwrap();
    assert_eq!(stat, json!({"skill": "ATTACK", "level": 99}));
    assert_eq!(server.broker().pending_calls(), 0);
}

#[tokio::test]
async fn concurrent_calls_are_correlated() {
    let (server, addr) = boot().await;
    let (ws, handle) = connect_agent(&server, addr, "abc").await;
    let _agent = spawn_responder(ws, |method, _| json!(method));

    let calls = ["getWorld", "getUsername", "getInventory", "getPosition"].map(|method| {
        let handle = handle.clone();
        tokio::spawn(async move { handle.call(RpcCall::<String>::new(method, vec![])).await })
    });
    for (call, method) in calls.into_iter().zip(["getWorld", "getUsername", "getInventory", "getPosition"]) {
        assert_eq!(call.await.unwrap().unwrap(), Some(method.to_owned()));
    }
}

#[tokio::test]
async fn unanswered_call_times_out() {
    let (server, addr) = boot().await;
    let (mut ws, handle) = connect_agent(&server, addr, "abc").await;

    let call = tokio::spawn(async move {
        let call = RpcCall::<i32> {
            timeout: Some(Duration::from_millis(300)),
            ..RpcCall::new("getWorld", vec![])
        };
        handle.call(call).await
    });
    let request = read_json(&mut ws).await;
    assert_eq!(request["method"], "getWorld");

    assert_matches!(call.await.unwrap(), Err(BrokerError::Timeout { .. }));
    assert_eq!(server.broker().pending_calls(), 0);
}

#[tokio::test]
async fn call_pending_when_agent_drops_ends_at_its_timeout() {
    let (server, addr) = boot().await;
    let (mut ws, handle) = connect_agent(&server, addr, "abc").await;
    let (tx, mut signals) = mpsc::unbounded_channel();
    handle.on_disconnect(move || {
        let _ = tx.send("disconnect");
    });

    let started = tokio::time::Instant::now();
    let caller = handle.clone();
    let call = tokio::spawn(async move {
        let call = RpcCall::<i32> {
            timeout: Some(Duration::from_millis(500)),
            ..RpcCall::new("getWorld", vec![])
        };
        caller.call(call).await
    });
    let request = read_json(&mut ws).await;
    assert_eq!(request["method"], "getWorld");

    ws.close(None).await.unwrap();
    expect_signal(&mut signals, "disconnect").await;
    if started.elapsed() < Duration::from_millis(400) {
        assert!(!call.is_finished());
        assert_eq!(server.broker().pending_calls(), 1);
    }

    assert_matches!(call.await.unwrap(), Err(BrokerError::Timeout { method, .. }) if method == "getWorld");
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(server.broker().pending_calls(), 0);
}

#[tokio::test]
async fn remote_error_payload_is_surfaced() {
    let (server, addr) = boot().await;
    let (mut ws, handle) = connect_agent(&server, addr, "abc").await;

    let call = tokio::spawn(async move { handle.call(RpcCall::<i32>::new("getWorld", vec![])).await });
    let request = read_json(&mut ws).await;
    send_json(
        &mut ws,
        &json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": -32000, "message": "not logged in"}}),
    )
    .await;

    assert_matches!(
        call.await.unwrap(),
        Err(BrokerError::Remote { code: -32000, message, .. }) if message == "not logged in"
    );
}

// ── Identity and lifecycle ──

#[tokio::test]
async fn root_path_gets_generated_id() {
    let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionId>();
    let config = test_config();
    let broker = Broker::builder()
        .config(config.broker.clone())
        .on_connect(move |handle| {
            let _ = tx.send(handle.id().clone());
        })
        .build();
    let (_server, addr) = boot_with(broker, config).await;

    let _first = connect(addr, "/").await;
    let _second = connect(addr, "/").await;
    let a = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    let b = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert!(!a.as_str().is_empty());
    assert_ne!(a, b);
}

#[tokio::test]
async fn duplicate_id_is_closed_with_policy_violation() {
    let (server, addr) = boot().await;
    let (ws, handle) = connect_agent(&server, addr, "dup").await;
    let _agent = spawn_responder(ws, world_agent);

    let mut second = connect(addr, "/dup").await;
    let msg = timeout(TIMEOUT, second.next()).await.unwrap().unwrap().unwrap();
    assert_matches!(msg, Message::Close(Some(frame)) => {
        assert_eq!(frame.code, CloseCode::Policy);
        assert!(frame.reason.as_str().contains("already live"));
    });

    assert!(handle.is_running());
    assert_eq!(handle.call(RpcCall::<i32>::new("getWorld", vec![])).await.unwrap(), Some(305));
    assert_eq!(server.broker().live_count(), 1);
}

#[tokio::test]
async fn disconnect_then_reconnect_within_grace() {
    let (connects_tx, mut connects) = mpsc::unbounded_channel::<ConnectionId>();
    let config = test_config();
    let broker = Broker::builder()
        .config(config.broker.clone())
        .on_connect(move |handle| {
            let _ = connects_tx.send(handle.id().clone());
        })
        .build();
    let (server, addr) = boot_with(broker, config).await;

    let (mut ws, handle) = connect_agent(&server, addr, "abc").await;
    let (tx, mut signals) = mpsc::unbounded_channel();
    let d = tx.clone();
    handle.on_disconnect(move || {
        let _ = d.send("disconnect");
    });
    handle.on_reconnect(move || {
        let _ = tx.send("reconnect");
    });

    ws.close(None).await.unwrap();
    expect_signal(&mut signals, "disconnect").await;
    assert!(!handle.is_running());
    assert_matches!(
        handle.call(RpcCall::<i32>::new("getWorld", vec![])).await,
        Err(BrokerError::NotConnected(_))
    );
    assert_eq!(server.broker().dormant_count(), 1);

    let (ws, again) = connect_agent(&server, addr, "abc").await;
    expect_signal(&mut signals, "reconnect").await;
    assert_eq!(again, handle);
    assert_eq!(server.broker().dormant_count(), 0);

    let _agent = spawn_responder(ws, world_agent);
    assert_eq!(handle.call(RpcCall::<i32>::new("getWorld", vec![])).await.unwrap(), Some(305));

    // Only the first connection was announced.
    assert_eq!(connects.recv().await.unwrap().as_str(), "abc");
    assert!(connects.try_recv().is_err());
}

#[tokio::test]
async fn cleanup_after_grace_forgets_listeners() {
    let config = ServerConfig {
        broker: BrokerConfig {
            grace_period: Duration::from_millis(200),
            ..test_config().broker
        },
        ..test_config()
    };
    let (server, addr) = boot_with(Broker::new(config.broker.clone()), config).await;
    let (mut ws, handle) = connect_agent(&server, addr, "abc").await;
    handle.on_ban(|| {});
    let id = handle.id().clone();

    ws.close(None).await.unwrap();
    timeout(TIMEOUT, async {
        while server.broker().has_bookkeeping(&id) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(server.broker().listener_count(&id), 0);
}

#[tokio::test]
async fn silent_agent_is_dropped_by_heartbeat() {
    let config = ServerConfig {
        ping_interval: Duration::from_millis(100),
        pong_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let (server, addr) = boot_with(Broker::new(config.broker.clone()), config).await;
    // Never polled, so pings go unanswered.
    let (_ws, handle) = connect_agent(&server, addr, "quiet").await;

    let (tx, mut signals) = mpsc::unbounded_channel();
    handle.on_disconnect(move || {
        let _ = tx.send("disconnect");
    });
    expect_signal(&mut signals, "disconnect").await;
    assert!(!handle.is_running());
}

// ── Events ──

#[tokio::test]
async fn agent_events_reach_listeners() {
    let (server, addr) = boot().await;
    let (mut ws, handle) = connect_agent(&server, addr, "abc").await;

    let (tx, mut signals) = mpsc::unbounded_channel();
    let (msg_tx, mut messages) = mpsc::unbounded_channel::<String>();
    let ended = tx.clone();
    handle.on_script_end(move || {
        let _ = ended.send("script-ended");
    });
    handle.on_ban(move || {
        let _ = tx.send("banned");
    });
    handle.on_script_message(move |text| {
        let _ = msg_tx.send(text.to_owned());
    });

    send_json(&mut ws, &json!({"jsonrpc": "2.0", "id": "e1", "method": "onEvent", "params": {"eventType": "custom", "message": "level up"}})).await;
    send_json(&mut ws, &json!({"jsonrpc": "2.0", "id": "e2", "method": "onEvent", "params": [{"eventType": "scriptEnded"}]})).await;
    send_json(&mut ws, &json!({"jsonrpc": "2.0", "id": "e3", "method": "onEvent", "params": {"eventType": "banned"}})).await;

    assert_eq!(timeout(TIMEOUT, messages.recv()).await.unwrap().unwrap(), "level up");
    expect_signal(&mut signals, "script-ended").await;
    expect_signal(&mut signals, "banned").await;
}

#[tokio::test]
async fn script_request_is_answered_under_its_token() {
    let (server, addr) = boot().await;
    let (mut ws, handle) = connect_agent(&server, addr, "abc").await;
    handle.on_script_request(|request: &str| match request {
        "fail" => Err("quest log unavailable".to_owned()),
        other => Ok(format!("pong:{other}")),
    });

    send_json(&mut ws, &json!({"jsonrpc": "2.0", "id": "c1", "method": "sendCustomRequest", "params": ["ping"]})).await;
    let reply = read_json(&mut ws).await;
    assert_eq!(reply["id"], "c1");
    assert_eq!(reply["result"], "pong:ping");

    send_json(&mut ws, &json!({"jsonrpc": "2.0", "id": 42, "method": "sendCustomRequest", "params": ["fail"]})).await;
    let reply = read_json(&mut ws).await;
    assert_eq!(reply["id"], "42");
    assert_eq!(reply["error"]["code"], 500);
    assert_eq!(reply["error"]["data"]["message"], "quest log unavailable");
}

#[tokio::test]
async fn malformed_frames_do_not_drop_the_connection() {
    let (server, addr) = boot().await;
    let (mut ws, handle) = connect_agent(&server, addr, "abc").await;

    ws.send(Message::text("not json")).await.unwrap();
    send_json(&mut ws, &json!({"id": "x", "method": "onEvent", "params": {"eventType": "exploded"}})).await;
    send_json(&mut ws, &json!({"jsonrpc": "2.0", "id": "u1", "method": "teleport", "params": []})).await;

    let reply = read_json(&mut ws).await;
    assert_eq!(reply["id"], "u1");
    assert_eq!(reply["error"]["code"], -32601);
    assert!(handle.is_running());
}

#[tokio::test]
async fn script_message_is_sent_to_active_tab() {
    let (server, addr) = boot().await;
    let (mut ws, handle) = connect_agent(&server, addr, "abc").await;

    let sender = tokio::spawn(async move { handle.send_script_message("hello script").await });
    let request = read_json(&mut ws).await;
    assert_eq!(request["method"], "sendScriptMessage");
    assert_eq!(request["params"], json!([-1, "hello script"]));
    send_json(&mut ws, &json!({"jsonrpc": "2.0", "id": request["id"], "result": null})).await;
    sender.await.unwrap().unwrap();
}

// ── Server ──

#[tokio::test]
async fn health_counts_live_agents() {
    let (server, addr) = boot().await;
    let (_ws, _handle) = connect_agent(&server, addr, "abc").await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
}

#[tokio::test]
async fn shutdown_closes_live_agents() {
    let (server, addr) = boot().await;
    let (mut ws, handle) = connect_agent(&server, addr, "abc").await;

    server.broker().shutdown();
    let closed = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    timeout(TIMEOUT, async {
        while handle.is_running() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(server.broker().dormant_count(), 0);
}
