//! WebSocket hub integration: subscribe over a real socket, ingest a
//! broadcast over HTTP, and watch the fan-out.

use futures_util::{SinkExt, StreamExt};
use navigator::auth::AuthVerifier;
use navigator::config;
use navigator::dispatch::Dispatcher;
use navigator::hub::Hub;
use navigator::proxy::ProxyEngine;
use navigator::server::{router, SharedDispatcher};
use navigator::supervisor::WorkerSupervisor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

async fn boot() -> (SocketAddr, Arc<Hub>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("navigator.yml");
    std::fs::write(
        &config_path,
        "listen: \"127.0.0.1:0\"\nhub:\n  websocket_path: /websocket\n  broadcast_path: /_broadcast\n",
    )
    .unwrap();
    let config = Arc::new(config::load(&config_path).unwrap());

    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move { while control_rx.recv().await.is_some() {} });
    let hub = Arc::new(Hub::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&config),
        Arc::new(AuthVerifier::new(None)),
        WorkerSupervisor::new(&config),
        Arc::new(ProxyEngine::new().unwrap()),
        Arc::clone(&hub),
        control_tx,
    ));
    let shared = SharedDispatcher::new(dispatcher);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(shared);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (addr, hub, dir)
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/websocket"))
        .await
        .expect("websocket handshake");
    ws
}

async fn subscribe(ws: &mut WsClient, stream: &str) {
    ws.send(Message::Text(
        serde_json::json!({"type": "subscribe", "stream": stream}).to_string(),
    ))
    .await
    .unwrap();
    let ack = next_json(ws).await;
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(ack["stream"], stream);
}

/// Read frames until a text frame arrives (skipping pings), with a timeout.
async fn next_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(payload) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn broadcast_fans_out_to_subscribers_in_order() {
    let (addr, hub, _dir) = boot().await;
    let client = reqwest::Client::new();

    let mut room1_a = connect(addr).await;
    let mut room1_b = connect(addr).await;
    let mut room2 = connect(addr).await;
    subscribe(&mut room1_a, "room1").await;
    subscribe(&mut room1_b, "room1").await;
    subscribe(&mut room2, "room2").await;
    assert_eq!(hub.connection_count().await, 3);

    for payload in [r#"{"stream":"room1","data":{"m":"hi"}}"#, r#"{"stream":"room1","data":{"m":"again"}}"#] {
        let resp = client
            .post(format!("http://{addr}/_broadcast"))
            .body(payload.to_owned())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    for ws in [&mut room1_a, &mut room1_b] {
        let first = next_json(ws).await;
        assert_eq!(first["type"], "message");
        assert_eq!(first["stream"], "room1");
        assert_eq!(first["data"]["m"], "hi");
        let second = next_json(ws).await;
        assert_eq!(second["data"]["m"], "again");
    }

    // room2 saw nothing; a fresh broadcast to room2 is its first frame.
    let resp = client
        .post(format!("http://{addr}/_broadcast"))
        .body(r#"{"stream":"room2","data":"only"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let frame = next_json(&mut room2).await;
    assert_eq!(frame["stream"], "room2");
    assert_eq!(frame["data"], "only");
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (addr, hub, _dir) = boot().await;
    let client = reqwest::Client::new();

    let mut ws = connect(addr).await;
    subscribe(&mut ws, "events").await;
    assert_eq!(hub.subscriber_count("events").await, 1);

    ws.send(Message::Text(
        serde_json::json!({"type": "unsubscribe", "stream": "events"}).to_string(),
    ))
    .await
    .unwrap();

    // The hub processes frames sequentially per connection; once the
    // subscriber count drops the unsubscribe has landed.
    for _ in 0..50 {
        if hub.subscriber_count("events").await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hub.subscriber_count("events").await, 0);

    let resp = client
        .post(format!("http://{addr}/_broadcast"))
        .body(r#"{"stream":"events","data":1}"#)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["delivered"], 0);
}

#[tokio::test]
async fn closing_the_socket_unregisters_the_connection() {
    let (addr, hub, _dir) = boot().await;

    let mut ws = connect(addr).await;
    subscribe(&mut ws, "gone").await;
    ws.close(None).await.unwrap();

    for _ in 0..50 {
        if hub.connection_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hub.connection_count().await, 0);
    assert_eq!(hub.subscriber_count("gone").await, 0);
}

#[tokio::test]
async fn unknown_frame_types_are_ignored() {
    let (addr, hub, _dir) = boot().await;

    let mut ws = connect(addr).await;
    ws.send(Message::Text(r#"{"type":"mystery"}"#.to_string()))
        .await
        .unwrap();
    ws.send(Message::Text("not json at all".to_string()))
        .await
        .unwrap();
    subscribe(&mut ws, "still-alive").await;
    assert_eq!(hub.subscriber_count("still-alive").await, 1);
}

#[tokio::test]
async fn hub_shutdown_closes_clients() {
    let (addr, hub, _dir) = boot().await;

    let mut ws = connect(addr).await;
    subscribe(&mut ws, "room").await;
    hub.shutdown().await;

    // The writer sends Close and the connection unwinds.
    let mut closed = false;
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_secs(5), ws.next()).await
    {
        match frame {
            Ok(Message::Close(_)) | Err(_) => {
                closed = true;
                break;
            }
            _ => {}
        }
    }
    assert!(closed || hub.connection_count().await == 0);
}
