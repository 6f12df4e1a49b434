//! Per-connection socket tasks.
//!
//! Each accepted WebSocket runs two cooperative halves: the reader (this
//! task) parses the inbound JSON grammar and enforces the 60 s read
//! deadline, reset by any frame including pongs; the writer drains the
//! bounded outbound queue and emits a keep-alive ping every 30 s. Close is
//! initiated by deadline expiry, either socket half failing, or hub
//! shutdown — and teardown always funnels through the single
//! `hub.unregister` call at the bottom of the reader.

use super::{Hub, QUEUE_CAPACITY};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const READ_DEADLINE: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Inbound frame grammar. Unknown types deserialize to `Other` and are
/// ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Subscribe { stream: String },
    Unsubscribe { stream: String },
    Pong,
    #[serde(other)]
    Other,
}

pub async fn handle_socket(hub: Arc<Hub>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(QUEUE_CAPACITY);
    let cancel = hub.shutdown_token().child_token();
    let id = hub.register(tx, cancel.clone()).await;

    // ── Writer: queue drain + keep-alive ─────────────────────────────────────
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await;
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                frame = rx.recv() => {
                    match frame {
                        Some(text) => {
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // ── Reader: grammar + deadline ───────────────────────────────────────────
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = tokio::time::timeout(READ_DEADLINE, stream.next()) => frame,
        };
        match frame {
            Err(_) => {
                debug!(conn = id, "read deadline exceeded — closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                trace!(conn = id, err = %e, "socket read error");
                break;
            }
            Ok(Some(Ok(message))) => match message {
                Message::Text(text) => handle_frame(&hub, id, text.as_str()).await,
                // Transport pongs reset the deadline by reaching this loop.
                Message::Pong(_) | Message::Ping(_) | Message::Binary(_) => {}
                Message::Close(_) => break,
            },
        }
    }

    cancel.cancel();
    let _ = writer.await;
    hub.unregister(id).await;
}

async fn handle_frame(hub: &Hub, id: u64, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            trace!(conn = id, err = %e, "unparseable frame ignored");
            return;
        }
    };
    match frame {
        InboundFrame::Subscribe { stream } => {
            hub.subscribe(id, &stream).await;
            let ack = serde_json::json!({"type": "subscribed", "stream": stream}).to_string();
            hub.send_to(id, ack).await;
        }
        InboundFrame::Unsubscribe { stream } => {
            hub.unsubscribe(id, &stream).await;
        }
        // Application-level pong: nothing to do — arriving here already
        // reset the read deadline.
        InboundFrame::Pong => {}
        InboundFrame::Other => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_grammar_parses() {
        match serde_json::from_str::<InboundFrame>(r#"{"type":"subscribe","stream":"room1"}"#) {
            Ok(InboundFrame::Subscribe { stream }) => assert_eq!(stream, "room1"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            serde_json::from_str::<InboundFrame>(r#"{"type":"unsubscribe","stream":"x"}"#),
            Ok(InboundFrame::Unsubscribe { .. })
        ));
        assert!(matches!(
            serde_json::from_str::<InboundFrame>(r#"{"type":"pong"}"#),
            Ok(InboundFrame::Pong)
        ));
        assert!(matches!(
            serde_json::from_str::<InboundFrame>(r#"{"type":"mystery","x":1}"#),
            Ok(InboundFrame::Other)
        ));
    }

    #[test]
    fn subscribe_without_stream_is_rejected() {
        assert!(serde_json::from_str::<InboundFrame>(r#"{"type":"subscribe"}"#).is_err());
    }
}
