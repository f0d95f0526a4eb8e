//! WebSocket session lifecycle, from upgrade to disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::LiveConnection;
use crate::broker::{Broker, Handshake};
use crate::config::ServerConfig;

/// How long the forwarder gets to flush and send its Close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Close frame reasons are limited to 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

/// Run one agent's WebSocket session.
///
/// 1. Registers the transport with the broker; a rejected transport is sent
///    a policy-violation Close frame
/// 2. Forwards queued outbound text and sends periodic Pings
/// 3. Routes inbound text (and UTF-8 binary) frames to the broker
/// 4. Reports the disconnect when either side closes or the peer goes silent
#[instrument(skip_all, fields(connection_id = %handshake.connection_id()))]
pub async fn run_ws_session(ws: WebSocket, handshake: Handshake, broker: Broker, config: Arc<ServerConfig>) {
    let id = handshake.connection_id().clone();
    debug!(path = handshake.path(), "transport opened");
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<String>(config.outbound_queue.max(1));
    let closer = broker.session_token();
    let connection = Arc::new(LiveConnection::new(id.clone(), send_tx, closer.clone()));

    if let Err(error) = broker.accept(Arc::clone(&connection)) {
        info!(%error, "transport rejected");
        let frame = CloseFrame {
            code: close_code::POLICY,
            reason: close_reason(&error.to_string()).into(),
        };
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
        return;
    }

    let outbound_conn = Arc::clone(&connection);
    let ping_interval = config.ping_interval;
    let pong_timeout = config.pong_timeout;
    let outbound = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        // Skip the immediate first tick
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = outbound_conn.closer().cancelled() => {
                    let frame = CloseFrame { code: close_code::NORMAL, reason: "closing".into() };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if !outbound_conn.check_alive() && outbound_conn.last_pong_elapsed() > pong_timeout {
                        warn!(?pong_timeout, "agent unresponsive, disconnecting");
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        outbound_conn.close();
    });

    loop {
        let frame = tokio::select! {
            () = closer.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(error)) => {
                debug!(%error, "websocket read failed");
                break;
            }
            None => break,
        };
        connection.mark_alive();

        match message {
            Message::Text(text) => broker.handle_inbound(&id, text.as_str()),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => broker.handle_inbound(&id, text),
                Err(_) => {
                    counter!("helm_inbound_rejected_total").increment(1);
                    warn!(len = data.len(), "dropping non-UTF-8 binary frame");
                }
            },
            Message::Close(_) => {
                debug!("agent sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    connection.close();
    let abort = outbound.abort_handle();
    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, outbound).await.is_err() {
        abort.abort();
    }

    histogram!("helm_connection_duration_seconds").record(connection.age().as_secs_f64());
    if connection.drop_count() > 0 {
        warn!(dropped = connection.drop_count(), "outbound messages were dropped");
    }
    broker.disconnected(&connection);
}

fn close_reason(text: &str) -> String {
    if text.len() <= MAX_CLOSE_REASON {
        return text.to_owned();
    }
    let mut end = MAX_CLOSE_REASON;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_owned()
}
