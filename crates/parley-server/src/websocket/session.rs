//! One `WebSocket` client from upgrade through disconnect.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::gateway::Gateway;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_TOTAL, WS_HEARTBEAT_TIMEOUTS_TOTAL,
};

/// Drive a connected socket.
///
/// The writer task drains the connection's queue and pings on the heartbeat
/// interval; the heartbeat task closes the connection when pongs stop; the
/// reader loop hands each text frame to the gateway. Any of them ending, or
/// `shutdown` firing, tears the connection down.
#[instrument(skip_all)]
pub async fn run_ws_session(ws: WebSocket, gateway: Arc<Gateway>, shutdown: CancellationToken) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(gateway.config().send_buffer);
    let conn = gateway.on_open(send_tx).await;
    let conn_id = conn.id.clone();
    let started = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);

    let closing = shutdown.child_token();

    let ping_interval = gateway.config().heartbeat_interval;
    let writer_cancel = closing.clone();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        let _ = ping.tick().await;
        loop {
            tokio::select! {
                () = writer_cancel.cancelled() => break,
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
        writer_cancel.cancel();
    });

    let heartbeat = tokio::spawn({
        let conn = Arc::clone(&conn);
        let closing = closing.clone();
        let (interval, timeout) = (
            gateway.config().heartbeat_interval,
            gateway.config().heartbeat_timeout,
        );
        async move {
            if run_heartbeat(conn, interval, timeout, closing.clone()).await
                == HeartbeatResult::TimedOut
            {
                warn!("client unresponsive, disconnecting");
                counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                closing.cancel();
            }
        }
    });

    loop {
        let frame = tokio::select! {
            () = closing.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(conn_id = %conn_id, error = %e, "websocket read error");
                break;
            }
            None => break,
        };
        conn.mark_alive();
        match msg {
            Message::Text(text) => gateway.on_message(&conn, text.as_str()).await,
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => gateway.on_message(&conn, text).await,
                Err(_) => debug!(conn_id = %conn_id, len = data.len(), "ignoring non-UTF8 binary frame"),
            },
            Message::Close(_) => {
                debug!(conn_id = %conn_id, "client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    closing.cancel();
    gateway.on_close(&conn);
    let _ = heartbeat.await;
    let _ = writer.await;
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    info!(conn_id = %conn_id, "connection closed");
}
