//! A single observer's socket, from upgrade through disconnect.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tracing::{debug, info, instrument};

use super::connection::Outbound;
use super::hub::EventHub;

/// Drive one observer connection.
///
/// Registers with the hub (which queues the welcome envelope), forwards
/// queued frames to the socket, applies inbound control messages, and
/// unregisters on the way out. The write side sends a close frame when the
/// hub closes the connection and simply drops the socket when the heartbeat
/// terminates it.
#[instrument(skip_all, fields(ip = %ip))]
pub async fn run_ws_session(ws: WebSocket, hub: Arc<EventHub>, ip: IpAddr) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (connection, mut send_rx) = hub.register(Some(ip));
    let client_id = connection.id.clone();

    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);

    let writer_conn = connection.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = writer_conn.closed() => {
                    if let Some(code) = writer_conn.close_code() {
                        let frame = CloseFrame { code, reason: "server shutting down".into() };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    }
                    break;
                }
                frame = send_rx.recv() => {
                    let message = match frame {
                        Some(Outbound::Text(text)) => Message::Text(text),
                        Some(Outbound::Ping) => Message::Ping(Vec::new().into()),
                        None => break,
                    };
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => hub.handle_control(&connection, text.as_str()),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => hub.handle_control(&connection, text),
                    Err(_) => debug!(client_id, len = data.len(), "ignoring non-UTF8 binary frame"),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => connection.mark_alive(),
                Some(Ok(Message::Close(_))) => {
                    debug!(client_id, "observer sent close frame");
                    break;
                }
                Some(Err(e)) => {
                    debug!(client_id, error = %e, "socket error");
                    break;
                }
                None => break,
            },
            _ = &mut writer => break,
        }
    }

    hub.unregister(&client_id);
    connection.terminate();
    writer.abort();

    info!(client_id, "observer disconnected");
    counter!("ws_disconnections_total").increment(1);
    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(connection.age().as_secs_f64());
}
