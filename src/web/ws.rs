//! WebSocket sink handler: the signaling channel and the binary JPEG path.
//!
//! At most one WebSocket peer is the sink. A new successful handshake
//! displaces the previous sink with a "going away" close frame; an
//! intentional shutdown closes with a distinguished reason the sink
//! recognizes and does not reconnect after. Outbound traffic to one sink
//! flows through a single queue, so message order is preserved.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::signal::SignalMessage;

use super::{ServerEvent, ServerState};

/// Close reason when a newer sink displaces this one.
pub const CLOSE_REASON_DISPLACED: &str = "New client connected";

/// Close reason for an intentional shutdown; the sink must not reconnect.
pub const CLOSE_REASON_STOPPED: &str = "Streaming stopped";

/// Keep-alive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Drop the socket after this long without any inbound traffic.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(120);

/// Outbound traffic for the current sink.
#[derive(Debug)]
pub(crate) enum SinkOutbound {
    Signal(SignalMessage),
    Frame(Bytes),
    Goodbye(&'static str),
}

/// Drive one sink connection until it closes.
pub(crate) async fn handle_sink(socket: WebSocket, state: Arc<ServerState>) {
    let (tx, rx) = mpsc::channel::<SinkOutbound>(32);
    let generation = state.register_sink(tx);
    info!(generation, "sink connected");
    let _ = state.events.send(ServerEvent::SinkConnected).await;

    run_sink(socket, rx, &state).await;

    // Only the registration we created may be cleared; a displaced
    // handler must not remove its successor.
    if state.unregister_sink(generation) {
        info!(generation, "sink disconnected");
        let _ = state.events.send(ServerEvent::SinkDisconnected).await;
    }
}

async fn run_sink(socket: WebSocket, mut rx: mpsc::Receiver<SinkOutbound>, state: &ServerState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut idle_deadline = Instant::now() + SOCKET_TIMEOUT;

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(SinkOutbound::Signal(msg)) => {
                    if ws_tx.send(Message::Text(msg.to_json().into())).await.is_err() {
                        break;
                    }
                }
                Some(SinkOutbound::Frame(jpeg)) => {
                    if ws_tx.send(Message::Binary(jpeg)).await.is_err() {
                        break;
                    }
                }
                Some(SinkOutbound::Goodbye(reason)) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },
            inbound = ws_rx.next() => {
                idle_deadline = Instant::now() + SOCKET_TIMEOUT;
                match inbound {
                    Some(Ok(Message::Text(text))) => match SignalMessage::from_json(&text) {
                        Some(msg) => {
                            let _ = state.events.send(ServerEvent::Signal(msg)).await;
                        }
                        // Malformed signaling on the socket is ignored.
                        None => debug!("ignoring malformed sink message"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_) | Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        // Broken pipe, connection reset, software abort:
                        // evict this sink, the server keeps running.
                        debug!(error = %e, "sink transport error");
                        break;
                    }
                }
            },
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                debug!("sink idle timeout");
                break;
            }
        }
    }
}
