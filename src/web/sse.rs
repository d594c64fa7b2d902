//! Server-Sent-Events fallback for sink browsers without WebSocket binary
//! support.
//!
//! Each observer gets every broadcast JPEG as a base64 `data:` record,
//! plus an `event: ping` every second to keep middleboxes from closing
//! the connection. Observers are independent of the WebSocket sink; any
//! number may attach.

use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::Stream;
use tokio::sync::broadcast;
use tracing::debug;

use super::ServerState;

const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Decrements the observer count when the stream is dropped.
struct ObserverGuard(Arc<ServerState>);

impl ObserverGuard {
    fn register(state: Arc<ServerState>) -> Self {
        state.sse_clients.fetch_add(1, Ordering::Relaxed);
        Self(state)
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.0.sse_clients.fetch_sub(1, Ordering::Relaxed);
    }
}

/// GET /stream-sse
pub(crate) async fn stream_sse(
    State(state): State<Arc<ServerState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.sse_tx.subscribe();

    let stream = async_stream::stream! {
        let mut rx = rx;
        let _guard = ObserverGuard::register(state);
        let mut ping = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                result = rx.recv() => match result {
                    Ok(jpeg) => yield Ok(Event::default().data(BASE64.encode(&jpeg))),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // A slow observer just skips frames.
                        debug!(missed = n, "sse observer lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ping.tick() => yield Ok(Event::default().event("ping").data("")),
            }
        }
    };

    Sse::new(stream)
}
