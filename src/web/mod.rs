//! Signaling and fallback server: axum HTTP + WebSocket + SSE.
//!
//! One server multiplexes everything the sink needs:
//! - `GET /` — the sink page (hosted bytes, replaceable by the embedder)
//! - `WS /stream` — signaling channel and binary JPEG fallback path
//! - `GET /stream-sse` — base64 JPEG frames over Server-Sent Events
//! - `POST /webrtc-offer`, `/webrtc-answer`, `/webrtc-ice` — HTTP signaling
//! - `GET /api/status` — liveness and client counts
//!
//! Transport errors on an individual sink evict that sink only; the
//! server itself keeps serving.

pub mod sse;
pub mod ws;

pub use ws::{CLOSE_REASON_DISPLACED, CLOSE_REASON_STOPPED};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::capture::FrameRouter;
use crate::error::ServerError;
use crate::pipeline::PipelineSnapshot;
use crate::signal::{SdpKind, SignalMessage};

use ws::SinkOutbound;

/// Events the server reports to the pipeline.
#[derive(Debug)]
pub enum ServerEvent {
    SinkConnected,
    SinkDisconnected,
    Signal(SignalMessage),
}

/// The registered WebSocket sink.
struct SinkHandle {
    tx: mpsc::Sender<SinkOutbound>,
    generation: u64,
}

/// Shared server state.
pub struct ServerState {
    sink: Mutex<Option<SinkHandle>>,
    generation: AtomicU64,
    pub(crate) sse_tx: broadcast::Sender<Bytes>,
    pub(crate) sse_clients: AtomicUsize,
    pub(crate) events: mpsc::Sender<ServerEvent>,
    snapshot: watch::Receiver<PipelineSnapshot>,
    router: Arc<FrameRouter>,
    started_at: Instant,
}

impl ServerState {
    /// Register a new sink, displacing any previous one with a goodbye
    /// frame. Returns the registration generation.
    pub(crate) fn register_sink(&self, tx: mpsc::Sender<SinkOutbound>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut sink = self.sink.lock().unwrap();
        if let Some(old) = sink.take() {
            debug!(displaced = old.generation, "displacing previous sink");
            let _ = old.tx.try_send(SinkOutbound::Goodbye(CLOSE_REASON_DISPLACED));
        }
        *sink = Some(SinkHandle { tx, generation });
        generation
    }

    /// Clear the registration if it is still this generation's. Returns
    /// whether anything was removed.
    pub(crate) fn unregister_sink(&self, generation: u64) -> bool {
        let mut sink = self.sink.lock().unwrap();
        match sink.as_ref() {
            Some(current) if current.generation == generation => {
                *sink = None;
                true
            }
            _ => false,
        }
    }

    fn sink_tx(&self) -> Option<mpsc::Sender<SinkOutbound>> {
        self.sink.lock().unwrap().as_ref().map(|s| s.tx.clone())
    }
}

/// Handle to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
    addr: SocketAddr,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a signaling message for the WebSocket sink. A missing sink is
    /// not an error; the message is simply dropped.
    pub fn send_signal(&self, msg: SignalMessage) {
        if let Some(tx) = self.state.sink_tx() {
            if tx.try_send(SinkOutbound::Signal(msg)).is_err() {
                warn!("sink signaling queue full, message dropped");
            }
        }
    }

    /// Broadcast one JPEG frame: a TIMESTAMP text message then the binary
    /// frame to the WebSocket sink (when `include_sink`), and a base64
    /// record to every SSE observer. The timestamp-before-frame order lets
    /// the sink compute one-way latency.
    pub fn broadcast_jpeg(&self, jpeg: &Bytes, include_sink: bool) {
        if include_sink {
            if let Some(tx) = self.state.sink_tx() {
                // Both messages ride the same queue, preserving order. A
                // full queue drops the frame, never queues it for later.
                let ts = SignalMessage::timestamp_now();
                if tx.try_send(SinkOutbound::Signal(ts)).is_ok() {
                    let _ = tx.try_send(SinkOutbound::Frame(jpeg.clone()));
                }
            }
        }
        let _ = self.state.sse_tx.send(jpeg.clone());
    }

    /// Send the shutdown goodbye to the sink and stop accepting.
    /// Idempotent.
    pub async fn stop(&self) {
        if let Some(tx) = self.state.sink_tx() {
            let _ = tx.try_send(SinkOutbound::Goodbye(CLOSE_REASON_STOPPED));
            // Give the writer a moment to flush the close frame.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
            info!("server stopped");
        }
    }
}

/// The signaling and fallback server.
pub struct Server;

impl Server {
    /// Bind and start serving. `AddrInUse` maps to [`ServerError::PortBusy`]
    /// so the caller can run its cleanup-and-retry policy.
    pub async fn start(
        port: u16,
        events: mpsc::Sender<ServerEvent>,
        snapshot: watch::Receiver<PipelineSnapshot>,
        router: Arc<FrameRouter>,
    ) -> Result<ServerHandle, ServerError> {
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                return Err(ServerError::PortBusy(port));
            }
            Err(e) => return Err(ServerError::Bind(e)),
        };
        let addr = listener.local_addr().map_err(ServerError::Bind)?;

        let (sse_tx, _) = broadcast::channel(8);
        let state = Arc::new(ServerState {
            sink: Mutex::new(None),
            generation: AtomicU64::new(0),
            sse_tx,
            sse_clients: AtomicUsize::new(0),
            events,
            snapshot,
            router,
            started_at: Instant::now(),
        });

        let app = Router::new()
            .route("/", get(index))
            .route("/stream", get(ws_upgrade))
            .route("/stream-sse", get(sse::stream_sse))
            .route("/webrtc-offer", post(webrtc_offer))
            .route("/webrtc-answer", post(webrtc_answer))
            .route("/webrtc-ice", post(webrtc_ice))
            .route("/api/status", get(api_status))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&state));

        info!(%addr, "server listening");
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "server exited");
            }
        });

        Ok(ServerHandle {
            state,
            addr,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

async fn index() -> Html<&'static str> {
    Html(include_str!("sink.html"))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_sink(socket, state))
}

/// POST /webrtc-offer — a sink-initiated offer. The source drives
/// negotiation itself, so this is accepted and surfaced but the session
/// machine only acts on answers.
async fn webrtc_offer(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    signal_sdp(&state, &body, SdpKind::Offer, "offer").await
}

/// POST /webrtc-answer — the sink's answer to our offer.
async fn webrtc_answer(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    signal_sdp(&state, &body, SdpKind::Answer, "answer").await
}

async fn signal_sdp(
    state: &ServerState,
    body: &serde_json::Value,
    kind: SdpKind,
    expected_type: &str,
) -> StatusCode {
    let type_ok = body.get("type").and_then(|v| v.as_str()) == Some(expected_type);
    let sdp = body.get("sdp").and_then(|v| v.as_str());
    match (type_ok, sdp) {
        (true, Some(sdp)) => {
            let _ = state
                .events
                .send(ServerEvent::Signal(SignalMessage::Sdp {
                    sdp_type: kind,
                    sdp: sdp.to_string(),
                }))
                .await;
            StatusCode::OK
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

/// POST /webrtc-ice — an ICE candidate from the sink.
async fn webrtc_ice(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let Some(candidate) = body.get("candidate").and_then(|v| v.as_str()) else {
        return StatusCode::BAD_REQUEST;
    };
    let sdp_mid = body
        .get("sdpMid")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let sdp_mline_index = body
        .get("sdpMLineIndex")
        .and_then(|v| v.as_u64())
        .map(|n| n as u16);
    let _ = state
        .events
        .send(ServerEvent::Signal(SignalMessage::Ice {
            sdp_mid,
            sdp_mline_index,
            candidate: candidate.to_string(),
        }))
        .await;
    StatusCode::OK
}

/// GET /api/status — liveness, state, and client counts.
async fn api_status(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    let snapshot = state.snapshot.borrow().clone();
    let stats = state.router.stats();
    let websocket = usize::from(state.sink.lock().unwrap().is_some());

    Json(serde_json::json!({
        "status": "ok",
        "state": snapshot.state,
        "mode": snapshot.mode,
        "sink_connected": snapshot.sink_connected,
        "front_camera": snapshot.front_camera,
        "clients": {
            "websocket": websocket,
            "sse": state.sse_clients.load(Ordering::Relaxed),
        },
        "frames": {
            "offered": stats.offered,
            "dispatched": stats.dispatched,
            "dropped": stats.dropped,
        },
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}
