//! Pipeline controller: the state machine binding camera, router, peer
//! session, and server together.
//!
//! One controller task owns the component lifecycle and consumes every
//! asynchronous event (server, peer, embedder commands) from a single
//! select loop, so transitions are strictly ordered. State is published
//! as immutable snapshots on a watch channel; nothing reaches into the
//! controller's mutable state from outside.
//!
//! The critical ordering rule: the server must not accept sink
//! connections before the camera is ready, or the sink connects into a
//! blank stream. `start` therefore opens the camera first and only then
//! binds the listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capture::{CameraBackend, FrameConsumer, FrameRouter, FrameSource};
use crate::config::PipelineConfig;
use crate::convert::{I420Converter, JpegEncoder};
use crate::discovery;
use crate::error::{CameraError, ServerError};
use crate::frame::{CameraLens, CameraMode, RawFrame};
use crate::signal::{SdpKind, SignalMessage, VideoCommand};
use crate::web::{Server, ServerEvent, ServerHandle};
use crate::webrtc::{PeerConfig, PeerEvent, PeerSession};

/// Controller lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Stopped,
    Starting,
    WaitingForCamera,
    ServerUp,
    PeerNegotiating,
    #[serde(rename = "streaming_webrtc")]
    StreamingWebRTC,
    StreamingFallback,
    Stopping,
}

/// Which transport currently carries video to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    WebRtc,
    Fallback,
}

/// Immutable snapshot of the pipeline, published on every change.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub state: PipelineState,
    pub mode: Option<StreamMode>,
    pub sink_connected: bool,
    pub lens: CameraLens,
    /// Derived from the lens; there is no second source of truth.
    pub front_camera: bool,
    pub server_addr: Option<SocketAddr>,
    pub last_error: Option<String>,
}

impl PipelineSnapshot {
    fn initial(lens: CameraLens) -> Self {
        Self {
            state: PipelineState::Stopped,
            mode: None,
            sink_connected: false,
            lens,
            front_camera: lens.is_front(),
            server_addr: None,
            last_error: None,
        }
    }
}

/// Embedder-supplied hook keeping the device awake while streaming.
/// Acquisition plumbing lives with the embedder; the controller only
/// calls these at the start/stop transitions.
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

/// Commands from the embedder.
enum Command {
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SwitchLens {
        reply: oneshot::Sender<Result<CameraLens, CameraError>>,
    },
    SetSinkVideo {
        video_id: String,
        start_seconds: Option<f64>,
    },
    ClearSinkVideo,
}

/// Handle to a running pipeline. Cheap to clone.
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<PipelineSnapshot>,
    preview: watch::Receiver<Option<RawFrame>>,
}

impl PipelineHandle {
    /// Start streaming: camera first, then the sink server.
    pub async fn start(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { reply })
            .await
            .map_err(|_| anyhow!("pipeline terminated"))?;
        rx.await.map_err(|_| anyhow!("pipeline terminated"))?
    }

    /// Stop streaming and release every held resource. Idempotent.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Switch to the other lens, keeping the mode and the peer connection.
    pub async fn switch_lens(&self) -> Result<CameraLens, CameraError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SwitchLens { reply })
            .await
            .map_err(|_| CameraError::Closed)?;
        rx.await.map_err(|_| CameraError::Closed)?
    }

    /// Tell the sink which video to load.
    pub async fn set_sink_video(&self, video_id: impl Into<String>, start_seconds: Option<f64>) {
        let _ = self
            .commands
            .send(Command::SetSinkVideo {
                video_id: video_id.into(),
                start_seconds,
            })
            .await;
    }

    /// Tell the sink to unload its video.
    pub async fn clear_sink_video(&self) {
        let _ = self.commands.send(Command::ClearSinkVideo).await;
    }

    /// Subscribe to state snapshots.
    pub fn snapshot(&self) -> watch::Receiver<PipelineSnapshot> {
        self.snapshot.clone()
    }

    /// Current snapshot.
    pub fn current(&self) -> PipelineSnapshot {
        self.snapshot.borrow().clone()
    }

    /// The preview surface: latest captured frame, both modes.
    pub fn preview(&self) -> watch::Receiver<Option<RawFrame>> {
        self.preview.clone()
    }
}

/// The pipeline entry point.
pub struct Pipeline;

impl Pipeline {
    /// Spawn the controller with a no-op wake lock.
    pub fn spawn(config: PipelineConfig, backend: Arc<dyn CameraBackend>) -> PipelineHandle {
        Self::spawn_with_wake_lock(config, backend, Arc::new(NoopWakeLock))
    }

    /// Spawn the controller with an embedder wake lock.
    pub fn spawn_with_wake_lock(
        config: PipelineConfig,
        backend: Arc<dyn CameraBackend>,
        wake: Arc<dyn WakeLock>,
    ) -> PipelineHandle {
        let router = Arc::new(FrameRouter::new(config.frame_interval));
        let source = FrameSource::new(backend, config.camera.clone(), Arc::clone(&router));
        let preview = source.preview();

        let (commands, command_rx) = mpsc::channel(8);
        let (server_events_tx, server_events) = mpsc::channel(64);
        let (peer_events_tx, peer_events) = mpsc::channel(64);
        let (snapshot_tx, snapshot) = watch::channel(PipelineSnapshot::initial(config.lens));

        let controller = Controller {
            config,
            router,
            source,
            wake,
            snapshot_tx,
            server_events_tx,
            peer_events_tx,
            server: None,
            peer: None,
            beacon: None,
            include_sink: Arc::new(AtomicBool::new(false)),
            ice_deadline: None,
        };
        tokio::spawn(controller.run(command_rx, server_events, peer_events));

        PipelineHandle {
            commands,
            snapshot,
            preview,
        }
    }
}

struct Controller {
    config: PipelineConfig,
    router: Arc<FrameRouter>,
    source: FrameSource,
    wake: Arc<dyn WakeLock>,
    snapshot_tx: watch::Sender<PipelineSnapshot>,
    server_events_tx: mpsc::Sender<ServerEvent>,
    peer_events_tx: mpsc::Sender<PeerEvent>,
    server: Option<ServerHandle>,
    peer: Option<Arc<PeerSession>>,
    beacon: Option<JoinHandle<()>>,
    /// Whether the JPEG fanout also feeds the WebSocket sink (fallback
    /// mode). SSE observers are fed regardless.
    include_sink: Arc<AtomicBool>,
    ice_deadline: Option<Instant>,
}

impl Controller {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut server_events: mpsc::Receiver<ServerEvent>,
        mut peer_events: mpsc::Receiver<PeerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = server_events.recv() => self.handle_server_event(event).await,
                Some(event) = peer_events.recv() => self.handle_peer_event(event).await,
                _ = tokio::time::sleep_until(self.ice_deadline.unwrap_or_else(Instant::now)),
                    if self.ice_deadline.is_some() =>
                {
                    warn!("negotiation timed out");
                    self.enter_fallback("ice timeout").await;
                }
            }
        }
        // Handle dropped: tear everything down.
        self.shutdown().await;
    }

    fn state(&self) -> PipelineState {
        self.snapshot_tx.borrow().state
    }

    fn set_state(&self, state: PipelineState) {
        debug!(?state, "pipeline state");
        self.snapshot_tx.send_modify(|s| {
            s.state = state;
            s.mode = match state {
                PipelineState::StreamingWebRTC => Some(StreamMode::WebRtc),
                PipelineState::StreamingFallback => Some(StreamMode::Fallback),
                _ => None,
            };
        });
    }

    fn set_error(&self, error: impl ToString) {
        self.snapshot_tx
            .send_modify(|s| s.last_error = Some(error.to_string()));
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { reply } => {
                let _ = reply.send(self.handle_start().await);
            }
            Command::Stop { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
            Command::SwitchLens { reply } => {
                let result = self.source.switch_lens().await;
                if let Ok(lens) = &result {
                    let lens = *lens;
                    info!(?lens, "lens switched");
                    self.snapshot_tx.send_modify(|s| {
                        s.lens = lens;
                        s.front_camera = lens.is_front();
                    });
                }
                let _ = reply.send(result);
            }
            Command::SetSinkVideo {
                video_id,
                start_seconds,
            } => {
                if let Some(server) = &self.server {
                    server.send_signal(SignalMessage::VideoUrl {
                        video_id,
                        current_time: start_seconds,
                    });
                }
            }
            Command::ClearSinkVideo => {
                if let Some(server) = &self.server {
                    server.send_signal(SignalMessage::VideoControl {
                        command: VideoCommand::Stop,
                        value: None,
                    });
                }
            }
        }
    }

    async fn handle_start(&mut self) -> Result<()> {
        if self.state() != PipelineState::Stopped {
            return Err(anyhow!("pipeline already running"));
        }
        self.set_state(PipelineState::Starting);
        self.wake.acquire();

        // Camera first. The server must not accept sinks before the
        // camera is ready.
        self.set_state(PipelineState::WaitingForCamera);
        if let Err(e) = self
            .source
            .open(CameraMode::Streaming, self.config.lens)
            .await
        {
            self.set_error(&e);
            self.wake.release();
            self.set_state(PipelineState::Stopped);
            return Err(anyhow!(e)).context("camera open failed");
        }
        info!("camera ready");

        match self.start_server().await {
            Ok(server) => {
                self.snapshot_tx
                    .send_modify(|s| s.server_addr = Some(server.addr()));
                self.server = Some(server);
            }
            Err(e) => {
                self.set_error(&e);
                self.source.close().await;
                self.wake.release();
                self.set_state(PipelineState::Stopped);
                return Err(anyhow!(e)).context("server start failed");
            }
        }

        // The JPEG fanout runs in every streaming state: SSE observers
        // are independent of the negotiated peer. The WebSocket sink is
        // included only in fallback mode.
        self.include_sink.store(false, Ordering::Relaxed);
        self.attach_jpeg_fanout();

        if let Some(discovery_config) = self.config.discovery.clone() {
            self.beacon = Some(discovery::spawn_beacon(
                discovery_config,
                self.config.http_port,
            ));
        }

        self.set_state(PipelineState::ServerUp);
        info!("pipeline serving");
        Ok(())
    }

    /// Bind the server; on a busy port stop any prior instance we own,
    /// wait 500 ms, and retry exactly once.
    async fn start_server(&mut self) -> Result<ServerHandle, ServerError> {
        let start = |events: mpsc::Sender<ServerEvent>,
                     snapshot: watch::Receiver<PipelineSnapshot>,
                     router: Arc<FrameRouter>,
                     port: u16| async move {
            Server::start(port, events, snapshot, router).await
        };

        match start(
            self.server_events_tx.clone(),
            self.snapshot_tx.subscribe(),
            Arc::clone(&self.router),
            self.config.http_port,
        )
        .await
        {
            Err(ServerError::PortBusy(port)) => {
                warn!(port, "port busy, cleaning up and retrying once");
                if let Some(stale) = self.server.take() {
                    stale.stop().await;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
                start(
                    self.server_events_tx.clone(),
                    self.snapshot_tx.subscribe(),
                    Arc::clone(&self.router),
                    self.config.http_port,
                )
                .await
            }
            other => other,
        }
    }

    fn attach_jpeg_fanout(&self) {
        let Some(server) = &self.server else { return };
        self.router.attach(
            "jpeg",
            Arc::new(JpegFanout {
                encoder: JpegEncoder::new(self.config.jpeg_quality),
                server: server.clone(),
                include_sink: Arc::clone(&self.include_sink),
            }),
        );
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SinkConnected => {
                self.snapshot_tx.send_modify(|s| s.sink_connected = true);
                match self.state() {
                    PipelineState::ServerUp
                    | PipelineState::PeerNegotiating
                    | PipelineState::StreamingWebRTC
                    | PipelineState::StreamingFallback => self.begin_negotiation().await,
                    _ => {}
                }
            }
            ServerEvent::SinkDisconnected => {
                self.snapshot_tx.send_modify(|s| s.sink_connected = false);
                if self.state() == PipelineState::PeerNegotiating {
                    // Nothing to negotiate with; fall back to waiting.
                    self.close_peer().await;
                    self.ice_deadline = None;
                    self.set_state(PipelineState::ServerUp);
                }
            }
            ServerEvent::Signal(msg) => self.handle_signal(msg).await,
        }
    }

    /// A sink connected (or reconnected): discard any previous peer state
    /// and produce a fresh offer.
    async fn begin_negotiation(&mut self) {
        self.close_peer().await;
        self.include_sink.store(false, Ordering::Relaxed);

        let peer_config = PeerConfig {
            stun_server: self.config.stun_server.clone(),
            sample_duration: self.config.frame_interval,
        };
        let session = match PeerSession::new(peer_config, self.peer_events_tx.clone()).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!(error = %e, "peer setup failed, using fallback");
                self.set_error(&e);
                self.enter_fallback("peer setup failed").await;
                return;
            }
        };

        if let Err(e) = session.create_offer(&self.peer_events_tx).await {
            warn!(error = %e, "offer failed, using fallback");
            self.set_error(&e);
            session.close().await;
            self.enter_fallback("offer failed").await;
            return;
        }

        self.peer = Some(session);
        self.ice_deadline = Some(Instant::now() + self.config.ice_timeout);
        self.set_state(PipelineState::PeerNegotiating);
    }

    async fn handle_signal(&mut self, msg: SignalMessage) {
        match msg {
            SignalMessage::Sdp {
                sdp_type: SdpKind::Answer,
                sdp,
            } => {
                let Some(peer) = self.peer.clone() else {
                    debug!("answer with no active peer, ignoring");
                    return;
                };
                if let Err(e) = peer.accept_answer(sdp).await {
                    warn!(error = %e, "answer rejected, using fallback");
                    self.set_error(&e);
                    self.enter_fallback("answer rejected").await;
                }
            }
            SignalMessage::Sdp {
                sdp_type: SdpKind::Offer,
                ..
            } => {
                // The source drives negotiation; a sink-initiated offer
                // has no place in the session machine.
                debug!("sink-initiated offer ignored");
            }
            SignalMessage::Ice {
                sdp_mid,
                sdp_mline_index,
                candidate,
            } => {
                if let Some(peer) = self.peer.clone() {
                    if let Err(e) = peer
                        .add_remote_candidate(candidate, sdp_mid, sdp_mline_index)
                        .await
                    {
                        debug!(error = %e, "remote candidate rejected");
                    }
                }
            }
            SignalMessage::Timestamp { .. } => {}
            other => debug!(?other, "unexpected sink message"),
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalDescription { sdp_type, sdp } => {
                if let Some(server) = &self.server {
                    server.send_signal(SignalMessage::Sdp { sdp_type, sdp });
                }
            }
            PeerEvent::LocalCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                if let Some(server) = &self.server {
                    server.send_signal(SignalMessage::Ice {
                        sdp_mid,
                        sdp_mline_index,
                        candidate,
                    });
                }
            }
            PeerEvent::Connected => {
                if self.state() == PipelineState::PeerNegotiating {
                    self.ice_deadline = None;
                    if let Some(peer) = self.peer.clone() {
                        self.router.attach(
                            "webrtc",
                            Arc::new(PeerInjector {
                                converter: I420Converter::new(),
                                peer,
                            }),
                        );
                    }
                    self.set_state(PipelineState::StreamingWebRTC);
                    info!("streaming over webrtc");
                }
            }
            PeerEvent::Failed => {
                if matches!(
                    self.state(),
                    PipelineState::PeerNegotiating | PipelineState::StreamingWebRTC
                ) {
                    self.enter_fallback("peer failed").await;
                }
            }
        }
    }

    /// Degrade to the JPEG broadcast. A single transition; repeated
    /// triggers are no-ops once fallback is active.
    async fn enter_fallback(&mut self, reason: &str) {
        self.close_peer().await;
        self.ice_deadline = None;
        self.include_sink.store(true, Ordering::Relaxed);
        if self.state() != PipelineState::StreamingFallback {
            info!(reason, "streaming over fallback");
            self.set_state(PipelineState::StreamingFallback);
        }
    }

    async fn close_peer(&mut self) {
        self.router.detach("webrtc");
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
    }

    /// Tear everything down in order: peer, server (with its goodbye
    /// close), consumers, camera, wake lock. Idempotent.
    async fn shutdown(&mut self) {
        if self.state() == PipelineState::Stopped {
            return;
        }
        self.set_state(PipelineState::Stopping);
        self.ice_deadline = None;
        self.close_peer().await;

        if let Some(beacon) = self.beacon.take() {
            beacon.abort();
        }
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
        self.router.clear();
        self.source.close().await;
        self.wake.release();

        self.snapshot_tx.send_modify(|s| {
            s.sink_connected = false;
            s.server_addr = None;
        });
        self.set_state(PipelineState::Stopped);
        info!("pipeline stopped");
    }
}

/// Consumer: encode each dispatched frame to JPEG and broadcast it.
/// Encoding failures drop the frame and nothing else.
struct JpegFanout {
    encoder: JpegEncoder,
    server: ServerHandle,
    include_sink: Arc<AtomicBool>,
}

impl FrameConsumer for JpegFanout {
    fn accept(&self, frame: &RawFrame) {
        match self.encoder.encode(frame) {
            Ok(jpeg) => self
                .server
                .broadcast_jpeg(&jpeg.data, self.include_sink.load(Ordering::Relaxed)),
            Err(e) => warn!(error = %e, "jpeg encode failed, frame dropped"),
        }
    }
}

/// Consumer: convert each dispatched frame to I420 and feed the peer's
/// track source. Conversion failures drop the frame.
struct PeerInjector {
    converter: I420Converter,
    peer: Arc<PeerSession>,
}

impl FrameConsumer for PeerInjector {
    fn accept(&self, frame: &RawFrame) {
        match self.converter.convert(frame) {
            Ok(i420) => self.peer.push_i420(i420),
            Err(e) => warn!(error = %e, "i420 conversion failed, frame dropped"),
        }
    }
}

#[cfg(all(test, feature = "test-source"))]
mod tests {
    use super::*;
    use crate::capture::{SyntheticBackend, SyntheticConfig};
    use crate::config::CameraConfig;

    fn test_pipeline() -> PipelineHandle {
        let config = PipelineConfig {
            http_port: 0,
            camera: CameraConfig {
                width: 64,
                height: 48,
                fps: 30,
                ..Default::default()
            },
            ..Default::default()
        };
        Pipeline::spawn(
            config,
            Arc::new(SyntheticBackend::new(SyntheticConfig::default())),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_stop_round_trip() {
        let pipeline = test_pipeline();
        assert_eq!(pipeline.current().state, PipelineState::Stopped);

        pipeline.start().await.unwrap();
        let snapshot = pipeline.current();
        assert_eq!(snapshot.state, PipelineState::ServerUp);
        assert!(snapshot.server_addr.is_some());

        pipeline.stop().await;
        let snapshot = pipeline.current();
        assert_eq!(snapshot.state, PipelineState::Stopped);
        assert!(snapshot.server_addr.is_none());

        // Starting again succeeds with the resources released.
        pipeline.start().await.unwrap();
        pipeline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_is_idempotent() {
        let pipeline = test_pipeline();
        pipeline.stop().await;
        pipeline.stop().await;
        assert_eq!(pipeline.current().state, PipelineState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn double_start_is_rejected() {
        let pipeline = test_pipeline();
        pipeline.start().await.unwrap();
        assert!(pipeline.start().await.is_err());
        pipeline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn switch_lens_updates_snapshot() {
        let pipeline = test_pipeline();
        pipeline.start().await.unwrap();
        assert!(pipeline.current().front_camera);

        let lens = pipeline.switch_lens().await.unwrap();
        assert_eq!(lens, CameraLens::Back);
        let snapshot = pipeline.current();
        assert_eq!(snapshot.lens, CameraLens::Back);
        assert!(!snapshot.front_camera);

        pipeline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn preview_flows_after_start() {
        let pipeline = test_pipeline();
        pipeline.start().await.unwrap();

        let mut preview = pipeline.preview();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                preview.changed().await.unwrap();
                if preview.borrow().is_some() {
                    break;
                }
            }
        })
        .await
        .expect("preview frame should arrive");

        pipeline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sink_video_commands_without_server_are_noops() {
        let pipeline = test_pipeline();
        pipeline.set_sink_video("dQw4w9WgXcQ", Some(12.0)).await;
        pipeline.clear_sink_video().await;
        assert_eq!(pipeline.current().state, PipelineState::Stopped);
    }
}
