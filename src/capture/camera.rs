//! Frame source: exclusive owner of the camera device.
//!
//! All lifecycle operations (open, lens switch, mode change, close) are
//! serialized through a single executor task, so at most one binding ever
//! exists against the underlying camera and callbacks never overlap. The
//! preview output is a latest-frame watch handed out by reference; it is
//! never re-opened independently of the streaming binding.
//!
//! The default backend spawns `libcamera-vid` emitting raw I420 to stdout
//! and chunks it into frames on a blocking reader, the same shape the
//! hardware capture takes elsewhere in this codebase family.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capture::router::FrameRouter;
use crate::config::CameraConfig;
use crate::error::CameraError;
use crate::frame::{monotonic_ns, CameraLens, CameraMode, RawFrame};

/// How often the executor polls a closing device for its terminal state.
const CLOSE_POLL: Duration = Duration::from_millis(20);

/// A camera backend: knows which lenses exist and how to bind one.
pub trait CameraBackend: Send + Sync + 'static {
    fn lens_available(&self, lens: CameraLens) -> bool;

    /// Bind the camera. Returns the device handle and the frame stream.
    /// A transient failure is `CameraError::Unavailable` and will be
    /// retried by the executor.
    fn open(
        &self,
        config: &CameraConfig,
        lens: CameraLens,
    ) -> Result<(Box<dyn CameraDevice>, mpsc::Receiver<RawFrame>), CameraError>;
}

/// A bound camera device.
pub trait CameraDevice: Send {
    /// Ask the device to stop. Must not block.
    fn begin_close(&mut self);

    /// Whether the device has reached its terminal closed state.
    fn is_closed(&mut self) -> bool;
}

/// Commands accepted by the executor task.
enum CameraCommand {
    Open {
        mode: CameraMode,
        lens: CameraLens,
        reply: oneshot::Sender<Result<(), CameraError>>,
    },
    SwitchLens {
        reply: oneshot::Sender<Result<CameraLens, CameraError>>,
    },
    SetMode {
        mode: CameraMode,
        reply: oneshot::Sender<Result<(), CameraError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// What the source is currently bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceBinding {
    pub mode: CameraMode,
    pub lens: CameraLens,
}

/// Handle to the frame source. Cheap to clone; all clones talk to the same
/// executor.
#[derive(Clone)]
pub struct FrameSource {
    commands: mpsc::Sender<CameraCommand>,
    preview: watch::Receiver<Option<RawFrame>>,
    binding: watch::Receiver<Option<SourceBinding>>,
}

impl FrameSource {
    /// Spawn the executor. Dispatch in `Streaming` mode goes to `router`.
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        config: CameraConfig,
        router: Arc<FrameRouter>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(8);
        let (preview_tx, preview) = watch::channel(None);
        let (binding_tx, binding) = watch::channel(None);

        tokio::spawn(executor(backend, config, router, command_rx, preview_tx, binding_tx));

        Self {
            commands,
            preview,
            binding,
        }
    }

    /// Acquire the camera and start producing frames. Returning `Ok` is
    /// the source's ready signal, emitted exactly once per open.
    pub async fn open(&self, mode: CameraMode, lens: CameraLens) -> Result<(), CameraError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(CameraCommand::Open { mode, lens, reply })
            .await
            .map_err(|_| CameraError::Closed)?;
        rx.await.map_err(|_| CameraError::Closed)?
    }

    /// Atomically rebind against the other lens, preserving the mode.
    /// Returns the lens now active.
    pub async fn switch_lens(&self) -> Result<CameraLens, CameraError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(CameraCommand::SwitchLens { reply })
            .await
            .map_err(|_| CameraError::Closed)?;
        rx.await.map_err(|_| CameraError::Closed)?
    }

    /// Change between preview-only and streaming. A no-op when the mode is
    /// already current; otherwise a full rebind preserving the lens.
    pub async fn set_mode(&self, mode: CameraMode) -> Result<(), CameraError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(CameraCommand::SetMode { mode, reply })
            .await
            .map_err(|_| CameraError::Closed)?;
        rx.await.map_err(|_| CameraError::Closed)?
    }

    /// Release all camera resources. Idempotent.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(CameraCommand::Close { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// The preview surface: a latest-frame watch. Present in both modes.
    pub fn preview(&self) -> watch::Receiver<Option<RawFrame>> {
        self.preview.clone()
    }

    /// Current binding, `None` when the camera is closed or mid-switch.
    pub fn binding(&self) -> Option<SourceBinding> {
        *self.binding.borrow()
    }
}

/// Executor-held state for one binding.
struct Active {
    device: Box<dyn CameraDevice>,
    binding: SourceBinding,
    delivery: tokio::task::JoinHandle<()>,
}

/// The camera executor: a single task owning the device, processing
/// lifecycle commands strictly in order.
async fn executor(
    backend: Arc<dyn CameraBackend>,
    config: CameraConfig,
    router: Arc<FrameRouter>,
    mut commands: mpsc::Receiver<CameraCommand>,
    preview: watch::Sender<Option<RawFrame>>,
    binding_tx: watch::Sender<Option<SourceBinding>>,
) {
    let mut active: Option<Active> = None;

    while let Some(command) = commands.recv().await {
        match command {
            CameraCommand::Open { mode, lens, reply } => {
                let result = if active.is_some() {
                    Err(CameraError::Unavailable("camera already open".into()))
                } else {
                    bind(&*backend, &config, &router, &preview, mode, lens)
                        .await
                        .map(|a| {
                            binding_tx.send_replace(Some(a.binding));
                            active = Some(a);
                        })
                };
                let _ = reply.send(result);
            }
            CameraCommand::SwitchLens { reply } => {
                let result = match active.take() {
                    None => Err(CameraError::Closed),
                    Some(current) => {
                        let target = current.binding.lens.other();
                        if !backend.lens_available(target) {
                            // Abort without unbinding: the current lens
                            // keeps streaming.
                            let lens = current.binding.lens;
                            active = Some(current);
                            let _ = reply.send(Err(CameraError::LensMissing(target)));
                            debug!(?lens, "lens switch aborted, target missing");
                            continue;
                        }
                        let mode = current.binding.mode;
                        binding_tx.send_replace(None);
                        unbind(current, config.close_timeout).await;
                        match bind(&*backend, &config, &router, &preview, mode, target).await {
                            Ok(a) => {
                                binding_tx.send_replace(Some(a.binding));
                                active = Some(a);
                                Ok(target)
                            }
                            Err(e) => Err(e),
                        }
                    }
                };
                let _ = reply.send(result);
            }
            CameraCommand::SetMode { mode, reply } => {
                let result = match active.take() {
                    None => Err(CameraError::Closed),
                    Some(current) if current.binding.mode == mode => {
                        // Idempotent: no rebind.
                        active = Some(current);
                        Ok(())
                    }
                    Some(current) => {
                        let lens = current.binding.lens;
                        binding_tx.send_replace(None);
                        unbind(current, config.close_timeout).await;
                        match bind(&*backend, &config, &router, &preview, mode, lens).await {
                            Ok(a) => {
                                binding_tx.send_replace(Some(a.binding));
                                active = Some(a);
                                Ok(())
                            }
                            Err(e) => Err(e),
                        }
                    }
                };
                let _ = reply.send(result);
            }
            CameraCommand::Close { reply } => {
                if let Some(current) = active.take() {
                    binding_tx.send_replace(None);
                    unbind(current, config.close_timeout).await;
                }
                let _ = reply.send(());
            }
        }
    }

    // Handle dropped: release whatever is still bound.
    if let Some(current) = active.take() {
        unbind(current, config.close_timeout).await;
    }
}

/// Open with retry and backoff, then start the delivery task.
async fn bind(
    backend: &dyn CameraBackend,
    config: &CameraConfig,
    router: &Arc<FrameRouter>,
    preview: &watch::Sender<Option<RawFrame>>,
    mode: CameraMode,
    lens: CameraLens,
) -> Result<Active, CameraError> {
    let mut attempt = 0u32;
    let (device, frames) = loop {
        match backend.open(config, lens) {
            Ok(bound) => break bound,
            Err(CameraError::Unavailable(reason)) if attempt < config.open_retries => {
                attempt += 1;
                let delay = retry_delay(attempt);
                warn!(?lens, attempt, %reason, "camera open failed, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
            Err(CameraError::Unavailable(reason)) => {
                return Err(CameraError::InitFailed(reason));
            }
            Err(e) => return Err(e),
        }
    };

    info!(?lens, ?mode, "camera bound");
    let delivery = tokio::spawn(deliver(frames, mode, Arc::clone(router), preview.clone()));

    Ok(Active {
        device,
        binding: SourceBinding { mode, lens },
        delivery,
    })
}

/// Stop a binding and wait (bounded) for the device's terminal state.
/// On timeout the teardown proceeds anyway.
async fn unbind(mut active: Active, close_timeout: Duration) {
    active.device.begin_close();
    let deadline = Instant::now() + close_timeout;
    loop {
        if active.device.is_closed() {
            break;
        }
        if Instant::now() >= deadline {
            warn!("camera close wait timed out, proceeding");
            break;
        }
        tokio::time::sleep(CLOSE_POLL).await;
    }
    active.delivery.abort();
    debug!("camera unbound");
}

/// Forward frames to the preview tap and, in streaming mode, the router.
/// Dispatch is synchronous here; the frame is released when the iteration
/// ends.
async fn deliver(
    mut frames: mpsc::Receiver<RawFrame>,
    mode: CameraMode,
    router: Arc<FrameRouter>,
    preview: watch::Sender<Option<RawFrame>>,
) {
    let mut count = 0u64;
    while let Some(frame) = frames.recv().await {
        preview.send_replace(Some(frame.clone()));
        if mode == CameraMode::Streaming {
            router.dispatch(&frame);
        }
        count += 1;
        if count % 300 == 0 {
            debug!(count, "frames delivered");
        }
    }
    debug!(count, "delivery ended");
}

/// Backoff for open retries: 1s, 2s, 3s.
fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(attempt as u64)
}

// ── libcamera subprocess backend ─────────────────────────────────────

/// Camera backend spawning `libcamera-vid` with raw I420 output.
pub struct LibcameraBackend {
    camera_count: u32,
}

impl LibcameraBackend {
    /// Probe available cameras. Falls back to a single camera when the
    /// probe tool is missing.
    pub fn detect() -> Self {
        let camera_count = Command::new("libcamera-vid")
            .arg("--list-cameras")
            .output()
            .ok()
            .map(|out| {
                let text = String::from_utf8_lossy(&out.stdout);
                text.lines()
                    .filter(|line| {
                        let mut parts = line.trim_start().splitn(2, ':');
                        matches!(parts.next(), Some(idx) if idx.trim().parse::<u32>().is_ok())
                            && parts.next().is_some()
                    })
                    .count() as u32
            })
            .filter(|&n| n > 0)
            .unwrap_or(1);
        info!(camera_count, "libcamera probe");
        Self { camera_count }
    }

    /// Front is index 0 (the user-facing module on the supported devices),
    /// back is index 1.
    fn index(lens: CameraLens) -> u32 {
        match lens {
            CameraLens::Front => 0,
            CameraLens::Back => 1,
        }
    }
}

impl CameraBackend for LibcameraBackend {
    fn lens_available(&self, lens: CameraLens) -> bool {
        Self::index(lens) < self.camera_count
    }

    fn open(
        &self,
        config: &CameraConfig,
        lens: CameraLens,
    ) -> Result<(Box<dyn CameraDevice>, mpsc::Receiver<RawFrame>), CameraError> {
        if !self.lens_available(lens) {
            return Err(CameraError::LensMissing(lens));
        }

        let (width, height, fps) = (config.width, config.height, config.fps);
        let mut child = Command::new("libcamera-vid")
            .args([
                "--camera",
                &Self::index(lens).to_string(),
                "-t",
                "0",
                "--codec",
                "yuv420",
                "--width",
                &width.to_string(),
                "--height",
                &height.to_string(),
                "--framerate",
                &fps.to_string(),
                "--nopreview",
                "--flush",
                "-o",
                "-",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CameraError::Unavailable(format!("spawn libcamera-vid: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CameraError::Unavailable("no stdout from libcamera-vid".into()))?;

        let (tx, rx) = mpsc::channel(4);
        tokio::task::spawn_blocking(move || read_yuv_stream(stdout, tx, width, height));

        Ok((Box::new(LibcameraDevice { child }), rx))
    }
}

struct LibcameraDevice {
    child: Child,
}

impl CameraDevice for LibcameraDevice {
    fn begin_close(&mut self) {
        let _ = self.child.kill();
    }

    fn is_closed(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

impl Drop for LibcameraDevice {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Blocking reader: chunk raw I420 stdout into frames.
fn read_yuv_stream<R: Read>(mut reader: R, tx: mpsc::Sender<RawFrame>, width: u32, height: u32) {
    let y_size = (width * height) as usize;
    let c_size = y_size / 4;
    let frame_size = y_size + 2 * c_size;
    let mut buf = vec![0u8; frame_size];
    let mut count = 0u64;

    loop {
        if let Err(e) = reader.read_exact(&mut buf) {
            debug!(error = %e, "yuv stream ended");
            break;
        }
        let frame = RawFrame::from_packed(
            width,
            height,
            monotonic_ns(),
            buf[..y_size].to_vec(),
            buf[y_size..y_size + c_size].to_vec(),
            buf[y_size + c_size..].to_vec(),
        );
        if tx.blocking_send(frame).is_err() {
            debug!("frame receiver dropped, stopping reader");
            break;
        }
        count += 1;
        if count % 300 == 0 {
            debug!(count, "raw frames read");
        }
    }
}

#[cfg(all(test, feature = "test-source"))]
mod tests {
    use super::*;
    use crate::capture::test_source::{SyntheticBackend, SyntheticConfig};
    use crate::capture::FrameConsumer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl FrameConsumer for Counter {
        fn accept(&self, _frame: &RawFrame) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> CameraConfig {
        CameraConfig {
            width: 64,
            height: 48,
            fps: 60,
            close_timeout: Duration::from_millis(500),
            open_retries: 3,
        }
    }

    fn source_with(backend: SyntheticBackend) -> (FrameSource, Arc<FrameRouter>) {
        let router = Arc::new(FrameRouter::new(Duration::from_millis(0)));
        let source = FrameSource::new(Arc::new(backend), fast_config(), Arc::clone(&router));
        (source, router)
    }

    #[tokio::test]
    async fn open_streams_frames_to_router() {
        let (source, router) = source_with(SyntheticBackend::new(SyntheticConfig::default()));
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        router.attach("count", counter.clone());

        source.open(CameraMode::Streaming, CameraLens::Front).await.unwrap();
        assert_eq!(
            source.binding(),
            Some(SourceBinding {
                mode: CameraMode::Streaming,
                lens: CameraLens::Front
            })
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(counter.0.load(Ordering::SeqCst) > 0, "frames should flow");
        source.close().await;
    }

    #[tokio::test]
    async fn preview_only_does_not_dispatch() {
        let (source, router) = source_with(SyntheticBackend::new(SyntheticConfig::default()));
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        router.attach("count", counter.clone());

        source.open(CameraMode::PreviewOnly, CameraLens::Front).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Preview tap sees frames, the router does not.
        assert!(source.preview().borrow().is_some());
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        source.close().await;
    }

    #[tokio::test]
    async fn double_open_is_rejected() {
        let (source, _router) = source_with(SyntheticBackend::new(SyntheticConfig::default()));
        source.open(CameraMode::Streaming, CameraLens::Front).await.unwrap();
        assert!(matches!(
            source.open(CameraMode::Streaming, CameraLens::Front).await,
            Err(CameraError::Unavailable(_))
        ));
        source.close().await;
    }

    #[tokio::test]
    async fn switch_lens_preserves_mode_and_flips_lens() {
        let (source, _router) = source_with(SyntheticBackend::new(SyntheticConfig::default()));
        source.open(CameraMode::Streaming, CameraLens::Front).await.unwrap();

        let lens = source.switch_lens().await.unwrap();
        assert_eq!(lens, CameraLens::Back);
        assert_eq!(
            source.binding(),
            Some(SourceBinding {
                mode: CameraMode::Streaming,
                lens: CameraLens::Back
            })
        );

        // Twice is the identity.
        let lens = source.switch_lens().await.unwrap();
        assert_eq!(lens, CameraLens::Front);
        source.close().await;
    }

    #[tokio::test]
    async fn switch_on_single_lens_device_keeps_binding() {
        let config = SyntheticConfig {
            lens_count: 1,
            ..Default::default()
        };
        let (source, _router) = source_with(SyntheticBackend::new(config));
        source.open(CameraMode::Streaming, CameraLens::Front).await.unwrap();

        assert!(matches!(
            source.switch_lens().await,
            Err(CameraError::LensMissing(CameraLens::Back))
        ));
        // The original binding is untouched.
        assert_eq!(
            source.binding(),
            Some(SourceBinding {
                mode: CameraMode::Streaming,
                lens: CameraLens::Front
            })
        );
        source.close().await;
    }

    #[tokio::test]
    async fn set_mode_same_mode_is_a_noop() {
        let backend = SyntheticBackend::new(SyntheticConfig::default());
        let opens = backend.open_count();
        let (source, _router) = source_with(backend);
        source.open(CameraMode::Streaming, CameraLens::Front).await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        source.set_mode(CameraMode::Streaming).await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1, "no rebind expected");

        source.set_mode(CameraMode::PreviewOnly).await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 2, "mode change rebinds");
        source.close().await;
    }

    #[tokio::test]
    async fn close_then_open_succeeds_again() {
        let (source, _router) = source_with(SyntheticBackend::new(SyntheticConfig::default()));
        source.open(CameraMode::Streaming, CameraLens::Front).await.unwrap();
        source.close().await;
        source.close().await; // idempotent
        assert_eq!(source.binding(), None);
        source.open(CameraMode::Streaming, CameraLens::Front).await.unwrap();
        source.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn open_retries_then_turns_terminal() {
        let config = SyntheticConfig {
            fail_opens: u32::MAX,
            ..Default::default()
        };
        let backend = SyntheticBackend::new(config);
        let opens = backend.open_count();
        let (source, _router) = source_with(backend);

        let err = source
            .open(CameraMode::Streaming, CameraLens::Front)
            .await
            .unwrap_err();
        assert!(matches!(err, CameraError::InitFailed(_)));
        // Initial attempt plus three retries.
        assert_eq!(opens.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_within_retry_budget() {
        let config = SyntheticConfig {
            fail_opens: 2,
            ..Default::default()
        };
        let (source, _router) = source_with(SyntheticBackend::new(config));
        source.open(CameraMode::Streaming, CameraLens::Front).await.unwrap();
        source.close().await;
    }
}
