//! Synthetic camera backend for development and CI without hardware.
//!
//! Generates a moving luma gradient at the configured rate. Optional row
//! padding on the Y plane exercises the converters' per-row copy path the
//! way padded hardware buffers do.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::CameraConfig;
use crate::error::CameraError;
use crate::frame::{monotonic_ns, CameraLens, Plane, RawFrame};

use super::camera::{CameraBackend, CameraDevice};

/// Synthetic backend configuration.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// How many lenses the fake device has (front is index 0).
    pub lens_count: u32,
    /// Fail this many opens with a transient error before succeeding.
    pub fail_opens: u32,
    /// Extra bytes appended to each Y row (padded row stride).
    pub row_padding: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            lens_count: 2,
            fail_opens: 0,
            row_padding: 0,
        }
    }
}

/// A camera backend that needs no camera.
pub struct SyntheticBackend {
    config: SyntheticConfig,
    opens: Arc<AtomicUsize>,
    remaining_failures: Arc<AtomicU32>,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        let remaining_failures = Arc::new(AtomicU32::new(config.fail_opens));
        Self {
            config,
            opens: Arc::new(AtomicUsize::new(0)),
            remaining_failures,
        }
    }

    /// Counter of open attempts, observable from tests.
    pub fn open_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }

    fn index(lens: CameraLens) -> u32 {
        match lens {
            CameraLens::Front => 0,
            CameraLens::Back => 1,
        }
    }
}

impl CameraBackend for SyntheticBackend {
    fn lens_available(&self, lens: CameraLens) -> bool {
        Self::index(lens) < self.config.lens_count
    }

    fn open(
        &self,
        config: &CameraConfig,
        lens: CameraLens,
    ) -> Result<(Box<dyn CameraDevice>, mpsc::Receiver<RawFrame>), CameraError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        if !self.lens_available(lens) {
            return Err(CameraError::LensMissing(lens));
        }
        if self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CameraError::Unavailable("synthetic transient failure".into()));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(4);

        let generator_stop = Arc::clone(&stop);
        let generator_closed = Arc::clone(&closed);
        let (width, height, fps) = (config.width, config.height, config.fps.max(1));
        let row_padding = self.config.row_padding;
        // Front and back get distinct base shades so a lens switch is
        // visible in the frames.
        let base = Self::index(lens) as u8 * 64;

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_micros(1_000_000 / fps as u64));
            let mut frame_num = 0u64;
            loop {
                interval.tick().await;
                if generator_stop.load(Ordering::SeqCst) {
                    break;
                }
                let frame = synthetic_frame(width, height, row_padding, base, frame_num);
                if tx.send(frame).await.is_err() {
                    break;
                }
                frame_num += 1;
            }
            generator_closed.store(true, Ordering::SeqCst);
            debug!(frame_num, "synthetic source stopped");
        });

        Ok((Box::new(SyntheticDevice { stop, closed }), rx))
    }
}

struct SyntheticDevice {
    stop: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl CameraDevice for SyntheticDevice {
    fn begin_close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn is_closed(&mut self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A moving gradient frame with optional Y row padding.
fn synthetic_frame(
    width: u32,
    height: u32,
    row_padding: usize,
    base: u8,
    frame_num: u64,
) -> RawFrame {
    let (w, h) = (width as usize, height as usize);
    let row_stride = w + row_padding;

    let mut y = Vec::with_capacity(row_stride * h);
    for row in 0..h {
        for col in 0..w {
            y.push(base.wrapping_add((col + row + frame_num as usize) as u8));
        }
        y.extend(std::iter::repeat(0xEE).take(row_padding));
    }

    let chroma = vec![128u8; (w / 2) * (h / 2)];
    RawFrame {
        width,
        height,
        rotation: 0,
        timestamp_ns: monotonic_ns(),
        y: Plane {
            data: Bytes::from(y),
            row_stride,
            pixel_stride: 1,
        },
        u: Plane::packed(chroma.clone(), w / 2),
        v: Plane::packed(chroma, w / 2),
    }
}
