//! Error types, one enum per failure domain.
//!
//! The recovery policy differs per kind: camera failures retry then turn
//! fatal, sink transport failures only evict that sink, peer failures
//! degrade the pipeline to the JPEG fallback, and frame processing
//! failures drop the offending frame and nothing else.

use thiserror::Error;

use crate::frame::CameraLens;

/// Camera acquisition and lifecycle errors.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The device is occupied or reported a hardware error. Retried with
    /// backoff before becoming fatal.
    #[error("camera unavailable: {0}")]
    Unavailable(String),

    /// The requested lens does not exist on this device. Not retried; the
    /// current binding is left untouched.
    #[error("lens not available: {0:?}")]
    LensMissing(CameraLens),

    /// Open retries exhausted. Terminal for the pipeline.
    #[error("camera initialization failed after retries: {0}")]
    InitFailed(String),

    /// An operation was issued after the source closed.
    #[error("camera is closed")]
    Closed,
}

/// HTTP server and sink transport errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configured port is occupied. One cleanup-and-retry is attempted
    /// before this becomes fatal.
    #[error("port {0} is busy")]
    PortBusy(u16),

    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),

    /// A single sink's transport broke; the sink is evicted, the server
    /// keeps running.
    #[error("sink transport error: {0}")]
    SinkTransport(String),
}

/// WebRTC peer session errors. Any of these degrade the pipeline to the
/// fallback broadcast.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer setup failed: {0}")]
    Setup(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("peer session is closed")]
    Closed,
}

/// Frame conversion errors. Always local: the frame is dropped, the
/// pipeline continues.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("bad frame dimensions {width}x{height}")]
    BadDimensions { width: u32, height: u32 },

    #[error("{plane} plane too short: need {needed} bytes, have {actual}")]
    ShortPlane {
        plane: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("jpeg encoding failed: {0}")]
    Jpeg(String),

    #[error("i420 conversion failed: {0}")]
    Convert(String),
}
