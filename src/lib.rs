//! mirrorcast — the live media core of a camera-to-TV mirroring system.
//!
//! A handheld source captures camera frames, renders a local preview, and
//! streams to a television browser on the same LAN: over a WebRTC peer
//! connection when the sink negotiates one, over a WebSocket/SSE JPEG
//! broadcast when it does not. This crate is the pipeline and its
//! coordination layer; UI, YouTube embedding, and platform plumbing live
//! with the embedder.
//!
//! Modules:
//!
//! - **frame** — stride-aware raw frames, packed I420, encoded JPEG
//! - **capture** — exclusive camera ownership and frame routing
//! - **convert** — YUV to JPEG and I420, crop/scale to the wire size
//! - **webrtc** — peer session, outgoing H.264 track, SDP codec filter
//! - **web** — axum server: signaling WebSocket, SSE fallback, status
//! - **pipeline** — the state machine binding everything together
//! - **discovery** — UDP presence beacon
//!
//! The `test-source` feature adds a synthetic camera backend so the whole
//! pipeline runs without hardware.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mirrorcast::{LibcameraBackend, Pipeline, PipelineConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let pipeline = Pipeline::spawn(
//!     PipelineConfig::default(),
//!     Arc::new(LibcameraBackend::detect()),
//! );
//! pipeline.start().await?;
//! pipeline.set_sink_video("dQw4w9WgXcQ", None).await;
//! pipeline.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod convert;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod signal;
pub mod web;
pub mod webrtc;

pub use capture::{CameraBackend, FrameConsumer, FrameRouter, FrameSource, LibcameraBackend};
pub use config::{CameraConfig, DiscoveryConfig, PipelineConfig};
pub use convert::{I420Converter, JpegEncoder};
pub use error::{CameraError, FrameError, PeerError, ServerError};
pub use frame::{
    CameraLens, CameraMode, EncodedJpeg, I420Frame, RawFrame, STREAM_HEIGHT, STREAM_WIDTH,
};
pub use pipeline::{Pipeline, PipelineHandle, PipelineSnapshot, PipelineState, StreamMode, WakeLock};
pub use signal::{SdpKind, SignalMessage, VideoCommand};

#[cfg(feature = "test-source")]
pub use capture::{SyntheticBackend, SyntheticConfig};
