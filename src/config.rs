//! Pipeline configuration.

use std::time::Duration;

use crate::frame::{CameraLens, DEFAULT_JPEG_QUALITY};

/// Camera capture settings.
///
/// The preview stream is captured at the highest available 16:9 resolution;
/// the defaults below are the cap the policy resolves to on the supported
/// devices. The outgoing stream is always bounded to 320x240 by the
/// converters, independent of the capture resolution.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Preview/capture width in pixels.
    pub width: u32,
    /// Preview/capture height in pixels.
    pub height: u32,
    /// Capture frame rate.
    pub fps: u32,
    /// How long to wait for the device to report closed during a rebind.
    /// On timeout the rebind proceeds anyway.
    pub close_timeout: Duration,
    /// Open attempts before the failure turns terminal.
    pub open_retries: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            close_timeout: Duration::from_millis(500),
            open_retries: 3,
        }
    }
}

/// UDP presence beacon settings. The local IP and device name come from
/// the embedder; interface enumeration is not this crate's concern.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Local address advertised to sinks.
    pub ip: String,
    /// Human-readable device name advertised to sinks.
    pub device_name: String,
    /// Destination broadcast port.
    pub port: u16,
    /// Broadcast interval.
    pub interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ip: String::new(),
            device_name: "mirrorcast".into(),
            port: 8081,
            interval: Duration::from_secs(2),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// HTTP server port for the sink.
    pub http_port: u16,
    /// Which lens to open on start.
    pub lens: CameraLens,
    /// Minimum interval between dispatched frames. Frames arriving inside
    /// the interval are dropped, not queued.
    pub frame_interval: Duration,
    /// JPEG quality for the fallback broadcast.
    pub jpeg_quality: u8,
    /// STUN endpoint for ICE. No TURN relays: the system is LAN-only and
    /// relayed paths have displaced working host candidates.
    pub stun_server: String,
    /// How long to wait in negotiation before degrading to the fallback.
    pub ice_timeout: Duration,
    pub camera: CameraConfig,
    /// Presence beacon; `None` disables it.
    pub discovery: Option<DiscoveryConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            lens: CameraLens::Front,
            frame_interval: Duration::from_millis(100),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            stun_server: "stun:stun.l.google.com:19302".into(),
            ice_timeout: Duration::from_secs(10),
            camera: CameraConfig::default(),
            discovery: None,
        }
    }
}
