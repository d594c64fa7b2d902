//! Signaling protocol for the sink channel.
//!
//! All control traffic to and from the sink travels as JSON text frames on
//! the `/stream` WebSocket, discriminated by a `type` field. The same
//! shapes are accepted on the HTTP signaling POST endpoints. Message order
//! on the channel is preserved; there is at most one active sink.

use serde::{Deserialize, Serialize};

/// Direction-agnostic SDP role tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Playback commands relayed to the sink's embedded player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCommand {
    Play,
    Pause,
    Seek,
    Stop,
}

/// One signaling message, as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// Session description, either direction.
    #[serde(rename = "SDP")]
    Sdp {
        #[serde(rename = "sdpType")]
        sdp_type: SdpKind,
        sdp: String,
    },

    /// Trickle ICE candidate, either direction.
    #[serde(rename = "ICE")]
    Ice {
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
        candidate: String,
    },

    /// Wall-clock milliseconds, sent immediately before each binary JPEG
    /// frame so the sink can estimate one-way latency.
    #[serde(rename = "TIMESTAMP")]
    Timestamp { timestamp: u64 },

    /// Tell the sink which video to load.
    #[serde(rename = "VIDEO_URL")]
    VideoUrl {
        #[serde(rename = "videoId")]
        video_id: String,
        #[serde(rename = "currentTime", skip_serializing_if = "Option::is_none")]
        current_time: Option<f64>,
    },

    /// Playback control for the sink's player. `value` carries the seek
    /// position in seconds when present.
    #[serde(rename = "VIDEO_CONTROL")]
    VideoControl {
        command: VideoCommand,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<f64>,
    },
}

impl SignalMessage {
    /// Serialize for a WebSocket text frame.
    pub fn to_json(&self) -> String {
        // The enum carries only JSON-representable data; serialization
        // cannot fail.
        serde_json::to_string(self).expect("signal message serializes")
    }

    /// Parse an incoming text frame. Returns `None` for anything that is
    /// not a well-formed signaling message (malformed input is ignored on
    /// the WebSocket path).
    pub fn from_json(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// A timestamp message carrying the current wall-clock time.
    pub fn timestamp_now() -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        SignalMessage::Timestamp { timestamp }
    }
}
