//! WebRTC peer session, outgoing video track, and SDP codec filtering.

pub mod peer;
pub mod sdp;
pub mod track;

pub use peer::{PeerConfig, PeerEvent, PeerSession, PeerState};
pub use sdp::filter_codecs;
pub use track::VideoTrackSource;
