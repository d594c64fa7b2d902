//! WebRTC peer session: one connection to the sink, video out only.
//!
//! The session owns the peer connection and its outgoing track source,
//! drives the offer/answer exchange, and relays ICE both ways. Everything
//! it learns asynchronously (local candidates, connection state) is
//! reported through a narrow event channel; the pipeline decides what to
//! do with it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::error::PeerError;
use crate::frame::I420Frame;
use crate::signal::SdpKind;

use super::sdp::filter_codecs;
use super::track::VideoTrackSource;

/// Lifecycle phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Offering,
    AwaitingAnswer,
    Connected,
    Failed,
    Closed,
}

/// Events the session reports to its observer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local description ready for the signaling channel. Already
    /// codec-filtered; the locally-set description is not.
    LocalDescription { sdp_type: SdpKind, sdp: String },
    /// A local ICE candidate for the signaling channel.
    LocalCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
    /// The connection reached the connected state.
    Connected,
    /// The connection failed. The observer degrades to the fallback.
    Failed,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Single STUN endpoint. No TURN: the system is LAN-only and relayed
    /// paths have been observed to replace working host candidates.
    pub stun_server: String,
    /// Nominal duration of one video sample (the dispatch interval).
    pub sample_duration: Duration,
}

/// One peer connection to the sink.
pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    state: Arc<Mutex<PeerState>>,
    source: VideoTrackSource,
    writer: JoinHandle<()>,
}

impl PeerSession {
    /// Build the connection, add the video track, and wire callbacks to
    /// the event channel. Candidate gathering runs once per session; there
    /// is no continual gathering.
    pub async fn new(
        config: PeerConfig,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Setup(e.to_string()))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::Setup(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![config.stun_server.clone()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| PeerError::Setup(e.to_string()))?,
        );

        let source = VideoTrackSource::new(config.sample_duration);
        pc.add_track(source.track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerError::Setup(e.to_string()))?;
        let writer = source.spawn_writer();

        let state = Arc::new(Mutex::new(PeerState::Idle));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events
                            .send(PeerEvent::LocalCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            })
                            .await;
                    }
                    Err(e) => debug!(error = %e, "candidate serialization failed"),
                }
            })
        }));

        let state_events = events;
        let state_ref = Arc::clone(&state);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let events = state_events.clone();
            let state = Arc::clone(&state_ref);
            Box::pin(async move {
                match s {
                    RTCPeerConnectionState::Connected => {
                        info!("peer connection established");
                        *state.lock().unwrap() = PeerState::Connected;
                        let _ = events.send(PeerEvent::Connected).await;
                    }
                    RTCPeerConnectionState::Failed => {
                        warn!("peer connection failed");
                        *state.lock().unwrap() = PeerState::Failed;
                        let _ = events.send(PeerEvent::Failed).await;
                    }
                    other => debug!(state = ?other, "peer connection state"),
                }
            })
        }));

        Ok(Self {
            pc,
            state,
            source,
            writer,
        })
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap()
    }

    /// Create and set the local offer, then emit the codec-filtered copy on
    /// the event channel.
    pub async fn create_offer(&self, events: &mpsc::Sender<PeerEvent>) -> Result<(), PeerError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                PeerState::Idle => *state = PeerState::Offering,
                PeerState::Closed => return Err(PeerError::Closed),
                other => {
                    return Err(PeerError::Negotiation(format!(
                        "create_offer in state {other:?}"
                    )))
                }
            }
        }

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        let transmitted = filter_codecs(&offer.sdp);

        // The local description keeps every codec the stack advertises;
        // only the copy on the wire is filtered.
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        *self.state.lock().unwrap() = PeerState::AwaitingAnswer;

        let _ = events
            .send(PeerEvent::LocalDescription {
                sdp_type: SdpKind::Offer,
                sdp: transmitted,
            })
            .await;
        Ok(())
    }

    /// Apply the sink's answer.
    pub async fn accept_answer(&self, sdp: String) -> Result<(), PeerError> {
        if self.state() == PeerState::Closed {
            return Err(PeerError::Closed);
        }
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }

    /// Add a remote ICE candidate.
    pub async fn add_remote_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), PeerError> {
        if self.state() == PeerState::Closed {
            return Err(PeerError::Closed);
        }
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }

    /// Feed a frame into the outgoing track. Safe in every state; the
    /// track drops frames until the transport is up.
    pub fn push_i420(&self, frame: I420Frame) {
        self.source.push(frame);
    }

    /// Release everything. Idempotent.
    pub async fn close(&self) {
        *self.state.lock().unwrap() = PeerState::Closed;
        self.writer.abort();
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "peer connection close");
        }
    }
}
