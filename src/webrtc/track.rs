//! Outgoing video track: the source the peer connection reads from.
//!
//! The track consumes packed I420 frames through a latest-value channel
//! (an overrun replaces the pending frame, it is never queued), encodes
//! them to H.264, and hands samples to the RTP layer. The encoder runs in
//! its own task and is independent of the session state machine, so the
//! track survives lens switches without renegotiation.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use openh264::encoder::Encoder;
use openh264::formats::YUVBuffer;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::FrameError;
use crate::frame::I420Frame;

/// Force a keyframe every this many encoded frames.
const KEYFRAME_INTERVAL: u64 = 30;

/// H.264 encoder wrapper with periodic keyframe forcing.
pub struct H264Encoder {
    inner: Encoder,
    frame_count: u64,
}

impl H264Encoder {
    pub fn new() -> Result<Self, FrameError> {
        let inner = Encoder::new().map_err(|e| FrameError::Convert(e.to_string()))?;
        Ok(Self {
            inner,
            frame_count: 0,
        })
    }

    /// Encode one I420 frame to an Annex B access unit.
    pub fn encode(&mut self, frame: &I420Frame) -> Result<Bytes, FrameError> {
        if self.frame_count % KEYFRAME_INTERVAL == 0 {
            self.inner.force_intra_frame();
        }
        self.frame_count += 1;

        let buffer = YUVBuffer::from_vec(
            frame.to_contiguous(),
            frame.width as usize,
            frame.height as usize,
        );
        let bitstream = self
            .inner
            .encode(&buffer)
            .map_err(|e| FrameError::Convert(e.to_string()))?;
        Ok(Bytes::from(bitstream.to_vec()))
    }
}

/// The video source feeding one peer connection's outgoing track.
pub struct VideoTrackSource {
    track: Arc<TrackLocalStaticSample>,
    latest: watch::Sender<Option<I420Frame>>,
    sample_duration: Duration,
}

impl VideoTrackSource {
    pub fn new(sample_duration: Duration) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "video".to_owned(),
            "mirrorcast-video".to_owned(),
        ));
        let (latest, _) = watch::channel(None);
        Self {
            track,
            latest,
            sample_duration,
        }
    }

    /// The track to add to the peer connection.
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    /// Hand the source a new frame. Replaces any frame the encoder has not
    /// picked up yet.
    pub fn push(&self, frame: I420Frame) {
        let _ = self.latest.send(Some(frame));
    }

    /// Start the encode-and-write task. It ends when the source is dropped.
    ///
    /// Encoding failures drop the frame and keep the task alive.
    pub fn spawn_writer(&self) -> JoinHandle<()> {
        let mut rx = self.latest.subscribe();
        let track = Arc::clone(&self.track);
        let duration = self.sample_duration;

        tokio::spawn(async move {
            let mut encoder = match H264Encoder::new() {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "H.264 encoder unavailable, track stays silent");
                    return;
                }
            };

            let mut written = 0u64;
            while rx.changed().await.is_ok() {
                let frame = match rx.borrow_and_update().clone() {
                    Some(f) => f,
                    None => continue,
                };
                let data = match encoder.encode(&frame) {
                    Ok(d) => d,
                    Err(e) => {
                        debug!(error = %e, "frame encode failed, dropped");
                        continue;
                    }
                };
                let sample = Sample {
                    data,
                    duration,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    debug!(error = %e, "write_sample failed, dropped");
                    continue;
                }
                written += 1;
                if written % 100 == 0 {
                    debug!(written, "track samples written");
                }
            }
            debug!("track writer ended after {} samples", written);
        })
    }
}
