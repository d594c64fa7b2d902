//! Camera capture: the frame source and the frame router.
//!
//! The source owns the camera exclusively and serializes every lifecycle
//! operation through one executor task. The router fans dispatched frames
//! out to whatever consumers the pipeline has attached, throttled to the
//! dispatch interval.

pub mod camera;
pub mod router;

#[cfg(feature = "test-source")]
pub mod test_source;

pub use camera::{CameraBackend, CameraDevice, FrameSource, LibcameraBackend, SourceBinding};
pub use router::{FrameConsumer, FrameRouter, RouterStats};

#[cfg(feature = "test-source")]
pub use test_source::{SyntheticBackend, SyntheticConfig};
