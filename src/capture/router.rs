//! Frame router: dispatches captured frames to the active consumers.
//!
//! The router enforces a minimum inter-frame interval independent of the
//! camera rate. Frames arriving inside the interval are dropped, never
//! queued; the latest frame always wins. Dispatch to all consumers is
//! synchronous relative to a single frame, and the frame must not be
//! retained past the dispatch call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use std::sync::Arc;

use tracing::debug;

use crate::frame::RawFrame;

/// A frame consumer. Implementations copy what they need inside `accept`;
/// the frame is released when dispatch returns. Errors are the consumer's
/// own business: a bad frame is dropped there, never propagated.
pub trait FrameConsumer: Send + Sync {
    fn accept(&self, frame: &RawFrame);
}

/// Counters kept lock-free; read as a snapshot.
#[derive(Debug, Default)]
struct AtomicRouterStats {
    offered: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Frames offered by the capture layer.
    pub offered: u64,
    /// Frames delivered to at least one consumer.
    pub dispatched: u64,
    /// Frames dropped by the interval gate or for lack of consumers.
    pub dropped: u64,
}

/// Interval-gated dispatcher from the capture task to the consumers.
pub struct FrameRouter {
    interval: Duration,
    consumers: RwLock<Vec<(&'static str, Arc<dyn FrameConsumer>)>>,
    last_dispatch: Mutex<Option<Instant>>,
    stats: AtomicRouterStats,
}

impl FrameRouter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            consumers: RwLock::new(Vec::new()),
            last_dispatch: Mutex::new(None),
            stats: AtomicRouterStats::default(),
        }
    }

    /// Attach a consumer under a label. A second attach with the same
    /// label replaces the first.
    pub fn attach(&self, label: &'static str, consumer: Arc<dyn FrameConsumer>) {
        let mut consumers = self.consumers.write().unwrap();
        consumers.retain(|(l, _)| *l != label);
        consumers.push((label, consumer));
        debug!(label, "consumer attached");
    }

    /// Detach the consumer under `label`, if any.
    pub fn detach(&self, label: &'static str) {
        self.consumers.write().unwrap().retain(|(l, _)| *l != label);
        debug!(label, "consumer detached");
    }

    /// Detach everything.
    pub fn clear(&self) {
        self.consumers.write().unwrap().clear();
    }

    /// Offer a frame. Returns true when it was dispatched.
    ///
    /// Called from the single capture delivery task, so frames arrive in
    /// capture order and dispatches never overlap.
    pub fn dispatch(&self, frame: &RawFrame) -> bool {
        self.stats.offered.fetch_add(1, Ordering::Relaxed);

        {
            let mut last = self.last_dispatch.lock().unwrap();
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < self.interval {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
            *last = Some(now);
        }

        let consumers = self.consumers.read().unwrap();
        if consumers.is_empty() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        for (_, consumer) in consumers.iter() {
            consumer.accept(frame);
        }
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            offered: self.stats.offered.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}
