//! Hands completed frames to the frame-ready callback.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use crate::stats::StatsTracker;

/// Consumer of reassembled frames: decoder, renderer, recorder.
///
/// Called synchronously on the receive task, once per completed frame, in
/// completion order. Slow work should be moved off that task by the
/// implementation; the session buffers nothing beyond the frame in hand.
pub trait FrameHandler: Send + Sync {
    fn on_frame_ready(&self, frame: Bytes) -> Result<()>;
}

impl<F> FrameHandler for F
where
    F: Fn(Bytes) -> Result<()> + Send + Sync,
{
    fn on_frame_ready(&self, frame: Bytes) -> Result<()> {
        self(frame)
    }
}

/// Invokes the handler and contains its failures.
pub struct FrameDispatcher {
    handler: Arc<dyn FrameHandler>,
    stats: Arc<StatsTracker>,
}

impl FrameDispatcher {
    pub fn new(handler: Arc<dyn FrameHandler>, stats: Arc<StatsTracker>) -> Self {
        Self { handler, stats }
    }

    /// Count the frame and pass it on.
    ///
    /// An error or a panic in the handler is logged, counted in
    /// `handler_failures` and swallowed: one bad frame must not end the
    /// session.
    pub fn deliver(&self, frame: Bytes) {
        let len = frame.len();
        self.stats.record_frame_completed(len);

        match catch_unwind(AssertUnwindSafe(|| self.handler.on_frame_ready(frame))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, len, "frame handler failed");
                self.stats.record_handler_failure();
            }
            Err(_) => {
                tracing::warn!(len, "frame handler panicked");
                self.stats.record_handler_failure();
            }
        }
    }
}
