//! Session statistics: frame counters and throughput.
//!
//! The receive loop is the only writer. Counters are atomics so the periodic
//! reporter and the session owner can read a snapshot from other tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

#[derive(Debug)]
pub struct StatsTracker {
    started_at: Mutex<Instant>,
    frames_completed: AtomicU64,
    bytes_completed: AtomicU64,
    datagrams_received: AtomicU64,
    datagrams_dropped: AtomicU64,
    frames_evicted: AtomicU64,
    frames_with_gaps: AtomicU64,
    handler_failures: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub frames_completed: u64,
    pub bytes_completed: u64,
    pub datagrams_received: u64,
    pub datagrams_dropped: u64,
    pub frames_evicted: u64,
    pub frames_with_gaps: u64,
    pub handler_failures: u64,
    /// Time since the session became active.
    pub elapsed: Duration,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            started_at: Mutex::new(Instant::now()),
            frames_completed: AtomicU64::new(0),
            bytes_completed: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            frames_evicted: AtomicU64::new(0),
            frames_with_gaps: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Restart the clock `elapsed` is measured from. The session calls this
    /// when it becomes active.
    pub fn mark_started(&self) {
        *self.started_at.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    pub fn record_frame_completed(&self, len: usize) {
        self.frames_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_completed.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_datagram(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Malformed, unknown, out-of-range, or orphaned datagrams.
    pub fn record_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gaps(&self) {
        self.frames_with_gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// The chunk store keeps its own running total; mirror it.
    pub fn set_frames_evicted(&self, total: u64) {
        self.frames_evicted.store(total, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            bytes_completed: self.bytes_completed.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            frames_evicted: self.frames_evicted.load(Ordering::Relaxed),
            frames_with_gaps: self.frames_with_gaps.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            elapsed: self
                .started_at
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .elapsed(),
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSnapshot {
    /// Frames per second since the session started.
    pub fn average_fps(&self) -> f64 {
        per_second(self.frames_completed, self.elapsed)
    }

    /// Frames per second between `earlier` and this snapshot.
    pub fn rate_since(&self, earlier: &StatsSnapshot) -> f64 {
        per_second(
            self.frames_completed.saturating_sub(earlier.frames_completed),
            self.elapsed.saturating_sub(earlier.elapsed),
        )
    }
}

fn per_second(count: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Log a stats line every `every` until shutdown. Never writes the tracker.
pub async fn report_loop(
    stats: Arc<StatsTracker>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    let mut previous = stats.snapshot();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,

            _ = interval.tick() => {
                let current = stats.snapshot();
                tracing::info!(
                    frames = current.frames_completed,
                    runtime_secs = format_args!("{:.1}", current.elapsed.as_secs_f64()),
                    average_fps = format_args!("{:.1}", current.average_fps()),
                    rolling_fps = format_args!("{:.1}", current.rate_since(&previous)),
                    dropped = current.datagrams_dropped,
                    evicted = current.frames_evicted,
                    "video stats"
                );
                previous = current;
            }
        }
    }
}
