//! Chunk store: bounded table of frames being reassembled from CHUNK datagrams.
//!
//! A FRAME_START allocates a zeroed buffer of the announced size; each CHUNK
//! is copied in at `chunk_index * chunk_payload_size`, clipped to the buffer.
//! A frame completes once it has seen as many distinct chunk indices as were
//! announced. Completion counts indices, it does not check that they are
//! exactly `0..expected`; a frame that completes with holes is still handed
//! over but flagged with `has_gaps`.
//!
//! # Memory bounds
//!
//! ```text
//! max_pending_frames * max_frame_bytes
//! ```
//!
//! Incomplete frames older than the staleness window are evicted lazily on
//! every `begin_frame` / `add_chunk`, and starting a frame at capacity evicts
//! the oldest pending one.
//!
//! Not thread-safe. The receive loop is the only writer.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use vidstream_core::config::ReassemblyConfig;

#[derive(Debug, Clone)]
pub struct ChunkStoreConfig {
    /// Byte stride between consecutive chunk indices.
    pub chunk_payload_size: u64,
    pub max_frame_bytes: u64,
    pub staleness: Duration,
    pub max_pending_frames: usize,
}

impl From<&ReassemblyConfig> for ChunkStoreConfig {
    fn from(config: &ReassemblyConfig) -> Self {
        Self {
            chunk_payload_size: config.chunk_payload_size,
            max_frame_bytes: config.max_frame_bytes,
            staleness: config.staleness(),
            max_pending_frames: config.max_pending_frames,
        }
    }
}

impl Default for ChunkStoreConfig {
    fn default() -> Self {
        Self::from(&ReassemblyConfig::default())
    }
}

/// One in-flight multi-chunk frame.
#[derive(Debug)]
struct PendingFrame {
    total_size: u64,
    expected_chunk_count: u64,
    buffer: Vec<u8>,
    received_indices: HashSet<u64>,
    created_at: Instant,
}

impl PendingFrame {
    fn new(buffer_len: usize, expected_chunk_count: u64, now: Instant) -> Self {
        Self {
            total_size: buffer_len as u64,
            expected_chunk_count,
            buffer: vec![0u8; buffer_len],
            received_indices: HashSet::new(),
            created_at: now,
        }
    }

    fn received(&self) -> u64 {
        self.received_indices.len() as u64
    }

    fn is_complete(&self) -> bool {
        self.received() >= self.expected_chunk_count
    }

    /// True when some index in `0..expected_chunk_count` never arrived.
    /// Only meaningful once complete: then any out-of-range index implies a hole.
    fn has_gaps(&self) -> bool {
        self.received_indices
            .iter()
            .any(|&index| index >= self.expected_chunk_count)
    }

    fn is_stale(&self, now: Instant, staleness: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= staleness
    }

    /// Copy `payload` to `offset`, discarding whatever lies past `total_size`.
    fn write_clipped(&mut self, offset: u64, payload: &[u8]) {
        // offset < total_size, which came from a usize.
        let start = offset as usize;
        let end = start.saturating_add(payload.len()).min(self.buffer.len());
        self.buffer[start..end].copy_from_slice(&payload[..end - start]);
    }
}

/// Result of [`ChunkStore::begin_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    Started,
    /// An entry for this id already existed; its partial state was discarded.
    Replaced,
    /// Size or count out of bounds. No entry was created.
    Rejected,
}

/// A fully reassembled frame, owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFrame {
    pub frame_id: u64,
    pub data: Bytes,
    /// Completed on index count while some index in `0..expected` is missing.
    pub has_gaps: bool,
}

/// Result of [`ChunkStore::add_chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// No FRAME_START for this id (early, late, or evicted). Nothing allocated.
    UnknownFrame,
    /// Index already written; nothing changed.
    Duplicate,
    /// The chunk's offset lies entirely past `total_size`.
    Rejected,
    Incomplete { received: u64, expected: u64 },
    Complete(CompletedFrame),
}

/// Table of in-flight frames keyed by server-assigned frame id.
pub struct ChunkStore {
    config: ChunkStoreConfig,
    pending: HashMap<u64, PendingFrame>,
    evicted_total: u64,
}

impl ChunkStore {
    pub fn new(config: ChunkStoreConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            evicted_total: 0,
        }
    }

    /// Start reassembling `frame_id`, replacing any entry with the same id.
    pub fn begin_frame(
        &mut self,
        frame_id: u64,
        total_size: u64,
        expected_chunk_count: u64,
    ) -> BeginOutcome {
        let now = Instant::now();
        self.evict_stale_at(now);

        if total_size == 0 || expected_chunk_count == 0 {
            tracing::debug!(
                frame_id,
                total_size,
                expected_chunk_count,
                "empty frame announced, ignoring"
            );
            return BeginOutcome::Rejected;
        }
        let buffer_len = match usize::try_from(total_size) {
            Ok(len) if total_size <= self.config.max_frame_bytes => len,
            _ => {
                tracing::warn!(
                    frame_id,
                    total_size,
                    max = self.config.max_frame_bytes,
                    "frame exceeds maximum size, ignoring"
                );
                return BeginOutcome::Rejected;
            }
        };

        let replaced = self.pending.remove(&frame_id).is_some();
        if !replaced && self.pending.len() >= self.config.max_pending_frames {
            self.evict_oldest();
        }

        self.pending.insert(
            frame_id,
            PendingFrame::new(buffer_len, expected_chunk_count, now),
        );

        if replaced {
            tracing::debug!(frame_id, "frame restarted, discarding partial state");
            BeginOutcome::Replaced
        } else {
            BeginOutcome::Started
        }
    }

    /// Place one chunk. Returns the frame, and forgets it, once complete.
    pub fn add_chunk(&mut self, frame_id: u64, chunk_index: u64, payload: &[u8]) -> AddOutcome {
        self.evict_stale_at(Instant::now());

        let Entry::Occupied(mut entry) = self.pending.entry(frame_id) else {
            return AddOutcome::UnknownFrame;
        };
        let frame = entry.get_mut();
        if frame.received_indices.contains(&chunk_index) {
            return AddOutcome::Duplicate;
        }
        let offset = match chunk_index.checked_mul(self.config.chunk_payload_size) {
            Some(offset) if offset < frame.total_size => offset,
            _ => return AddOutcome::Rejected,
        };

        frame.write_clipped(offset, payload);
        frame.received_indices.insert(chunk_index);

        if !frame.is_complete() {
            return AddOutcome::Incomplete {
                received: frame.received(),
                expected: frame.expected_chunk_count,
            };
        }

        let frame = entry.remove();
        AddOutcome::Complete(CompletedFrame {
            frame_id,
            has_gaps: frame.has_gaps(),
            data: Bytes::from(frame.buffer),
        })
    }

    /// Drop incomplete frames older than the staleness window.
    pub fn evict_stale(&mut self) -> usize {
        self.evict_stale_at(Instant::now())
    }

    fn evict_stale_at(&mut self, now: Instant) -> usize {
        let staleness = self.config.staleness;
        let before = self.pending.len();
        self.pending.retain(|frame_id, frame| {
            let stale = frame.is_stale(now, staleness);
            if stale {
                tracing::warn!(
                    frame_id,
                    received = frame.received(),
                    expected = frame.expected_chunk_count,
                    "evicting stale frame"
                );
            }
            !stale
        });
        let evicted = before - self.pending.len();
        self.evicted_total += evicted as u64;
        evicted
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, frame)| frame.created_at)
            .map(|(frame_id, _)| *frame_id);
        if let Some(frame_id) = oldest {
            self.pending.remove(&frame_id);
            self.evicted_total += 1;
            tracing::warn!(
                frame_id,
                max = self.config.max_pending_frames,
                "pending frame table full, evicting oldest"
            );
        }
    }

    pub fn is_pending(&self, frame_id: u64) -> bool {
        self.pending.contains_key(&frame_id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Frames dropped by staleness or capacity since creation.
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }
}
