//! Receive loop: the single writer of the chunk store.
//!
//! Every datagram is classified by the header parser. FRAME_START and CHUNK
//! feed the chunk store, a single-datagram FRAME skips it and goes straight
//! to the dispatcher. Transient problems (timeouts, malformed or orphaned
//! datagrams) are counted and dropped; only a socket error, a server
//! DISCONNECT or a stop request ends the loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::timeout;

use vidstream_core::wire::{Chunk, Datagram, FrameStart, HeaderParser};

use crate::chunk_store::{AddOutcome, BeginOutcome, ChunkStore};
use crate::dispatch::FrameDispatcher;
use crate::stats::StatsTracker;

use super::state::SharedState;
use super::SessionEnd;

pub struct ReceiveLoop {
    socket: Arc<UdpSocket>,
    /// Addresses a DISCONNECT is honoured from: configured and observed.
    server_addrs: [SocketAddr; 2],
    parser: HeaderParser,
    store: ChunkStore,
    dispatcher: FrameDispatcher,
    stats: Arc<StatsTracker>,
    shared: SharedState,
    poll: Duration,
    recv_buffer_bytes: usize,
    shutdown: broadcast::Receiver<()>,
}

impl ReceiveLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: Arc<UdpSocket>,
        server_addrs: [SocketAddr; 2],
        store: ChunkStore,
        dispatcher: FrameDispatcher,
        stats: Arc<StatsTracker>,
        shared: SharedState,
        poll: Duration,
        recv_buffer_bytes: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            socket,
            server_addrs,
            parser: HeaderParser::new(),
            store,
            dispatcher,
            stats,
            shared,
            poll,
            recv_buffer_bytes,
            shutdown,
        }
    }

    pub async fn run(mut self) -> SessionEnd {
        let mut buf = vec![0u8; self.recv_buffer_bytes];

        loop {
            if !self.shared.is_running() {
                return SessionEnd::Stopped;
            }

            let received = tokio::select! {
                _ = self.shutdown.recv() => return SessionEnd::Stopped,
                r = timeout(self.poll, self.socket.recv_from(&mut buf)) => r,
            };

            let (len, from) = match received {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "socket receive failed, ending session");
                    return SessionEnd::SocketFailed(e.to_string());
                }
                Err(_) => {
                    tracing::trace!("receive poll timed out");
                    self.store.evict_stale();
                    self.stats.set_frames_evicted(self.store.evicted_total());
                    continue;
                }
            };

            if let Some(end) = self.handle_datagram(&buf[..len], from) {
                return end;
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> Option<SessionEnd> {
        self.stats.record_datagram();

        match self.parser.parse(data) {
            Datagram::FrameStart(start) => self.begin_frame(start),
            Datagram::Chunk(chunk) => self.place_chunk(chunk),
            Datagram::Frame(payload) => {
                tracing::trace!(len = payload.len(), "single-datagram frame");
                self.dispatcher.deliver(Bytes::copy_from_slice(payload));
            }
            Datagram::Disconnect => {
                if self.server_addrs.contains(&from) {
                    tracing::info!(%from, "server sent DISCONNECT");
                    return Some(SessionEnd::ServerDisconnected);
                }
                tracing::debug!(%from, "ignoring DISCONNECT from unknown peer");
                self.stats.record_dropped();
            }
            Datagram::Registered => {
                tracing::trace!(%from, "ignoring REGISTERED while active");
            }
            Datagram::Malformed(e) => {
                tracing::debug!(%from, len = data.len(), error = %e, "dropping malformed datagram");
                self.stats.record_dropped();
            }
            Datagram::Unknown => {
                tracing::trace!(%from, len = data.len(), "dropping datagram with unknown tag");
                self.stats.record_dropped();
            }
        }

        self.stats.set_frames_evicted(self.store.evicted_total());
        None
    }

    fn begin_frame(&mut self, start: FrameStart) {
        let outcome = self
            .store
            .begin_frame(start.frame_id, start.total_size, start.chunk_count);
        tracing::trace!(
            frame_id = start.frame_id,
            total_size = start.total_size,
            chunk_count = start.chunk_count,
            width = ?start.width,
            ?outcome,
            "FRAME_START"
        );
        if outcome == BeginOutcome::Rejected {
            self.stats.record_dropped();
        }
    }

    fn place_chunk(&mut self, chunk: Chunk<'_>) {
        match self
            .store
            .add_chunk(chunk.frame_id, chunk.chunk_index, chunk.payload)
        {
            AddOutcome::Complete(frame) => {
                if frame.has_gaps {
                    tracing::warn!(
                        frame_id = frame.frame_id,
                        "frame completed by count with missing chunk indices"
                    );
                    self.stats.record_gaps();
                }
                tracing::debug!(frame_id = frame.frame_id, len = frame.data.len(), "frame complete");
                self.dispatcher.deliver(frame.data);
            }
            AddOutcome::Incomplete { .. } => {}
            AddOutcome::Duplicate => {
                tracing::trace!(
                    frame_id = chunk.frame_id,
                    chunk_index = chunk.chunk_index,
                    "duplicate chunk"
                );
            }
            AddOutcome::UnknownFrame => {
                tracing::trace!(frame_id = chunk.frame_id, "chunk for unknown frame");
                self.stats.record_dropped();
            }
            AddOutcome::Rejected => {
                tracing::debug!(
                    frame_id = chunk.frame_id,
                    chunk_index = chunk.chunk_index,
                    "chunk offset past end of frame"
                );
                self.stats.record_dropped();
            }
        }
    }
}
