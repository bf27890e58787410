//! Keep-alive ticker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use vidstream_core::wire::TAG_KEEPALIVE;

use super::state::SharedState;

pub struct KeepaliveTicker {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    every: Duration,
    shared: SharedState,
    shutdown: broadcast::Receiver<()>,
}

impl KeepaliveTicker {
    pub fn new(
        socket: Arc<UdpSocket>,
        server: SocketAddr,
        every: Duration,
        shared: SharedState,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            socket,
            server,
            every,
            shared,
            shutdown,
        }
    }

    /// Send KEEPALIVE every interval until shutdown. The first one goes out
    /// one interval after registration.
    pub async fn run(mut self) {
        let start = tokio::time::Instant::now() + self.every;
        let mut interval = tokio::time::interval_at(start, self.every);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!(sent = self.shared.keepalives_sent(), "keep-alive ticker stopping");
                    return;
                }

                _ = interval.tick() => {
                    match self.socket.send_to(TAG_KEEPALIVE, self.server).await {
                        Ok(_) => {
                            self.shared.record_keepalive(Instant::now());
                            tracing::trace!(server = %self.server, "sent KEEPALIVE");
                        }
                        Err(e) => {
                            tracing::debug!(server = %self.server, error = %e, "KEEPALIVE send failed");
                        }
                    }
                }
            }
        }
    }
}
