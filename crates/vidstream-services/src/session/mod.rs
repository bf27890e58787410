//! Session controller: one client session against one streaming server.
//!
//! [`Session::start`] binds the socket, registers, and spawns three tasks:
//! the receive loop, the keep-alive ticker and, if enabled, the stats
//! reporter. A driver task waits for the receive loop to end, stops the
//! other two, sends a best-effort DISCONNECT and releases the socket.
//!
//! ```text
//! Unregistered → Registering → Active → Disconnecting → Closed
//! ```
//!
//! A session is never restarted. Registration failure is not retried here;
//! that is a decision for whoever supervises the session.

mod handshake;
mod keepalive;
mod receive;
mod state;

pub use state::{SessionShared, SessionState, SharedState};

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use vidstream_core::config::StreamConfig;

use crate::chunk_store::{ChunkStore, ChunkStoreConfig};
use crate::dispatch::{FrameDispatcher, FrameHandler};
use crate::stats::{report_loop, StatsSnapshot, StatsTracker};

use keepalive::KeepaliveTicker;
use receive::ReceiveLoop;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Everything a session needs, fixed at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_host: String,
    pub server_port: u16,
    /// 0 = OS-assigned.
    pub local_port: u16,
    pub registration_timeout: Duration,
    pub keepalive_interval: Duration,
    pub recv_poll: Duration,
    pub stats_interval: Option<Duration>,
    pub recv_buffer_bytes: usize,
    pub store: ChunkStoreConfig,
}

impl From<&StreamConfig> for SessionConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            server_host: config.server.host.clone(),
            server_port: config.server.port,
            local_port: config.client.local_port,
            registration_timeout: config.client.registration_timeout(),
            keepalive_interval: config.client.keepalive_interval(),
            recv_poll: config.client.recv_poll(),
            stats_interval: config.client.stats_interval(),
            recv_buffer_bytes: config.client.recv_buffer_bytes,
            store: ChunkStoreConfig::from(&config.reassembly),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("{host}:{port} resolved to no addresses")]
    NoAddress { host: String, port: u16 },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("registration failed: {reason}")]
    RegistrationFailed { reason: String },

    #[error("socket error: {0}")]
    Io(#[source] std::io::Error),

    #[error("session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// ── Outcome ───────────────────────────────────────────────────────────────────

/// Why the receive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local stop request.
    Stopped,
    /// The server sent DISCONNECT.
    ServerDisconnected,
    /// The socket became unusable.
    SocketFailed(String),
}

/// Final report of a closed session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub end: SessionEnd,
    /// Configured server address, where keep-alives and DISCONNECT go.
    pub server: SocketAddr,
    /// Address the REGISTERED reply came from.
    pub observed: SocketAddr,
    pub stats: StatsSnapshot,
    pub keepalives_sent: u64,
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    config: SessionConfig,
    shared: SharedState,
    stats: Arc<StatsTracker>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            shared: SessionShared::shared(),
            stats: StatsTracker::shared(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.subscribe()
    }

    pub fn stats(&self) -> Arc<StatsTracker> {
        self.stats.clone()
    }

    /// Register with the server and start receiving.
    ///
    /// Completed frames go to `handler`, on the receive task, in completion
    /// order. On error the socket is released and the session is `Closed`.
    pub async fn start(self, handler: Arc<dyn FrameHandler>) -> Result<RunningSession, SessionError> {
        match self.open().await {
            Ok((socket, server, observed)) => Ok(self.spawn(socket, server, observed, handler)),
            Err(e) => {
                tracing::warn!(error = %e, "session failed to start");
                self.shared.set_state(SessionState::Closed);
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<(UdpSocket, SocketAddr, SocketAddr), SessionError> {
        let server = resolve(&self.config.server_host, self.config.server_port).await?;

        let bind_addr: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, self.config.local_port).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, self.config.local_port).into()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| SessionError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = socket.local_addr().map_err(SessionError::Io)?;

        self.shared.set_state(SessionState::Registering);
        tracing::info!(%server, local = %local_addr, "registering with server");

        let observed =
            handshake::register(&socket, server, self.config.registration_timeout).await?;
        Ok((socket, server, observed))
    }

    fn spawn(
        self,
        socket: UdpSocket,
        server: SocketAddr,
        observed: SocketAddr,
        handler: Arc<dyn FrameHandler>,
    ) -> RunningSession {
        let Session {
            config,
            shared,
            stats,
        } = self;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr().ok();
        let (shutdown_tx, _) = broadcast::channel::<()>(4);

        stats.mark_started();
        shared.set_running(true);
        shared.set_state(SessionState::Active);
        tracing::info!(%server, %observed, "registered");

        let receive = ReceiveLoop::new(
            socket.clone(),
            [server, observed],
            ChunkStore::new(config.store.clone()),
            FrameDispatcher::new(handler, stats.clone()),
            stats.clone(),
            shared.clone(),
            config.recv_poll,
            config.recv_buffer_bytes,
            shutdown_tx.subscribe(),
        );
        let keepalive = KeepaliveTicker::new(
            socket.clone(),
            server,
            config.keepalive_interval,
            shared.clone(),
            shutdown_tx.subscribe(),
        );
        let reporter = config
            .stats_interval
            .map(|every| tokio::spawn(report_loop(stats.clone(), every, shutdown_tx.subscribe())));
        let keepalive = tokio::spawn(keepalive.run());

        let driver = tokio::spawn(drive(
            receive,
            keepalive,
            reporter,
            socket,
            server,
            observed,
            shared.clone(),
            stats.clone(),
            shutdown_tx.clone(),
        ));

        RunningSession {
            driver,
            stop: StopHandle {
                shared: shared.clone(),
                shutdown: shutdown_tx,
            },
            shared,
            stats,
            server,
            observed,
            local_addr,
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, SessionError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| SessionError::Resolve {
            host: host.to_string(),
            port,
            source,
        })?;
    addrs.next().ok_or_else(|| SessionError::NoAddress {
        host: host.to_string(),
        port,
    })
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    receive: ReceiveLoop,
    keepalive: JoinHandle<()>,
    reporter: Option<JoinHandle<()>>,
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    observed: SocketAddr,
    shared: SharedState,
    stats: Arc<StatsTracker>,
    shutdown: broadcast::Sender<()>,
) -> SessionSummary {
    let end = receive.run().await;

    shared.set_running(false);
    shared.set_state(SessionState::Disconnecting);
    // Receivers may already be gone.
    let _ = shutdown.send(());

    if let Err(e) = keepalive.await {
        tracing::warn!(error = %e, "keep-alive task failed");
    }
    if let Some(reporter) = reporter {
        if let Err(e) = reporter.await {
            tracing::warn!(error = %e, "stats reporter failed");
        }
    }

    handshake::disconnect(&socket, server).await;
    drop(socket);

    let snapshot = stats.snapshot();
    shared.set_state(SessionState::Closed);
    tracing::info!(
        end = ?end,
        frames = snapshot.frames_completed,
        bytes = snapshot.bytes_completed,
        runtime_secs = format_args!("{:.1}", snapshot.elapsed.as_secs_f64()),
        average_fps = format_args!("{:.1}", snapshot.average_fps()),
        dropped = snapshot.datagrams_dropped,
        evicted = snapshot.frames_evicted,
        with_gaps = snapshot.frames_with_gaps,
        handler_failures = snapshot.handler_failures,
        "final video stats"
    );

    SessionSummary {
        end,
        server,
        observed,
        stats: snapshot,
        keepalives_sent: shared.keepalives_sent(),
    }
}

// ── Running session ───────────────────────────────────────────────────────────

/// Asks a running session to stop. Cheap to clone.
#[derive(Clone)]
pub struct StopHandle {
    shared: SharedState,
    shutdown: broadcast::Sender<()>,
}

impl StopHandle {
    /// Request shutdown. Idempotent; returns immediately.
    pub fn stop(&self) {
        if self.shared.is_running() {
            tracing::info!("stop requested");
        }
        self.shared.set_running(false);
        let _ = self.shutdown.send(());
    }
}

/// A registered session whose tasks are running.
pub struct RunningSession {
    driver: JoinHandle<SessionSummary>,
    stop: StopHandle,
    shared: SharedState,
    stats: Arc<StatsTracker>,
    server: SocketAddr,
    observed: SocketAddr,
    local_addr: Option<SocketAddr>,
}

impl RunningSession {
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn stats(&self) -> Arc<StatsTracker> {
        self.stats.clone()
    }

    /// The configured server address.
    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Where the REGISTERED reply came from. Usually equal to
    /// [`server_addr`](Self::server_addr), but not behind NAT or a relay.
    pub fn observed_addr(&self) -> SocketAddr {
        self.observed
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn last_keepalive_sent(&self) -> Option<std::time::Instant> {
        self.shared.last_keepalive_sent()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop and wait for `Closed`.
    pub async fn stop(self) -> Result<SessionSummary, SessionError> {
        self.stop.stop();
        self.join().await
    }

    /// Wait for the session to close, however that happens.
    pub async fn join(self) -> Result<SessionSummary, SessionError> {
        Ok(self.driver.await?)
    }

    /// Resolve once the session has left `Active` on its own or otherwise.
    pub async fn closed(&self) {
        let mut rx = self.shared.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot fail.
        let _ = rx
            .wait_for(|state| matches!(state, SessionState::Disconnecting | SessionState::Closed))
            .await;
    }
}
