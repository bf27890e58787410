//! vidstream integration test harness.
//!
//! Every test drives a real `Session` over loopback UDP against a scripted
//! fake server bound on 127.0.0.1. No privileges or external services are
//! needed:
//!
//!   cargo test --test integration
//!
//! Each test binds its own sockets on OS-assigned ports, so tests can run in
//! parallel.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use vidstream_core::wire::{TAG_KEEPALIVE, TAG_REGISTERED, TAG_REGISTER_CLIENT};
use vidstream_services::{FrameHandler, RunningSession, Session, SessionConfig};

mod reassembly;
mod session;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for anything that should happen "promptly".
pub const WAIT: Duration = Duration::from_secs(2);

/// How long a test waits to conclude that nothing more is coming.
pub const QUIET: Duration = Duration::from_millis(200);

/// The server side of the protocol, driven step by step from a test.
pub struct FakeServer {
    socket: UdpSocket,
    client: Option<SocketAddr>,
}

impl FakeServer {
    pub async fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .context("failed to bind fake server")?;
        Ok(Self {
            socket,
            client: None,
        })
    }

    pub fn port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Next datagram from anyone, or an error after `within`.
    pub async fn recv(&self, within: Duration) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; 2048];
        let (len, from) = tokio::time::timeout(within, self.socket.recv_from(&mut buf))
            .await
            .context("fake server timed out waiting for a datagram")??;
        buf.truncate(len);
        Ok((buf, from))
    }

    /// Wait for REGISTER_CLIENT, reply with `reply`, remember the client.
    pub async fn answer_registration(&mut self, reply: &[u8]) -> Result<SocketAddr> {
        let (datagram, from) = self.recv(WAIT).await?;
        if datagram != TAG_REGISTER_CLIENT {
            bail!("expected REGISTER_CLIENT, got {:?}", String::from_utf8_lossy(&datagram));
        }
        self.socket.send_to(reply, from).await?;
        self.client = Some(from);
        Ok(from)
    }

    /// Wait for a datagram equal to `tag`, skipping keep-alives unless that
    /// is what we are waiting for.
    pub async fn expect(&self, tag: &[u8]) -> Result<()> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            let (datagram, _) = self.recv(left).await?;
            if datagram == tag {
                return Ok(());
            }
            if datagram != TAG_KEEPALIVE {
                bail!(
                    "expected {:?}, got {:?}",
                    String::from_utf8_lossy(tag),
                    String::from_utf8_lossy(&datagram)
                );
            }
        }
    }

    /// Send one datagram to the registered client.
    pub async fn send(&self, datagram: &[u8]) -> Result<()> {
        let client = self.client.context("no client registered yet")?;
        self.socket.send_to(datagram, client).await?;
        Ok(())
    }

    /// Send one datagram to `to`, registered or not.
    pub async fn send_to(&self, datagram: &[u8], to: SocketAddr) -> Result<()> {
        self.socket.send_to(datagram, to).await?;
        Ok(())
    }

    pub async fn send_all<I, D>(&self, datagrams: I) -> Result<()>
    where
        I: IntoIterator<Item = D>,
        D: AsRef<[u8]>,
    {
        for datagram in datagrams {
            self.send(datagram.as_ref()).await?;
        }
        Ok(())
    }
}

/// Session config pointed at `server`, with short timers for tests.
pub fn test_config(server: &FakeServer) -> SessionConfig {
    let mut config = SessionConfig {
        server_host: "127.0.0.1".to_string(),
        server_port: server.port(),
        registration_timeout: Duration::from_millis(300),
        recv_poll: Duration::from_millis(50),
        stats_interval: None,
        ..SessionConfig::default()
    };
    config.store.chunk_payload_size = 1000;
    config
}

/// A frame handler that forwards every frame to a channel.
pub fn channel_handler() -> (std::sync::Arc<dyn FrameHandler>, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |frame: Bytes| -> Result<()> {
        tx.send(frame)
            .map_err(|_| anyhow::anyhow!("test receiver dropped"))
    };
    (std::sync::Arc::new(handler), rx)
}

/// Start a session against `server`, which answers the registration.
pub async fn start_session(
    server: &mut FakeServer,
    config: SessionConfig,
    handler: std::sync::Arc<dyn FrameHandler>,
) -> Result<RunningSession> {
    let (running, registered) = tokio::join!(
        Session::new(config).start(handler),
        server.answer_registration(TAG_REGISTERED),
    );
    registered?;
    Ok(running?)
}

/// Next delivered frame, or an error after [`WAIT`].
pub async fn next_frame(frames: &mut mpsc::UnboundedReceiver<Bytes>) -> Result<Bytes> {
    tokio::time::timeout(WAIT, frames.recv())
        .await
        .context("no frame delivered in time")?
        .context("frame channel closed")
}

/// True if no frame arrives within [`QUIET`].
pub async fn no_frame(frames: &mut mpsc::UnboundedReceiver<Bytes>) -> bool {
    tokio::time::timeout(QUIET, frames.recv()).await.is_err()
}

/// Deterministic test payload.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
