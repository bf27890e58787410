//! Registration and disconnect datagrams.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use vidstream_core::wire::{TAG_DISCONNECT, TAG_REGISTERED, TAG_REGISTER_CLIENT};

use super::SessionError;

/// Send REGISTER_CLIENT and wait up to `wait` for the reply.
///
/// The first datagram to arrive decides: exactly `REGISTERED` succeeds and
/// yields the address it came from, anything else fails. Never retried.
pub async fn register(
    socket: &UdpSocket,
    server: SocketAddr,
    wait: Duration,
) -> Result<SocketAddr, SessionError> {
    tracing::debug!(%server, "sending REGISTER_CLIENT");
    socket
        .send_to(TAG_REGISTER_CLIENT, server)
        .await
        .map_err(SessionError::Io)?;

    let mut buf = [0u8; 1024];
    let (len, from) = match timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(result) => result.map_err(SessionError::Io)?,
        Err(_) => {
            return Err(SessionError::RegistrationFailed {
                reason: format!("no reply within {}ms", wait.as_millis()),
            })
        }
    };

    if &buf[..len] != TAG_REGISTERED {
        return Err(SessionError::RegistrationFailed {
            reason: format!(
                "unexpected reply from {from}: {:?}",
                String::from_utf8_lossy(&buf[..len.min(32)])
            ),
        });
    }

    tracing::trace!(%from, "received REGISTERED");
    Ok(from)
}

/// Tell the server we are leaving. Best effort: failures are only logged.
pub async fn disconnect(socket: &UdpSocket, server: SocketAddr) {
    match socket.send_to(TAG_DISCONNECT, server).await {
        Ok(_) => tracing::debug!(%server, "sent DISCONNECT"),
        Err(e) => tracing::debug!(%server, error = %e, "DISCONNECT send failed"),
    }
}
