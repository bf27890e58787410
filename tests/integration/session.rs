use std::time::Duration;

use tokio::net::UdpSocket;
use vidstream_core::wire::{TAG_DISCONNECT, TAG_KEEPALIVE, TAG_REGISTERED, TAG_REGISTER_CLIENT};
use vidstream_services::{Session, SessionEnd, SessionError, SessionState};

use crate::*;

/// Registration succeeds, the session runs, and stop sends DISCONNECT.
#[tokio::test]
async fn test_register_and_stop() {
    let mut server = FakeServer::bind().await.unwrap();
    let (handler, _frames) = channel_handler();

    let config = test_config(&server);
    let running = start_session(&mut server, config, handler)
        .await
        .unwrap();
    assert_eq!(running.state(), SessionState::Active);
    assert!(running.is_running());
    assert_eq!(running.server_addr().port(), server.port());

    let summary = tokio::time::timeout(WAIT, running.stop())
        .await
        .expect("stop should finish within one poll interval")
        .unwrap();
    assert_eq!(summary.end, SessionEnd::Stopped);
    assert_eq!(summary.stats.frames_completed, 0);

    server.expect(TAG_DISCONNECT).await.unwrap();
}

/// A silent server fails registration; the receive loop never starts.
#[tokio::test]
async fn test_registration_timeout() {
    let server = FakeServer::bind().await.unwrap();
    let (handler, _frames) = channel_handler();

    let session = Session::new(test_config(&server));
    let state = session.subscribe_state();
    let err = session.start(handler).await.err().unwrap();

    assert!(
        matches!(err, SessionError::RegistrationFailed { .. }),
        "unexpected error: {err}"
    );
    assert_eq!(*state.borrow(), SessionState::Closed);

    // Exactly one REGISTER_CLIENT, never retried, nothing else.
    let (first, _) = server.recv(WAIT).await.unwrap();
    assert_eq!(first, TAG_REGISTER_CLIENT);
    assert!(server.recv(QUIET).await.is_err());
}

/// Anything but an exact REGISTERED fails registration.
#[tokio::test]
async fn test_registration_wrong_reply() {
    let mut server = FakeServer::bind().await.unwrap();
    let (handler, _frames) = channel_handler();

    let session = Session::new(test_config(&server));
    let (result, answered) = tokio::join!(
        session.start(handler),
        server.answer_registration(b"BUSY"),
    );
    answered.unwrap();
    assert!(matches!(
        result.err().unwrap(),
        SessionError::RegistrationFailed { .. }
    ));
}

/// Keep-alives arrive at the configured interval while active.
#[tokio::test]
async fn test_keepalives_sent() {
    let mut server = FakeServer::bind().await.unwrap();
    let (handler, _frames) = channel_handler();
    let mut config = test_config(&server);
    config.keepalive_interval = Duration::from_millis(50);

    let running = start_session(&mut server, config, handler).await.unwrap();

    server.expect(TAG_KEEPALIVE).await.unwrap();
    server.expect(TAG_KEEPALIVE).await.unwrap();
    assert!(running.last_keepalive_sent().is_some());

    let summary = running.stop().await.unwrap();
    assert!(summary.keepalives_sent >= 2);
}

/// A DISCONNECT from the server closes the session on its own.
#[tokio::test]
async fn test_server_disconnect_ends_session() {
    let mut server = FakeServer::bind().await.unwrap();
    let (handler, _frames) = channel_handler();

    let config = test_config(&server);
    let running = start_session(&mut server, config, handler)
        .await
        .unwrap();
    server.send(TAG_DISCONNECT).await.unwrap();

    tokio::time::timeout(WAIT, running.closed())
        .await
        .expect("session should close after server DISCONNECT");
    let summary = running.join().await.unwrap();
    assert_eq!(summary.end, SessionEnd::ServerDisconnected);
}

/// State moves through Disconnecting to Closed and is observable.
#[tokio::test]
async fn test_state_observable_through_shutdown() {
    let mut server = FakeServer::bind().await.unwrap();
    let (handler, _frames) = channel_handler();

    let config = test_config(&server);
    let running = start_session(&mut server, config, handler)
        .await
        .unwrap();
    let mut state = running.subscribe_state();
    assert_eq!(*state.borrow_and_update(), SessionState::Active);

    let stop = running.stop_handle();
    stop.stop();
    stop.stop();

    tokio::time::timeout(WAIT, state.wait_for(|s| *s == SessionState::Closed))
        .await
        .expect("session should reach Closed")
        .unwrap();
    assert_eq!(running.join().await.unwrap().end, SessionEnd::Stopped);
}

/// REGISTERED from a different address than the configured one is accepted
/// and reported separately.
#[tokio::test]
async fn test_registered_from_other_address() {
    let server = FakeServer::bind().await.unwrap();
    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    let (handler, _frames) = channel_handler();

    let session = Session::new(test_config(&server));
    let (running, relayed) = tokio::join!(session.start(handler), async {
        let (datagram, client) = server.recv(WAIT).await?;
        anyhow::ensure!(datagram == TAG_REGISTER_CLIENT, "expected REGISTER_CLIENT");
        relay.send_to(TAG_REGISTERED, client).await?;
        anyhow::Ok(())
    });
    relayed.unwrap();
    let running = running.unwrap();

    assert_eq!(running.server_addr().port(), server.port());
    assert_eq!(running.observed_addr(), relay_addr);
    assert_ne!(running.observed_addr(), running.server_addr());

    let summary = running.stop().await.unwrap();
    assert_eq!(summary.server.port(), server.port());
    assert_eq!(summary.observed, relay_addr);
}

/// Time spent waiting for REGISTERED does not count as session runtime.
#[tokio::test]
async fn test_runtime_starts_at_registration() {
    let server = FakeServer::bind().await.unwrap();
    let (handler, _frames) = channel_handler();
    let mut config = test_config(&server);
    config.registration_timeout = Duration::from_secs(1);

    let session = Session::new(config);
    let (running, answered) = tokio::join!(session.start(handler), async {
        let (_, client) = server.recv(WAIT).await?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        server.send_to(TAG_REGISTERED, client).await
    });
    answered.unwrap();
    let running = running.unwrap();

    assert!(running.stats().snapshot().elapsed < Duration::from_millis(300));
    running.stop().await.unwrap();
}
