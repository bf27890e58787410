use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use vidstream_core::wire::{encode_chunk, encode_frame, encode_frame_start, FrameStart, WordWidth};

use crate::*;

fn frame_start(frame_id: u64, total_size: u64, chunk_count: u64, width: WordWidth) -> Vec<u8> {
    encode_frame_start(&FrameStart {
        frame_id,
        total_size,
        chunk_count,
        width,
    })
    .unwrap()
}

fn chunk(width: WordWidth, frame_id: u64, index: u64, payload: &[u8]) -> Vec<u8> {
    encode_chunk(width, frame_id, index, payload).unwrap()
}

/// FRAME_START(7, 3000, 3) then chunks 1, 0, 2 yields one 3000-byte frame
/// in index order.
#[tokio::test]
async fn test_out_of_order_frame() {
    let mut server = FakeServer::bind().await.unwrap();
    let (handler, mut frames) = channel_handler();
    let config = test_config(&server);
    let running = start_session(&mut server, config, handler)
        .await
        .unwrap();

    let original = pattern(3000, 7);
    let w = WordWidth::Wide;
    server
        .send_all([
            frame_start(7, 3000, 3, w),
            chunk(w, 7, 1, &original[1000..2000]),
            chunk(w, 7, 0, &original[..1000]),
            chunk(w, 7, 2, &original[2000..]),
        ])
        .await
        .unwrap();

    let frame = next_frame(&mut frames).await.unwrap();
    assert_eq!(frame.len(), 3000);
    assert_eq!(frame, Bytes::from(original));
    assert!(no_frame(&mut frames).await);

    let summary = running.stop().await.unwrap();
    assert_eq!(summary.stats.frames_completed, 1);
    assert_eq!(summary.stats.bytes_completed, 3000);
}

/// Re-delivered chunks change nothing, before or after completion.
#[tokio::test]
async fn test_duplicate_chunks_ignored() {
    let mut server = FakeServer::bind().await.unwrap();
    let (handler, mut frames) = channel_handler();
    let config = test_config(&server);
    let running = start_session(&mut server, config, handler)
        .await
        .unwrap();

    let original = pattern(1500, 1);
    let w = WordWidth::Wide;
    server
        .send_all([
            frame_start(1, 1500, 2, w),
            chunk(w, 1, 0, &original[..1000]),
            chunk(w, 1, 0, &original[..1000]),
            chunk(w, 1, 1, &original[1000..]),
            chunk(w, 1, 1, &original[1000..]),
        ])
        .await
        .unwrap();

    assert_eq!(next_frame(&mut frames).await.unwrap(), Bytes::from(original));
    assert!(no_frame(&mut frames).await);

    let summary = running.stop().await.unwrap();
    assert_eq!(summary.stats.frames_completed, 1);
    // The late copy of chunk 1 hits a frame that no longer exists.
    assert_eq!(summary.stats.datagrams_dropped, 1);
}

/// 32-bit-word headers reassemble exactly like 64-bit ones.
#[tokio::test]
async fn test_narrow_headers() {
    let mut server = FakeServer::bind().await.unwrap();
    let (handler, mut frames) = channel_handler();
    let config = test_config(&server);
    let running = start_session(&mut server, config, handler)
        .await
        .unwrap();

    let original = pattern(2500, 3);
    let n = WordWidth::Narrow;
    server
        .send_all([
            frame_start(40, 2500, 3, n),
            chunk(n, 40, 2, &original[2000..]),
            chunk(n, 40, 1, &original[1000..2000]),
            chunk(n, 40, 0, &original[..1000]),
        ])
        .await
        .unwrap();

    assert_eq!(next_frame(&mut frames).await.unwrap(), Bytes::from(original));
    running.stop().await.unwrap();
}

/// A second FRAME_START for a pending id throws away what came before it.
#[tokio::test]
async fn test_frame_start_replaces_pending_frame() {
    let mut server = FakeServer::bind().await.unwrap();
    let (handler, mut frames) = channel_handler();
    let config = test_config(&server);
    let running = start_session(&mut server, config, handler)
        .await
        .unwrap();

    let stale = vec![0xAAu8; 1000];
    let fresh = pattern(2000, 9);
    let w = WordWidth::Wide;
    server
        .send_all([
            frame_start(5, 2000, 2, w),
            chunk(w, 5, 0, &stale),
            frame_start(5, 2000, 2, w),
            chunk(w, 5, 1, &fresh[1000..]),
            chunk(w, 5, 0, &fresh[..1000]),
        ])
        .await
        .unwrap();

    assert_eq!(next_frame(&mut frames).await.unwrap(), Bytes::from(fresh));
    assert!(no_frame(&mut frames).await);
    running.stop().await.unwrap();
}

/// The legacy single-datagram FRAME goes straight to the handler.
#[tokio::test]
async fn test_legacy_frame() {
    let mut server = FakeServer::bind().await.unwrap();
    let (handler, mut frames) = channel_handler();
    let config = test_config(&server);
    let running = start_session(&mut server, config, handler)
        .await
        .unwrap();

    server.send(&encode_frame(b"jpeg bytes")).await.unwrap();
    assert_eq!(
        next_frame(&mut frames).await.unwrap(),
        Bytes::from_static(b"jpeg bytes")
    );
    running.stop().await.unwrap();
}

/// Garbage on the socket is dropped and the session keeps going.
#[tokio::test]
async fn test_malformed_datagrams_do_not_stop_session() {
    let mut server = FakeServer::bind().await.unwrap();
    let (handler, mut frames) = channel_handler();
    let config = test_config(&server);
    let running = start_session(&mut server, config, handler)
        .await
        .unwrap();

    server
        .send_all([
            b"HELLO".to_vec(),
            b"FRAME_START\x00\x01".to_vec(),
            b"CHUNK\x01".to_vec(),
            b"FRAME\xff\xff\xff\xff\xff\xff\xff\xff".to_vec(),
            chunk(WordWidth::Wide, 123, 0, b"orphan"),
            encode_frame(b"still alive"),
        ])
        .await
        .unwrap();

    assert_eq!(
        next_frame(&mut frames).await.unwrap(),
        Bytes::from_static(b"still alive")
    );
    assert!(running.is_running());

    let summary = running.stop().await.unwrap();
    assert_eq!(summary.stats.datagrams_dropped, 5);
}

/// A failing handler is contained; later frames are still delivered.
#[tokio::test]
async fn test_handler_failure_keeps_session() {
    let mut server = FakeServer::bind().await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut frames) = tokio::sync::mpsc::unbounded_channel();
    let counter = calls.clone();
    let handler = move |frame: Bytes| -> anyhow::Result<()> {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("first frame is corrupt");
        }
        tx.send(frame).map_err(|_| anyhow::anyhow!("receiver dropped"))
    };
    let config = test_config(&server);
    let running = start_session(&mut server, config, Arc::new(handler))
        .await
        .unwrap();

    server
        .send_all([encode_frame(b"bad"), encode_frame(b"good")])
        .await
        .unwrap();

    assert_eq!(
        next_frame(&mut frames).await.unwrap(),
        Bytes::from_static(b"good")
    );
    let summary = running.stop().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(summary.stats.handler_failures, 1);
    assert_eq!(summary.stats.frames_completed, 2);
}

/// An incomplete frame is evicted after the staleness window and its late
/// chunks are dropped.
#[tokio::test]
async fn test_stale_frame_evicted() {
    let mut server = FakeServer::bind().await.unwrap();
    let (handler, mut frames) = channel_handler();
    let mut config = test_config(&server);
    config.store.staleness = Duration::from_millis(60);
    let running = start_session(&mut server, config, handler).await.unwrap();

    let original = pattern(2000, 4);
    let w = WordWidth::Wide;
    server
        .send_all([frame_start(9, 2000, 2, w), chunk(w, 9, 0, &original[..1000])])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.send(&chunk(w, 9, 1, &original[1000..])).await.unwrap();

    assert!(no_frame(&mut frames).await);
    let summary = running.stop().await.unwrap();
    assert_eq!(summary.stats.frames_completed, 0);
    assert_eq!(summary.stats.frames_evicted, 1);
}
