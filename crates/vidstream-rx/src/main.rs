//! vidstream-rx: receives a chunked video stream and hands out whole frames.
//!
//! Usage: `vidstream-rx [host] [port]`

use std::sync::Arc;

use anyhow::{Context, Result};

use vidstream_core::StreamConfig;
use vidstream_services::{Session, SessionConfig, SessionEnd};

mod sink;

use sink::FrameWriter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = StreamConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = StreamConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        StreamConfig::default()
    });

    let mut args = std::env::args().skip(1);
    if let Some(host) = args.next() {
        config.server.host = host;
    }
    if let Some(port) = args.next() {
        config.server.port = port
            .parse()
            .with_context(|| format!("invalid port {port:?}"))?;
    }

    tracing::info!(
        server = %format_args!("{}:{}", config.server.host, config.server.port),
        format = ?config.output.format,
        "vidstream-rx starting"
    );

    let sink = FrameWriter::new(config.output.dir.clone(), config.output.format)?;
    let session = Session::new(SessionConfig::from(&config))
        .start(Arc::new(sink))
        .await
        .context("failed to start session")?;

    // ── Wait for exit ────────────────────────────────────────────────────────

    let stop = session.stop_handle();
    tokio::select! {
        r = tokio::signal::ctrl_c() => match r {
            Ok(()) => {
                tracing::info!("shutdown signal received");
                stop.stop();
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
                session.closed().await;
            }
        },
        _ = session.closed() => {}
    }

    let summary = session.join().await?;
    match &summary.end {
        SessionEnd::Stopped => tracing::info!("session stopped"),
        SessionEnd::ServerDisconnected => tracing::info!("server ended the session"),
        SessionEnd::SocketFailed(e) => anyhow::bail!("session ended on socket error: {e}"),
    }
    Ok(())
}
