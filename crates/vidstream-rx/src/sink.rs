//! Frame sink: where completed frames go when nothing decodes them.
//!
//! With an output directory every frame is written to
//! `<dir>/frame-<seq>.<ext>`; without one the frame is only logged.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use bytes::Bytes;

use vidstream_core::StreamFormat;
use vidstream_services::FrameHandler;

pub struct FrameWriter {
    dir: Option<PathBuf>,
    format: StreamFormat,
    seq: AtomicU64,
}

impl FrameWriter {
    /// Creates `dir` if it does not exist.
    pub fn new(dir: Option<PathBuf>, format: StreamFormat) -> Result<Self> {
        if let Some(dir) = &dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create output dir {}", dir.display()))?;
            tracing::info!(dir = %dir.display(), format = ?format, "writing frames");
        }
        Ok(Self {
            dir,
            format,
            seq: AtomicU64::new(0),
        })
    }

    fn path_for(dir: &Path, seq: u64, format: StreamFormat) -> PathBuf {
        dir.join(format!("frame-{seq:06}.{}", format.extension()))
    }
}

impl FrameHandler for FrameWriter {
    fn on_frame_ready(&self, frame: Bytes) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        match &self.dir {
            Some(dir) => {
                let path = Self::path_for(dir, seq, self.format);
                std::fs::write(&path, &frame)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                tracing::debug!(seq, len = frame.len(), path = %path.display(), "frame written");
            }
            None => tracing::debug!(seq, len = frame.len(), "frame ready"),
        }
        Ok(())
    }
}
