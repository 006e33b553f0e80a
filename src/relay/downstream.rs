//! Local side of a relay session: where audio comes from and where results go.
//!
//! The WebSocket client implements both traits in `crate::websocket`; the
//! playback mode uses [`FileAudioSource`] and [`LogResultSink`].

use crate::error::RelayError;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

/// Produces raw audio frames for one session.
#[async_trait]
pub trait AudioSource: Send {
    /// Next frame. `Ok(None)` means the input ended normally; an error means the
    /// client went away or the input failed.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, RelayError>;

    /// Resolves once the producer is gone for good, without consuming audio.
    /// Sources that cannot tell never resolve.
    async fn disconnected(&mut self) {
        std::future::pending::<()>().await
    }
}

/// How a session ended, as seen by the local client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseStatus {
    Completed,
    Failed(String),
}

/// Receives recognition results for one session.
///
/// The listener and the coordinator hold clones of the same sink.
#[async_trait]
pub trait ResultSink: Clone + Send + Sync + 'static {
    /// Deliver the sentence text of one `result-generated` event.
    async fn emit_result(&self, text: &str) -> Result<(), RelayError>;

    /// Close the local side. Called once per session.
    async fn close(&self, status: CloseStatus);
}

/// Reads a raw PCM file in fixed-size chunks, pacing them like a live microphone.
pub struct FileAudioSource {
    file: File,
    chunk_size: usize,
    interval: Duration,
    chunks_read: u64,
}

impl FileAudioSource {
    pub async fn open(
        path: impl AsRef<Path>,
        chunk_size: usize,
        interval: Duration,
    ) -> Result<Self, RelayError> {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .map_err(|e| RelayError::Downstream(format!("cannot open {}: {}", path.display(), e)))?;

        info!(file = %path.display(), chunk_size, "Opened audio file for playback");

        Ok(Self {
            file,
            chunk_size: chunk_size.max(1),
            interval,
            chunks_read: 0,
        })
    }
}

#[async_trait]
impl AudioSource for FileAudioSource {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        if self.chunks_read > 0 && !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }

        let mut chunk = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < chunk.len() {
            let n = self
                .file
                .read(&mut chunk[filled..])
                .await
                .map_err(|e| RelayError::Downstream(format!("audio file read failed: {}", e)))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        chunk.truncate(filled);
        self.chunks_read += 1;
        Ok(Some(chunk))
    }
}

/// Logs each result instead of sending it anywhere.
#[derive(Debug, Clone, Default)]
pub struct LogResultSink;

#[async_trait]
impl ResultSink for LogResultSink {
    async fn emit_result(&self, text: &str) -> Result<(), RelayError> {
        info!("Recognition result: {}", text);
        Ok(())
    }

    async fn close(&self, status: CloseStatus) {
        match status {
            CloseStatus::Completed => info!("Playback session completed"),
            CloseStatus::Failed(reason) => warn!("Playback session failed: {}", reason),
        }
    }
}
