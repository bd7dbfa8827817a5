//! Destinations for encoded CSV chunks.
//!
//! Every chunk is flushed as soon as it is written: the HTTP sink hands it to
//! the response body as its own chunk, the file sink flushes its buffer.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use super::error::ExportError;

/// Body item type of a streamed HTTP response.
pub type BodyChunk = Result<Bytes, std::io::Error>;

#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Writes and flushes one chunk.
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), ExportError>;

    /// Resolves when the destination went away (client disconnect).
    /// Sinks without a remote peer never resolve.
    async fn closed(&self);
}

/// Feeds a streaming response body.
#[derive(Debug)]
pub struct HttpSink {
    tx: mpsc::Sender<BodyChunk>,
}

impl HttpSink {
    pub fn new(tx: mpsc::Sender<BodyChunk>) -> Self {
        Self { tx }
    }

    /// Terminates the body with an error so the client sees an aborted
    /// transfer instead of a cleanly finished file.
    pub async fn abort(&self, err: &ExportError) {
        if self
            .tx
            .send(Err(std::io::Error::other(err.to_string())))
            .await
            .is_err()
        {
            tracing::debug!(error = %err, "Response body already dropped, abort not delivered");
        }
    }
}

#[async_trait]
impl ChunkSink for HttpSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), ExportError> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| ExportError::BrowserDisconnected)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Buffered file destination for queued exports.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl FileSink {
    /// Creates (or truncates) `path`, creating parent directories.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flushes and syncs the file to disk.
    pub async fn finish(mut self) -> Result<u64, ExportError> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        Ok(self.bytes_written)
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), ExportError> {
        self.writer.write_all(&chunk).await?;
        self.writer.flush().await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}
