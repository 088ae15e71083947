//! Chunked streaming of local files to clients.

use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::client::ClientHandle;
use crate::protocol::{ServerEvent, TransferEvent};
use crate::{Error, Result};

/// Default bytes per `download:chunk` event.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Totals of one completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferSummary {
    pub bytes: u64,
    pub chunks: usize,
}

/// Streams files as `metadata`, `chunk`*, `complete` event sequences.
#[derive(Debug, Clone, Copy)]
pub struct FileStreamer {
    chunk_size: usize,
}

impl Default for FileStreamer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl FileStreamer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Streams `dir/filename` to the client.
    ///
    /// A missing file yields exactly one `NotFound` event. A read error yields
    /// one `Error` event and ends the transfer. The file is read sequentially
    /// and never held in memory as a whole.
    pub async fn send_file(
        &self,
        client: &ClientHandle,
        dir: &Path,
        filename: &str,
    ) -> Result<TransferSummary> {
        let path = dir.join(filename);

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                debug!(path = %path.display(), "File to stream not found");
                client
                    .emit(ServerEvent::Transfer(TransferEvent::NotFound {
                        path: path.clone(),
                    }))
                    .await;
                return Err(Error::FileNotFound(path));
            }
        };

        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => return Err(report_read_error(client, &path, err).await),
        };

        let emitted = client
            .emit(ServerEvent::Transfer(TransferEvent::Metadata {
                filename: filename.to_string(),
                size: metadata.len(),
            }))
            .await;
        if !emitted {
            return Err(Error::ClientDisconnected);
        }

        let mut summary = TransferSummary::default();
        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            let read = match file.read(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) => return Err(report_read_error(client, &path, err).await),
            };
            let chunk = ServerEvent::Transfer(TransferEvent::Chunk(buffer[..read].to_vec()));
            if !client.emit(chunk).await {
                debug!(path = %path.display(), sent = summary.bytes, "Client left mid-transfer");
                return Err(Error::ClientDisconnected);
            }
            summary.bytes += read as u64;
            summary.chunks += 1;
        }

        client
            .emit(ServerEvent::Transfer(TransferEvent::Complete {
                filename: filename.to_string(),
            }))
            .await;
        debug!(
            path = %path.display(),
            bytes = summary.bytes,
            chunks = summary.chunks,
            "File streamed"
        );
        Ok(summary)
    }
}

async fn report_read_error(client: &ClientHandle, path: &Path, err: std::io::Error) -> Error {
    warn!(path = %path.display(), error = %err, "File stream failed");
    client
        .emit(ServerEvent::Transfer(TransferEvent::Error {
            message: err.to_string(),
        }))
        .await;
    Error::StreamRead(err.to_string())
}
