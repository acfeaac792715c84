//! In-flight progress of a single file, on either side of a transfer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::unix_seconds;

/// Bytes carried by one FILE_DATA frame.
pub const CHUNK_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} ended before its advertised size")]
    UnexpectedEof(PathBuf),
    #[error("chunk of {chunk} bytes overflows {path} ({remaining} bytes left)")]
    Overflow {
        path: PathBuf,
        chunk: usize,
        remaining: u64,
    },
    #[error("transfer of {0} is already closed")]
    Closed(PathBuf),
}

/// Identifies the owner of a file lock for the lifetime of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct TransferUnit {
    id: TransferId,
    folder_id: u32,
    path: PathBuf,
    name: String,
    file_size: u64,
    transferred: u64,
    mod_time: u32,
    file: Option<File>,
}

impl TransferUnit {
    /// Opens `path` for chunked sending. Size and mod-time are captured now.
    pub async fn open_for_send(
        id: TransferId,
        folder_id: u32,
        path: &Path,
    ) -> Result<Self, TransferError> {
        let file = File::open(path).await.map_err(|e| io_err(path, e))?;
        let meta = file.metadata().await.map_err(|e| io_err(path, e))?;
        Ok(Self {
            id,
            folder_id,
            path: path.to_path_buf(),
            name: file_name(path),
            file_size: meta.len(),
            transferred: 0,
            mod_time: meta.modified().map(unix_seconds).unwrap_or(0),
            file: Some(file),
        })
    }

    /// Creates (or truncates) `path` for receiving `file_size` bytes.
    ///
    /// A zero-length unit is complete on creation.
    pub async fn create_for_receive(
        id: TransferId,
        folder_id: u32,
        path: &Path,
        file_size: u64,
        mod_time: u32,
    ) -> Result<Self, TransferError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| io_err(path, e))?;
        Ok(Self {
            id,
            folder_id,
            path: path.to_path_buf(),
            name: file_name(path),
            file_size,
            transferred: 0,
            mod_time,
            file: (file_size > 0).then_some(file),
        })
    }

    /// Reads the next chunk of at most [`CHUNK_SIZE`] bytes.
    ///
    /// Returns an empty chunk, and closes the file, once everything was read.
    pub async fn next_chunk(&mut self) -> Result<Vec<u8>, TransferError> {
        let remaining = self.remaining();
        if remaining == 0 {
            self.file = None;
            return Ok(Vec::new());
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::Closed(self.path.clone()))?;

        let len = remaining.min(CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransferError::UnexpectedEof(self.path.clone())
            } else {
                io_err(&self.path, e)
            }
        })?;
        self.transferred += len as u64;
        Ok(buf)
    }

    /// Appends a received chunk. Returns `true` exactly when the file becomes
    /// complete; the handle is flushed and closed at that point.
    pub async fn accept_chunk(&mut self, bytes: &[u8]) -> Result<bool, TransferError> {
        let remaining = self.remaining();
        let Some(file) = self.file.as_mut() else {
            return Err(TransferError::Closed(self.path.clone()));
        };
        if bytes.len() as u64 > remaining {
            return Err(TransferError::Overflow {
                path: self.path.clone(),
                chunk: bytes.len(),
                remaining,
            });
        }

        file.write_all(bytes)
            .await
            .map_err(|e| io_err(&self.path, e))?;
        self.transferred += bytes.len() as u64;

        if self.transferred == self.file_size {
            file.flush().await.map_err(|e| io_err(&self.path, e))?;
            self.file = None;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn folder_id(&self) -> u32 {
        self.folder_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component, the name used on the wire.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn mod_time(&self) -> u32 {
        self.mod_time
    }

    pub fn remaining(&self) -> u64 {
        self.file_size - self.transferred
    }

    pub fn is_complete(&self) -> bool {
        self.transferred == self.file_size
    }
}

impl fmt::Debug for TransferUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferUnit")
            .field("id", &self.id)
            .field("folder_id", &self.folder_id)
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("transferred", &self.transferred)
            .field("open", &self.file.is_some())
            .finish()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn io_err(path: &Path, source: std::io::Error) -> TransferError {
    TransferError::Io {
        path: path.to_path_buf(),
        source,
    }
}
