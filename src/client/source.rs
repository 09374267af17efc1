use crate::error::{Result, ResultIoExt};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Bytes to be uploaded: a file on disk or an in-memory buffer.
///
/// Only file sources carry a fingerprint; buffer uploads cannot be
/// rediscovered through the resume store.
pub enum UploadSource {
    File {
        path: PathBuf,
        file_name: String,
        size: u64,
        modified_millis: i64,
    },
    Buffer {
        data: Bytes,
        file_name: Option<String>,
    },
}

impl UploadSource {
    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let metadata = fs::metadata(&path).await.map_io_err(&path)?;
        let modified_millis = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        Ok(Self::File {
            size: metadata.len(),
            path,
            file_name,
            modified_millis,
        })
    }

    pub fn from_bytes(data: impl Into<Bytes>, file_name: Option<String>) -> Self {
        Self::Buffer {
            data: data.into(),
            file_name,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::File { size, .. } => *size,
            Self::Buffer { data, .. } => data.len() as u64,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::File { file_name, .. } => Some(file_name),
            Self::Buffer { file_name, .. } => file_name.as_deref(),
        }
    }

    /// Stable fingerprint `<name>-<size>-<lastModified>` used for resume
    /// discovery. `None` for buffer sources.
    pub fn file_key(&self) -> Option<String> {
        match self {
            Self::File {
                file_name,
                size,
                modified_millis,
                ..
            } => Some(format!("{file_name}-{size}-{modified_millis}")),
            Self::Buffer { .. } => None,
        }
    }

    /// Read exactly `len` bytes starting at `offset`. Each call opens its own
    /// file handle so concurrent chunk reads do not contend on a shared seek
    /// position.
    pub async fn read_chunk(&self, offset: u64, len: u64) -> Result<Bytes> {
        match self {
            Self::File { path, .. } => {
                let mut file = fs::File::open(path).await.map_io_err(path)?;
                file.seek(std::io::SeekFrom::Start(offset))
                    .await
                    .map_io_err(path)?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await.map_io_err(path)?;
                Ok(Bytes::from(buf))
            }
            Self::Buffer { data, .. } => {
                let start = offset as usize;
                let end = start + len as usize;
                if end > data.len() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("chunk range {start}..{end} exceeds buffer of {}", data.len()),
                    )
                    .into());
                }
                Ok(data.slice(start..end))
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File { path, .. } => Some(path),
            Self::Buffer { .. } => None,
        }
    }
}
