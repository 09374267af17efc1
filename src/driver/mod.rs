mod local;
mod s3;

pub use local::LocalDriver;
pub use s3::S3Driver;

use crate::error::{Error, Result};
use crate::session::UploadSession;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use utoipa::ToSchema;

/// Request-body byte stream handed to a driver's write path.
pub type ChunkStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Where a finalized artifact ended up. Tagged so new driver kinds can extend
/// the union without touching the service.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageLocation {
    Local {
        #[schema(value_type = String)]
        path: PathBuf,
    },
    S3 {
        bucket: String,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        etag: Option<String>,
    },
}

/// Byte persistence for one upload session.
///
/// Drivers must tolerate concurrent `write_chunk` calls for distinct indices
/// of the same session, and overwrite on a repeated index (last writer wins).
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Prepare backend state for a new session (staging directory, multipart
    /// upload, ...). Called once, before any chunk arrives.
    async fn init_upload(&self, session: &UploadSession) -> Result<()>;

    /// Persist one chunk. `expected_size` is the length the session demands
    /// for this index; drivers fail `CHUNK_SIZE_MISMATCH` when the body
    /// disagrees, and `CHUNK_HASH_MISMATCH` when `hash` is supplied and does
    /// not match the SHA-256 of the received bytes.
    async fn write_chunk(
        &self,
        session: &UploadSession,
        index: u32,
        body: ChunkStream,
        expected_size: u64,
        hash: Option<&str>,
    ) -> Result<()>;

    /// Convert accumulated chunks into the final artifact and release staging
    /// state. Not idempotent; the service calls it at most once per session.
    async fn finalize_upload(&self, session: &UploadSession) -> Result<StorageLocation>;

    /// Release staging state without producing an artifact. Absent state is
    /// success so abort can race cleanup.
    async fn abort_upload(&self, session: &UploadSession) -> Result<()>;
}

/// Compare a caller-supplied chunk hash against the SHA-256 of the received
/// bytes. Hex comparison is case-insensitive.
pub(crate) fn check_chunk_hash(supplied: Option<&str>, actual_hex: &str) -> Result<()> {
    if let Some(expected) = supplied {
        if !expected.eq_ignore_ascii_case(actual_hex) {
            return Err(Error::ChunkHashMismatch {
                expected: expected.to_string(),
                actual: actual_hex.to_string(),
            });
        }
    }
    Ok(())
}
