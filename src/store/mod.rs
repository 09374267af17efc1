mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::session::{SessionPatch, UploadInit, UploadSession};
use async_trait::async_trait;
use std::time::Duration;

/// Session metadata and received-chunk index persistence.
///
/// The reference implementation is process-local ([`MemoryStore`]); the
/// contract is written so a network-backed store can slot in behind the same
/// service. Implementations must make `mark_chunk_received` and
/// `list_received_chunks` atomic with respect to a single upload id.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Persist a new session under `upload_id`. The store owns timestamps and
    /// TTL expansion (`expires_at = created_at + ttl`).
    async fn create_session(
        &self,
        upload_id: String,
        init: UploadInit,
        chunk_size: u64,
        ttl: Option<Duration>,
    ) -> Result<UploadSession>;

    /// Fetch a session. Expired sessions read as absent.
    async fn get_session(&self, upload_id: &str) -> Result<Option<UploadSession>>;

    /// Apply a partial update; `updated_at` advances on every call.
    async fn update_session(&self, upload_id: &str, patch: SessionPatch) -> Result<UploadSession>;

    /// Idempotent set insert; re-marking a known index is a no-op.
    async fn mark_chunk_received(&self, upload_id: &str, index: u32) -> Result<()>;

    /// Sorted indices received so far.
    async fn list_received_chunks(&self, upload_id: &str) -> Result<Vec<u32>>;

    /// Remove the session record and its received-set. Missing sessions are
    /// not an error so cleanup sweeps tolerate concurrent deletion.
    async fn delete_session(&self, upload_id: &str) -> Result<()>;

    /// Optional capability: sessions whose TTL has lapsed and that are still
    /// eligible for sweeping. `None` when the store does not support listing.
    async fn list_expired_sessions(&self) -> Result<Option<Vec<UploadSession>>> {
        Ok(None)
    }

    /// Optional capability: every session the store knows about.
    async fn list_all_sessions(&self) -> Result<Option<Vec<UploadSession>>> {
        Ok(None)
    }
}
