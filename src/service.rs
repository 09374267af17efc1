use crate::driver::{ChunkStream, StorageDriver, StorageLocation};
use crate::error::{Error, Result};
use crate::session::{
    self, SessionPatch, SessionStatus, UploadInit, UploadSession,
};
use crate::store::UploadStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;

/// Snapshot of one session's progress, as reported over the wire.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub upload_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received_chunks: Vec<u32>,
    pub missing_chunks: Vec<u32>,
}

/// Result of a successful finalize.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResult {
    pub upload_id: String,
    pub status: SessionStatus,
    pub location: StorageLocation,
}

/// Outcome of one cleanup sweep. Per-session failures are collected rather
/// than aborting the sweep.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct CleanupReport {
    pub cleaned: u32,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub default_chunk_size: u64,
    /// TTL applied to every new session; `None` disables expiry.
    pub session_ttl: Option<Duration>,
    /// Upper bound on `file_size` at init; `None` disables the guard.
    pub max_file_size: Option<u64>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            default_chunk_size: session::DEFAULT_CHUNK_SIZE,
            session_ttl: Some(Duration::from_secs(
                session::DEFAULT_SESSION_TTL_SECS as u64,
            )),
            max_file_size: None,
        }
    }
}

/// The upload coordination engine: validates inputs, sequences store and
/// driver calls, enforces the session state machine, and runs cleanup sweeps.
///
/// The service itself does not serialize operations on a session; consistency
/// comes from the store's atomic received-set and the driver's tolerance for
/// concurrent writes to distinct indices.
pub struct UploadService {
    store: Arc<dyn UploadStore>,
    driver: Arc<dyn StorageDriver>,
    options: ServiceOptions,
}

impl UploadService {
    pub fn new(
        store: Arc<dyn UploadStore>,
        driver: Arc<dyn StorageDriver>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            store,
            driver,
            options,
        }
    }

    /// Create a session and prepare driver state. Both must succeed for the
    /// session to exist; a driver failure rolls the store record back.
    pub async fn init_upload(&self, init: UploadInit) -> Result<UploadSession> {
        if init.file_size == 0 {
            return Err(Error::InvalidRequest {
                msg: "fileSize must be a positive integer".to_string(),
            });
        }
        if let Some(max) = self.options.max_file_size {
            if init.file_size > max {
                return Err(Error::InvalidRequest {
                    msg: format!("fileSize {} exceeds maximum of {}", init.file_size, max),
                });
            }
        }

        let chunk_size = session::clamp_chunk_size(
            init.desired_chunk_size,
            self.options.default_chunk_size,
            init.file_size,
        );
        let upload_id = session::generate_upload_id();

        let session = self
            .store
            .create_session(upload_id.clone(), init, chunk_size, self.options.session_ttl)
            .await?;

        if let Err(e) = self.driver.init_upload(&session).await {
            if let Err(del) = self.store.delete_session(&upload_id).await {
                tracing::warn!(upload_id, error = %del, "Failed to roll back session after driver init failure");
            }
            return Err(e);
        }

        tracing::info!(
            upload_id,
            file_size = session.file_size,
            chunk_size = session.chunk_size,
            total_chunks = session.total_chunks,
            "Upload session created"
        );

        Ok(session)
    }

    /// Validate and persist one chunk. Re-writing a known index is accepted;
    /// the received-set has set semantics and the driver overwrites.
    pub async fn handle_chunk(
        &self,
        upload_id: &str,
        index: u32,
        size: u64,
        hash: Option<&str>,
        body: ChunkStream,
    ) -> Result<()> {
        let session = self.require_live_session(upload_id).await?;

        if index >= session.total_chunks {
            return Err(Error::ChunkOutOfRange {
                index,
                total_chunks: session.total_chunks,
            });
        }

        let expected = session.expected_chunk_size(index);
        if size != expected {
            return Err(Error::ChunkSizeMismatch {
                expected,
                actual: size,
            });
        }

        self.driver
            .write_chunk(&session, index, body, expected, hash)
            .await?;

        self.store.mark_chunk_received(upload_id, index).await?;
        if session.status == SessionStatus::Pending {
            self.store
                .update_session(upload_id, SessionPatch::status(SessionStatus::InProgress))
                .await?;
        }

        Ok(())
    }

    /// Pure read of a session's progress.
    pub async fn get_status(&self, upload_id: &str) -> Result<UploadStatus> {
        let session = self.require_session(upload_id).await?;
        let received: BTreeSet<u32> = self
            .store
            .list_received_chunks(upload_id)
            .await?
            .into_iter()
            .collect();
        let missing = session::missing_chunks(session.total_chunks, &received);

        Ok(UploadStatus {
            upload_id: session.upload_id,
            status: session.status,
            file_name: session.file_name,
            file_size: session.file_size,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            received_chunks: received.into_iter().collect(),
            missing_chunks: missing,
        })
    }

    /// Materialize the artifact once every chunk has arrived.
    ///
    /// Finalize and the status patch are not transactional: if the driver
    /// succeeds but the patch fails, the artifact exists while the session
    /// still reads `in_progress`. The patch error is surfaced and finalize is
    /// never retried.
    pub async fn complete_upload(
        &self,
        upload_id: &str,
        hash: Option<&str>,
    ) -> Result<CompleteResult> {
        let session = self.require_live_session(upload_id).await?;

        let received: BTreeSet<u32> = self
            .store
            .list_received_chunks(upload_id)
            .await?
            .into_iter()
            .collect();
        let missing = session::missing_chunks(session.total_chunks, &received);
        if !missing.is_empty() {
            return Err(Error::MissingChunks { missing });
        }

        if let Some(hash) = hash {
            // Advisory only; drivers verify per-chunk hashes instead
            tracing::debug!(upload_id, hash, "File hash supplied on complete");
        }

        let location = self.driver.finalize_upload(&session).await?;

        self.store
            .update_session(upload_id, SessionPatch::status(SessionStatus::Completed))
            .await
            .inspect_err(|e| {
                tracing::error!(
                    upload_id,
                    error = %e,
                    "Artifact finalized but session patch failed; session stays in_progress"
                );
            })?;

        tracing::info!(upload_id, "Upload completed");

        Ok(CompleteResult {
            upload_id: upload_id.to_string(),
            status: SessionStatus::Completed,
            location,
        })
    }

    /// Cancel a session and release driver state. Aborting an already
    /// canceled session is a no-op (the driver was already released).
    pub async fn abort_upload(&self, upload_id: &str) -> Result<()> {
        let session = self.require_session(upload_id).await?;

        match session.status {
            SessionStatus::Completed => Err(Error::UploadAlreadyCompleted {
                upload_id: upload_id.to_string(),
            }),
            SessionStatus::Canceled => Ok(()),
            _ => {
                self.driver.abort_upload(&session).await?;
                self.store
                    .update_session(upload_id, SessionPatch::status(SessionStatus::Canceled))
                    .await?;
                tracing::info!(upload_id, "Upload canceled");
                Ok(())
            }
        }
    }

    /// Sweep sessions whose TTL has lapsed. Requires the store's
    /// `list_expired_sessions` capability.
    pub async fn cleanup_expired_uploads(&self) -> Result<CleanupReport> {
        let Some(expired) = self.store.list_expired_sessions().await? else {
            return Ok(CleanupReport {
                cleaned: 0,
                errors: vec!["not supported".to_string()],
            });
        };

        Ok(self.sweep(expired).await)
    }

    /// Sweep non-completed sessions untouched for longer than `max_age`.
    /// Requires the store's `list_all_sessions` capability.
    pub async fn cleanup_stale_uploads(&self, max_age: Duration) -> Result<CleanupReport> {
        let Some(sessions) = self.store.list_all_sessions().await? else {
            return Ok(CleanupReport {
                cleaned: 0,
                errors: vec!["not supported".to_string()],
            });
        };

        let now = Utc::now();
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let stale = sessions
            .into_iter()
            .filter(|s| s.status != SessionStatus::Completed)
            .filter(|s| now - s.updated_at > max_age)
            .collect();

        Ok(self.sweep(stale).await)
    }

    async fn sweep(&self, sessions: Vec<UploadSession>) -> CleanupReport {
        let mut report = CleanupReport::default();

        for session in sessions {
            let upload_id = session.upload_id.clone();

            if session.status != SessionStatus::Completed {
                if let Err(e) = self.driver.abort_upload(&session).await {
                    tracing::warn!(upload_id, error = %e, "Driver abort failed during sweep");
                    report.errors.push(format!("{upload_id}: {e}"));
                    continue;
                }
            }

            match self.store.delete_session(&upload_id).await {
                Ok(()) => report.cleaned += 1,
                Err(e) => {
                    tracing::warn!(upload_id, error = %e, "Failed to delete session during sweep");
                    report.errors.push(format!("{upload_id}: {e}"));
                }
            }
        }

        report
    }

    async fn require_session(&self, upload_id: &str) -> Result<UploadSession> {
        self.store
            .get_session(upload_id)
            .await?
            .ok_or_else(|| Error::UploadNotFound {
                upload_id: upload_id.to_string(),
            })
    }

    /// Session lookup plus the terminal-status guards shared by chunk writes
    /// and completion.
    async fn require_live_session(&self, upload_id: &str) -> Result<UploadSession> {
        let session = self.require_session(upload_id).await?;
        match session.status {
            SessionStatus::Completed => Err(Error::UploadAlreadyCompleted {
                upload_id: upload_id.to_string(),
            }),
            SessionStatus::Canceled => Err(Error::UploadCanceled {
                upload_id: upload_id.to_string(),
            }),
            _ => Ok(session),
        }
    }
}

/// Default cleanup interval: 1 hour
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Spawn a background task that periodically sweeps expired upload sessions.
pub fn spawn_cleanup_task(service: Arc<UploadService>, interval_secs: u64) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(interval_secs);

        loop {
            tokio::time::sleep(interval).await;

            match service.cleanup_expired_uploads().await {
                Ok(report) if report.cleaned > 0 || !report.errors.is_empty() => {
                    tracing::info!(
                        cleaned = report.cleaned,
                        errors = report.errors.len(),
                        "Swept expired upload sessions"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to sweep expired uploads");
                }
                _ => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LocalDriver;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use futures::StreamExt;
    use futures::stream;
    use tempfile::TempDir;

    fn body(data: Vec<u8>) -> ChunkStream {
        stream::iter(vec![Ok(Bytes::from(data))]).boxed()
    }

    fn service(dir: &TempDir) -> UploadService {
        let driver = LocalDriver::new(dir.path().join("tmp"), dir.path().join("final"), false);
        UploadService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(driver),
            ServiceOptions {
                session_ttl: None,
                ..Default::default()
            },
        )
    }

    fn small_init(file_size: u64, chunk_size: u64) -> UploadInit {
        UploadInit {
            file_name: Some("blob.bin".to_string()),
            file_size,
            desired_chunk_size: Some(chunk_size),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_init_rejects_zero_file_size() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let err = svc.init_upload(small_init(0, 1024)).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_init_enforces_max_file_size() {
        let dir = TempDir::new().unwrap();
        let driver = LocalDriver::new(dir.path().join("tmp"), dir.path().join("final"), false);
        let svc = UploadService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(driver),
            ServiceOptions {
                session_ttl: None,
                max_file_size: Some(1000),
                ..Default::default()
            },
        );
        let err = svc.init_upload(small_init(1001, 1024)).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_state_machine_pending_to_completed() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);

        // Chunk sizes below the clamp floor normalize to the file size here
        let session = svc.init_upload(small_init(10, 4)).await.unwrap();
        assert_eq!(session.chunk_size, 10);
        assert_eq!(session.total_chunks, 1);
        assert_eq!(session.status, SessionStatus::Pending);

        svc.handle_chunk(&session.upload_id, 0, 10, None, body(vec![7u8; 10]))
            .await
            .unwrap();

        let status = svc.get_status(&session.upload_id).await.unwrap();
        assert_eq!(status.status, SessionStatus::InProgress);
        assert_eq!(status.received_chunks, vec![0]);
        assert!(status.missing_chunks.is_empty());

        let result = svc.complete_upload(&session.upload_id, None).await.unwrap();
        assert_eq!(result.status, SessionStatus::Completed);

        // Completed sessions reject further mutation
        let err = svc
            .handle_chunk(&session.upload_id, 0, 10, None, body(vec![7u8; 10]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UPLOAD_ALREADY_COMPLETED");
        let err = svc.abort_upload(&session.upload_id).await.unwrap_err();
        assert_eq!(err.code(), "UPLOAD_ALREADY_COMPLETED");
    }

    #[tokio::test]
    async fn test_chunk_validation_order() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let session = svc.init_upload(small_init(10, 4)).await.unwrap();

        let err = svc
            .handle_chunk("u_nope", 0, 10, None, body(vec![0u8; 10]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UPLOAD_NOT_FOUND");

        let err = svc
            .handle_chunk(&session.upload_id, 5, 10, None, body(vec![0u8; 10]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CHUNK_OUT_OF_RANGE");

        let err = svc
            .handle_chunk(&session.upload_id, 0, 9, None, body(vec![0u8; 9]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CHUNK_SIZE_MISMATCH");
    }

    #[tokio::test]
    async fn test_complete_with_gap_reports_missing() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        // MIN_CHUNK_SIZE floor gives three 256 KiB chunks over 700 000 bytes
        let session = svc
            .init_upload(small_init(700_000, 262_144))
            .await
            .unwrap();
        assert_eq!(session.total_chunks, 3);

        svc.handle_chunk(&session.upload_id, 0, 262_144, None, body(vec![0u8; 262_144]))
            .await
            .unwrap();
        let last = session.expected_chunk_size(2);
        svc.handle_chunk(&session.upload_id, 2, last, None, body(vec![0u8; last as usize]))
            .await
            .unwrap();

        let err = svc.complete_upload(&session.upload_id, None).await.unwrap_err();
        match err {
            Error::MissingChunks { missing } => assert_eq!(missing, vec![1]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_is_idempotent_and_blocks_mutation() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let session = svc.init_upload(small_init(10, 4)).await.unwrap();

        svc.abort_upload(&session.upload_id).await.unwrap();
        // Second abort is a no-op
        svc.abort_upload(&session.upload_id).await.unwrap();

        let err = svc
            .handle_chunk(&session.upload_id, 0, 10, None, body(vec![0u8; 10]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UPLOAD_CANCELED");
        let err = svc.complete_upload(&session.upload_id, None).await.unwrap_err();
        assert_eq!(err.code(), "UPLOAD_CANCELED");
    }

    #[tokio::test]
    async fn test_duplicate_chunk_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let session = svc.init_upload(small_init(10, 4)).await.unwrap();

        svc.handle_chunk(&session.upload_id, 0, 10, None, body(vec![1u8; 10]))
            .await
            .unwrap();
        svc.handle_chunk(&session.upload_id, 0, 10, None, body(vec![2u8; 10]))
            .await
            .unwrap();

        let status = svc.get_status(&session.upload_id).await.unwrap();
        assert_eq!(status.received_chunks, vec![0]);
    }
}
