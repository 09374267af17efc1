use crate::error::{Error, Result};
use crate::session::{self, SessionPatch, SessionStatus, UploadInit, UploadSession};
use crate::store::UploadStore;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

struct SessionEntry {
    session: UploadSession,
    received: BTreeSet<u32>,
}

/// In-memory reference store. Sessions do not survive a restart; the server
/// purges orphaned chunk staging on startup to match.
#[derive(Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    async fn create_session(
        &self,
        upload_id: String,
        init: UploadInit,
        chunk_size: u64,
        ttl: Option<Duration>,
    ) -> Result<UploadSession> {
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| {
            now + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::zero())
        });

        let session = UploadSession {
            upload_id: upload_id.clone(),
            file_name: init.file_name,
            mime_type: init.mime_type,
            metadata: init.metadata,
            file_size: init.file_size,
            chunk_size,
            total_chunks: session::total_chunks(init.file_size, chunk_size),
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            expires_at,
        };

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            upload_id,
            SessionEntry {
                session: session.clone(),
                received: BTreeSet::new(),
            },
        );

        Ok(session)
    }

    async fn get_session(&self, upload_id: &str) -> Result<Option<UploadSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(upload_id)
            .map(|entry| &entry.session)
            .filter(|session| !session.is_expired())
            .cloned())
    }

    async fn update_session(&self, upload_id: &str, patch: SessionPatch) -> Result<UploadSession> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(upload_id)
            .filter(|entry| !entry.session.is_expired())
            .ok_or_else(|| Error::UploadNotFound {
                upload_id: upload_id.to_string(),
            })?;

        if let Some(status) = patch.status {
            entry.session.status = status;
        }
        entry.session.updated_at = Utc::now();

        Ok(entry.session.clone())
    }

    async fn mark_chunk_received(&self, upload_id: &str, index: u32) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(upload_id)
            .filter(|entry| !entry.session.is_expired())
            .ok_or_else(|| Error::UploadNotFound {
                upload_id: upload_id.to_string(),
            })?;

        entry.received.insert(index);
        entry.session.updated_at = Utc::now();

        Ok(())
    }

    async fn list_received_chunks(&self, upload_id: &str) -> Result<Vec<u32>> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(upload_id)
            .filter(|entry| !entry.session.is_expired())
            .ok_or_else(|| Error::UploadNotFound {
                upload_id: upload_id.to_string(),
            })?;

        Ok(entry.received.iter().copied().collect())
    }

    async fn delete_session(&self, upload_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(upload_id);
        Ok(())
    }

    async fn list_expired_sessions(&self) -> Result<Option<Vec<UploadSession>>> {
        let now = Utc::now();
        let sessions = self.sessions.read().await;
        // Completed sessions are never swept, so the listing skips them.
        let expired = sessions
            .values()
            .filter(|entry| entry.session.status != SessionStatus::Completed)
            .filter(|entry| entry.session.expires_at.is_some_and(|t| t < now))
            .map(|entry| entry.session.clone())
            .collect();
        Ok(Some(expired))
    }

    async fn list_all_sessions(&self) -> Result<Option<Vec<UploadSession>>> {
        let sessions = self.sessions.read().await;
        Ok(Some(
            sessions.values().map(|entry| entry.session.clone()).collect(),
        ))
    }
}
