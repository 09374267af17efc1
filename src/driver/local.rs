use crate::driver::{ChunkStream, StorageDriver, StorageLocation, check_chunk_hash};
use crate::error::{Error, Result, ResultIoExt};
use crate::session::UploadSession;
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Local filesystem driver. Chunks are staged as numbered files under
/// `<temp_dir>/<upload_id>/` and concatenated into `<base_dir>` on finalize.
pub struct LocalDriver {
    temp_dir: PathBuf,
    base_dir: PathBuf,
    preserve_file_name: bool,
}

impl LocalDriver {
    pub fn new(
        temp_dir: impl Into<PathBuf>,
        base_dir: impl Into<PathBuf>,
        preserve_file_name: bool,
    ) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            base_dir: base_dir.into(),
            preserve_file_name,
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Remove every staging directory under `temp_dir`.
    /// Called on startup since the in-memory session store does not survive
    /// restarts.
    pub async fn purge_staging(&self) -> Result<u32> {
        if !self.temp_dir.exists() {
            return Ok(0);
        }

        let mut count = 0u32;
        let mut entries = fs::read_dir(&self.temp_dir).await.map_io_err(&self.temp_dir)?;
        while let Some(entry) = entries.next_entry().await.map_io_err(&self.temp_dir)? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Err(e) = fs::remove_dir_all(&path).await {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to remove staging directory"
                );
            } else {
                count += 1;
            }
        }

        Ok(count)
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf> {
        // Ids are server-generated, but never let one become a path escape
        if !crate::session::is_valid_upload_id(upload_id)
            || upload_id.contains(['/', '\\', '\0'])
        {
            return Err(Error::InvalidRequest {
                msg: format!("Invalid upload id: {upload_id}"),
            });
        }
        Ok(self.temp_dir.join(upload_id))
    }

    fn chunk_path(&self, upload_id: &str, index: u32) -> Result<PathBuf> {
        // Zero-padded so lexicographic listing order equals numeric order
        Ok(self.upload_dir(upload_id)?.join(format!("chunk_{index:06}")))
    }

    fn final_path(&self, session: &UploadSession) -> PathBuf {
        if self.preserve_file_name {
            // Take only the last path component of a caller-supplied name
            if let Some(name) = session
                .file_name
                .as_deref()
                .and_then(|name| Path::new(name).file_name())
            {
                return self.base_dir.join(&session.upload_id).join(name);
            }
        }
        let ext = session.file_extension().unwrap_or_default();
        self.base_dir.join(format!("{}{ext}", session.upload_id))
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    async fn init_upload(&self, session: &UploadSession) -> Result<()> {
        let upload_dir = self.upload_dir(&session.upload_id)?;
        fs::create_dir_all(&upload_dir)
            .await
            .map_io_err(&upload_dir)?;
        Ok(())
    }

    async fn write_chunk(
        &self,
        session: &UploadSession,
        index: u32,
        mut body: ChunkStream,
        expected_size: u64,
        hash: Option<&str>,
    ) -> Result<()> {
        let chunk_path = self.chunk_path(&session.upload_id, index)?;

        // Stream straight to disk; a repeated index truncates the prior write
        let mut file = fs::File::create(&chunk_path)
            .await
            .map_io_err(&chunk_path)?;
        let mut hasher = Sha256::new();
        while let Some(part) = body.next().await {
            let part = part.map_io_err(&chunk_path)?;
            hasher.update(&part);
            file.write_all(&part).await.map_io_err(&chunk_path)?;
        }
        file.sync_all().await.map_io_err(&chunk_path)?;
        drop(file);

        let actual = fs::metadata(&chunk_path)
            .await
            .map_io_err(&chunk_path)?
            .len();
        if actual != expected_size {
            // Partial or oversized bodies are not kept around
            let _ = fs::remove_file(&chunk_path).await;
            return Err(Error::ChunkSizeMismatch {
                expected: expected_size,
                actual,
            });
        }

        if let Err(e) = check_chunk_hash(hash, &format!("{:x}", hasher.finalize())) {
            let _ = fs::remove_file(&chunk_path).await;
            return Err(e);
        }

        Ok(())
    }

    async fn finalize_upload(&self, session: &UploadSession) -> Result<StorageLocation> {
        let upload_dir = self.upload_dir(&session.upload_id)?;
        let final_path = self.final_path(session);

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await.map_io_err(parent)?;
        }

        let mut chunk_names = Vec::new();
        let mut entries = fs::read_dir(&upload_dir).await.map_io_err(&upload_dir)?;
        while let Some(entry) = entries.next_entry().await.map_io_err(&upload_dir)? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("chunk_") {
                chunk_names.push(name);
            }
        }
        chunk_names.sort();

        // One output stream held open across every chunk read
        let mut output = fs::File::create(&final_path)
            .await
            .map_io_err(&final_path)?;
        for name in &chunk_names {
            let chunk_path = upload_dir.join(name);
            let mut chunk = fs::File::open(&chunk_path).await.map_io_err(&chunk_path)?;
            tokio::io::copy(&mut chunk, &mut output)
                .await
                .map_io_err(&final_path)?;
        }
        output.sync_all().await.map_io_err(&final_path)?;
        drop(output);

        fs::remove_dir_all(&upload_dir)
            .await
            .map_io_err(&upload_dir)?;

        Ok(StorageLocation::Local { path: final_path })
    }

    async fn abort_upload(&self, session: &UploadSession) -> Result<()> {
        let upload_dir = self.upload_dir(&session.upload_id)?;
        match fs::remove_dir_all(&upload_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).map_io_err(&upload_dir),
        }
    }
}
