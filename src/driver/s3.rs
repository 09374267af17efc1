use crate::config::S3Config;
use crate::driver::{ChunkStream, StorageDriver, StorageLocation, check_chunk_hash};
use crate::error::{Error, Result};
use crate::session::UploadSession;
use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::BytesMut;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
struct UploadedPart {
    part_number: i32,
    etag: Option<String>,
}

struct MultipartState {
    multipart_id: String,
    key: String,
    /// Slot per chunk index; `parts[i]` holds the last accepted upload of
    /// part `i + 1`.
    parts: Vec<Option<UploadedPart>>,
}

/// S3-compatible driver. Each chunk maps to one part of a native multipart
/// upload.
///
/// Multipart bookkeeping is process-local: finalizing or aborting an upload
/// initiated in a different process fails with STORAGE_ERROR. A production
/// deployment should pair this with an S3 lifecycle rule for incomplete
/// multipart uploads.
type ObjectKeyFn = dyn Fn(&UploadSession) -> String + Send + Sync;

pub struct S3Driver {
    client: aws_sdk_s3::Client,
    bucket: String,
    key_prefix: String,
    object_key_fn: Option<Box<ObjectKeyFn>>,
    state: Arc<RwLock<HashMap<String, MultipartState>>>,
}

impl S3Driver {
    pub fn new(
        client: aws_sdk_s3::Client,
        bucket: impl Into<String>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            key_prefix: key_prefix.into(),
            object_key_fn: None,
            state: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Override the default `<prefix><YYYY>/<MM>/<upload_id><ext>` keying.
    pub fn with_object_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&UploadSession) -> String + Send + Sync + 'static,
    {
        self.object_key_fn = Some(Box::new(key_fn));
        self
    }

    fn object_key(&self, session: &UploadSession) -> String {
        match &self.object_key_fn {
            Some(key_fn) => key_fn(session),
            None => object_key(&self.key_prefix, session),
        }
    }

    /// Build a driver from the ambient AWS environment plus `[storage.s3]`
    /// overrides (region, custom endpoint for S3-compatible stores).
    pub async fn from_config(config: &S3Config) -> Self {
        let sdk_config = aws_config::load_from_env().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(region) = &config.region {
            builder = builder.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        Self::new(client, config.bucket.clone(), config.key_prefix.clone())
    }

    fn storage_error(operation: &str, e: impl std::fmt::Display) -> Error {
        Error::Storage {
            msg: format!("{operation} failed: {e}"),
        }
    }

    fn missing_state(upload_id: &str) -> Error {
        Error::Storage {
            msg: format!("No multipart state for upload {upload_id} in this process"),
        }
    }
}

/// `<key_prefix><YYYY>/<MM>/<upload_id><ext>`, dated by session creation.
fn object_key(key_prefix: &str, session: &UploadSession) -> String {
    let ext = session.file_extension().unwrap_or_default();
    format!(
        "{key_prefix}{}/{}{ext}",
        session.created_at.format("%Y/%m"),
        session.upload_id
    )
}

#[async_trait]
impl StorageDriver for S3Driver {
    async fn init_upload(&self, session: &UploadSession) -> Result<()> {
        let key = self.object_key(session);

        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .set_content_type(session.mime_type.clone())
            .send()
            .await
            .map_err(|e| Self::storage_error("CreateMultipartUpload", e))?;

        let multipart_id = output
            .upload_id()
            .ok_or_else(|| Error::Storage {
                msg: "CreateMultipartUpload returned no upload id".to_string(),
            })?
            .to_string();

        let mut state = self.state.write().await;
        state.insert(
            session.upload_id.clone(),
            MultipartState {
                multipart_id,
                key,
                parts: vec![None; session.total_chunks as usize],
            },
        );

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
        // UploadPart needs a known-length body, so the chunk is buffered whole
        let mut buf = BytesMut::with_capacity(expected_size as usize);
        while let Some(part) = body.next().await {
            let part = part.map_err(|e| Self::storage_error("chunk body read", e))?;
            buf.extend_from_slice(&part);
        }
        if buf.len() as u64 != expected_size {
            return Err(Error::ChunkSizeMismatch {
                expected: expected_size,
                actual: buf.len() as u64,
            });
        }
        check_chunk_hash(hash, &format!("{:x}", Sha256::digest(&buf)))?;

        let (multipart_id, key) = {
            let state = self.state.read().await;
            let entry = state
                .get(&session.upload_id)
                .ok_or_else(|| Self::missing_state(&session.upload_id))?;
            (entry.multipart_id.clone(), entry.key.clone())
        };

        // S3 part numbers are 1-based
        let part_number = index as i32 + 1;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&multipart_id)
            .part_number(part_number)
            .content_length(expected_size as i64)
            .body(ByteStream::from(buf.freeze()))
            .send()
            .await
            .map_err(|e| Self::storage_error("UploadPart", e))?;

        let mut state = self.state.write().await;
        let entry = state
            .get_mut(&session.upload_id)
            .ok_or_else(|| Self::missing_state(&session.upload_id))?;
        // A re-uploaded part number supersedes the prior ETag
        if let Some(slot) = entry.parts.get_mut(index as usize) {
            *slot = Some(UploadedPart {
                part_number,
                etag: output.e_tag().map(str::to_string),
            });
        }

        Ok(())
    }

    async fn finalize_upload(&self, session: &UploadSession) -> Result<StorageLocation> {
        let (multipart_id, key, parts) = {
            let state = self.state.read().await;
            let entry = state
                .get(&session.upload_id)
                .ok_or_else(|| Self::missing_state(&session.upload_id))?;
            (
                entry.multipart_id.clone(),
                entry.key.clone(),
                entry.parts.clone(),
            )
        };

        // Slot order is part-number order; unset slots are omitted
        let mut mpu = CompletedMultipartUpload::builder();
        for part in parts.iter().flatten() {
            let mut builder = CompletedPart::builder().part_number(part.part_number);
            if let Some(etag) = &part.etag {
                builder = builder.e_tag(etag);
            }
            mpu = mpu.parts(builder.build());
        }

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&multipart_id)
            .multipart_upload(mpu.build())
            .send()
            .await
            .map_err(|e| Self::storage_error("CompleteMultipartUpload", e))?;

        self.state.write().await.remove(&session.upload_id);

        Ok(StorageLocation::S3 {
            bucket: self.bucket.clone(),
            key,
            url: output.location().map(str::to_string),
            etag: output.e_tag().map(str::to_string),
        })
    }

    async fn abort_upload(&self, session: &UploadSession) -> Result<()> {
        let entry = self.state.write().await.remove(&session.upload_id);
        let Some(entry) = entry else {
            // Nothing staged in this process
            return Ok(());
        };

        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&entry.key)
            .upload_id(&entry.multipart_id)
            .send()
            .await
            .map_err(|e| Self::storage_error("AbortMultipartUpload", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_object_key_layout() {
        let session = UploadSession {
            upload_id: "u_abc123".to_string(),
            file_name: Some("movie.mp4".to_string()),
            mime_type: None,
            metadata: None,
            file_size: 10,
            chunk_size: 10,
            total_chunks: 1,
            status: SessionStatus::Pending,
            created_at: Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
            updated_at: Utc::now(),
            expires_at: None,
        };

        assert_eq!(
            object_key("uploads/", &session),
            "uploads/2026/08/u_abc123.mp4"
        );

        let mut bare = session.clone();
        bare.file_name = None;
        assert_eq!(object_key("", &bare), "2026/08/u_abc123");
    }
}
