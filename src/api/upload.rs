use crate::api::AppState;
use crate::error::{Error, Result};
use crate::service::{CompleteResult, UploadStatus};
use crate::session::{SessionStatus, UploadInit, UploadSession, is_valid_upload_id};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

/// Header carrying an optional per-chunk SHA-256 hex digest.
pub const CHUNK_HASH_HEADER: &str = "x-torrin-chunk-hash";

/// Response from accepting a chunk
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    /// Upload session ID
    pub upload_id: String,
    /// Index of the chunk that was just persisted
    pub received_index: u32,
    /// Session status after the write
    pub status: SessionStatus,
}

/// Request body for completing an upload
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    /// Whole-file hash; advisory (chunks are verified individually)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

fn require_upload_id(upload_id: &str) -> Result<()> {
    if !is_valid_upload_id(upload_id) {
        return Err(Error::InvalidRequest {
            msg: format!("Malformed upload id: {upload_id}"),
        });
    }
    Ok(())
}

/// Create a new upload session
#[utoipa::path(
    post,
    path = "/",
    request_body = UploadInit,
    responses(
        (status = 201, description = "Upload session created", body = UploadSession),
        (status = 400, description = "Invalid request"),
        (status = 500, description = "Internal server error")
    ),
    tag = "uploads"
)]
pub async fn init_upload(
    State(state): State<Arc<AppState>>,
    Json(init): Json<UploadInit>,
) -> Result<impl IntoResponse> {
    let session = state.service.init_upload(init).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// Upload a single chunk
#[utoipa::path(
    put,
    path = "/{upload_id}/chunks/{index}",
    params(
        ("upload_id" = String, Path, description = "Upload session ID"),
        ("index" = u32, Path, description = "Chunk index (0-based)")
    ),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Chunk persisted", body = ChunkUploadResponse),
        (status = 400, description = "Invalid chunk"),
        (status = 404, description = "Upload session not found"),
        (status = 409, description = "Session already completed or canceled"),
        (status = 500, description = "Storage error")
    ),
    tag = "uploads"
)]
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Path((upload_id, index)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse> {
    require_upload_id(&upload_id)?;

    let index: u32 = index.parse().map_err(|_| Error::InvalidRequest {
        msg: format!("Chunk index must be a non-negative integer, got: {index}"),
    })?;

    let size: u64 = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::InvalidRequest {
            msg: "Content-Length header is required".to_string(),
        })?;
    if size == 0 {
        return Err(Error::InvalidRequest {
            msg: "Chunk body must not be empty".to_string(),
        });
    }

    let hash = headers
        .get(CHUNK_HASH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let stream = body
        .into_data_stream()
        .map(|part| part.map_err(std::io::Error::other))
        .boxed();

    state
        .service
        .handle_chunk(&upload_id, index, size, hash.as_deref(), stream)
        .await?;

    Ok(Json(ChunkUploadResponse {
        upload_id,
        received_index: index,
        status: SessionStatus::InProgress,
    }))
}

/// Report received and missing chunks for a session
#[utoipa::path(
    get,
    path = "/{upload_id}/status",
    params(
        ("upload_id" = String, Path, description = "Upload session ID")
    ),
    responses(
        (status = 200, description = "Session status", body = UploadStatus),
        (status = 404, description = "Upload session not found")
    ),
    tag = "uploads"
)]
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<Json<UploadStatus>> {
    require_upload_id(&upload_id)?;
    let status = state.service.get_status(&upload_id).await?;
    Ok(Json(status))
}

/// Assemble the final artifact once all chunks have arrived
#[utoipa::path(
    post,
    path = "/{upload_id}/complete",
    params(
        ("upload_id" = String, Path, description = "Upload session ID")
    ),
    request_body = CompleteUploadRequest,
    responses(
        (status = 200, description = "Upload finalized", body = CompleteResult),
        (status = 400, description = "Chunks missing"),
        (status = 404, description = "Upload session not found"),
        (status = 409, description = "Session already completed or canceled"),
        (status = 500, description = "Storage error")
    ),
    tag = "uploads"
)]
pub async fn complete_upload(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
    body: Bytes,
) -> Result<Json<CompleteResult>> {
    require_upload_id(&upload_id)?;

    // An absent body reads the same as `{}`
    let request: CompleteUploadRequest = if body.is_empty() {
        CompleteUploadRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| Error::InvalidRequest {
            msg: format!("Malformed completion body: {e}"),
        })?
    };

    let result = state
        .service
        .complete_upload(&upload_id, request.hash.as_deref())
        .await?;
    Ok(Json(result))
}

/// Cancel an upload session and release staged chunks
#[utoipa::path(
    delete,
    path = "/{upload_id}",
    params(
        ("upload_id" = String, Path, description = "Upload session ID")
    ),
    responses(
        (status = 204, description = "Upload canceled"),
        (status = 404, description = "Upload session not found"),
        (status = 409, description = "Session already completed")
    ),
    tag = "uploads"
)]
pub async fn abort_upload(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse> {
    require_upload_id(&upload_id)?;
    state.service.abort_upload(&upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
