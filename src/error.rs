use derive_more::Display;
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display)]
pub enum Error {
    #[display("Upload session not found: {upload_id}")]
    UploadNotFound { upload_id: String },

    #[display("Upload already completed: {upload_id}")]
    UploadAlreadyCompleted { upload_id: String },

    #[display("Upload canceled: {upload_id}")]
    UploadCanceled { upload_id: String },

    #[display("Chunk index {index} out of range (0-{})", total_chunks.saturating_sub(1))]
    ChunkOutOfRange { index: u32, total_chunks: u32 },

    #[display("Chunk size mismatch: expected {expected}, got {actual}")]
    ChunkSizeMismatch { expected: u64, actual: u64 },

    #[display("Chunk hash mismatch: expected {expected}, got {actual}")]
    ChunkHashMismatch { expected: String, actual: String },

    #[display("Chunk {index} already uploaded")]
    ChunkAlreadyUploaded { index: u32 },

    #[display("Upload incomplete: {} chunk(s) missing", missing.len())]
    MissingChunks { missing: Vec<u32> },

    #[display("File hash mismatch: expected {expected}, got {actual}")]
    FileHashMismatch { expected: String, actual: String },

    #[display("Storage error: {msg}")]
    Storage { msg: String },

    #[display("IO error at {path}: {error}")]
    Io { error: std::io::Error, path: String },

    #[display("Invalid request: {msg}")]
    InvalidRequest { msg: String },

    #[display("Network error: {msg}")]
    Network { msg: String },

    #[display("Timeout: {msg}")]
    Timeout { msg: String },

    #[display("Internal error: {msg}")]
    Internal { msg: String },
}

impl std::error::Error for Error {}

// Implement From<std::io::Error> for cases where path context is not available
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io {
            error,
            path: "<unknown>".to_string(),
        }
    }
}

impl Error {
    /// Wire-protocol error code, as it appears in `{"error": {"code": ...}}`.
    pub fn code(&self) -> &'static str {
        match self {
            Error::UploadNotFound { .. } => "UPLOAD_NOT_FOUND",
            Error::UploadAlreadyCompleted { .. } => "UPLOAD_ALREADY_COMPLETED",
            Error::UploadCanceled { .. } => "UPLOAD_CANCELED",
            Error::ChunkOutOfRange { .. } => "CHUNK_OUT_OF_RANGE",
            Error::ChunkSizeMismatch { .. } => "CHUNK_SIZE_MISMATCH",
            Error::ChunkHashMismatch { .. } => "CHUNK_HASH_MISMATCH",
            Error::ChunkAlreadyUploaded { .. } => "CHUNK_ALREADY_UPLOADED",
            Error::MissingChunks { .. } => "MISSING_CHUNKS",
            Error::FileHashMismatch { .. } => "FILE_HASH_MISMATCH",
            Error::Storage { .. } | Error::Io { .. } => "STORAGE_ERROR",
            Error::InvalidRequest { .. } => "INVALID_REQUEST",
            Error::Network { .. } => "NETWORK_ERROR",
            Error::Timeout { .. } => "TIMEOUT_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the wire code maps to.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::UploadNotFound { .. } => StatusCode::NOT_FOUND,
            Error::UploadAlreadyCompleted { .. }
            | Error::UploadCanceled { .. }
            | Error::ChunkAlreadyUploaded { .. } => StatusCode::CONFLICT,
            Error::ChunkOutOfRange { .. }
            | Error::ChunkSizeMismatch { .. }
            | Error::ChunkHashMismatch { .. }
            | Error::MissingChunks { .. }
            | Error::FileHashMismatch { .. }
            | Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Network { .. } | Error::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage { .. } | Error::Io { .. } | Error::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Structured `details` payload for codes that carry one.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::ChunkSizeMismatch { expected, actual } => {
                Some(json!({ "expected": expected, "actual": actual }))
            }
            Error::ChunkHashMismatch { expected, actual } => {
                Some(json!({ "expected": expected, "actual": actual }))
            }
            Error::MissingChunks { missing } => Some(json!({ "missingChunks": missing })),
            _ => None,
        }
    }

    /// Reconstruct a typed error from a parsed wire body. Unknown codes fall
    /// back to INTERNAL_ERROR so the message is never silently dropped.
    pub fn from_wire(code: &str, message: String, details: Option<serde_json::Value>) -> Self {
        let detail_u64 = |key: &str| {
            details
                .as_ref()
                .and_then(|d| d.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or_default()
        };
        let detail_str = |key: &str| {
            details
                .as_ref()
                .and_then(|d| d.get(key))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        match code {
            "UPLOAD_NOT_FOUND" => Error::UploadNotFound { upload_id: message },
            "UPLOAD_ALREADY_COMPLETED" => Error::UploadAlreadyCompleted { upload_id: message },
            "UPLOAD_CANCELED" => Error::UploadCanceled { upload_id: message },
            "CHUNK_OUT_OF_RANGE" => Error::ChunkOutOfRange {
                index: detail_u64("index") as u32,
                total_chunks: detail_u64("totalChunks") as u32,
            },
            "CHUNK_SIZE_MISMATCH" => Error::ChunkSizeMismatch {
                expected: detail_u64("expected"),
                actual: detail_u64("actual"),
            },
            "CHUNK_HASH_MISMATCH" => Error::ChunkHashMismatch {
                expected: detail_str("expected"),
                actual: detail_str("actual"),
            },
            "CHUNK_ALREADY_UPLOADED" => Error::ChunkAlreadyUploaded {
                index: detail_u64("index") as u32,
            },
            "MISSING_CHUNKS" => Error::MissingChunks {
                missing: details
                    .as_ref()
                    .and_then(|d| d.get("missingChunks"))
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_u64())
                            .map(|v| v as u32)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "FILE_HASH_MISMATCH" => Error::FileHashMismatch {
                expected: detail_str("expected"),
                actual: detail_str("actual"),
            },
            "STORAGE_ERROR" => Error::Storage { msg: message },
            "INVALID_REQUEST" => Error::InvalidRequest { msg: message },
            "NETWORK_ERROR" => Error::Network { msg: message },
            "TIMEOUT_ERROR" => Error::Timeout { msg: message },
            _ => Error::Internal { msg: message },
        }
    }
}

// Implement axum IntoResponse for Error
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let message = match &self {
            Error::Io { error, path } => {
                // Log full error with path internally; never expose file paths
                tracing::error!("IO error at path {}: {}", path, error);
                "Storage operation failed".to_string()
            }
            Error::Storage { msg } => {
                tracing::error!("Storage error: {}", msg);
                "Storage operation failed".to_string()
            }
            Error::Internal { msg } => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut error = json!({
            "code": self.code(),
            "message": message,
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }

        let body = axum::Json(json!({ "error": error }));

        (self.status_code(), body).into_response()
    }
}

/// Extension trait for converting I/O errors to custom errors with path context
pub trait ResultIoExt<T> {
    fn map_io_err(self, path: &std::path::Path) -> Result<T>;
}

impl<T> ResultIoExt<T> for std::result::Result<T, std::io::Error> {
    fn map_io_err(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|error| Error::Io {
            error,
            path: path.display().to_string(),
        })
    }
}
