mod events;
mod http;
mod resume;
mod source;
mod upload;

pub use events::{SubscriptionId, UploadProgress, UploadState};
pub use http::ApiClient;
pub use resume::{ClientUploadState, FsResumeStore, ResumeStore};
pub use source::UploadSource;
pub use upload::Upload;

use std::collections::HashMap;
use std::time::Duration;

/// Default number of chunk uploads in flight
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Hard ceiling on in-flight chunk uploads
pub const MAX_CONCURRENCY: usize = 10;

/// Default number of tries per chunk, first attempt included
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default base delay between retries
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Tuning knobs for a client-side upload.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Base URL of the upload endpoint, e.g.
    /// `http://localhost:3000/torrin/uploads`.
    pub endpoint: String,
    /// Chunk size to request at init; the server's clamped value wins.
    pub chunk_size: Option<u64>,
    pub max_concurrency: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// Send a SHA-256 hash header with every chunk.
    pub chunk_hashes: bool,
    pub mime_type: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl UploadOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            chunk_size: None,
            max_concurrency: DEFAULT_CONCURRENCY,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            chunk_hashes: false,
            mime_type: None,
            metadata: None,
        }
    }
}
