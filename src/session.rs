use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use utoipa::ToSchema;

/// Default chunk size: 1 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Smallest chunk size a client may negotiate: 256 KiB
pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;

/// Largest chunk size a client may negotiate: 100 MiB
pub const MAX_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Default session expiration: 24 hours
pub const DEFAULT_SESSION_TTL_SECS: i64 = 86_400;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_RANDOM_LEN: usize = 8;

/// Session lifecycle state. Only advances along
/// `pending -> in_progress -> completed | canceled`; `failed` is reserved for
/// drivers that surface unrecoverable write errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

/// Authoritative record of one upload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Caller-supplied key/value map, carried end-to-end unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| t <= Utc::now())
    }

    /// Byte length chunk `index` must carry for this session.
    pub fn expected_chunk_size(&self, index: u32) -> u64 {
        expected_chunk_size(index, self.total_chunks, self.file_size, self.chunk_size)
    }

    /// Extension of the original filename, dot included (e.g. ".bin").
    pub fn file_extension(&self) -> Option<String> {
        self.file_name
            .as_deref()
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
    }
}

/// Inputs to session creation, shared between the HTTP surface and the
/// service so the wire request and the service contract cannot drift.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_chunk_size: Option<u64>,
}

/// Partial session update applied by the store. `updated_at` always advances.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
        }
    }
}

/// Generate a fresh upload id: `u_<base36 millis><8 base36 random>`.
pub fn generate_upload_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_RANDOM_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("u_{}{}", to_base36(millis), suffix)
}

/// Accepts any `u_`-prefixed id longer than the prefix itself.
pub fn is_valid_upload_id(upload_id: &str) -> bool {
    upload_id.starts_with("u_") && upload_id.len() > 2
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(ID_ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 digits are ascii")
}

/// Normalize a requested chunk size: clamp to the legal range, then cap at
/// the file size so a single-chunk upload never over-allocates.
pub fn clamp_chunk_size(desired: Option<u64>, default: u64, file_size: u64) -> u64 {
    desired
        .unwrap_or(default)
        .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
        .min(file_size)
}

pub fn total_chunks(file_size: u64, chunk_size: u64) -> u32 {
    file_size.div_ceil(chunk_size) as u32
}

/// Expected byte length of chunk `index`. Every chunk is `chunk_size` except
/// the last, which carries the remainder (or a full chunk when the file size
/// divides evenly).
pub fn expected_chunk_size(index: u32, total_chunks: u32, file_size: u64, chunk_size: u64) -> u64 {
    if index + 1 == total_chunks {
        file_size - (total_chunks as u64 - 1) * chunk_size
    } else {
        chunk_size
    }
}

/// Sorted complement of `received` over `[0, total_chunks)`.
pub fn missing_chunks(total_chunks: u32, received: &BTreeSet<u32>) -> Vec<u32> {
    (0..total_chunks).filter(|i| !received.contains(i)).collect()
}

/// Whole-number progress percentage, capped at 100.
pub fn progress_percentage(bytes_uploaded: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 100;
    }
    let pct = (bytes_uploaded as f64 / total_bytes as f64 * 100.0).round() as u64;
    pct.min(100) as u8
}
