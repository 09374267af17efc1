use crate::error::{Result, ResultIoExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Client-side record of a partially-uploaded session, persisted so a fresh
/// process can resume where the last one stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientUploadState {
    pub upload_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received_chunks: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Key/value persistence for upload state plus the fingerprint index that
/// maps a file key back to its last upload id.
pub trait ResumeStore: Send + Sync {
    fn save_state(&self, state: &ClientUploadState) -> Result<()>;
    fn load_state(&self, upload_id: &str) -> Result<Option<ClientUploadState>>;
    fn remove_state(&self, upload_id: &str) -> Result<()>;

    fn set_file_key(&self, file_key: &str, upload_id: &str) -> Result<()>;
    fn find_by_file(&self, file_key: &str) -> Result<Option<String>>;
    fn remove_file_key(&self, file_key: &str) -> Result<()>;
}

const STATE_PREFIX: &str = "torrin_upload_";
const INDEX_FILE: &str = "torrin_file_index.json";

/// Filesystem-backed resume store: one JSON file per session under
/// `torrin_upload_<uploadId>.json`, plus `torrin_file_index.json` holding the
/// `{fileKey: uploadId}` map.
pub struct FsResumeStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles on the index file
    index_lock: Mutex<()>,
}

impl FsResumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_io_err(&dir)?;
        Ok(Self {
            dir,
            index_lock: Mutex::new(()),
        })
    }

    fn state_path(&self, upload_id: &str) -> PathBuf {
        // Ids are `u_<base36>`, already safe as a file name component
        self.dir.join(format!("{STATE_PREFIX}{upload_id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn read_index(&self) -> Result<HashMap<String, String>> {
        let path = self.index_path();
        match std::fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e).map_io_err(&path),
        }
    }

    fn write_index(&self, index: &HashMap<String, String>) -> Result<()> {
        let path = self.index_path();
        let data = serde_json::to_vec_pretty(index).map_err(std::io::Error::other)?;
        std::fs::write(&path, data).map_io_err(&path)
    }
}

impl ResumeStore for FsResumeStore {
    fn save_state(&self, state: &ClientUploadState) -> Result<()> {
        let path = self.state_path(&state.upload_id);
        let data = serde_json::to_vec_pretty(state).map_err(std::io::Error::other)?;
        std::fs::write(&path, data).map_io_err(&path)
    }

    fn load_state(&self, upload_id: &str) -> Result<Option<ClientUploadState>> {
        let path = self.state_path(upload_id);
        match std::fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).map_io_err(&path),
        }
    }

    fn remove_state(&self, upload_id: &str) -> Result<()> {
        let path = self.state_path(upload_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).map_io_err(&path),
        }
    }

    fn set_file_key(&self, file_key: &str, upload_id: &str) -> Result<()> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = self.read_index()?;
        index.insert(file_key.to_string(), upload_id.to_string());
        self.write_index(&index)
    }

    fn find_by_file(&self, file_key: &str) -> Result<Option<String>> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_index()?.get(file_key).cloned())
    }

    fn remove_file_key(&self, file_key: &str) -> Result<()> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = self.read_index()?;
        if index.remove(file_key).is_some() {
            self.write_index(&index)?;
        }
        Ok(())
    }
}
