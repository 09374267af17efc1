use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use torrin::api::{AppState, build_router};
use torrin::config::Config;
use torrin::driver::LocalDriver;
use torrin::service::{ServiceOptions, UploadService};
use torrin::store::MemoryStore;

pub struct TestPaths {
    pub temp: PathBuf,
    pub data: PathBuf,
}

/// Build app state backed by a local driver under a leaked temp directory
/// (the directory must outlive the returned state).
pub fn test_state(session_ttl: Option<Duration>) -> (Arc<AppState>, TestPaths) {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().to_path_buf();

    // Don't drop temp_dir - leak it so it persists for the test
    std::mem::forget(temp_dir);

    let temp = root.join("staging");
    let data = root.join("artifacts");

    let mut config = Config::default();
    config.storage.temp_path = temp.clone();
    config.storage.data_path = data.clone();

    let driver = LocalDriver::new(temp.clone(), data.clone(), false);
    let service = Arc::new(UploadService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(driver),
        ServiceOptions {
            session_ttl,
            ..Default::default()
        },
    ));

    let state = Arc::new(AppState { service, config });
    (state, TestPaths { temp, data })
}

pub fn setup_test_app() -> (Router, TestPaths) {
    let (state, paths) = test_state(None);
    (build_router(state), paths)
}

/// Serve the app on an ephemeral port; returns the upload endpoint URL.
pub async fn spawn_test_server() -> (String, TestPaths) {
    let (router, paths) = setup_test_app();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{addr}/torrin/uploads"), paths)
}

/// Deterministic pseudo-random payload so artifacts can be compared
/// byte-for-byte.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i.wrapping_mul(31).wrapping_add(7) & 0xff) as u8)
        .collect()
}
