use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use std::time::Duration;
use torrin::driver::ChunkStream;
use torrin::session::UploadInit;

mod common;
use common::{payload, test_state};

fn body(data: Vec<u8>) -> ChunkStream {
    stream::iter(vec![Ok(Bytes::from(data))]).boxed()
}

fn init(file_size: u64) -> UploadInit {
    UploadInit {
        file_name: Some("sweep.bin".to_string()),
        file_size,
        desired_chunk_size: Some(file_size),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_ttl_sweep_removes_expired_session_and_staging() {
    let (state, paths) = test_state(Some(Duration::from_millis(10)));
    let service = &state.service;
    let data = payload(1024);

    let session = service.init_upload(init(1024)).await.unwrap();
    let upload_id = session.upload_id.clone();
    service
        .handle_chunk(&upload_id, 0, 1024, None, body(data))
        .await
        .unwrap();
    assert!(paths.temp.join(&upload_id).exists());

    tokio::time::sleep(Duration::from_millis(50)).await;

    // Expired sessions read as gone
    let err = service.get_status(&upload_id).await.unwrap_err();
    assert_eq!(err.code(), "UPLOAD_NOT_FOUND");

    let report = service.cleanup_expired_uploads().await.unwrap();
    assert_eq!(report.cleaned, 1);
    assert!(report.errors.is_empty());

    // Driver state is released before the record is deleted
    assert!(!paths.temp.join(&upload_id).exists());

    // Second sweep has nothing left to do
    let report = service.cleanup_expired_uploads().await.unwrap();
    assert_eq!(report.cleaned, 0);
}

#[tokio::test]
async fn test_completed_sessions_survive_the_ttl_sweep() {
    let (state, paths) = test_state(Some(Duration::from_millis(40)));
    let service = &state.service;
    let data = payload(1024);

    let session = service.init_upload(init(1024)).await.unwrap();
    let upload_id = session.upload_id.clone();
    service
        .handle_chunk(&upload_id, 0, 1024, None, body(data.clone()))
        .await
        .unwrap();
    let result = service.complete_upload(&upload_id, None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;

    let report = service.cleanup_expired_uploads().await.unwrap();
    assert_eq!(report.cleaned, 0);

    // The artifact is untouched
    let torrin::driver::StorageLocation::Local { path } = result.location else {
        panic!("expected local location");
    };
    assert_eq!(std::fs::read(path).unwrap(), data);
    drop(paths);
}

#[tokio::test]
async fn test_stale_sweep_only_removes_old_sessions() {
    let (state, _paths) = test_state(None);
    let service = &state.service;

    let old = service.init_upload(init(1024)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let fresh = service.init_upload(init(1024)).await.unwrap();

    let report = service
        .cleanup_stale_uploads(Duration::from_millis(30))
        .await
        .unwrap();
    assert_eq!(report.cleaned, 1);
    assert!(report.errors.is_empty());

    let err = service.get_status(&old.upload_id).await.unwrap_err();
    assert_eq!(err.code(), "UPLOAD_NOT_FOUND");
    assert!(service.get_status(&fresh.upload_id).await.is_ok());
}

#[tokio::test]
async fn test_chunk_activity_keeps_a_session_fresh() {
    let (state, _paths) = test_state(None);
    let service = &state.service;
    let data = payload(1024);

    let session = service.init_upload(init(1024)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    // The write refreshes updated_at, so the session is no longer stale
    service
        .handle_chunk(&session.upload_id, 0, 1024, None, body(data))
        .await
        .unwrap();

    let report = service
        .cleanup_stale_uploads(Duration::from_millis(30))
        .await
        .unwrap();
    assert_eq!(report.cleaned, 0);
}
