use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::util::ServiceExt;

mod common;
use common::{payload, setup_test_app};

const BASE: &str = "/torrin/uploads";

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn init_session(app: &Router, body: serde_json::Value) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(BASE)
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn put_chunk(
    app: &Router,
    upload_id: &str,
    index: &str,
    data: Vec<u8>,
) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("{BASE}/{upload_id}/chunks/{index}"))
                .header("Content-Type", "application/octet-stream")
                .header("Content-Length", data.len())
                .body(Body::from(data))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn get_status(app: &Router, upload_id: &str) -> serde_json::Value {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("{BASE}/{upload_id}/status"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

async fn complete(app: &Router, upload_id: &str) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("{BASE}/{upload_id}/complete"))
                .header("Content-Type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn delete(app: &Router, upload_id: &str) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("{BASE}/{upload_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_init_returns_session_summary() {
    let (app, _paths) = setup_test_app();

    let response = init_session(
        &app,
        json!({
            "fileName": "movie.mp4",
            "fileSize": 2_500_000,
            "desiredChunkSize": 1_000_000,
            "metadata": {"owner": "tests"}
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let session = body_json(response).await;

    let upload_id = session["uploadId"].as_str().unwrap();
    assert!(upload_id.starts_with("u_"));
    assert_eq!(session["chunkSize"], 1_000_000);
    assert_eq!(session["totalChunks"], 3);
    assert_eq!(session["status"], "pending");
    assert_eq!(session["metadata"]["owner"], "tests");
}

#[tokio::test]
async fn test_init_rejects_zero_file_size() {
    let (app, _paths) = setup_test_app();

    let response = init_session(&app, json!({ "fileSize": 0 })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_init_clamps_small_chunk_size() {
    let (app, _paths) = setup_test_app();

    // Requested 1 byte; floor is 256 KiB
    let response = init_session(
        &app,
        json!({ "fileSize": 10_000_000, "desiredChunkSize": 1 }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let session = body_json(response).await;
    assert_eq!(session["chunkSize"], 262_144);
}

#[tokio::test]
async fn test_happy_path_three_chunks_in_order() {
    let (app, _paths) = setup_test_app();
    let data = payload(2_500_000);

    let response = init_session(
        &app,
        json!({
            "fileName": "artifact.bin",
            "fileSize": 2_500_000,
            "desiredChunkSize": 1_000_000
        }),
    )
    .await;
    let session = body_json(response).await;
    let upload_id = session["uploadId"].as_str().unwrap().to_string();

    // Expected sizes: 1_000_000, 1_000_000, 500_000
    for (index, range) in [(0, 0..1_000_000), (1, 1_000_000..2_000_000), (2, 2_000_000..2_500_000)] {
        let response = put_chunk(&app, &upload_id, &index.to_string(), data[range].to_vec()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let chunk = body_json(response).await;
        assert_eq!(chunk["receivedIndex"], index);
        assert_eq!(chunk["status"], "in_progress");

        let status = get_status(&app, &upload_id).await;
        let received = status["receivedChunks"].as_array().unwrap();
        assert_eq!(received.len(), index as usize + 1);
    }

    let response = complete(&app, &upload_id).await;
    assert_eq!(response.status(), StatusCode::OK);
    let result = body_json(response).await;
    assert_eq!(result["status"], "completed");
    assert_eq!(result["location"]["type"], "local");

    // Artifact is byte-identical to the source
    let path = result["location"]["path"].as_str().unwrap();
    assert_eq!(std::fs::read(path).unwrap(), data);

    let status = get_status(&app, &upload_id).await;
    assert_eq!(status["status"], "completed");
    assert!(status["missingChunks"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_out_of_order_upload() {
    let (app, _paths) = setup_test_app();
    let data = payload(2_500_000);

    let response = init_session(
        &app,
        json!({ "fileName": "a.bin", "fileSize": 2_500_000, "desiredChunkSize": 1_000_000 }),
    )
    .await;
    let session = body_json(response).await;
    let upload_id = session["uploadId"].as_str().unwrap().to_string();

    // PUT order 2, 0, 1
    put_chunk(&app, &upload_id, "2", data[2_000_000..].to_vec()).await;
    let status = get_status(&app, &upload_id).await;
    assert_eq!(status["receivedChunks"], json!([2]));
    assert_eq!(status["missingChunks"], json!([0, 1]));

    put_chunk(&app, &upload_id, "0", data[..1_000_000].to_vec()).await;
    let status = get_status(&app, &upload_id).await;
    assert_eq!(status["receivedChunks"], json!([0, 2]));

    put_chunk(&app, &upload_id, "1", data[1_000_000..2_000_000].to_vec()).await;

    let response = complete(&app, &upload_id).await;
    assert_eq!(response.status(), StatusCode::OK);
    let result = body_json(response).await;
    let path = result["location"]["path"].as_str().unwrap();
    assert_eq!(std::fs::read(path).unwrap(), data);
}

#[tokio::test]
async fn test_wrong_size_on_last_chunk() {
    let (app, _paths) = setup_test_app();

    let response = init_session(
        &app,
        json!({ "fileSize": 2_500_000, "desiredChunkSize": 1_000_000 }),
    )
    .await;
    let session = body_json(response).await;
    let upload_id = session["uploadId"].as_str().unwrap().to_string();

    // Last chunk should be 500_000 bytes
    let response = put_chunk(&app, &upload_id, "2", vec![0u8; 1_000_000]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["error"]["code"], "CHUNK_SIZE_MISMATCH");
    assert_eq!(error["error"]["details"]["expected"], 500_000);
    assert_eq!(error["error"]["details"]["actual"], 1_000_000);
}

#[tokio::test]
async fn test_complete_with_gap_reports_missing_chunks() {
    let (app, _paths) = setup_test_app();
    let data = payload(2_500_000);

    let response = init_session(
        &app,
        json!({ "fileSize": 2_500_000, "desiredChunkSize": 1_000_000 }),
    )
    .await;
    let session = body_json(response).await;
    let upload_id = session["uploadId"].as_str().unwrap().to_string();

    put_chunk(&app, &upload_id, "0", data[..1_000_000].to_vec()).await;
    put_chunk(&app, &upload_id, "2", data[2_000_000..].to_vec()).await;

    let response = complete(&app, &upload_id).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["error"]["code"], "MISSING_CHUNKS");
    assert_eq!(error["error"]["details"]["missingChunks"], json!([1]));
}

#[tokio::test]
async fn test_chunk_out_of_range() {
    let (app, _paths) = setup_test_app();

    let response = init_session(
        &app,
        json!({ "fileSize": 2_000_000, "desiredChunkSize": 1_000_000 }),
    )
    .await;
    let session = body_json(response).await;
    let upload_id = session["uploadId"].as_str().unwrap().to_string();

    let response = put_chunk(&app, &upload_id, "2", vec![0u8; 1_000_000]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["error"]["code"], "CHUNK_OUT_OF_RANGE");
}

#[tokio::test]
async fn test_request_validation() {
    let (app, _paths) = setup_test_app();

    let response = init_session(
        &app,
        json!({ "fileSize": 2_000_000, "desiredChunkSize": 1_000_000 }),
    )
    .await;
    let session = body_json(response).await;
    let upload_id = session["uploadId"].as_str().unwrap().to_string();

    // Non-numeric index
    let response = put_chunk(&app, &upload_id, "abc", vec![0u8; 16]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["error"]["code"], "INVALID_REQUEST");

    // Missing Content-Length
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("{BASE}/{upload_id}/chunks/0"))
                .header("Content-Type", "application/octet-stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Malformed upload id
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("{BASE}/not-an-id/status"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Well-formed but unknown id
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("{BASE}/u_doesnotexist/status"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error = body_json(response).await;
    assert_eq!(error["error"]["code"], "UPLOAD_NOT_FOUND");
}

#[tokio::test]
async fn test_chunk_hash_verification() {
    let (app, _paths) = setup_test_app();
    let data = payload(1_000_000);

    let response = init_session(
        &app,
        json!({ "fileSize": 1_000_000, "desiredChunkSize": 1_000_000 }),
    )
    .await;
    let session = body_json(response).await;
    let upload_id = session["uploadId"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("{BASE}/{upload_id}/chunks/0"))
                .header("Content-Type", "application/octet-stream")
                .header("Content-Length", data.len())
                .header("x-torrin-chunk-hash", "deadbeef")
                .body(Body::from(data.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error = body_json(response).await;
    assert_eq!(error["error"]["code"], "CHUNK_HASH_MISMATCH");

    // Correct hash is accepted
    use sha2::{Digest, Sha256};
    let hash = format!("{:x}", Sha256::digest(&data));
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("{BASE}/{upload_id}/chunks/0"))
                .header("Content-Type", "application/octet-stream")
                .header("Content-Length", data.len())
                .header("x-torrin-chunk-hash", hash)
                .body(Body::from(data))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_abort_is_idempotent_and_blocks_chunks() {
    let (app, paths) = setup_test_app();
    let data = payload(2_000_000);

    let response = init_session(
        &app,
        json!({ "fileSize": 2_000_000, "desiredChunkSize": 1_000_000 }),
    )
    .await;
    let session = body_json(response).await;
    let upload_id = session["uploadId"].as_str().unwrap().to_string();

    put_chunk(&app, &upload_id, "0", data[..1_000_000].to_vec()).await;
    assert!(paths.temp.join(&upload_id).exists());

    let response = delete(&app, &upload_id).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!paths.temp.join(&upload_id).exists());

    // Repeated DELETE on a canceled session stays 204
    let response = delete(&app, &upload_id).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Chunks and completion are refused after cancel
    let response = put_chunk(&app, &upload_id, "1", data[1_000_000..].to_vec()).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error = body_json(response).await;
    assert_eq!(error["error"]["code"], "UPLOAD_CANCELED");

    let response = complete(&app, &upload_id).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_delete_fails_against_completed_session() {
    let (app, _paths) = setup_test_app();
    let data = payload(1_000_000);

    let response = init_session(
        &app,
        json!({ "fileSize": 1_000_000, "desiredChunkSize": 1_000_000 }),
    )
    .await;
    let session = body_json(response).await;
    let upload_id = session["uploadId"].as_str().unwrap().to_string();

    put_chunk(&app, &upload_id, "0", data).await;
    let response = complete(&app, &upload_id).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = delete(&app, &upload_id).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error = body_json(response).await;
    assert_eq!(error["error"]["code"], "UPLOAD_ALREADY_COMPLETED");
}

#[tokio::test]
async fn test_duplicate_chunk_upload_is_accepted() {
    let (app, _paths) = setup_test_app();
    let data = payload(2_000_000);

    let response = init_session(
        &app,
        json!({ "fileSize": 2_000_000, "desiredChunkSize": 1_000_000 }),
    )
    .await;
    let session = body_json(response).await;
    let upload_id = session["uploadId"].as_str().unwrap().to_string();

    put_chunk(&app, &upload_id, "0", data[..1_000_000].to_vec()).await;
    let response = put_chunk(&app, &upload_id, "0", data[..1_000_000].to_vec()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let status = get_status(&app, &upload_id).await;
    assert_eq!(status["receivedChunks"], json!([0]));
    assert_eq!(status["missingChunks"], json!([1]));
}
