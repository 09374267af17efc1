use crate::api::{ChunkUploadResponse, CompleteUploadRequest};
use crate::error::{Error, Result};
use crate::service::{CompleteResult, UploadStatus};
use crate::session::{UploadInit, UploadSession};
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::Deserialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Deserialize)]
struct WireError {
    code: String,
    message: String,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    error: WireError,
}

/// Typed protocol client: one method per wire operation, with error bodies
/// decoded back into the shared taxonomy.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ApiClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }

    pub async fn init_upload(&self, init: &UploadInit) -> Result<UploadSession> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(init)
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }

    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        index: u32,
        data: Bytes,
        hash: Option<&str>,
    ) -> Result<ChunkUploadResponse> {
        let url = format!("{}/{upload_id}/chunks/{index}", self.endpoint);
        let mut request = self
            .http
            .put(&url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, data.len())
            .body(data);
        if let Some(hash) = hash {
            request = request.header(crate::api::CHUNK_HASH_HEADER, hash);
        }

        let response = request.send().await.map_err(transport_error)?;
        decode(response).await
    }

    pub async fn get_status(&self, upload_id: &str) -> Result<UploadStatus> {
        let url = format!("{}/{upload_id}/status", self.endpoint);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }

    pub async fn complete_upload(
        &self,
        upload_id: &str,
        hash: Option<String>,
    ) -> Result<CompleteResult> {
        let url = format!("{}/{upload_id}/complete", self.endpoint);
        let response = self
            .http
            .post(&url)
            .json(&CompleteUploadRequest { hash })
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }

    /// Cancel the session. A 404 is success: the session is already gone.
    pub async fn abort_upload(&self, upload_id: &str) -> Result<()> {
        let url = format!("{}/{upload_id}", self.endpoint);
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(decode_error(response).await)
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout { msg: e.to_string() }
    } else {
        Error::Network { msg: e.to_string() }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(decode_error(response).await);
    }
    response.json().await.map_err(|e| Error::Network {
        msg: format!("Failed to parse response body: {e}"),
    })
}

/// Map a non-success response back onto the error taxonomy. Responses that do
/// not carry the wire error shape become NETWORK_ERROR with the raw payload.
async fn decode_error(response: reqwest::Response) -> Error {
    let status = response.status();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            return Error::Network {
                msg: format!("HTTP {status}: failed to read error body: {e}"),
            };
        }
    };

    match serde_json::from_slice::<WireErrorBody>(&body) {
        Ok(wire) => Error::from_wire(&wire.error.code, wire.error.message, wire.error.details),
        Err(_) => Error::Network {
            msg: format!("HTTP {status}: {}", String::from_utf8_lossy(&body)),
        },
    }
}
