mod upload;

pub use upload::{CHUNK_HASH_HEADER, ChunkUploadResponse, CompleteUploadRequest};

use crate::config::Config;
use crate::service::UploadService;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;
use utoipa_rapidoc::RapiDoc;

pub struct AppState {
    pub service: Arc<UploadService>,
    pub config: Config,
}

#[derive(OpenApi)]
#[openapi(
    components(
        schemas(
            crate::session::UploadSession,
            crate::session::UploadInit,
            crate::session::SessionStatus,
            crate::service::UploadStatus,
            crate::service::CompleteResult,
            crate::driver::StorageLocation,
            upload::ChunkUploadResponse,
            upload::CompleteUploadRequest,
        )
    ),
    tags(
        (name = "uploads", description = "Resumable chunked upload endpoints")
    )
)]
pub struct ApiDoc;

/// Create the upload API router with all routes
pub fn create_api_router(state: Arc<AppState>) -> OpenApiRouter {
    OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(upload::init_upload))
        .routes(routes!(upload::upload_chunk))
        .routes(routes!(upload::get_status))
        .routes(routes!(upload::complete_upload))
        .routes(routes!(upload::abort_upload))
        .with_state(state)
}

/// Assemble the full application router: upload routes nested under the
/// configured base path, API docs, and the HTTP middleware stack.
pub fn build_router(state: Arc<AppState>) -> Router {
    let base_path = state.config.server.base_path.clone();
    let (api_router, api_doc) = create_api_router(state).split_for_parts();

    let doc_routes = Router::new()
        .merge(RapiDoc::with_openapi("/api-docs/openapi.json", api_doc).path("/api-docs"));

    Router::new()
        .nest(&base_path, api_router)
        .merge(doc_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
