pub mod api;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod service;
pub mod session;
pub mod store;

use api::{AppState, build_router};
use config::{Config, DriverKind};
use driver::{LocalDriver, S3Driver, StorageDriver};
use service::{ServiceOptions, UploadService, spawn_cleanup_task};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use store::MemoryStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber for logging
/// Uses journald when running as a service (no terminal), fmt when running interactively
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "torrin=info,tower_http=warn".into());

    if std::io::stdout().is_terminal() {
        // Running in a terminal, use formatted output
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        // Running as a service, use journald
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_journald::layer().expect("Failed to connect to journald"))
            .init();
    }
}

/// Run the upload server
pub async fn run_service(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    tracing::info!("torrin version {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(config_path).unwrap_or_else(|_| {
        tracing::warn!("Failed to load config, using defaults");
        Config::default()
    });

    tracing::info!("Starting server with config: {:?}", config);

    // Select the storage driver
    let driver: Arc<dyn StorageDriver> = match config.storage.driver {
        DriverKind::Local => {
            let local = LocalDriver::new(
                config.storage.temp_path.clone(),
                config.storage.data_path.clone(),
                config.storage.preserve_file_name,
            );

            // Sessions don't survive restarts, so orphaned staging is garbage
            match local.purge_staging().await {
                Ok(count) if count > 0 => {
                    tracing::info!(count, "Purged orphaned staging directories on startup");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to purge staging directories on startup");
                }
                _ => {}
            }

            Arc::new(local)
        }
        DriverKind::S3 => {
            let Some(s3_config) = config.storage.s3.as_ref() else {
                return Err("storage.driver = \"s3\" requires a [storage.s3] section".into());
            };
            Arc::new(S3Driver::from_config(s3_config).await)
        }
    };

    let store = Arc::new(MemoryStore::new());
    let session_ttl = (config.upload.session_ttl_secs > 0)
        .then(|| Duration::from_secs(config.upload.session_ttl_secs as u64));

    let service = Arc::new(UploadService::new(
        store,
        driver,
        ServiceOptions {
            default_chunk_size: config.upload.default_chunk_size.as_u64(),
            session_ttl,
            max_file_size: Some(config.server.max_payload_size.as_u64()),
        },
    ));

    // Spawn background task to sweep expired upload sessions
    spawn_cleanup_task(service.clone(), config.upload.cleanup_interval_secs);

    let state = Arc::new(AppState {
        service,
        config: config.clone(),
    });

    let app = build_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("API documentation available at http://{}/api-docs", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for a shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
