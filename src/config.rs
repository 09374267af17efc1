use crate::error::{Error, Result};
use byte_unit::Byte;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

#[derive(Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Base path the upload routes are nested under.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: Byte,
}

/// Which built-in storage driver persists chunk bytes.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Local,
    S3,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_driver")]
    pub driver: DriverKind,

    /// Staging area for in-flight chunk files (local driver).
    #[serde(default = "default_temp_path")]
    pub temp_path: PathBuf,

    /// Where finalized artifacts land (local driver).
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Place the artifact at `<data_path>/<upload_id>/<file_name>` instead of
    /// `<data_path>/<upload_id><ext>`.
    #[serde(default)]
    pub preserve_file_name: bool,

    #[serde(default)]
    pub s3: Option<S3Config>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    pub bucket: String,

    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible stores (MinIO, R2, ...).
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: Byte,

    /// Session TTL in seconds; 0 disables expiry.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: i64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_base_path() -> String {
    "/torrin/uploads".to_string()
}

fn default_max_payload_size() -> Byte {
    Byte::from_u64_with_unit(10, byte_unit::Unit::GiB).unwrap()
}

fn default_driver() -> DriverKind {
    DriverKind::Local
}

fn default_temp_path() -> PathBuf {
    PathBuf::from("data/.torrin-tmp")
}

fn default_data_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_key_prefix() -> String {
    "uploads/".to_string()
}

fn default_chunk_size() -> Byte {
    Byte::from_u64(crate::session::DEFAULT_CHUNK_SIZE)
}

fn default_session_ttl_secs() -> i64 {
    crate::session::DEFAULT_SESSION_TTL_SECS
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

impl Config {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Add config file sources in order of precedence (lower to higher)
        if config_path.is_none() {
            // Release builds: look in /etc/torrin/
            #[cfg(not(debug_assertions))]
            {
                builder = builder
                    .add_source(config::File::with_name("/etc/torrin/config").required(false));
            }

            // Debug builds: look in current working directory
            #[cfg(debug_assertions)]
            {
                builder = builder.add_source(config::File::with_name("config").required(false));
            }
        }

        // Custom config path (if specified via --config)
        if let Some(path) = config_path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        // Environment variables (highest precedence)
        builder = builder.add_source(config::Environment::with_prefix("TORRIN").separator("__"));

        let config = builder.build().map_err(|e| Error::InvalidRequest {
            msg: format!("Failed to load configuration: {}", e),
        })?;

        let mut config: Self = config.try_deserialize().map_err(|e| Error::InvalidRequest {
            msg: format!("Failed to deserialize configuration: {}", e),
        })?;

        config.storage.data_path = absolutize(config.storage.data_path)?;
        config.storage.temp_path = absolutize(config.storage.temp_path)?;

        if config.storage.driver == DriverKind::S3 && config.storage.s3.is_none() {
            return Err(Error::InvalidRequest {
                msg: "storage.driver = \"s3\" requires a [storage.s3] section".to_string(),
            });
        }

        Ok(config)
    }
}

/// Convert a relative path to absolute and resolve `.`/`..` components.
/// If canonicalize fails (e.g. the path does not exist yet), keep the
/// absolute form.
fn absolutize(mut path: PathBuf) -> Result<PathBuf> {
    if !path.is_absolute() {
        let cwd = std::env::current_dir().map_err(|e| Error::InvalidRequest {
            msg: format!("Failed to get current directory: {}", e),
        })?;
        path = cwd.join(path);
    }
    if let Ok(canonical) = path.canonicalize() {
        path = canonical;
    }
    Ok(path)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: default_base_path(),
            max_payload_size: default_max_payload_size(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_path = absolutize(default_data_path()).unwrap_or_else(|_| default_data_path());
        let temp_path = absolutize(default_temp_path()).unwrap_or_else(|_| default_temp_path());
        Self {
            driver: default_driver(),
            temp_path,
            data_path,
            preserve_file_name: false,
            s3: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: default_chunk_size(),
            session_ttl_secs: default_session_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("base_path", &self.base_path)
            .field(
                "max_payload_size",
                &format!(
                    "{}",
                    self.max_payload_size
                        .get_appropriate_unit(byte_unit::UnitType::Binary)
                ),
            )
            .finish()
    }
}
