use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration shared by the booth server and device binaries
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Document store configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Blob store configuration
    #[serde(default)]
    pub blob: BlobConfig,
    /// Capture lock configuration
    #[serde(default)]
    pub lock: LockConfig,
    /// Tablet capture configuration
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Gallery configuration
    #[serde(default)]
    pub gallery: GalleryConfig,
    /// Theme configuration
    #[serde(default)]
    pub themes: ThemeConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Which backend a store uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackend {
    S3,
    Memory,
}

/// Document store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Backend selection
    #[serde(default = "default_document_backend")]
    pub backend: DocumentBackend,
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Blob store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfig {
    /// Backend selection
    #[serde(default = "default_blob_backend")]
    pub backend: BlobBackend,
    /// S3 bucket name
    #[serde(default)]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Download URL expiration in seconds
    #[serde(default = "default_download_url_expiry_secs")]
    pub download_url_expiry_secs: u64,
    /// Prefix for raw captures uploaded by tablets
    #[serde(default = "default_raw_prefix")]
    pub raw_prefix: String,
}

/// Capture lock configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Document id of the lock record in the `camera` collection
    #[serde(default = "default_resource_id")]
    pub resource_id: String,
    /// Attempts before a conflicting transaction is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Retry delay cap in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Age after which a held lock may be reclaimed; unset disables reclaiming
    pub stale_after_secs: Option<u64>,
}

/// Tablet capture configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Countdown length before the shot
    #[serde(default = "default_countdown_secs")]
    pub countdown_secs: u32,
    /// Output aspect ratio (width / height)
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: f64,
    /// Flip the saved image to match a mirrored preview
    #[serde(default)]
    pub mirror: bool,
    /// File the camera process keeps overwriting with its latest frame
    #[serde(default = "default_frame_path")]
    pub frame_path: PathBuf,
    /// Local key-value file holding the device identity
    #[serde(default = "default_identity_path")]
    pub identity_path: PathBuf,
}

/// Gallery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GalleryConfig {
    /// Blob prefix reconciled into the `images` collection
    #[serde(default = "default_source_prefix")]
    pub source_prefix: String,
    /// Page size when the client does not ask for one
    #[serde(default = "default_gallery_limit")]
    pub default_limit: usize,
    /// Maximum paths per delete request
    #[serde(default = "default_max_delete_batch")]
    pub max_delete_batch: usize,
}

/// Theme configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ThemeConfig {
    /// Maximum theme length in characters
    #[serde(default = "default_theme_max_length")]
    pub max_length: usize,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum upload body size in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "booth-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_document_backend() -> DocumentBackend {
    DocumentBackend::Postgres
}

fn default_blob_backend() -> BlobBackend {
    BlobBackend::S3
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_download_url_expiry_secs() -> u64 {
    7 * 24 * 3600 // presigned URLs max out at one week
}

fn default_raw_prefix() -> String {
    "user_images_raw/".to_string()
}

fn default_resource_id() -> String {
    "resource".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    1000
}

fn default_countdown_secs() -> u32 {
    10
}

fn default_aspect_ratio() -> f64 {
    3.0 / 4.0
}

fn default_frame_path() -> PathBuf {
    PathBuf::from("/run/booth/frame.png")
}

fn default_identity_path() -> PathBuf {
    PathBuf::from("booth-device.json")
}

fn default_source_prefix() -> String {
    "user_images/".to_string()
}

fn default_gallery_limit() -> usize {
    50
}

fn default_max_delete_batch() -> usize {
    100
}

fn default_theme_max_length() -> usize {
    25
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/booth").required(false))
            .add_source(config::File::with_name("/etc/booth/booth").required(false))
            // Override with environment variables
            // BOOTH__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("BOOTH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.backend == DocumentBackend::Postgres && self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        if self.blob.backend == BlobBackend::S3 && self.blob.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("blob.bucket".to_string()));
        }

        if self.lock.resource_id.is_empty() || self.lock.resource_id.contains('/') {
            return Err(ConfigValidationError::InvalidValue {
                field: "lock.resource_id".to_string(),
                message: "must be a non-empty document id".to_string(),
            });
        }

        if self.lock.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "lock.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.lock.stale_after_secs == Some(0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "lock.stale_after_secs".to_string(),
                message: "must be at least 1 when set".to_string(),
            });
        }

        if !(self.capture.aspect_ratio.is_finite() && self.capture.aspect_ratio > 0.0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.aspect_ratio".to_string(),
                message: "must be a positive number".to_string(),
            });
        }

        if self.themes.max_length == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "themes.max_length".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.gallery.max_delete_batch == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "gallery.max_delete_batch".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

impl LockConfig {
    /// Get the reclaim timeout as Duration, if reclaiming is enabled
    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_secs.map(Duration::from_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_document_backend(),
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: default_blob_backend(),
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            download_url_expiry_secs: default_download_url_expiry_secs(),
            raw_prefix: default_raw_prefix(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            resource_id: default_resource_id(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            stale_after_secs: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            countdown_secs: default_countdown_secs(),
            aspect_ratio: default_aspect_ratio(),
            mirror: false,
            frame_path: default_frame_path(),
            identity_path: default_identity_path(),
        }
    }
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            source_prefix: default_source_prefix(),
            default_limit: default_gallery_limit(),
            max_delete_batch: default_max_delete_batch(),
        }
    }
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            max_length: default_theme_max_length(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
