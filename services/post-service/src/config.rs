use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the post service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Bearer token verification
    pub auth: AuthConfig,
    /// S3 attachment storage
    pub s3: S3Config,
    /// Wide-column post table (PostgreSQL)
    pub database: DatabaseConfig,
    /// Search index
    pub search: SearchConfig,
    /// Content filter
    #[serde(default)]
    pub filter: FilterConfig,
    /// Orphan reconciliation job
    #[serde(default)]
    pub reconcile: ReconcileConfig,
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
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body for `POST /post`
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Token verification configuration
#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret shared with the token issuer
    pub jwt_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .finish()
    }
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding post attachments
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Base URL under which objects are publicly served (e.g. a CDN)
    pub public_base_url: Option<String>,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
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

/// Search index configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Elasticsearch node URL
    pub url: String,
    /// Index holding post documents
    #[serde(default = "default_index")]
    pub index: String,
    /// Radius used when a search omits `range`
    #[serde(default = "default_radius_km")]
    pub default_radius_km: f64,
    /// Upper bound on hits returned by one geo query
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Reject unparsable search coordinates instead of treating them as zero
    #[serde(default = "default_true")]
    pub strict_coordinates: bool,
}

/// Content filter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Case-sensitive substrings that hide a post from search results
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
}

/// Reconciliation job configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Run the periodic orphan sweep
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between sweeps
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Blobs younger than this may belong to an in-flight ingestion
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "post-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    32 * 1024 * 1024 // 32MB
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
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

fn default_index() -> String {
    "around".to_string()
}

fn default_radius_km() -> f64 {
    200.0
}

fn default_max_results() -> usize {
    1000
}

fn default_denylist() -> Vec<String> {
    vec!["fuck".to_string()]
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_grace_period_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/around").required(false))
            .add_source(config::File::with_name("/etc/around/around").required(false))
            // Override with environment variables
            // AROUND__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("AROUND")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("filter.denylist")
                    .with_list_parse_key("api.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would only fail later at request time
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.jwt_secret.trim().is_empty() {
            anyhow::bail!("auth.jwt_secret must be set");
        }
        if self.s3.bucket.is_empty() {
            anyhow::bail!("s3.bucket must be set");
        }
        if !(self.search.default_radius_km.is_finite() && self.search.default_radius_km > 0.0) {
            anyhow::bail!(
                "search.default_radius_km must be positive, got {}",
                self.search.default_radius_km
            );
        }
        if self.s3.part_size_bytes < 5 * 1024 * 1024 {
            anyhow::bail!("s3.part_size_bytes must be at least 5MB");
        }
        Ok(())
    }

    /// Get reconciliation interval as Duration
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
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

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            denylist: default_denylist(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_reconcile_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}
