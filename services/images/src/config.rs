use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the image service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Local file storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// External analyzer configuration
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Stuck-record repair configuration
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
    /// Upper bound on a single store operation in seconds
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Where uploads and annotated copies are written
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding originals and annotated copies
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,
    /// Maximum accepted upload size in bytes (50MB default)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// External analyzer invocation
///
/// The analyzer is run as
/// `{program} {script} --weights {weights} --img {image_size} --conf {confidence} --source {image}`
/// and writes numbered `exp*` directories under `output_dir`.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    /// Interpreter or executable to launch
    #[serde(default = "default_analyzer_program")]
    pub program: PathBuf,
    /// Detection script passed as the first argument
    #[serde(default = "default_analyzer_script")]
    pub script: PathBuf,
    /// Model weights
    #[serde(default = "default_analyzer_weights")]
    pub weights: PathBuf,
    /// Inference input size in pixels
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    /// Minimum confidence for a detection to be reported
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Root under which the analyzer creates its `exp*` output directories
    #[serde(default = "default_analyzer_output_dir")]
    pub output_dir: PathBuf,
    /// Name of the JSON result file inside an output directory
    #[serde(default = "default_result_file")]
    pub result_file: String,
    /// Analyzer timeout in seconds
    #[serde(default = "default_analyzer_timeout_secs")]
    pub timeout_secs: u64,
    /// Longest wait for a free analyzer slot, in seconds
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    /// Maximum analyzer runs in flight
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Header carrying the authenticated user id, set by the gateway
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
}

/// Periodic repair of records left pending
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Enable the reconciler task
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between passes
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Pending records older than this are marked failed; defaults to the
    /// analyzer's queue wait plus run timeout plus 60s
    pub stale_after_secs: Option<u64>,
}

// Default value functions
fn default_service_name() -> String {
    "image-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
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

fn default_query_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("public/images")
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024 // 50MB
}

fn default_analyzer_program() -> PathBuf {
    PathBuf::from("imagedetection/yolov5/yolov5_venv/bin/python")
}

fn default_analyzer_script() -> PathBuf {
    PathBuf::from("imagedetection/yolov5/detect.py")
}

fn default_analyzer_weights() -> PathBuf {
    PathBuf::from("imagedetection/yolov5s-cat-dog.pt")
}

fn default_image_size() -> u32 {
    640
}

fn default_confidence() -> f32 {
    0.25
}

fn default_analyzer_output_dir() -> PathBuf {
    PathBuf::from("imagedetection/yolov5/runs/detect")
}

fn default_result_file() -> String {
    "detections.json".to_string()
}

fn default_analyzer_timeout_secs() -> u64 {
    120
}

fn default_queue_timeout_secs() -> u64 {
    120
}

fn default_max_concurrent_runs() -> usize {
    1 // runs share one output root
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_identity_header() -> String {
    "x-user-id".to_string()
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/images").required(false))
            .add_source(config::File::with_name("/etc/images/images").required(false))
            // Override with environment variables
            // IMAGES__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("IMAGES")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.analyzer.confidence) {
            anyhow::bail!(
                "analyzer.confidence must be within [0, 1], got {}",
                self.analyzer.confidence
            );
        }
        if self.analyzer.max_concurrent_runs == 0 {
            anyhow::bail!("analyzer.max_concurrent_runs must be at least 1");
        }
        if self.api.identity_header.trim().is_empty() {
            anyhow::bail!("api.identity_header must not be empty");
        }
        Ok(())
    }

    /// Age after which a pending record is considered stuck
    pub fn stale_after(&self) -> Duration {
        self.reconcile
            .stale_after_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.analyzer.max_invocation() + Duration::from_secs(60))
    }

    /// Get reconcile interval as Duration
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Upper bound on a single store operation
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl AnalyzerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    /// Longest a single analysis can take, waiting for a slot included
    pub fn max_invocation(&self) -> Duration {
        self.queue_timeout() + self.timeout()
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

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            images_dir: default_images_dir(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            program: default_analyzer_program(),
            script: default_analyzer_script(),
            weights: default_analyzer_weights(),
            image_size: default_image_size(),
            confidence: default_confidence(),
            output_dir: default_analyzer_output_dir(),
            result_file: default_result_file(),
            timeout_secs: default_analyzer_timeout_secs(),
            queue_timeout_secs: default_queue_timeout_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            identity_header: default_identity_header(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reconcile_interval_secs(),
            stale_after_secs: None,
        }
    }
}
