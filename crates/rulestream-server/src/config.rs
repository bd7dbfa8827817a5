use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Export queue, worker and delivery settings
    #[serde(default)]
    pub exports: ExportsConfig,
    /// Named search backend configurations usable by custom exports
    #[serde(default)]
    pub search_backends: BTreeMap<String, SearchBackendConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Largest page the search backend serves in one request.
pub const MAX_BATCH_SIZE: u64 = 10_000;

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Export validations
        let ex = &self.exports;
        if ex.queue_capacity == 0 {
            return Err("exports.queue_capacity must be > 0".into());
        }
        if ex.max_concurrent_jobs == 0 {
            return Err("exports.max_concurrent_jobs must be > 0".into());
        }
        if ex.max_search_requests == 0 {
            return Err("exports.max_search_requests must be > 0".into());
        }
        if !(1..=MAX_BATCH_SIZE).contains(&ex.batch_size) {
            return Err(format!("exports.batch_size must be within 1..={MAX_BATCH_SIZE}"));
        }
        if ex.download_chunk_size == 0 {
            return Err("exports.download_chunk_size must be > 0".into());
        }
        if ex.cleanup_interval_seconds == 0 {
            return Err("exports.cleanup_interval_seconds must be > 0".into());
        }
        if !ex.direct_download {
            match ex.indirect_download_url.as_deref().map(str::trim) {
                None | Some("") => {
                    return Err(
                        "exports.direct_download=false requires exports.indirect_download_url"
                            .into(),
                    );
                }
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    return Err(format!(
                        "exports.indirect_download_url must be an http(s) URL, got '{url}'"
                    ));
                }
                Some(_) => {}
            }
        }
        if let Some(name) = self.search_backends.keys().find(|n| n.trim().is_empty()) {
            return Err(format!("search_backends entry '{name}' needs a name"));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let ip: std::net::IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(std::net::IpAddr::from([0, 0, 0, 0]));
        SocketAddr::from((ip, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// Include backend error details in 500 responses
    #[serde(default)]
    pub verbose_errors: bool,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            verbose_errors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Export subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportsConfig {
    /// Directory receiving queued export artifacts
    #[serde(default = "default_export_path")]
    pub export_path: PathBuf,
    /// Maximum number of pending + running jobs
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Maximum search requests in one custom export
    #[serde(default = "default_max_search_requests")]
    pub max_search_requests: usize,
    /// Stream artifacts from disk (true) or redirect to `indirect_download_url` (false)
    #[serde(default = "default_true")]
    pub direct_download: bool,
    #[serde(default)]
    pub indirect_download_url: Option<String>,
    #[serde(default = "default_download_chunk_size")]
    pub download_chunk_size: usize,
    /// Page size requested from the search backend
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Reject requests naming unknown facts instead of skipping them
    #[serde(default)]
    pub strict_fact_resolution: bool,
}

fn default_export_path() -> PathBuf {
    std::env::temp_dir().join("rulestream-exports")
}
fn default_queue_capacity() -> usize {
    20
}
fn default_max_concurrent_jobs() -> usize {
    2
}
fn default_max_search_requests() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_download_chunk_size() -> usize {
    64 * 1024
}
fn default_batch_size() -> u64 {
    500
}
fn default_retention_hours() -> u64 {
    24
}
fn default_cleanup_interval_seconds() -> u64 {
    3600
}

impl Default for ExportsConfig {
    fn default() -> Self {
        Self {
            export_path: default_export_path(),
            queue_capacity: default_queue_capacity(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_search_requests: default_max_search_requests(),
            direct_download: true,
            indirect_download_url: None,
            download_chunk_size: default_download_chunk_size(),
            batch_size: default_batch_size(),
            retention_hours: default_retention_hours(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            strict_fact_resolution: false,
        }
    }
}

impl ExportsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SearchBackendConfig {
    /// Custom exports are refused unless explicitly enabled
    #[serde(default)]
    pub export_activated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// JSON fixtures seeding the in-memory fact store and search backend
    #[serde(default)]
    pub fixtures: Option<PathBuf>,
}

/// Layered loading: built-in defaults, then the TOML file, then
/// `RULESTREAM__<SECTION>__<KEY>` environment variables.
pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File, FileFormat};
    use std::path::Path;

    pub const ENV_PREFIX: &str = "RULESTREAM";

    /// Loads and validates the configuration. A missing file is an error only
    /// when `required` is set; otherwise defaults and environment apply.
    pub fn load_config(path: &Path, required: bool) -> Result<AppConfig, String> {
        let file = File::from(path).format(FileFormat::Toml).required(required);
        let merged: AppConfig = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| format!("{}: {e}", path.display()))?;
        merged.validate()?;
        Ok(merged)
    }
}
