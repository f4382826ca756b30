//! Application configuration for kbingest.
//!
//! User config lives at `~/.kbingest/kbingest.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "kbingest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".kbingest";

/// Default number of URLs processed concurrently per batch window.
pub const DEFAULT_CONCURRENCY: usize = 5;

// ---------------------------------------------------------------------------
// Config structs (matching kbingest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Per-domain request throttling.
    #[serde(default)]
    pub rate_limit: RateLimitSection,

    /// HTTP fetch settings.
    #[serde(default)]
    pub fetch: FetchSection,

    /// Scraper parameter cache settings.
    #[serde(default)]
    pub params: ParamsSection,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding the database and stored files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// URLs processed concurrently per batch window.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Skip content already owned by another completed URL.
    #[serde(default = "default_true")]
    pub detect_duplicates: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            concurrency: default_concurrency(),
            detect_duplicates: true,
        }
    }
}

fn default_data_dir() -> String {
    "~/.kbingest/data".into()
}
fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}
fn default_true() -> bool {
    true
}

/// `[rate_limit]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    /// When false, waiting for a domain never suspends.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum ms between requests to the same domain.
    #[serde(default = "default_interval")]
    pub default_interval_ms: u64,

    /// Per-domain interval overrides in ms.
    #[serde(default)]
    pub domains: BTreeMap<String, u64>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            default_interval_ms: default_interval(),
            domains: BTreeMap::new(),
        }
    }
}

fn default_interval() -> u64 {
    1000
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSection {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Responses larger than this are rejected.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    /// Responses slower than this record a "slow response" warning.
    #[serde(default = "default_slow_response_ms")]
    pub slow_response_ms: u64,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_redirects: default_max_redirects(),
            max_body_bytes: default_max_body_bytes(),
            slow_response_ms: default_slow_response_ms(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_redirects() -> usize {
    5
}
fn default_max_body_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_slow_response_ms() -> u64 {
    5000
}

/// `[params]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsSection {
    /// Seconds a cached scraper parameter set stays fresh.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for ParamsSection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// URLs processed concurrently per batch window.
    pub concurrency: usize,
    /// Default for the duplicate-content check when a run does not override it.
    pub detect_duplicates: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            detect_duplicates: true,
        }
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.defaults.concurrency.max(1),
            detect_duplicates: config.defaults.detect_duplicates,
        }
    }
}

/// Runtime rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub default_interval: Duration,
    pub domain_intervals: BTreeMap<String, Duration>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RateLimitConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            enabled: config.rate_limit.enabled,
            default_interval: Duration::from_millis(config.rate_limit.default_interval_ms),
            domain_intervals: config
                .rate_limit
                .domains
                .iter()
                .map(|(domain, ms)| (domain.to_lowercase(), Duration::from_millis(*ms)))
                .collect(),
        }
    }
}

/// Runtime HTTP fetch configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub max_body_bytes: u64,
    pub slow_response: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.fetch.timeout_secs),
            max_redirects: config.fetch.max_redirects,
            max_body_bytes: config.fetch.max_body_bytes,
            slow_response: Duration::from_millis(config.fetch.slow_response_ms),
        }
    }
}

impl AppConfig {
    /// Resolved data directory (`~` expanded).
    pub fn data_dir(&self) -> Result<PathBuf> {
        expand_home(&self.defaults.data_dir)
    }

    /// TTL for cached scraper parameters.
    pub fn params_ttl(&self) -> Duration {
        Duration::from_secs(self.params.cache_ttl_secs)
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| IngestError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.kbingest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| IngestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.kbingest/kbingest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| IngestError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| IngestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| IngestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| IngestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("default_interval_ms"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.concurrency, 5);
        assert!(parsed.rate_limit.enabled);
        assert_eq!(parsed.params.cache_ttl_secs, 300);
    }

    #[test]
    fn config_with_domain_overrides() {
        let toml_str = r#"
[defaults]
concurrency = 2

[rate_limit]
default_interval_ms = 500

[rate_limit.domains]
"Example.com" = 200
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        let limits = RateLimitConfig::from(&config);
        assert_eq!(limits.default_interval, Duration::from_millis(500));
        assert_eq!(
            limits.domain_intervals.get("example.com"),
            Some(&Duration::from_millis(200))
        );
        assert_eq!(PipelineConfig::from(&config).concurrency, 2);
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let mut app = AppConfig::default();
        app.defaults.concurrency = 0;
        assert_eq!(PipelineConfig::from(&app).concurrency, 1);
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        let p = expand_home("/var/lib/kbingest").expect("expand");
        assert_eq!(p, PathBuf::from("/var/lib/kbingest"));
    }
}
