use anyhow::{Context, Result};
use confyg::{env, Confygery};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anchorage_core::Distance;

/// How the backing vector store is obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendMode {
    /// Connect to an already running store at `url`.
    External,
    /// Run (or reuse) a local container managed by anchorage.
    #[default]
    SelfManaged,
}

impl BackendMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::External => "external",
            Self::SelfManaged => "self-managed",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for anchorage.
///
/// Configuration is loaded from multiple sources with the following priority:
/// 1. CLI arguments (highest priority)
/// 2. Environment variables (ANCHOR_* prefix)
/// 3. Config file (~/.config/anchorage/config.toml)
/// 4. Built-in defaults (lowest priority)
///
/// The struct is built once at startup and passed by reference to the
/// lifecycle controller and client constructors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend mode.
    ///
    /// Can be set via:
    /// - ENV: ANCHOR_MODE (external | self-managed)
    /// - Config: mode = "external"
    pub mode: BackendMode,

    /// URL of an external backing store (required in external mode).
    ///
    /// Can be set via:
    /// - CLI: --url http://host:6333
    /// - ENV: ANCHOR_URL
    pub url: Option<String>,

    /// API key sent to the backing store, if it requires one.
    pub api_key: Option<String>,

    /// Port the managed store should listen on when free.
    pub preferred_port: u16,

    /// First port scanned when the preferred port is busy.
    pub port_range_start: u16,

    /// Last port scanned when the preferred port is busy.
    pub port_range_end: u16,

    /// Persistent storage directory mounted into the managed store.
    ///
    /// Default: ~/.local/share/anchorage/qdrant
    pub data_dir: PathBuf,

    /// Container name used to find and stop the managed store.
    pub container_name: String,

    /// Container image for the managed store.
    pub image: String,

    /// Delay between liveness polls while waiting for readiness.
    pub health_check_interval_ms: u64,

    /// Overall readiness deadline.
    pub health_check_timeout_secs: u64,

    /// How long the backend may stay degraded before operations fail.
    pub degraded_timeout_secs: u64,

    /// Background probe period once ready (0 disables the probe).
    pub probe_interval_secs: u64,

    /// Grace period for in-flight operations and container stop.
    pub shutdown_grace_secs: u64,

    /// Timeout applied to every HTTP request.
    pub request_timeout_secs: u64,

    /// Retries for metadata reads and writes before giving up.
    pub persistence_retries: usize,

    /// Reserved collection holding collection-model bindings.
    pub metadata_collection: String,

    /// Distance metric used when a binding is created lazily.
    pub default_distance: Distance,

    /// Base URL of an OpenAI-compatible embeddings endpoint.
    ///
    /// Can be set via:
    /// - ENV: ANCHOR_EMBEDDING_URL
    /// - Config: embedding_url = "http://localhost:1234"
    pub embedding_url: Option<String>,

    /// Bearer token for the embeddings endpoint.
    pub embedding_api_key: Option<String>,

    /// Result count used by `find` when the caller gives none.
    pub search_limit: usize,

    /// Largest batch accepted by `store_batch`.
    pub max_batch_size: usize,

    /// Logger options.
    #[serde(skip_serializing)]
    pub logging: twyg::Opts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: BackendMode::default(),
            url: None,
            api_key: None,
            preferred_port: 6333,
            port_range_start: 6333,
            port_range_end: 6433,
            data_dir: default_data_dir(),
            container_name: "anchorage_qdrant".to_string(),
            image: "qdrant/qdrant".to_string(),
            health_check_interval_ms: 500,
            health_check_timeout_secs: 30,
            degraded_timeout_secs: 120,
            probe_interval_secs: 15,
            shutdown_grace_secs: 10,
            request_timeout_secs: 10,
            persistence_retries: 3,
            metadata_collection: "_anchorage_bindings".to_string(),
            default_distance: Distance::Cosine,
            embedding_url: None,
            embedding_api_key: None,
            search_limit: 10,
            max_batch_size: 256,
            logging: twyg::Opts::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Searches for config file at: ~/.config/anchorage/config.toml
    /// Reads environment variables with ANCHOR_ prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// the resulting configuration is inconsistent.
    pub fn load() -> Result<Self> {
        let config_path = config_file_path();

        let mut builder = Confygery::new().context("Failed to create config builder")?;

        if config_path.exists() {
            let path_str = config_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Config path contains invalid UTF-8"))?;
            builder
                .add_file(path_str)
                .context("Failed to load config file")?;
        }

        let env_opts = env::Options::with_top_level("anchor");
        builder
            .add_env(env_opts)
            .context("Failed to load environment variables")?;

        let config: Self = builder.build().context("Failed to build configuration")?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration, pointing at an external store.
    ///
    /// This is used when the --url CLI flag is provided.
    pub fn load_with_url(url: String) -> Result<Self> {
        let mut config = Self::load()?;
        config.mode = BackendMode::External;
        config.url = Some(url);
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.mode == BackendMode::External && self.url.is_none() {
            anyhow::bail!("mode = \"external\" requires url to be set");
        }
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            anyhow::bail!(
                "invalid port range {}-{}",
                self.port_range_start,
                self.port_range_end
            );
        }
        if self.metadata_collection.trim().is_empty() {
            anyhow::bail!("metadata_collection must not be empty");
        }
        if self.health_check_interval_ms == 0 {
            anyhow::bail!("health_check_interval_ms must be positive");
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    pub fn degraded_timeout(&self) -> Duration {
        Duration::from_secs(self.degraded_timeout_secs)
    }

    /// Background probe period, or `None` when disabled.
    pub fn probe_interval(&self) -> Option<Duration> {
        (self.probe_interval_secs > 0).then(|| Duration::from_secs(self.probe_interval_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Get the default managed-store data directory.
///
/// Returns: ~/.local/share/anchorage/qdrant (or platform equivalent)
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("anchorage")
        .join("qdrant")
}

/// Get the config file path.
///
/// Returns:
/// - Linux: ~/.config/anchorage/config.toml
/// - macOS: ~/Library/Application Support/anchorage/config.toml
/// - Windows: %APPDATA%\anchorage\config.toml
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("anchorage")
        .join("config.toml")
}

/// Get the example config file content.
pub fn example_config() -> &'static str {
    r#"# Anchorage Configuration File
#
# Configuration is loaded from multiple sources with the following priority:
# 1. CLI arguments (highest priority)
# 2. Environment variables (ANCHOR_* prefix)
# 3. This config file
# 4. Built-in defaults (lowest priority)

# Backend mode: "self-managed" runs a local Qdrant container,
# "external" connects to `url`.
mode = "self-managed"

# External backing store (required when mode = "external")
#url = "http://localhost:6333"
#api_key = "your-qdrant-api-key"

# Managed container settings
preferred_port = 6333
port_range_start = 6333
port_range_end = 6433
container_name = "anchorage_qdrant"
image = "qdrant/qdrant"
#data_dir = "/path/to/qdrant/storage"

# Health checking
health_check_interval_ms = 500
health_check_timeout_secs = 30
degraded_timeout_secs = 120
probe_interval_secs = 15

# Shutdown and request limits
shutdown_grace_secs = 10
request_timeout_secs = 10
persistence_retries = 3

# Collection bindings
metadata_collection = "_anchorage_bindings"
default_distance = "cosine"

# OpenAI-compatible embeddings endpoint (LM Studio, Ollama, TEI, OpenAI)
#embedding_url = "http://localhost:1234"
#embedding_api_key = "sk-..."

search_limit = 10
max_batch_size = 256
"#
}

/// Create default config file if it doesn't exist.
///
/// Returns true if a new file was created, false if it already existed.
pub fn ensure_config_file() -> Result<bool> {
    let config_path = config_file_path();

    if config_path.exists() {
        return Ok(false);
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    std::fs::write(&config_path, example_config()).context("Failed to write config file")?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mode, BackendMode::SelfManaged);
        assert!(config.url.is_none());
        assert_eq!(config.preferred_port, 6333);
        assert!(!config.data_dir.as_os_str().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_durations() {
        let config = Config::default();
        assert_eq!(config.health_check_interval(), Duration::from_millis(500));
        assert_eq!(config.health_check_timeout(), Duration::from_secs(30));
        assert_eq!(config.probe_interval(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_probe_interval_zero_disables_probe() {
        let config = Config {
            probe_interval_secs: 0,
            ..Config::default()
        };
        assert!(config.probe_interval().is_none());
    }

    #[test]
    fn test_external_mode_requires_url() {
        let config = Config {
            mode: BackendMode::External,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_port_range_is_rejected() {
        let config = Config {
            port_range_start: 7000,
            port_range_end: 6000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.mode, BackendMode::SelfManaged);
        assert_eq!(config.default_distance, Distance::Cosine);
        assert_eq!(config.metadata_collection, "_anchorage_bindings");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config =
            toml::from_str("mode = \"external\"\nurl = \"http://db:6333\"\n").unwrap();
        assert_eq!(config.mode, BackendMode::External);
        assert_eq!(config.url.as_deref(), Some("http://db:6333"));
        assert_eq!(config.port_range_end, 6433);
        assert!(config.validate().is_ok());
    }
}
