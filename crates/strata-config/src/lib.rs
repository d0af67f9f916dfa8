//! # strata-config
//!
//! Configuration for Strata components.
//!
//! Loads configuration from:
//! 1. `~/.strata/config.toml` (global)
//! 2. `.strata/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub mod logging;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.strata/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Project config (.strata/config.toml) - overrides global
        let project_path = Path::new(".strata/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let contents = std::fs::read_to_string(project_path)?;
            config = toml::from_str(&contents)?;
        }

        // 3. Environment variable overrides
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse a config from a specific file, still honoring env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Global config path: ~/.strata/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".strata/config.toml"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("STRATA_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("STRATA_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Ok(endpoint) = std::env::var("STRATA_ENDPOINT") {
            self.storage.endpoint = Some(endpoint);
        }
        if let Ok(bucket) = std::env::var("STRATA_BUCKET") {
            self.storage.bucket = Some(bucket);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.chunk_size < self.limits.max_inline_size {
            return Err(ConfigError::Invalid(
                "limits.chunk_size must be >= limits.max_inline_size".to_string(),
            ));
        }
        if self.storage.backend == BackendKind::ObjectStore
            && (self.storage.endpoint.is_none() || self.storage.bucket.is_none())
        {
            return Err(ConfigError::Invalid(
                "object-store backend requires storage.endpoint and storage.bucket".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap()
    }
}

/// Which storage backend holds content bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Local,
    ObjectStore,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Root directory for the local backend
    pub data_dir: PathBuf,
    /// SQLite metadata database path
    pub db_path: PathBuf,
    /// Object-store endpoint URL (object-store backend only)
    pub endpoint: Option<String>,
    /// Object-store bucket (object-store backend only)
    pub bucket: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            data_dir: PathBuf::from("~/.strata/data"),
            db_path: PathBuf::from("~/.strata/strata.db"),
            endpoint: None,
            bucket: None,
        }
    }
}

/// Payload size thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Payloads at or below this are stored inline in metadata (bytes)
    pub max_inline_size: u64,
    /// Chunk size for large payloads (bytes)
    pub chunk_size: u64,
    /// Hard cap on a single object (bytes)
    pub max_content_size: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inline_size: 1024 * 1024,
            chunk_size: 5 * 1024 * 1024,
            max_content_size: 1024 * 1024 * 1024,
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.backend, BackendKind::Local);
        assert_eq!(config.limits.max_inline_size, 1024 * 1024);
        assert_eq!(config.limits.chunk_size, 5 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[storage]"));
        assert!(toml_str.contains("[limits]"));
        assert!(toml_str.contains("backend = \"local\""));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.limits.chunk_size, parsed.limits.chunk_size);
        assert_eq!(config.storage.data_dir, parsed.storage.data_dir);
    }

    #[test]
    fn test_object_store_requires_endpoint() {
        let parsed: Config = toml::from_str(
            r#"
            [storage]
            backend = "object-store"
            "#,
        )
        .unwrap();
        assert!(matches!(parsed.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_overlapping_thresholds() {
        let parsed: Config = toml::from_str(
            r#"
            [limits]
            max_inline_size = 1000
            chunk_size = 100
            "#,
        )
        .unwrap();
        assert!(matches!(parsed.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [storage]
            backend = "local"
            data_dir = "/var/lib/strata"

            [limits]
            chunk_size = 2097152
            "#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/strata"));
        assert_eq!(config.limits.chunk_size, 2 * 1024 * 1024);
        // unspecified sections keep defaults
        assert_eq!(config.limits.max_inline_size, 1024 * 1024);
    }

    #[test]
    fn test_expand_home() {
        let expanded = expand_home(Path::new("~/.strata/data"));
        assert!(!expanded.starts_with("~"));
        assert_eq!(
            expand_home(Path::new("/absolute/path")),
            PathBuf::from("/absolute/path")
        );
    }
}
