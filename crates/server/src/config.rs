//! Configuration persistence for the GameForge server.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/gameforge-server/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine a config directory for this platform")]
    NoConfigDir,
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port to listen on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Directory of model manifest YAML files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_dir: Option<String>,

    /// Directory for verified weight downloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,

    /// Directory of pre-registered image assets for super-resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets_dir: Option<String>,

    /// Maximum number of models resident in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_models: Option<usize>,

    /// Memory budget for resident model weights, in GiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_gb: Option<u64>,

    /// Maximum size of a single weight download, in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_download_mb: Option<u64>,

    /// Timeout for a single weight download, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_timeout_secs: Option<u64>,

    /// Comma-separated list of allowed CORS origins. "*" allows all origins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<String>,

    /// Comma-separated list of allowed CORS HTTP methods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_methods: Option<String>,

    /// Comma-separated list of allowed CORS headers. "*" allows all headers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_headers: Option<String>,

    /// Default log level when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl ServerConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("gameforge-server").join("config.toml"))
    }

    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &ServerConfig) {
        if other.host.is_some() {
            self.host = other.host.clone();
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.manifest_dir.is_some() {
            self.manifest_dir = other.manifest_dir.clone();
        }
        if other.cache_dir.is_some() {
            self.cache_dir = other.cache_dir.clone();
        }
        if other.assets_dir.is_some() {
            self.assets_dir = other.assets_dir.clone();
        }
        if other.max_models.is_some() {
            self.max_models = other.max_models;
        }
        if other.max_memory_gb.is_some() {
            self.max_memory_gb = other.max_memory_gb;
        }
        if other.max_download_mb.is_some() {
            self.max_download_mb = other.max_download_mb;
        }
        if other.download_timeout_secs.is_some() {
            self.download_timeout_secs = other.download_timeout_secs;
        }
        if other.allowed_origins.is_some() {
            self.allowed_origins = other.allowed_origins.clone();
        }
        if other.allowed_methods.is_some() {
            self.allowed_methods = other.allowed_methods.clone();
        }
        if other.allowed_headers.is_some() {
            self.allowed_headers = other.allowed_headers.clone();
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = ServerConfig {
            host: Some("127.0.0.1".to_string()),
            port: Some(9000),
            manifest_dir: Some("/srv/manifests".to_string()),
            max_models: Some(2),
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let loaded = ServerConfig::load_from(&path).unwrap();
        assert_eq!(loaded.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(loaded.port, Some(9000));
        assert_eq!(loaded.manifest_dir.as_deref(), Some("/srv/manifests"));
        assert_eq!(loaded.max_models, Some(2));
        assert!(loaded.cache_dir.is_none());
    }

    #[test]
    fn merge_prefers_other() {
        let mut base = ServerConfig {
            port: Some(8000),
            host: Some("0.0.0.0".to_string()),
            ..Default::default()
        };
        let other = ServerConfig {
            port: Some(9000),
            ..Default::default()
        };
        base.merge(&other);
        assert_eq!(base.port, Some(9000));
        assert_eq!(base.host.as_deref(), Some("0.0.0.0"));
    }

    #[test]
    fn load_from_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(matches!(
            ServerConfig::load_from(&path).unwrap_err(),
            ConfigError::Io(_)
        ));
    }

    #[test]
    fn rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(
            ServerConfig::load_from(&path).unwrap_err(),
            ConfigError::Parse(_)
        ));
    }
}
