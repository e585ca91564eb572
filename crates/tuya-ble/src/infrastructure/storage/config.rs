//! TOML-based configuration for the engine and its known devices.
//!
//! # File layout
//!
//! ```toml
//! [engine]
//! response_timeout_ms = 10000
//! connect_attempts = 5
//!
//! [[devices]]
//! address = "DC:23:4D:12:34:56"
//! uuid = "tuya5a1b2c3d4e5f"
//! local_key = "Yk3b9Xq0pLm2Vw7R"
//! device_id = "bf5a1b2c3d4e5f6a7b"
//! category = "wk"
//! product_id = "ajrhf1aj"
//! device_name = "Living room radiator"
//! ```
//!
//! Every `[engine]` field has a serde default (see `EngineConfig`), and the
//! `[engine]` table itself may be omitted.  Each `[[devices]]` entry must
//! carry the five required credential fields; entries missing any of them
//! are rejected when the file is loaded.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::config::EngineConfig;
use crate::application::credentials::DeviceCredentials;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A `[[devices]]` entry is incomplete.
    #[error("invalid device credentials: {0}")]
    InvalidCredentials(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// One known device: its BLE address plus credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceEntry {
    pub address: String,
    #[serde(flatten)]
    pub credentials: DeviceCredentials,
}

impl AppConfig {
    /// Checks that every device entry has an address and complete credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCredentials`] naming the first bad entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, entry) in self.devices.iter().enumerate() {
            if entry.address.trim().is_empty() {
                return Err(ConfigError::InvalidCredentials(format!(
                    "device #{index} has no address"
                )));
            }
            let missing = entry.credentials.missing_fields();
            if !missing.is_empty() {
                return Err(ConfigError::InvalidCredentials(format!(
                    "{}: missing {}",
                    entry.address,
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Parses and validates configuration text.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] for malformed TOML and
/// [`ConfigError::InvalidCredentials`] for incomplete device entries.
pub fn from_toml_str(content: &str) -> Result<AppConfig, ConfigError> {
    let cfg: AppConfig = toml::from_str(content)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// plus everything [`from_toml_str`] returns.
pub fn load_from_path(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => from_toml_str(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_to_path(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[engine]
response_timeout_ms = 5000

[[devices]]
address = "DC:23:4D:12:34:56"
uuid = "tuya5a1b2c3d4e5f"
local_key = "Yk3b9Xq0pLm2Vw7R"
device_id = "bf5a1b2c3d4e5f6a7b"
category = "wk"
product_id = "ajrhf1aj"
device_name = "Living room radiator"
"#;

    #[test]
    fn test_empty_file_yields_defaults() {
        let cfg = from_toml_str("").expect("empty config is valid");
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.engine.connect_attempts, 100);
    }

    #[test]
    fn test_device_entries_are_parsed() {
        // Arrange / Act
        let cfg = from_toml_str(SAMPLE).expect("parse");

        // Assert
        assert_eq!(cfg.engine.response_timeout_ms, 5000);
        assert_eq!(cfg.engine.mtu, 20);
        assert_eq!(cfg.devices.len(), 1);
        let entry = &cfg.devices[0];
        assert_eq!(entry.address, "DC:23:4D:12:34:56");
        assert_eq!(entry.credentials.category, "wk");
        assert_eq!(
            entry.credentials.device_name.as_deref(),
            Some("Living room radiator")
        );
        assert_eq!(entry.credentials.product_model, None);
    }

    #[test]
    fn test_incomplete_device_is_rejected() {
        let text = SAMPLE.replace("product_id = \"ajrhf1aj\"\n", "product_id = \"\"\n");

        let result = from_toml_str(&text);

        assert!(
            matches!(result, Err(ConfigError::InvalidCredentials(msg)) if msg.contains("product_id"))
        );
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        assert!(matches!(
            from_toml_str("[engine\nmtu = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("tuya-ble-config-does-not-exist.toml");
        let cfg = load_from_path(&path).expect("missing file is not an error");
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn test_save_then_load_restores_config() {
        // Arrange
        let mut cfg = from_toml_str(SAMPLE).expect("parse");
        cfg.engine.connect_attempts = 7;
        let dir = std::env::temp_dir().join(format!("tuya-ble-config-{}", std::process::id()));
        let path = dir.join("config.toml");

        // Act
        save_to_path(&cfg, &path).expect("save");
        let restored = load_from_path(&path).expect("load");
        let _ = std::fs::remove_dir_all(&dir);

        // Assert
        assert_eq!(restored, cfg);
    }
}
