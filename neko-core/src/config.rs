// Config file loading shared by the neko crates

use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// Upper bound on config file size; anything larger is rejected before parsing.
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Parse error: {}", e),
            ConfigError::ValidationError(e) => write!(f, "Validation error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Configuration(err.to_string())
    }
}

/// Parse a config document, trying JSON, then TOML, then YAML.
pub fn load_from_str<T: DeserializeOwned>(content: &str) -> Result<T, ConfigError> {
    let json_err = match serde_json::from_str::<T>(content) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    if let Ok(value) = toml::from_str::<T>(content) {
        return Ok(value);
    }

    if let Ok(value) = serde_yaml::from_str::<T>(content) {
        return Ok(value);
    }

    Err(ConfigError::ParseError(format!(
        "Unknown format (not JSON, TOML or YAML; JSON error: {})",
        json_err
    )))
}

/// Read and parse a config file.
///
/// The extension picks the parser first (`.json`, `.toml`, `.yaml`/`.yml`);
/// unknown extensions fall back to [`load_from_str`].
pub fn load_from_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let display = path.display().to_string();

    if display.contains("..") {
        return Err(ConfigError::IoError(format!(
            "Path traversal detected: '{}'",
            display
        )));
    }

    let metadata = fs::metadata(path).map_err(|e| ConfigError::IoError(format!("{}: {}", display, e)))?;
    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::IoError(format!(
            "Config file too large: '{}' ({} bytes, max {})",
            display,
            metadata.len(),
            MAX_CONFIG_FILE_SIZE
        )));
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(format!("{}: {}", display, e)))?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("json") => serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string())),
        Some("toml") => toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string())),
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
        }
        _ => load_from_str(&content),
    }
}
