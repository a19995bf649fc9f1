//! Error types for neko-live2d

use neko_core::{Error as CoreError, ErrorInfo};
use thiserror::Error;

/// Failures reported by a platform adapter
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Operation not supported by adapter: {operation}")]
    Unsupported { operation: &'static str },

    #[error("{operation}: model not loaded")]
    ModelNotLoaded { operation: &'static str },

    #[error("Model not found: {uri}")]
    ModelNotFound { uri: String },

    #[error("Adapter backend error: {0}")]
    Backend(String),
}

/// Live2D service and manager errors
#[derive(Error, Debug)]
pub enum Live2DError {
    #[error("Invalid model reference: {0}")]
    InvalidModelRef(String),

    #[error("Failed to load model: {uri}")]
    ModelLoadFailed {
        uri: String,
        #[source]
        source: AdapterError,
    },

    #[error("Adapter does not support {operation}()")]
    CapabilityMissing { operation: &'static str },

    #[error("{name} must be a finite number, got {value}")]
    InvalidNumber { name: &'static str, value: f64 },

    #[error("Load of {uri} was superseded by a newer load")]
    LoadSuperseded { uri: String },

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Preferences error: {0}")]
    Preferences(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Live2DError {
    /// Stable machine-readable code, mirrored into [`ErrorInfo::code`].
    pub fn code(&self) -> &'static str {
        match self {
            Live2DError::InvalidModelRef(_) => "INVALID_MODEL_REF",
            Live2DError::ModelLoadFailed { .. } => "MODEL_LOAD_FAILED",
            Live2DError::CapabilityMissing { .. } => "CAPABILITY_MISSING",
            Live2DError::InvalidNumber { .. } => "INVALID_NUMBER",
            Live2DError::LoadSuperseded { .. } => "LOAD_SUPERSEDED",
            Live2DError::Adapter(_) => "ADAPTER_ERROR",
            Live2DError::Preferences(_) => "PREFERENCES_ERROR",
            Live2DError::Config(_) => "CONFIG_ERROR",
            Live2DError::Io(_) => "IO_ERROR",
            Live2DError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Snapshot of this error for state and events.
    pub fn to_info(&self) -> ErrorInfo {
        let info = ErrorInfo::new(self.code(), self.to_string());
        match std::error::Error::source(self) {
            Some(cause) => info.with_cause(cause.to_string()),
            None => info,
        }
    }

    /// Map an adapter failure for `operation`; unsupported operations become
    /// [`Live2DError::CapabilityMissing`].
    pub(crate) fn from_adapter(operation: &'static str, err: AdapterError) -> Self {
        match err {
            AdapterError::Unsupported { .. } => Live2DError::CapabilityMissing { operation },
            other => Live2DError::Adapter(other),
        }
    }
}

impl From<Live2DError> for CoreError {
    fn from(err: Live2DError) -> Self {
        match err {
            Live2DError::InvalidModelRef(msg) => CoreError::InvalidInput(msg),
            Live2DError::InvalidNumber { name, value } => {
                CoreError::InvalidInput(format!("{} must be a finite number, got {}", name, value))
            }
            Live2DError::Config(msg) => CoreError::Configuration(msg),
            Live2DError::Io(e) => CoreError::Io(e),
            other => CoreError::Runtime(format!("Live2D error: {}", other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Live2DError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(Live2DError::InvalidModelRef("x".into()).code(), "INVALID_MODEL_REF");
        assert_eq!(
            Live2DError::CapabilityMissing { operation: "play_motion" }.code(),
            "CAPABILITY_MISSING"
        );
    }

    #[test]
    fn test_load_failure_info_keeps_cause() {
        let err = Live2DError::ModelLoadFailed {
            uri: "m".into(),
            source: AdapterError::Backend("network down".into()),
        };
        let info = err.to_info();
        assert_eq!(info.code, "MODEL_LOAD_FAILED");
        assert!(info.cause.unwrap().contains("network down"));
    }

    #[test]
    fn test_unsupported_maps_to_capability_missing() {
        let err = Live2DError::from_adapter("set_expression", AdapterError::Unsupported { operation: "set_expression" });
        assert!(matches!(err, Live2DError::CapabilityMissing { operation: "set_expression" }));
    }
}
