//! Configuration for the Live2D control layer

use neko_core::OverrideMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Mouth-shape parameters. Lip sync always has the final say over these.
pub const DEFAULT_LIP_SYNC_PARAMETERS: &[&str] = &[
    "ParamMouthOpenY",
    "ParamMouthForm",
    "ParamMouthOpen",
    "ParamA",
    "ParamI",
    "ParamU",
    "ParamE",
    "ParamO",
];

/// Opacity/visibility parameters, never restored from a saved pose.
pub const DEFAULT_VISIBILITY_PARAMETERS: &[&str] = &["ParamOpacity", "ParamVisibility"];

/// Pre/post motion delta above which a parameter counts as motion-driven.
/// Heuristic: a motion that holds a value steady for a frame reads as static.
pub const DEFAULT_MOTION_EPSILON: f64 = 0.001;

/// Live2D control layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Live2DConfig {
    /// Blend mode the manager starts in (default: additive)
    pub default_override_mode: OverrideMode,

    /// Motion detection threshold for additive blending
    pub motion_epsilon: f64,

    /// Parameters driven by the mouth value
    pub lip_sync_parameters: Vec<String>,

    /// Parameters excluded from saved-pose application
    pub visibility_parameters: Vec<String>,

    /// Capacity of the broadcast event channel
    pub event_channel_capacity: usize,

    /// JSON file backing the preferences repository
    pub preferences_path: Option<PathBuf>,

    /// Emotion mapping table (JSON, TOML or YAML)
    pub emotion_mapping_path: Option<PathBuf>,
}

impl Default for Live2DConfig {
    fn default() -> Self {
        Self {
            default_override_mode: OverrideMode::Additive,
            motion_epsilon: DEFAULT_MOTION_EPSILON,
            lip_sync_parameters: DEFAULT_LIP_SYNC_PARAMETERS.iter().map(|s| s.to_string()).collect(),
            visibility_parameters: DEFAULT_VISIBILITY_PARAMETERS.iter().map(|s| s.to_string()).collect(),
            event_channel_capacity: 256,
            preferences_path: None,
            emotion_mapping_path: None,
        }
    }
}

impl Live2DConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.motion_epsilon.is_finite() || self.motion_epsilon < 0.0 {
            return Err("Motion epsilon must be a finite, non-negative number".to_string());
        }
        if self.motion_epsilon > 1.0 {
            return Err("Motion epsilon must not exceed 1.0".to_string());
        }

        if self.event_channel_capacity == 0 {
            return Err("Event channel capacity cannot be 0".to_string());
        }
        const MAX_EVENT_CHANNEL_CAPACITY: usize = 65_536;
        if self.event_channel_capacity > MAX_EVENT_CHANNEL_CAPACITY {
            return Err(format!(
                "Event channel capacity too large (max {})",
                MAX_EVENT_CHANNEL_CAPACITY
            ));
        }

        for id in self.lip_sync_parameters.iter().chain(self.visibility_parameters.iter()) {
            validate_parameter_id(id)?;
        }

        Ok(())
    }

    /// Load from a JSON, TOML or YAML file, then validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let config: Self = neko_core::config::load_from_file(path).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `NEKO_*` environment overrides on top of this config.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(mode) = std::env::var("NEKO_OVERRIDE_MODE") {
            match mode.parse::<OverrideMode>() {
                Ok(mode) => self.default_override_mode = mode,
                Err(e) => tracing::warn!("Ignoring NEKO_OVERRIDE_MODE: {}", e),
            }
        }

        if let Ok(epsilon) = std::env::var("NEKO_MOTION_EPSILON") {
            match epsilon.parse::<f64>() {
                Ok(v) if v.is_finite() && v >= 0.0 => self.motion_epsilon = v,
                _ => tracing::warn!("Ignoring invalid NEKO_MOTION_EPSILON: {}", epsilon),
            }
        }

        if let Ok(path) = std::env::var("NEKO_PREFERENCES_PATH") {
            if !path.trim().is_empty() {
                self.preferences_path = Some(PathBuf::from(path));
            }
        }

        self
    }

    pub fn is_lip_sync_parameter(&self, id: &str) -> bool {
        self.lip_sync_parameters.iter().any(|p| p == id)
    }

    pub fn is_visibility_parameter(&self, id: &str) -> bool {
        self.visibility_parameters.iter().any(|p| p == id)
    }
}

fn validate_parameter_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("Parameter id cannot be empty".to_string());
    }
    if id.len() > 256 {
        return Err("Parameter id too long (max 256 chars)".to_string());
    }
    if id.chars().any(|c| c.is_control()) {
        return Err(format!("Parameter id contains invalid characters: {:?}", id));
    }
    Ok(())
}
