//! Platform-agnostic data model shared by the service layer and adapters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Parameter id → value table (saved pose, persistent edits, preferences).
pub type ParameterMap = HashMap<String, f64>;

/// Platform the adapter renders on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Web,
    Native,
    /// In-process adapter without a renderer (tests, CLI)
    Headless,
    #[default]
    Unknown,
}

/// How an adapter should interpret [`ModelRef::uri`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    Url,
    File,
    Asset,
    Id,
}

/// Opaque model locator. `uri` is the identity key for preferences lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ModelSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ModelRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            source: None,
            id: None,
            meta: None,
        }
    }

    /// Model addressed by URL, the default for manager-driven loads.
    pub fn url(uri: impl Into<String>) -> Self {
        Self::new(uri).with_source(ModelSource::Url)
    }

    pub fn with_source(mut self, source: ModelSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// A usable reference carries a non-blank uri.
    pub fn is_valid(&self) -> bool {
        !self.uri.trim().is_empty()
    }
}

/// Motion addressing: group name plus optional index and priority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionRef {
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl MotionRef {
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            index: None,
            priority: None,
        }
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionRef {
    pub id: String,
}

impl ExpressionRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Uniform scale is preferred; per-axis scale is available for platforms that need it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scale {
    Uniform(f64),
    Axes(Vec2),
}

impl Scale {
    pub fn to_vec2(self) -> Vec2 {
        match self {
            Scale::Uniform(s) => Vec2::new(s, s),
            Scale::Axes(v) => v,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.to_vec2().is_finite()
    }
}

impl From<f64> for Scale {
    fn from(value: f64) -> Self {
        Scale::Uniform(value)
    }
}

impl From<Vec2> for Scale {
    fn from(value: Vec2) -> Self {
        Scale::Axes(value)
    }
}

/// Model placement. The coordinate system is whatever the adapter renders in.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Scale>,
}

impl Transform {
    pub fn new(position: Option<Vec2>, scale: Option<Scale>) -> Self {
        Self { position, scale }
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.scale.is_none()
    }

    pub fn is_finite(&self) -> bool {
        self.position.map_or(true, |p| p.is_finite()) && self.scale.map_or(true, |s| s.is_finite())
    }
}

/// Current placement as read back from the runtime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformSnapshot {
    pub position: Vec2,
    pub scale: Vec2,
}

impl Default for TransformSnapshot {
    fn default() -> Self {
        Self {
            position: Vec2::default(),
            scale: Vec2::new(1.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn from_edges(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
            width: (right - left).max(0.0),
            height: (bottom - top).max(0.0),
        }
    }

    pub fn from_size(width: f64, height: f64) -> Self {
        Self::from_edges(0.0, 0.0, width, height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Live2DStatus {
    Idle,
    Loading,
    Ready,
    Error,
}

impl fmt::Display for Live2DStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Live2DStatus::Idle => "idle",
            Live2DStatus::Loading => "loading",
            Live2DStatus::Ready => "ready",
            Live2DStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Cloneable record of a failure, carried by the error state and `error` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {})", cause)?;
        }
        Ok(())
    }
}

/// Service lifecycle state. Exactly one value exists at a time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Live2DState {
    #[default]
    Idle,
    Loading {
        model: ModelRef,
    },
    Ready {
        model: ModelRef,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<ModelRef>,
        error: ErrorInfo,
    },
}

impl Live2DState {
    pub fn status(&self) -> Live2DStatus {
        match self {
            Live2DState::Idle => Live2DStatus::Idle,
            Live2DState::Loading { .. } => Live2DStatus::Loading,
            Live2DState::Ready { .. } => Live2DStatus::Ready,
            Live2DState::Error { .. } => Live2DStatus::Error,
        }
    }

    pub fn model(&self) -> Option<&ModelRef> {
        match self {
            Live2DState::Idle => None,
            Live2DState::Loading { model } | Live2DState::Ready { model } => Some(model),
            Live2DState::Error { model, .. } => model.as_ref(),
        }
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            Live2DState::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Live2DState::Ready { .. })
    }
}

/// How saved parameters merge with live motion output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideMode {
    /// Saved parameters are not applied; mouth and persistent layers still are
    Off,
    /// Saved values are force-set every frame
    Override,
    /// Saved offsets ride on top of motion output
    #[default]
    Additive,
}

impl fmt::Display for OverrideMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OverrideMode::Off => "off",
            OverrideMode::Override => "override",
            OverrideMode::Additive => "additive",
        };
        f.write_str(name)
    }
}

impl FromStr for OverrideMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(OverrideMode::Off),
            "override" => Ok(OverrideMode::Override),
            "additive" => Ok(OverrideMode::Additive),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown override mode '{}' (expected off, override or additive)",
                other
            ))),
        }
    }
}
