//! Platform adapter contract
//!
//! An adapter owns the platform SDK objects (renderer, native view, headless
//! table) and exposes the primitives the service drives. Only `platform`,
//! `capabilities` and `load_model` are required; every optional primitive
//! defaults to [`AdapterError::Unsupported`], which the service reports as a
//! missing capability.

use crate::error::AdapterError;
use crate::events::EventSink;
use crate::runtime::Live2DRuntime;
use async_trait::async_trait;
use neko_core::{ExpressionRef, ModelRef, MotionRef, Platform, Transform};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Feature flags an adapter advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Parameter writes through the runtime handle
    pub parameters: bool,
    pub expressions: bool,
    pub motions: bool,
    pub mouth: bool,
    pub transform: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            parameters: true,
            expressions: true,
            motions: true,
            mouth: true,
            transform: true,
        }
    }
}

/// Adapter-specific load options, passed through untouched
pub type LoadOptions = serde_json::Map<String, serde_json::Value>;

/// View properties an adapter hands to its host view
pub type ViewProps = serde_json::Map<String, serde_json::Value>;

#[async_trait]
pub trait Live2DAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn capabilities(&self) -> Capabilities;

    /// Receive the sink the adapter reports platform events through.
    fn set_event_sink(&self, _sink: EventSink) {}

    async fn load_model(&self, model: &ModelRef, options: &LoadOptions) -> Result<(), AdapterError>;

    async fn unload_model(&self) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "unload_model",
        })
    }

    async fn play_motion(&self, _motion: &MotionRef) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "play_motion",
        })
    }

    async fn set_expression(&self, _expression: &ExpressionRef) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "set_expression",
        })
    }

    fn set_mouth_value(&self, _value: f64) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "set_mouth_value",
        })
    }

    async fn set_transform(&self, _transform: &Transform) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "set_transform",
        })
    }

    fn view_props(&self) -> Option<ViewProps> {
        None
    }

    /// Runtime handle for the loaded model, if the platform offers one.
    fn runtime(&self) -> Option<Arc<dyn Live2DRuntime>> {
        None
    }

    async fn dispose(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}
