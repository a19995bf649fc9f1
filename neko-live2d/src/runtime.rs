//! Runtime handle: optional platform capabilities beyond the adapter primitives
//!
//! Editors, preference saving and screen snapping need to read the model's
//! placement and individual parameters without depending on a particular
//! SDK. Every method has a conservative default so adapters implement only
//! what their platform can do.

use crate::error::AdapterError;
use crate::override_layer::OverrideStateGetter;
use neko_core::{Rect, Transform, TransformSnapshot};
use std::sync::Arc;

/// Parameter I/O on the loaded model
pub trait ParameterRuntime: Send + Sync {
    /// Write one parameter. Returns `false` when the model has no such id.
    fn set_parameter_value_by_id(&self, id: &str, value: f64, weight: f64) -> bool;

    fn parameter_value_by_id(&self, _id: &str) -> Option<f64> {
        None
    }

    /// Rest value, used as the base of additive offsets.
    fn parameter_default_value_by_id(&self, _id: &str) -> Option<f64> {
        None
    }

    fn parameter_count(&self) -> Option<usize> {
        None
    }

    /// Parameter ids. Backends that only know the count get `param_{i}` names.
    fn parameter_ids(&self) -> Vec<String> {
        (0..self.parameter_count().unwrap_or(0))
            .map(|i| format!("param_{}", i))
            .collect()
    }

    /// Hook the override engine into the backend's frame pipeline, replacing
    /// any previous installation.
    fn install_override_layer(&self, _getter: OverrideStateGetter) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "install_override_layer",
        })
    }

    fn uninstall_override_layer(&self) {}
}

/// Platform runtime handle returned by [`Live2DAdapter::runtime`](crate::Live2DAdapter::runtime)
pub trait Live2DRuntime: Send + Sync {
    fn transform_snapshot(&self) -> Option<TransformSnapshot> {
        None
    }

    fn set_transform(&self, _transform: &Transform) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported {
            operation: "set_transform",
        })
    }

    /// Model bounds in view coordinates
    fn bounds(&self) -> Option<Rect> {
        None
    }

    fn parameters(&self) -> Option<Arc<dyn ParameterRuntime>> {
        None
    }
}
