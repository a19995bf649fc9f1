pub mod config;
pub mod error;
pub mod types;

pub use config::ConfigError;
pub use error::{Error, Result};
pub use types::{
    ErrorInfo, ExpressionRef, Live2DState, Live2DStatus, ModelRef, ModelSource, MotionRef,
    OverrideMode, ParameterMap, Platform, Rect, Scale, Transform, TransformSnapshot, Vec2,
};
