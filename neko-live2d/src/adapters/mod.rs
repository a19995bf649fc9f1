//! Adapter implementations

pub mod headless;

pub use headless::{HeadlessAdapter, HeadlessModelSpec, MotionClip, ParameterSpec};
