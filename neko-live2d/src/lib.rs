//! neko-live2d: avatar runtime control layer
//!
//! Drives a parametric Live2D-style model through a platform adapter:
//! - Lifecycle service (`idle → loading → ready | error`) with typed events
//! - Manager facade: preferences, emotion mapping, parameter modes
//! - Per-frame override engine blending motion output, saved pose,
//!   lip sync and live parameter edits
//! - Frame pipeline middleware for hooking the motion and model update stages
//! - Headless adapter for tests and the CLI

pub mod adapter;
pub mod adapters;
pub mod config;
pub mod emotion;
pub mod error;
pub mod events;
pub mod manager;
pub mod override_layer;
pub mod pipeline;
pub mod preferences;
pub mod runtime;
pub mod service;

pub use adapter::{Capabilities, Live2DAdapter, LoadOptions, ViewProps};
pub use adapters::{HeadlessAdapter, HeadlessModelSpec, MotionClip, ParameterSpec};
pub use config::Live2DConfig;
pub use emotion::{EmotionMapping, EmotionMappingProvider, StaticEmotionMapping};
pub use error::{AdapterError, Live2DError, Result};
pub use events::{EventEmitter, EventKind, EventSink, HandlerErrorHook, Live2DEvent, Subscription};
pub use manager::{EmotionOutcome, InteractionOptions, InteractionUpdate, Live2DManager, LoadModelOptions, ManagerOptions};
pub use override_layer::{OverrideInstallation, OverrideLayer, OverrideRules, OverrideState, OverrideStateGetter};
pub use pipeline::{FrameMiddleware, FramePipeline, MiddlewareId, Next, ParameterModel, UpdateStage};
pub use preferences::{InMemoryPreferences, JsonFilePreferences, PreferencesRepository, PreferencesSnapshot};
pub use runtime::{Live2DRuntime, ParameterRuntime};
pub use service::Live2DService;
