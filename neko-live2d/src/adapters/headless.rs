//! Headless adapter: a deterministic in-process model without a renderer
//!
//! Models are described up front ([`HeadlessModelSpec`]) and registered under
//! the uri they will be loaded by. The host drives frames with
//! [`HeadlessAdapter::tick`], which runs the motion stage (expression, then
//! motion keyframes) and the model stage through the adapter's
//! [`FramePipeline`], so installed middleware sees exactly what a rendering
//! backend would.

use crate::adapter::{Capabilities, Live2DAdapter, LoadOptions, ViewProps};
use crate::config::Live2DConfig;
use crate::error::AdapterError;
use crate::events::{EventSink, Live2DEvent};
use crate::override_layer::{clamp01, OverrideInstallation, OverrideLayer, OverrideRules, OverrideStateGetter};
use crate::pipeline::{FramePipeline, ParameterModel, UpdateStage};
use crate::runtime::{Live2DRuntime, ParameterRuntime};
use async_trait::async_trait;
use neko_core::{
    ErrorInfo, ExpressionRef, ModelRef, MotionRef, ParameterMap, Platform, Rect, Transform, TransformSnapshot, Vec2,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One model parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub id: String,
    #[serde(default)]
    pub default: f64,
    #[serde(default = "ParameterSpec::default_min")]
    pub min: f64,
    #[serde(default = "ParameterSpec::default_max")]
    pub max: f64,
}

impl ParameterSpec {
    fn default_min() -> f64 {
        -30.0
    }

    fn default_max() -> f64 {
        30.0
    }

    pub fn new(id: impl Into<String>, default: f64, min: f64, max: f64) -> Self {
        Self {
            id: id.into(),
            default,
            min,
            max,
        }
    }
}

/// Keyframed motion. Curves map parameter ids to `[time, value]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionClip {
    /// Length in seconds
    pub duration: f64,
    #[serde(rename = "loop")]
    pub looped: bool,
    pub curves: HashMap<String, Vec<(f64, f64)>>,
}

impl MotionClip {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    pub fn with_curve(mut self, id: impl Into<String>, keyframes: &[(f64, f64)]) -> Self {
        let mut keys = keyframes.to_vec();
        keys.sort_by(|a, b| a.0.total_cmp(&b.0));
        self.curves.insert(id.into(), keys);
        self
    }

    /// Linear interpolation, held flat outside the first/last key.
    fn sample(keys: &[(f64, f64)], t: f64) -> Option<f64> {
        let (first, last) = (keys.first()?, keys.last()?);
        if t <= first.0 {
            return Some(first.1);
        }
        if t >= last.0 {
            return Some(last.1);
        }
        keys.windows(2).find(|w| t >= w[0].0 && t <= w[1].0).map(|w| {
            let span = w[1].0 - w[0].0;
            if span <= f64::EPSILON {
                w[1].1
            } else {
                w[0].1 + (w[1].1 - w[0].1) * (t - w[0].0) / span
            }
        })
    }
}

/// Complete description of a headless model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessModelSpec {
    pub parameters: Vec<ParameterSpec>,
    /// Motion group → clips
    pub motions: HashMap<String, Vec<MotionClip>>,
    /// Expression id → parameter values held while active
    pub expressions: HashMap<String, ParameterMap>,
    /// Unscaled model size, used for bounds
    pub size: Option<Vec2>,
}

impl HeadlessModelSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a description from a JSON, TOML or YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        neko_core::config::load_from_file(path).map_err(|e| AdapterError::Backend(e.to_string()))
    }

    pub fn with_parameter(mut self, id: impl Into<String>, default: f64, min: f64, max: f64) -> Self {
        self.parameters.push(ParameterSpec::new(id, default, min, max));
        self
    }

    pub fn with_motion(mut self, group: impl Into<String>, clip: MotionClip) -> Self {
        self.motions.entry(group.into()).or_default().push(clip);
        self
    }

    pub fn with_expression(mut self, id: impl Into<String>, values: &[(&str, f64)]) -> Self {
        self.expressions
            .insert(id.into(), values.iter().map(|(k, v)| (k.to_string(), *v)).collect());
        self
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.size = Some(Vec2::new(width, height));
        self
    }

    fn size(&self) -> Vec2 {
        self.size.unwrap_or(Vec2::new(400.0, 600.0))
    }

    /// Keyframes in time order, as sampling expects.
    fn sorted(mut self) -> Self {
        for clip in self.motions.values_mut().flatten() {
            for keys in clip.curves.values_mut() {
                keys.sort_by(|a, b| a.0.total_cmp(&b.0));
            }
        }
        self
    }
}

/// Parameter storage of the loaded model
struct ParameterTable {
    specs: Vec<ParameterSpec>,
    values: Vec<f64>,
    index: HashMap<String, usize>,
}

impl ParameterTable {
    fn new(specs: &[ParameterSpec]) -> Self {
        Self {
            values: specs.iter().map(|p| p.default).collect(),
            index: specs.iter().enumerate().map(|(i, p)| (p.id.clone(), i)).collect(),
            specs: specs.to_vec(),
        }
    }
}

impl ParameterModel for ParameterTable {
    fn parameter_value(&self, id: &str) -> Option<f64> {
        self.index.get(id).map(|&i| self.values[i])
    }

    fn parameter_default(&self, id: &str) -> Option<f64> {
        self.index.get(id).map(|&i| self.specs[i].default)
    }

    fn set_parameter_value(&mut self, id: &str, value: f64, weight: f64) -> bool {
        let Some(&i) = self.index.get(id) else {
            return false;
        };
        if !value.is_finite() {
            return false;
        }
        let spec = &self.specs[i];
        let current = self.values[i];
        let weight = clamp01(weight);
        let blended = if weight >= 1.0 {
            value
        } else {
            current + (value - current) * weight
        };
        self.values[i] = blended.clamp(spec.min, spec.max);
        true
    }

    fn parameter_ids(&self) -> Vec<String> {
        self.specs.iter().map(|p| p.id.clone()).collect()
    }
}

struct ActiveMotion {
    motion: MotionRef,
    clip: MotionClip,
    elapsed: f64,
}

/// Motion-stage state, kept apart from the parameter table so the stage
/// callback can borrow it while middleware holds the table.
#[derive(Default)]
struct Player {
    motion: Option<ActiveMotion>,
    expression: Option<(String, ParameterMap)>,
}

impl Player {
    /// Advance by `dt` and write this frame's values. Returns the motion that
    /// finished during this step, if any.
    fn update(&mut self, params: &mut dyn ParameterModel, dt: f64) -> Option<MotionRef> {
        if let Some((_, values)) = &self.expression {
            for (id, value) in values {
                params.set_parameter_value(id, *value, 1.0);
            }
        }

        let active = self.motion.as_mut()?;
        active.elapsed += dt;
        let mut t = active.elapsed;
        if active.clip.looped && active.clip.duration > 0.0 {
            t %= active.clip.duration;
        }
        for (id, keys) in &active.clip.curves {
            if let Some(value) = MotionClip::sample(keys, t) {
                params.set_parameter_value(id, value, 1.0);
            }
        }

        if !active.clip.looped && active.elapsed >= active.clip.duration {
            return self.motion.take().map(|m| m.motion);
        }
        None
    }
}

struct LoadedModel {
    model: ModelRef,
    spec: HeadlessModelSpec,
    params: ParameterTable,
    player: Player,
    transform: TransformSnapshot,
    frames: u64,
}

struct HeadlessShared {
    models: RwLock<HashMap<String, HeadlessModelSpec>>,
    loaded: Mutex<Option<LoadedModel>>,
    pipeline: Arc<FramePipeline>,
    layer: OverrideLayer,
    installation: Mutex<Option<OverrideInstallation>>,
    /// Kept across model swaps so a new model gets the layer again
    override_getter: RwLock<Option<OverrideStateGetter>>,
    sink: RwLock<Option<EventSink>>,
    mouth_value: RwLock<f64>,
    load_latency: RwLock<Option<Duration>>,
}

impl HeadlessShared {
    fn emit(&self, event: Live2DEvent) {
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    fn install(&self, getter: OverrideStateGetter) {
        let mut installation = self.installation.lock();
        // Old hooks go before the new ones are registered
        installation.take();
        *installation = Some(self.layer.install(&self.pipeline, Arc::clone(&getter)));
        *self.override_getter.write() = Some(getter);
    }
}

/// In-process adapter with a scriptable model. Cheap to clone.
#[derive(Clone)]
pub struct HeadlessAdapter {
    shared: Arc<HeadlessShared>,
}

impl Default for HeadlessAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessAdapter {
    pub fn new() -> Self {
        Self::with_config(&Live2DConfig::default())
    }

    pub fn with_config(config: &Live2DConfig) -> Self {
        Self {
            shared: Arc::new(HeadlessShared {
                models: RwLock::new(HashMap::new()),
                loaded: Mutex::new(None),
                pipeline: Arc::new(FramePipeline::new()),
                layer: OverrideLayer::new(OverrideRules::from_config(config)),
                installation: Mutex::new(None),
                override_getter: RwLock::new(None),
                sink: RwLock::new(None),
                mouth_value: RwLock::new(0.0),
                load_latency: RwLock::new(None),
            }),
        }
    }

    /// Make `spec` loadable under `uri`.
    pub fn register_model(&self, uri: impl Into<String>, spec: HeadlessModelSpec) {
        self.shared.models.write().insert(uri.into(), spec.sorted());
    }

    /// Delay every load by `latency` (simulated asset fetch).
    pub fn set_load_latency(&self, latency: Option<Duration>) {
        *self.shared.load_latency.write() = latency;
    }

    pub fn pipeline(&self) -> &Arc<FramePipeline> {
        &self.shared.pipeline
    }

    pub fn loaded_model(&self) -> Option<ModelRef> {
        self.shared.loaded.lock().as_ref().map(|m| m.model.clone())
    }

    pub fn active_motion(&self) -> Option<MotionRef> {
        let loaded = self.shared.loaded.lock();
        loaded.as_ref()?.player.motion.as_ref().map(|m| m.motion.clone())
    }

    pub fn active_expression(&self) -> Option<String> {
        let loaded = self.shared.loaded.lock();
        loaded.as_ref()?.player.expression.as_ref().map(|(id, _)| id.clone())
    }

    pub fn parameter(&self, id: &str) -> Option<f64> {
        self.shared.loaded.lock().as_ref()?.params.parameter_value(id)
    }

    /// All parameter values of the loaded model, in declaration order.
    pub fn parameter_table(&self) -> Vec<(String, f64)> {
        let loaded = self.shared.loaded.lock();
        match loaded.as_ref() {
            Some(m) => m.params.specs.iter().map(|p| p.id.clone()).zip(m.params.values.iter().copied()).collect(),
            None => Vec::new(),
        }
    }

    pub fn frames(&self) -> u64 {
        self.shared.loaded.lock().as_ref().map_or(0, |m| m.frames)
    }

    pub fn is_override_installed(&self) -> bool {
        self.shared.installation.lock().is_some()
    }

    /// Render one frame: motion stage, then model stage. No-op without a model.
    pub fn tick(&self, dt: Duration) {
        let dt = dt.as_secs_f64();
        let finished = {
            let mut guard = self.shared.loaded.lock();
            let Some(loaded) = guard.as_mut() else {
                return;
            };
            let LoadedModel {
                params, player, frames, ..
            } = loaded;

            let mut finished = None;
            self.shared.pipeline.run(UpdateStage::Motion, &mut *params, |model| {
                finished = player.update(model, dt);
            });
            self.shared.pipeline.run(UpdateStage::Model, &mut *params, |_| {});
            *frames += 1;
            finished
        };

        if let Some(motion) = finished {
            debug!("Motion finished: {}", motion.group);
            self.shared.emit(Live2DEvent::MotionFinished { motion: Some(motion) });
        }
    }

    /// Simulate a pointer tap at view coordinates.
    pub fn tap(&self, x: f64, y: f64) {
        self.shared.emit(Live2DEvent::Tap { x, y });
    }

    /// Simulate a runtime failure reported by the backend.
    pub fn report_error(&self, error: ErrorInfo) {
        self.shared.emit(Live2DEvent::Error { error });
    }

    fn runtime_handle(&self) -> HeadlessRuntime {
        HeadlessRuntime {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[async_trait]
impl Live2DAdapter for HeadlessAdapter {
    fn platform(&self) -> Platform {
        Platform::Headless
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn set_event_sink(&self, sink: EventSink) {
        *self.shared.sink.write() = Some(sink);
    }

    async fn load_model(&self, model: &ModelRef, _options: &LoadOptions) -> Result<(), AdapterError> {
        let latency = *self.shared.load_latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let spec = self
            .shared
            .models
            .read()
            .get(&model.uri)
            .cloned()
            .ok_or_else(|| AdapterError::ModelNotFound { uri: model.uri.clone() })?;

        // Hooks belong to the previous model
        self.shared.installation.lock().take();

        let params = ParameterTable::new(&spec.parameters);
        *self.shared.loaded.lock() = Some(LoadedModel {
            model: model.clone(),
            spec,
            params,
            player: Player::default(),
            transform: TransformSnapshot::default(),
            frames: 0,
        });
        info!("Headless model loaded: {}", model.uri);

        let getter = self.shared.override_getter.read().clone();
        if let Some(getter) = getter {
            self.shared.install(getter);
        }
        Ok(())
    }

    async fn unload_model(&self) -> Result<(), AdapterError> {
        self.shared.installation.lock().take();
        if let Some(prev) = self.shared.loaded.lock().take() {
            debug!("Headless model unloaded: {}", prev.model.uri);
        }
        Ok(())
    }

    async fn play_motion(&self, motion: &MotionRef) -> Result<(), AdapterError> {
        let mut guard = self.shared.loaded.lock();
        let loaded = guard.as_mut().ok_or(AdapterError::ModelNotLoaded {
            operation: "play_motion",
        })?;

        let clips = loaded
            .spec
            .motions
            .get(&motion.group)
            .filter(|clips| !clips.is_empty())
            .ok_or_else(|| AdapterError::Backend(format!("Unknown motion group: {}", motion.group)))?;
        let index = motion.index.unwrap_or(0) as usize;
        let clip = clips.get(index).cloned().ok_or_else(|| {
            AdapterError::Backend(format!("Motion index {} out of range for group {}", index, motion.group))
        })?;

        if let Some(current) = &loaded.player.motion {
            if current.motion.priority.unwrap_or(0) > motion.priority.unwrap_or(0) {
                debug!("Motion {} ignored: {} has higher priority", motion.group, current.motion.group);
                return Ok(());
            }
        }

        loaded.player.motion = Some(ActiveMotion {
            motion: motion.clone(),
            clip,
            elapsed: 0.0,
        });
        Ok(())
    }

    async fn set_expression(&self, expression: &ExpressionRef) -> Result<(), AdapterError> {
        let mut guard = self.shared.loaded.lock();
        let loaded = guard.as_mut().ok_or(AdapterError::ModelNotLoaded {
            operation: "set_expression",
        })?;
        let values = loaded
            .spec
            .expressions
            .get(&expression.id)
            .cloned()
            .ok_or_else(|| AdapterError::Backend(format!("Unknown expression: {}", expression.id)))?;
        loaded.player.expression = Some((expression.id.clone(), values));
        Ok(())
    }

    fn set_mouth_value(&self, value: f64) -> Result<(), AdapterError> {
        let value = clamp01(value);
        *self.shared.mouth_value.write() = value;
        if let Some(loaded) = self.shared.loaded.lock().as_mut() {
            loaded.params.set_parameter_value("ParamMouthOpenY", value, 1.0);
        }
        Ok(())
    }

    async fn set_transform(&self, transform: &Transform) -> Result<(), AdapterError> {
        self.runtime_handle().set_transform(transform)
    }

    fn view_props(&self) -> Option<ViewProps> {
        let mut props = ViewProps::new();
        props.insert("platform".to_string(), "headless".into());
        if let Some(loaded) = self.shared.loaded.lock().as_ref() {
            props.insert("model".to_string(), loaded.model.uri.clone().into());
            props.insert("frames".to_string(), loaded.frames.into());
        }
        props.insert("mouth".to_string(), (*self.shared.mouth_value.read()).into());
        Some(props)
    }

    fn runtime(&self) -> Option<Arc<dyn Live2DRuntime>> {
        Some(Arc::new(self.runtime_handle()))
    }

    async fn dispose(&self) -> Result<(), AdapterError> {
        self.shared.installation.lock().take();
        *self.shared.override_getter.write() = None;
        self.shared.loaded.lock().take();
        self.shared.sink.write().take();
        Ok(())
    }
}

/// Runtime handle of a [`HeadlessAdapter`]
#[derive(Clone)]
pub struct HeadlessRuntime {
    shared: Arc<HeadlessShared>,
}

impl Live2DRuntime for HeadlessRuntime {
    fn transform_snapshot(&self) -> Option<TransformSnapshot> {
        self.shared.loaded.lock().as_ref().map(|m| m.transform)
    }

    fn set_transform(&self, transform: &Transform) -> Result<(), AdapterError> {
        let mut guard = self.shared.loaded.lock();
        let loaded = guard.as_mut().ok_or(AdapterError::ModelNotLoaded {
            operation: "set_transform",
        })?;
        if let Some(position) = transform.position {
            loaded.transform.position = position;
        }
        if let Some(scale) = transform.scale {
            loaded.transform.scale = scale.to_vec2();
        }
        Ok(())
    }

    fn bounds(&self) -> Option<Rect> {
        let guard = self.shared.loaded.lock();
        let loaded = guard.as_ref()?;
        let size = loaded.spec.size();
        let TransformSnapshot { position, scale } = loaded.transform;
        Some(Rect::from_edges(
            position.x,
            position.y,
            position.x + size.x * scale.x,
            position.y + size.y * scale.y,
        ))
    }

    fn parameters(&self) -> Option<Arc<dyn ParameterRuntime>> {
        Some(Arc::new(self.clone()))
    }
}

impl ParameterRuntime for HeadlessRuntime {
    fn set_parameter_value_by_id(&self, id: &str, value: f64, weight: f64) -> bool {
        self.shared
            .loaded
            .lock()
            .as_mut()
            .map_or(false, |m| m.params.set_parameter_value(id, value, weight))
    }

    fn parameter_value_by_id(&self, id: &str) -> Option<f64> {
        self.shared.loaded.lock().as_ref()?.params.parameter_value(id)
    }

    fn parameter_default_value_by_id(&self, id: &str) -> Option<f64> {
        self.shared.loaded.lock().as_ref()?.params.parameter_default(id)
    }

    fn parameter_count(&self) -> Option<usize> {
        self.shared.loaded.lock().as_ref().map(|m| m.params.specs.len())
    }

    fn parameter_ids(&self) -> Vec<String> {
        self.shared
            .loaded
            .lock()
            .as_ref()
            .map(|m| m.params.parameter_ids())
            .unwrap_or_default()
    }

    fn install_override_layer(&self, getter: OverrideStateGetter) -> Result<(), AdapterError> {
        self.shared.install(getter);
        Ok(())
    }

    fn uninstall_override_layer(&self) {
        self.shared.installation.lock().take();
        *self.shared.override_getter.write() = None;
    }
}
