//! Live2D manager - policy facade over the service
//!
//! Resolves preferences on load, maps emotions to motions/expressions, keeps
//! the parameter-mode state the override engine reads every frame, and
//! offers the best-effort runtime helpers (parameter writes, snapping) UI
//! callers need.

use crate::adapter::{Live2DAdapter, LoadOptions};
use crate::config::Live2DConfig;
use crate::emotion::EmotionMappingProvider;
use crate::error::{Live2DError, Result};
use crate::events::{EventKind, HandlerErrorHook, Live2DEvent, Subscription};
use crate::override_layer::{clamp01, OverrideState, OverrideStateGetter};
use crate::preferences::{PreferencesRepository, PreferencesSnapshot};
use crate::runtime::{Live2DRuntime, ParameterRuntime};
use crate::service::Live2DService;
use neko_core::{
    ExpressionRef, Live2DState, ModelRef, MotionRef, OverrideMode, ParameterMap, Rect, Scale, Transform,
    TransformSnapshot, Vec2,
};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Pointer interaction flags, read by the host view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionOptions {
    pub drag: bool,
    pub wheel_zoom: bool,
    pub pinch_zoom: bool,
    pub tap: bool,
}

impl Default for InteractionOptions {
    fn default() -> Self {
        Self {
            drag: true,
            wheel_zoom: true,
            pinch_zoom: true,
            tap: true,
        }
    }
}

/// Partial update merged into [`InteractionOptions`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionUpdate {
    pub drag: Option<bool>,
    pub wheel_zoom: Option<bool>,
    pub pinch_zoom: Option<bool>,
    pub tap: Option<bool>,
}

impl InteractionOptions {
    fn merge(&mut self, update: InteractionUpdate) {
        self.drag = update.drag.unwrap_or(self.drag);
        self.wheel_zoom = update.wheel_zoom.unwrap_or(self.wheel_zoom);
        self.pinch_zoom = update.pinch_zoom.unwrap_or(self.pinch_zoom);
        self.tap = update.tap.unwrap_or(self.tap);
    }
}

/// What [`Live2DManager::set_emotion`] managed to apply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmotionOutcome {
    /// Expression id that was set
    pub expression: Option<String>,
    /// Motion group that was started
    pub motion: Option<String>,
}

/// Per-call load options
#[derive(Debug, Clone, Default)]
pub struct LoadModelOptions {
    /// Use these preferences instead of asking the repository
    pub preferences: Option<PreferencesSnapshot>,
    /// Passed through to the adapter
    pub adapter_options: LoadOptions,
}

impl LoadModelOptions {
    pub fn with_preferences(mut self, preferences: PreferencesSnapshot) -> Self {
        self.preferences = Some(preferences);
        self
    }
}

/// Collaborators and settings for a manager
#[derive(Default)]
pub struct ManagerOptions {
    pub config: Live2DConfig,
    pub preferences: Option<Arc<dyn PreferencesRepository>>,
    pub emotion_provider: Option<Arc<dyn EmotionMappingProvider>>,
    pub on_handler_error: Option<HandlerErrorHook>,
    /// Fixed seed for emotion candidate selection
    pub rng_seed: Option<u64>,
}

impl ManagerOptions {
    pub fn with_config(mut self, config: Live2DConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_preferences(mut self, preferences: Arc<dyn PreferencesRepository>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn with_emotion_provider(mut self, provider: Arc<dyn EmotionMappingProvider>) -> Self {
        self.emotion_provider = Some(provider);
        self
    }

    pub fn with_handler_error_hook(mut self, hook: HandlerErrorHook) -> Self {
        self.on_handler_error = Some(hook);
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

/// Inputs of the override engine, owned by the manager
#[derive(Debug, Clone, Default)]
struct ParameterState {
    mouth_value: f64,
    mode: OverrideMode,
    saved: Option<Arc<ParameterMap>>,
    persistent: Option<Arc<ParameterMap>>,
}

impl ParameterState {
    fn snapshot(&self) -> OverrideState {
        OverrideState {
            mouth_value: self.mouth_value,
            mode: self.mode,
            saved_parameters: self.saved.clone(),
            persistent_parameters: self.persistent.clone(),
        }
    }
}

pub struct Live2DManager {
    service: Live2DService,
    preferences: Option<Arc<dyn PreferencesRepository>>,
    emotion_provider: Option<Arc<dyn EmotionMappingProvider>>,
    params: Arc<RwLock<ParameterState>>,
    current_model_uri: RwLock<Option<String>>,
    locked: AtomicBool,
    interaction: RwLock<InteractionOptions>,
    load_seq: AtomicU64,
    rng: Mutex<StdRng>,
}

impl Live2DManager {
    pub fn new(adapter: Arc<dyn Live2DAdapter>) -> Self {
        Self::with_options(adapter, ManagerOptions::default())
    }

    pub fn with_options(adapter: Arc<dyn Live2DAdapter>, options: ManagerOptions) -> Self {
        let service = Live2DService::with_config(adapter, &options.config, options.on_handler_error);
        let rng = match options.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            service,
            preferences: options.preferences,
            emotion_provider: options.emotion_provider,
            params: Arc::new(RwLock::new(ParameterState {
                mode: options.config.default_override_mode,
                ..Default::default()
            })),
            current_model_uri: RwLock::new(None),
            locked: AtomicBool::new(false),
            interaction: RwLock::new(InteractionOptions::default()),
            load_seq: AtomicU64::new(0),
            rng: Mutex::new(rng),
        }
    }

    /// Underlying service, for callers migrating from direct service use.
    pub fn service(&self) -> &Live2DService {
        &self.service
    }

    pub fn runtime(&self) -> Option<Arc<dyn Live2DRuntime>> {
        self.service.runtime()
    }

    fn parameter_runtime(&self) -> Option<Arc<dyn ParameterRuntime>> {
        self.runtime()?.parameters()
    }

    pub fn state(&self) -> Live2DState {
        self.service.state()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Live2DEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.service.on(kind, handler)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Live2DEvent> {
        self.service.subscribe()
    }

    /// Uri of the model the last successful load brought in.
    pub fn current_model_uri(&self) -> Option<String> {
        self.current_model_uri.read().clone()
    }

    fn is_current_load(&self, seq: u64) -> bool {
        self.load_seq.load(Ordering::SeqCst) == seq
    }

    /// Install (or replace) the override layer, reading this manager's
    /// parameter state. Best-effort.
    fn ensure_override_layer(&self) {
        let Some(params) = self.parameter_runtime() else {
            return;
        };
        let state = Arc::clone(&self.params);
        let getter: OverrideStateGetter = Arc::new(move || state.read().snapshot());
        if let Err(e) = params.install_override_layer(getter) {
            debug!("Override layer not installed: {}", e);
        }
    }

    fn uninstall_override_layer(&self) {
        if let Some(params) = self.parameter_runtime() {
            params.uninstall_override_layer();
        }
    }

    /// Load `uri`, then apply its preferences and install the override layer.
    ///
    /// Preferences come from `options.preferences`, else the repository
    /// (lookup failures count as none). A failed or superseded load returns
    /// its error without applying anything.
    pub async fn load_model(&self, uri: &str, options: LoadModelOptions) -> Result<()> {
        let seq = self.load_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let preferences = match options.preferences {
            Some(explicit) => Some(explicit),
            None => self.load_preferences(uri).await,
        };
        // A newer load may have started while preferences were read
        if !self.is_current_load(seq) {
            return Err(Live2DError::LoadSuperseded { uri: uri.to_string() });
        }

        if let Err(e) = self.service.load_model(ModelRef::url(uri), options.adapter_options).await {
            if self.is_current_load(seq) {
                *self.current_model_uri.write() = None;
            }
            return Err(e);
        }
        if !self.is_current_load(seq) {
            return Err(Live2DError::LoadSuperseded { uri: uri.to_string() });
        }
        *self.current_model_uri.write() = Some(uri.to_string());

        if let Some(transform) = preferences.as_ref().and_then(|p| p.transform()) {
            if let Err(e) = self.service.set_transform(&transform).await {
                warn!("Failed to apply saved transform for {}: {}", uri, e);
            }
            if !self.is_current_load(seq) {
                return Err(Live2DError::LoadSuperseded { uri: uri.to_string() });
            }
        }

        if let Some(parameters) = preferences.as_ref().and_then(|p| p.parameters.as_ref()) {
            if let Err(e) = self.apply_model_parameters(parameters) {
                debug!("Saved parameters for {} not applied: {}", uri, e);
            }
        }

        self.ensure_override_layer();
        info!("Model ready: {}", uri);
        Ok(())
    }

    pub async fn unload_model(&self) -> Result<()> {
        self.load_seq.fetch_add(1, Ordering::SeqCst);
        self.uninstall_override_layer();
        *self.current_model_uri.write() = None;
        self.service.unload_model().await
    }

    pub fn transform_snapshot(&self) -> Option<TransformSnapshot> {
        self.runtime()?.transform_snapshot()
    }

    pub async fn set_transform(&self, transform: &Transform) -> Result<()> {
        self.service.set_transform(transform).await
    }

    /// Back to the origin at scale 1.
    pub async fn reset_model_position(&self) -> Result<()> {
        let transform = Transform::new(Some(Vec2::new(0.0, 0.0)), Some(Scale::Axes(Vec2::new(1.0, 1.0))));
        self.service.set_transform(&transform).await
    }

    /// Repository lookup; failures are logged and read as "no preferences".
    pub async fn load_preferences(&self, uri: &str) -> Option<PreferencesSnapshot> {
        let repository = self.preferences.as_ref()?;
        match repository.load(uri).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Failed to load preferences for {}: {}", uri, e);
                None
            }
        }
    }

    /// Persist the current placement and saved parameters of the loaded
    /// model. No-op without a model or repository; failures are logged.
    pub async fn save_preferences(&self) {
        let Some(repository) = self.preferences.as_ref() else {
            return;
        };
        let Some(uri) = self.current_model_uri() else {
            debug!("No model loaded, preferences not saved");
            return;
        };

        let mut snapshot = PreferencesSnapshot::new(uri);
        if let Some(current) = self.transform_snapshot() {
            snapshot.position = Some(current.position);
            snapshot.scale = Some(current.scale);
        }
        snapshot.parameters = self.params.read().saved.as_deref().cloned();

        match repository.save(&snapshot).await {
            Ok(()) => debug!("Preferences saved for {}", snapshot.model_uri),
            Err(e) => warn!("Failed to save preferences for {}: {}", snapshot.model_uri, e),
        }
    }

    pub async fn play_motion(&self, motion: &MotionRef) -> Result<()> {
        self.service.play_motion(motion).await
    }

    pub async fn set_expression(&self, expression: &ExpressionRef) -> Result<()> {
        self.service.set_expression(expression).await
    }

    /// Show `emotion` on the loaded model.
    ///
    /// Without a mapping provider the label is used as both expression id
    /// and motion group. With one, an expression and a motion are picked at
    /// random from the mapped candidates; with no mapped motion the group
    /// named after the emotion is tried. The two halves are independent and
    /// failures are logged, not returned.
    pub async fn set_emotion(&self, emotion: &str) -> EmotionOutcome {
        let Some(uri) = self.current_model_uri() else {
            debug!("No model loaded, emotion {} ignored", emotion);
            return EmotionOutcome::default();
        };

        let (expression, motion) = match &self.emotion_provider {
            None => (Some(emotion.to_string()), emotion.to_string()),
            Some(provider) => {
                let mapping = match provider.emotion_mapping(&uri).await {
                    Ok(mapping) => mapping.unwrap_or_default(),
                    Err(e) => {
                        warn!("Emotion mapping lookup failed for {}: {}", uri, e);
                        Default::default()
                    }
                };
                let mut rng = self.rng.lock();
                let expression = mapping.expressions_for(emotion).choose(&mut *rng).cloned();
                let motion = mapping
                    .motions_for(emotion)
                    .choose(&mut *rng)
                    .cloned()
                    .unwrap_or_else(|| emotion.to_string());
                (expression, motion)
            }
        };

        let mut outcome = EmotionOutcome::default();
        if let Some(id) = expression {
            match self.service.set_expression(&ExpressionRef::new(id.clone())).await {
                Ok(()) => outcome.expression = Some(id),
                Err(e) => debug!("Expression {} for emotion {} not applied: {}", id, emotion, e),
            }
        }
        match self.service.play_motion(&MotionRef::group(motion.clone())).await {
            Ok(()) => outcome.motion = Some(motion),
            Err(e) => debug!("Motion {} for emotion {} not played: {}", motion, emotion, e),
        }
        outcome
    }

    /// Set the lip-sync value and make it win immediately.
    pub fn set_mouth(&self, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(Live2DError::InvalidNumber {
                name: "mouth_value",
                value,
            });
        }
        let value = clamp01(value);

        match self.service.set_mouth_value(value) {
            Ok(_) => {}
            // The override layer drives the mouth parameters itself
            Err(Live2DError::CapabilityMissing { .. }) if self.parameter_runtime().is_some() => {}
            Err(e) => return Err(e),
        }
        self.params.write().mouth_value = value;
        self.ensure_override_layer();
        Ok(())
    }

    pub fn mouth_value(&self) -> f64 {
        self.params.read().mouth_value
    }

    /// Write parameters straight into the model, once. Non-finite values are
    /// skipped. Returns how many parameters were written.
    pub fn apply_model_parameters(&self, parameters: &ParameterMap) -> Result<usize> {
        let runtime = self.parameter_runtime().ok_or(Live2DError::CapabilityMissing {
            operation: "apply_model_parameters",
        })?;
        let mut applied = 0;
        for (id, &value) in parameters {
            if id.is_empty() || !value.is_finite() {
                continue;
            }
            if runtime.set_parameter_value_by_id(id, value, 1.0) {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Pose the override engine restores every frame (`None` clears it).
    pub fn set_saved_model_parameters(&self, parameters: Option<ParameterMap>) {
        self.params.write().saved = parameters.map(Arc::new);
        self.ensure_override_layer();
    }

    pub fn saved_model_parameters(&self) -> Option<ParameterMap> {
        self.params.read().saved.as_deref().cloned()
    }

    /// Live edits applied above everything but lip sync (`None` clears them).
    pub fn set_persistent_parameters(&self, parameters: Option<ParameterMap>) {
        self.params.write().persistent = parameters.map(Arc::new);
        self.ensure_override_layer();
    }

    pub fn persistent_parameters(&self) -> Option<ParameterMap> {
        self.params.read().persistent.as_deref().cloned()
    }

    pub fn set_parameter_override_mode(&self, mode: OverrideMode) {
        self.params.write().mode = mode;
        self.ensure_override_layer();
    }

    pub fn parameter_override_mode(&self) -> OverrideMode {
        self.params.read().mode
    }

    pub fn parameter_ids(&self) -> Vec<String> {
        self.parameter_runtime().map(|p| p.parameter_ids()).unwrap_or_default()
    }

    pub fn view_props(&self) -> crate::adapter::ViewProps {
        self.service.view_props()
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::Relaxed);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn set_interaction_options(&self, update: InteractionUpdate) {
        self.interaction.write().merge(update);
    }

    pub fn interaction_options(&self) -> InteractionOptions {
        *self.interaction.read()
    }

    /// Move the model back inside `viewport` if it left it. Returns whether
    /// the model moved; `false` also when the runtime cannot report bounds.
    pub async fn snap_to_screen(&self, viewport: Rect) -> Result<bool> {
        let Some(runtime) = self.runtime() else {
            return Ok(false);
        };
        let (Some(bounds), Some(current)) = (runtime.bounds(), runtime.transform_snapshot()) else {
            return Ok(false);
        };

        let dx = snap_offset(bounds.left, bounds.right, viewport.left, viewport.right);
        let dy = snap_offset(bounds.top, bounds.bottom, viewport.top, viewport.bottom);
        if dx == 0.0 && dy == 0.0 {
            return Ok(false);
        }

        let position = Vec2::new(current.position.x + dx, current.position.y + dy);
        self.service.set_transform(&Transform::new(Some(position), None)).await?;
        debug!("Snapped model by ({}, {})", dx, dy);
        Ok(true)
    }

    /// Uninstall hooks, then dispose the service. Never fails.
    pub async fn dispose(&self) {
        self.load_seq.fetch_add(1, Ordering::SeqCst);
        self.uninstall_override_layer();
        self.service.dispose().await;
        *self.current_model_uri.write() = None;
    }
}

/// Shift along one axis that brings `[min, max]` back inside `[vmin, vmax]`.
/// A span larger than the viewport is kept covering it instead.
fn snap_offset(min: f64, max: f64, vmin: f64, vmax: f64) -> f64 {
    if max - min > vmax - vmin {
        if min > vmin {
            vmin - min
        } else if max < vmax {
            vmax - max
        } else {
            0.0
        }
    } else if min < vmin {
        vmin - min
    } else if max > vmax {
        vmax - max
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snap_offset() {
        assert_eq!(snap_offset(10.0, 20.0, 0.0, 100.0), 0.0);
        assert_eq!(snap_offset(-5.0, 5.0, 0.0, 100.0), 5.0);
        assert_eq!(snap_offset(95.0, 105.0, 0.0, 100.0), -5.0);
        // Wider than the viewport
        assert_eq!(snap_offset(10.0, 210.0, 0.0, 100.0), -10.0);
        assert_eq!(snap_offset(-150.0, 50.0, 0.0, 100.0), 50.0);
        assert_eq!(snap_offset(-50.0, 150.0, 0.0, 100.0), 0.0);
    }

    #[test]
    fn test_interaction_merge() {
        let mut options = InteractionOptions::default();
        options.merge(InteractionUpdate {
            drag: Some(false),
            ..Default::default()
        });
        assert!(!options.drag);
        assert!(options.wheel_zoom && options.pinch_zoom && options.tap);
    }
}
