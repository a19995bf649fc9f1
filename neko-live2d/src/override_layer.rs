//! Parameter override engine
//!
//! Reconciles, every frame, the values written by the model's own motion
//! system with the user's saved pose, live persistent edits and the lip-sync
//! mouth value. Ascending priority (later wins):
//!
//! 1. saved parameters, in `override` or `additive` mode, skipping lip-sync
//!    and visibility ids and anything also present in the persistent map
//! 2. the clamped mouth value, written to every lip-sync id
//! 3. persistent parameters, skipping lip-sync ids
//!
//! In additive mode a saved parameter is only offset when motion is actually
//! driving it this frame: the engine records values before the motion stage,
//! compares them after, and for a delta above `motion_epsilon` writes
//! `post + (saved - default)`; otherwise it writes the saved value itself.
//!
//! The engine keeps no state between installs. It reads the current
//! [`OverrideState`] through the getter on every invocation, so changing the
//! saved map, the mode or the mouth value takes effect on the next frame.

use crate::config::Live2DConfig;
use crate::pipeline::{FrameMiddleware, FramePipeline, MiddlewareId, Next, ParameterModel, UpdateStage};
use neko_core::{OverrideMode, ParameterMap};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Inputs of the blend, as seen at one instant
#[derive(Debug, Clone, Default)]
pub struct OverrideState {
    pub mouth_value: f64,
    pub mode: OverrideMode,
    pub saved_parameters: Option<Arc<ParameterMap>>,
    pub persistent_parameters: Option<Arc<ParameterMap>>,
}

/// Supplies the latest [`OverrideState`]; called at least once per hook per frame.
pub type OverrideStateGetter = Arc<dyn Fn() -> OverrideState + Send + Sync>;

/// Parameter sets and thresholds the engine works with
#[derive(Debug, Clone)]
pub struct OverrideRules {
    pub lip_sync_parameters: Vec<String>,
    pub visibility_parameters: Vec<String>,
    pub motion_epsilon: f64,
}

impl Default for OverrideRules {
    fn default() -> Self {
        Self::from_config(&Live2DConfig::default())
    }
}

impl OverrideRules {
    pub fn from_config(config: &Live2DConfig) -> Self {
        Self {
            lip_sync_parameters: config.lip_sync_parameters.clone(),
            visibility_parameters: config.visibility_parameters.clone(),
            motion_epsilon: config.motion_epsilon,
        }
    }

    pub fn is_lip_sync(&self, id: &str) -> bool {
        self.lip_sync_parameters.iter().any(|p| p == id)
    }

    pub fn is_visibility(&self, id: &str) -> bool {
        self.visibility_parameters.iter().any(|p| p == id)
    }
}

/// Clamp to [0,1]; non-finite input reads as closed mouth.
pub fn clamp01(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Additive-mode target for one parameter.
///
/// `pre`/`post` are the values around the motion stage. A delta within
/// `epsilon` means motion is not driving the parameter, so the saved value is
/// written as is.
pub fn additive_target(pre: f64, post: f64, saved: f64, default: f64, epsilon: f64) -> f64 {
    if (post - pre).abs() > epsilon {
        post + (saved - default)
    } else {
        saved
    }
}

/// Motion-stage observations for the current frame
#[derive(Default)]
struct FrameScratch {
    pre: HashMap<String, f64>,
    /// `(pre, post)` around the motion stage for each saved candidate
    observed: HashMap<String, (f64, f64)>,
}

impl FrameScratch {
    fn reset(&mut self) {
        self.pre.clear();
        self.observed.clear();
    }
}

/// The blend routine shared by both hooks
#[derive(Debug, Clone, Default)]
pub struct OverrideLayer {
    rules: OverrideRules,
}

impl OverrideLayer {
    pub fn new(rules: OverrideRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &OverrideRules {
        &self.rules
    }

    /// Saved entries the blend may write this frame, with finite values only.
    fn saved_candidates<'s>(&'s self, state: &'s OverrideState) -> impl Iterator<Item = (&'s String, f64)> + 's {
        let saved = match state.mode {
            OverrideMode::Off => None,
            OverrideMode::Override | OverrideMode::Additive => state.saved_parameters.as_deref(),
        };
        let persistent = state.persistent_parameters.as_deref();

        saved.into_iter().flat_map(|map| map.iter()).filter_map(move |(id, &value)| {
            if id.is_empty()
                || !value.is_finite()
                || self.rules.is_lip_sync(id)
                || self.rules.is_visibility(id)
                || persistent.map_or(false, |p| p.contains_key(id))
            {
                None
            } else {
                Some((id, value))
            }
        })
    }

    /// Apply all three layers to `model`, using `observed` as this frame's
    /// motion observations for additive mode.
    fn apply_layers(
        &self,
        state: &OverrideState,
        model: &mut dyn ParameterModel,
        observed: &HashMap<String, (f64, f64)>,
    ) {
        for (id, saved) in self.saved_candidates(state) {
            let target = match (state.mode, observed.get(id)) {
                (OverrideMode::Additive, Some(&(pre, post))) => {
                    let default = model.parameter_default(id).unwrap_or(0.0);
                    additive_target(pre, post, saved, default, self.rules.motion_epsilon)
                }
                _ => saved,
            };
            model.set_parameter_value(id, target, 1.0);
        }

        let mouth = clamp01(state.mouth_value);
        for id in &self.rules.lip_sync_parameters {
            model.set_parameter_value(id, mouth, 1.0);
        }

        if let Some(persistent) = state.persistent_parameters.as_deref() {
            for (id, &value) in persistent {
                if id.is_empty() || !value.is_finite() || self.rules.is_lip_sync(id) {
                    continue;
                }
                model.set_parameter_value(id, value, 1.0);
            }
        }
    }

    /// Register the motion-stage and model-stage hooks on `pipeline`.
    pub fn install(&self, pipeline: &Arc<FramePipeline>, getter: OverrideStateGetter) -> OverrideInstallation {
        let shared = Arc::new(HookShared {
            layer: self.clone(),
            getter,
            scratch: Mutex::new(FrameScratch::default()),
        });

        let motion_id = pipeline.register(
            UpdateStage::Motion,
            Arc::new(MotionStageHook {
                shared: Arc::clone(&shared),
            }),
        );
        let model_id = pipeline.register(UpdateStage::Model, Arc::new(ModelStageHook { shared }));
        debug!("Override layer installed (motion={:?}, model={:?})", motion_id, model_id);

        OverrideInstallation {
            pipeline: Arc::downgrade(pipeline),
            motion_id,
            model_id,
        }
    }
}

struct HookShared {
    layer: OverrideLayer,
    getter: OverrideStateGetter,
    scratch: Mutex<FrameScratch>,
}

impl HookShared {
    fn read_state(&self) -> Option<OverrideState> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.getter)())) {
            Ok(state) => Some(state),
            Err(_) => {
                warn!("Override state getter panicked; skipping override layer for this frame");
                None
            }
        }
    }

    fn guarded(&self, what: &str, f: impl FnOnce()) {
        if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            warn!("Override layer fault during {}; skipped for this frame", what);
        }
    }
}

/// Wraps the motion stage: records pre-motion values, lets motion run, then blends.
struct MotionStageHook {
    shared: Arc<HookShared>,
}

impl FrameMiddleware for MotionStageHook {
    fn handle(&self, model: &mut dyn ParameterModel, next: Next<'_>) {
        let shared = &self.shared;

        shared.scratch.lock().reset();
        let before = shared.read_state();
        if let Some(state) = &before {
            shared.guarded("pre-motion capture", || {
                let mut scratch = shared.scratch.lock();
                if state.mode == OverrideMode::Additive {
                    for (id, _) in shared.layer.saved_candidates(state) {
                        if let Some(value) = model.parameter_value(id).filter(|v| v.is_finite()) {
                            scratch.pre.insert(id.clone(), value);
                        }
                    }
                }
            });
        }

        next.run(model);

        let Some(state) = shared.read_state() else {
            return;
        };
        shared.guarded("motion blend", || {
            let mut scratch = shared.scratch.lock();
            let FrameScratch { pre, observed } = &mut *scratch;
            if state.mode == OverrideMode::Additive {
                for (id, _) in shared.layer.saved_candidates(&state) {
                    let Some(post) = model.parameter_value(id).filter(|v| v.is_finite()) else {
                        continue;
                    };
                    let before = pre.get(id).copied().unwrap_or(post);
                    observed.insert(id.clone(), (before, post));
                }
            }
            shared.layer.apply_layers(&state, model, observed);
        });
    }
}

/// Wraps the model stage: re-applies the same blend right before the stage runs.
struct ModelStageHook {
    shared: Arc<HookShared>,
}

impl FrameMiddleware for ModelStageHook {
    fn handle(&self, model: &mut dyn ParameterModel, next: Next<'_>) {
        let shared = &self.shared;
        // Observations belong to this frame's motion stage only
        let observed = std::mem::take(&mut shared.scratch.lock().observed);
        if let Some(state) = shared.read_state() {
            shared.guarded("model blend", || {
                shared.layer.apply_layers(&state, model, &observed);
            });
        }
        next.run(model);
    }
}

/// Registered hooks; dropping or [`uninstall`](Self::uninstall)ing removes them.
pub struct OverrideInstallation {
    pipeline: Weak<FramePipeline>,
    motion_id: MiddlewareId,
    model_id: MiddlewareId,
}

impl OverrideInstallation {
    pub fn uninstall(self) {
        // Drop does the work
    }
}

impl Drop for OverrideInstallation {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.remove(UpdateStage::Motion, self.motion_id);
            pipeline.remove(UpdateStage::Model, self.model_id);
            debug!("Override layer uninstalled");
        }
    }
}

impl std::fmt::Debug for OverrideInstallation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverrideInstallation")
            .field("motion_id", &self.motion_id)
            .field("model_id", &self.model_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;

    /// Parameter table with defaults, enough to drive the hooks by hand
    struct Table {
        values: HashMap<String, f64>,
        defaults: HashMap<String, f64>,
    }

    impl Table {
        fn new(params: &[(&str, f64)]) -> Self {
            let values: HashMap<String, f64> = params.iter().map(|(k, v)| (k.to_string(), *v)).collect();
            Self {
                defaults: values.clone(),
                values,
            }
        }

        fn get(&self, id: &str) -> f64 {
            self.values[id]
        }
    }

    impl ParameterModel for Table {
        fn parameter_value(&self, id: &str) -> Option<f64> {
            self.values.get(id).copied()
        }
        fn parameter_default(&self, id: &str) -> Option<f64> {
            self.defaults.get(id).copied()
        }
        fn set_parameter_value(&mut self, id: &str, value: f64, _weight: f64) -> bool {
            match self.values.get_mut(id) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            }
        }
        fn parameter_ids(&self) -> Vec<String> {
            self.values.keys().cloned().collect()
        }
    }

    fn map(entries: &[(&str, f64)]) -> Option<Arc<ParameterMap>> {
        Some(Arc::new(entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()))
    }

    fn getter_for(state: Arc<RwLock<OverrideState>>) -> OverrideStateGetter {
        Arc::new(move || state.read().clone())
    }

    fn frame(pipeline: &FramePipeline, table: &mut Table, motion: &[(&str, f64)]) {
        pipeline.run(UpdateStage::Motion, table, |model| {
            for (id, value) in motion {
                model.set_parameter_value(id, *value, 1.0);
            }
        });
        pipeline.run(UpdateStage::Model, table, |_| {});
    }

    fn table() -> Table {
        Table::new(&[
            ("ParamAngleX", 0.0),
            ("ParamBodyAngleX", 0.0),
            ("ParamEyeLOpen", 1.0),
            ("ParamMouthOpenY", 0.0),
            ("ParamO", 0.0),
            ("ParamOpacity", 1.0),
        ])
    }

    #[test]
    fn test_additive_static_parameter_gets_saved_value() {
        let pipeline = Arc::new(FramePipeline::new());
        let state = Arc::new(RwLock::new(OverrideState {
            mode: OverrideMode::Additive,
            saved_parameters: map(&[("ParamEyeLOpen", 0.4)]),
            ..Default::default()
        }));
        let _install = OverrideLayer::default().install(&pipeline, getter_for(state));

        let mut model = table();
        frame(&pipeline, &mut model, &[]);
        assert_eq!(model.get("ParamEyeLOpen"), 0.4);

        // Stays put on the following frames
        frame(&pipeline, &mut model, &[]);
        assert_eq!(model.get("ParamEyeLOpen"), 0.4);
    }

    #[test]
    fn test_additive_driven_parameter_gets_offset_once() {
        let pipeline = Arc::new(FramePipeline::new());
        let state = Arc::new(RwLock::new(OverrideState {
            mode: OverrideMode::Additive,
            saved_parameters: map(&[("ParamAngleX", 5.0)]),
            ..Default::default()
        }));
        let _install = OverrideLayer::default().install(&pipeline, getter_for(state));

        let mut model = table();
        frame(&pipeline, &mut model, &[("ParamAngleX", 12.0)]);
        // post 12 + (saved 5 - default 0), not doubled by the model-stage backstop
        assert_eq!(model.get("ParamAngleX"), 17.0);

        frame(&pipeline, &mut model, &[("ParamAngleX", 20.0)]);
        assert_eq!(model.get("ParamAngleX"), 25.0);
    }

    #[test]
    fn test_model_stage_alone_does_not_reuse_last_frame_motion() {
        let pipeline = Arc::new(FramePipeline::new());
        let state = Arc::new(RwLock::new(OverrideState {
            mode: OverrideMode::Additive,
            saved_parameters: map(&[("ParamAngleX", 5.0)]),
            ..Default::default()
        }));
        let _install = OverrideLayer::default().install(&pipeline, getter_for(state));

        let mut model = table();
        frame(&pipeline, &mut model, &[("ParamAngleX", 12.0)]);
        assert_eq!(model.get("ParamAngleX"), 17.0);

        // No motion stage this frame: nothing observed, so the plain saved value
        model.set_parameter_value("ParamAngleX", 3.0, 1.0);
        pipeline.run(UpdateStage::Model, &mut model, |_| {});
        assert_eq!(model.get("ParamAngleX"), 5.0);
    }

    #[test]
    fn test_override_mode_forces_saved_value() {
        let pipeline = Arc::new(FramePipeline::new());
        let state = Arc::new(RwLock::new(OverrideState {
            mode: OverrideMode::Override,
            saved_parameters: map(&[("ParamAngleX", 5.0)]),
            ..Default::default()
        }));
        let _install = OverrideLayer::default().install(&pipeline, getter_for(state));

        let mut model = table();
        frame(&pipeline, &mut model, &[("ParamAngleX", 12.0)]);
        assert_eq!(model.get("ParamAngleX"), 5.0);
    }

    #[test]
    fn test_off_mode_leaves_motion_output() {
        let pipeline = Arc::new(FramePipeline::new());
        let state = Arc::new(RwLock::new(OverrideState {
            mode: OverrideMode::Off,
            saved_parameters: map(&[("ParamAngleX", 5.0)]),
            mouth_value: 0.6,
            ..Default::default()
        }));
        let _install = OverrideLayer::default().install(&pipeline, getter_for(state));

        let mut model = table();
        frame(&pipeline, &mut model, &[("ParamAngleX", 12.0)]);
        assert_eq!(model.get("ParamAngleX"), 12.0);
        assert_eq!(model.get("ParamMouthOpenY"), 0.6);
    }

    #[test]
    fn test_exempt_parameters() {
        let pipeline = Arc::new(FramePipeline::new());
        let state = Arc::new(RwLock::new(OverrideState {
            mode: OverrideMode::Override,
            mouth_value: 0.3,
            saved_parameters: map(&[("ParamMouthOpenY", 0.9), ("ParamOpacity", 0.0), ("ParamAngleX", 5.0)]),
            persistent_parameters: map(&[("ParamO", 1.0), ("ParamAngleX", -7.0)]),
        }));
        let _install = OverrideLayer::default().install(&pipeline, getter_for(state));

        let mut model = table();
        frame(&pipeline, &mut model, &[("ParamOpacity", 0.8)]);

        assert_eq!(model.get("ParamMouthOpenY"), 0.3);
        assert_eq!(model.get("ParamO"), 0.3);
        assert_eq!(model.get("ParamOpacity"), 0.8);
        assert_eq!(model.get("ParamAngleX"), -7.0);
    }

    #[test]
    fn test_state_changes_apply_without_reinstall() {
        let pipeline = Arc::new(FramePipeline::new());
        let state = Arc::new(RwLock::new(OverrideState::default()));
        let _install = OverrideLayer::default().install(&pipeline, getter_for(Arc::clone(&state)));

        let mut model = table();
        frame(&pipeline, &mut model, &[]);
        assert_eq!(model.get("ParamMouthOpenY"), 0.0);

        {
            let mut s = state.write();
            s.mouth_value = 2.5;
            s.persistent_parameters = map(&[("ParamBodyAngleX", 3.0)]);
        }
        frame(&pipeline, &mut model, &[]);
        assert_eq!(model.get("ParamMouthOpenY"), 1.0);
        assert_eq!(model.get("ParamBodyAngleX"), 3.0);
    }

    #[test]
    fn test_uninstall_restores_plain_stages() {
        let pipeline = Arc::new(FramePipeline::new());
        let state = Arc::new(RwLock::new(OverrideState {
            mode: OverrideMode::Override,
            saved_parameters: map(&[("ParamAngleX", 5.0)]),
            ..Default::default()
        }));

        for _ in 0..3 {
            let install = OverrideLayer::default().install(&pipeline, getter_for(Arc::clone(&state)));
            assert_eq!(pipeline.len(UpdateStage::Motion), 1);
            assert_eq!(pipeline.len(UpdateStage::Model), 1);
            install.uninstall();
        }
        assert!(pipeline.is_empty());

        let mut model = table();
        frame(&pipeline, &mut model, &[("ParamAngleX", 12.0)]);
        assert_eq!(model.get("ParamAngleX"), 12.0);
    }

    #[test]
    fn test_panicking_getter_degrades_to_noop() {
        let pipeline = Arc::new(FramePipeline::new());
        let getter: OverrideStateGetter = Arc::new(|| panic!("state unavailable"));
        let _install = OverrideLayer::default().install(&pipeline, getter);

        let mut model = table();
        frame(&pipeline, &mut model, &[("ParamAngleX", 12.0)]);
        assert_eq!(model.get("ParamAngleX"), 12.0);
    }

    #[test]
    fn test_additive_target() {
        assert_eq!(additive_target(1.0, 1.0, 0.4, 0.0, 0.001), 0.4);
        assert_eq!(additive_target(1.0, 1.0005, 0.4, 0.0, 0.001), 0.4);
        assert_eq!(additive_target(0.0, 2.0, 0.5, 0.25, 0.001), 2.25);
    }

    #[test]
    fn test_clamp01() {
        assert_eq!(clamp01(-1.0), 0.0);
        assert_eq!(clamp01(0.25), 0.25);
        assert_eq!(clamp01(7.0), 1.0);
        assert_eq!(clamp01(f64::NAN), 0.0);
    }
}
