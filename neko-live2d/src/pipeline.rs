//! Per-frame update pipeline with middleware extension points
//!
//! A render loop runs two update stages per frame: the motion stage (motion
//! playback writes parameters) and the model stage (physics/deformation reads
//! them). Instead of swapping the host's callbacks, code that needs to observe
//! or adjust parameters around a stage registers a [`FrameMiddleware`]. The
//! host passes its own stage callback every time it runs the stage, so the
//! host callback is never replaced and removing a middleware by id leaves
//! no wrapper behind.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Parameter access a stage and its middleware operate on
pub trait ParameterModel {
    /// Current value, `None` if the model has no such parameter.
    fn parameter_value(&self, id: &str) -> Option<f64>;

    /// Default (rest) value, `None` if unknown.
    fn parameter_default(&self, id: &str) -> Option<f64>;

    /// Blend `value` into the parameter with `weight` in [0,1].
    /// Returns `false` when the parameter does not exist.
    fn set_parameter_value(&mut self, id: &str, value: f64, weight: f64) -> bool;

    fn parameter_ids(&self) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateStage {
    /// Motion/expression playback
    Motion,
    /// Final model update (physics, deformers) right before drawing
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MiddlewareId(u64);

/// Code wrapped around one update stage
pub trait FrameMiddleware: Send + Sync {
    /// Run around the rest of the chain. Implementations call `next.run(model)`
    /// exactly once; skipping it skips the stage for this frame.
    fn handle(&self, model: &mut dyn ParameterModel, next: Next<'_>);
}

/// Remainder of a middleware chain, ending in the host's stage callback
pub struct Next<'a> {
    rest: &'a [Arc<dyn FrameMiddleware>],
    stage: &'a mut dyn FnMut(&mut dyn ParameterModel),
}

impl<'a> Next<'a> {
    pub fn run(self, model: &mut dyn ParameterModel) {
        match self.rest.split_first() {
            Some((middleware, rest)) => middleware.handle(model, Next { rest, stage: self.stage }),
            None => (self.stage)(model),
        }
    }
}

#[derive(Default)]
struct StageChain {
    middleware: Vec<(MiddlewareId, Arc<dyn FrameMiddleware>)>,
}

/// Middleware registry for the two update stages
#[derive(Default)]
pub struct FramePipeline {
    motion: RwLock<StageChain>,
    model: RwLock<StageChain>,
    next_id: AtomicU64,
}

impl FramePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain(&self, stage: UpdateStage) -> &RwLock<StageChain> {
        match stage {
            UpdateStage::Motion => &self.motion,
            UpdateStage::Model => &self.model,
        }
    }

    /// Append `middleware` to `stage`. Later registrations run closer to the stage.
    pub fn register(&self, stage: UpdateStage, middleware: Arc<dyn FrameMiddleware>) -> MiddlewareId {
        let id = MiddlewareId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.chain(stage).write().middleware.push((id, middleware));
        id
    }

    /// Remove a middleware; returns whether it was registered.
    pub fn remove(&self, stage: UpdateStage, id: MiddlewareId) -> bool {
        let mut chain = self.chain(stage).write();
        let before = chain.middleware.len();
        chain.middleware.retain(|(mid, _)| *mid != id);
        chain.middleware.len() != before
    }

    pub fn len(&self, stage: UpdateStage) -> usize {
        self.chain(stage).read().middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len(UpdateStage::Motion) == 0 && self.len(UpdateStage::Model) == 0
    }

    /// Run `stage` on `model` through the registered middleware.
    pub fn run<F>(&self, stage: UpdateStage, model: &mut dyn ParameterModel, mut callback: F)
    where
        F: FnMut(&mut dyn ParameterModel),
    {
        // Not held while the chain runs; middleware may touch the pipeline
        let middleware: Vec<Arc<dyn FrameMiddleware>> = self
            .chain(stage)
            .read()
            .middleware
            .iter()
            .map(|(_, m)| Arc::clone(m))
            .collect();

        Next {
            rest: &middleware,
            stage: &mut callback,
        }
        .run(model);
    }
}
