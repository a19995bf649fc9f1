//! Live2D service - lifecycle state machine over a platform adapter
//!
//! Owns the [`Live2DState`] (`idle → loading → ready | error`), validates
//! input before it reaches the adapter, and republishes adapter events
//! through an [`EventEmitter`].

use crate::adapter::{Capabilities, Live2DAdapter, LoadOptions, ViewProps};
use crate::config::Live2DConfig;
use crate::error::{AdapterError, Live2DError, Result};
use crate::events::{EventEmitter, EventKind, EventSink, HandlerErrorHook, Live2DEvent, Subscription};
use crate::override_layer::clamp01;
use crate::runtime::Live2DRuntime;
use neko_core::{ExpressionRef, Live2DState, ModelRef, MotionRef, Transform};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

struct ServiceInner {
    adapter: Arc<dyn Live2DAdapter>,
    state: RwLock<Live2DState>,
    mouth_value: RwLock<f64>,
    emitter: EventEmitter,
    /// Bumped by every load and unload; a load only commits if it is still current
    load_seq: AtomicU64,
}

impl ServiceInner {
    /// Replace the state and announce the transition. The lock is released
    /// before handlers run.
    fn set_state(&self, next: Live2DState) {
        let prev = std::mem::replace(&mut *self.state.write(), next.clone());
        debug!("Live2D state: {} -> {}", prev.status(), next.status());
        self.emitter.emit(Live2DEvent::StateChanged { prev, next });
    }

    /// Events reported by the adapter. Runtime errors force the error state
    /// while keeping the current model.
    fn on_adapter_event(&self, event: Live2DEvent) {
        if let Live2DEvent::Error { error } = &event {
            warn!("Adapter reported runtime error: {}", error);
            let model = self.state.read().model().cloned();
            self.set_state(Live2DState::Error {
                model,
                error: error.clone(),
            });
        }
        self.emitter.emit(event);
    }
}

/// State-machine service over one adapter. Cloning shares the same service.
#[derive(Clone)]
pub struct Live2DService {
    inner: Arc<ServiceInner>,
}

impl Live2DService {
    pub fn new(adapter: Arc<dyn Live2DAdapter>) -> Self {
        Self::with_config(adapter, &Live2DConfig::default(), None)
    }

    /// Create a service; `on_handler_error` receives event handler failures
    /// (default: warning log).
    pub fn with_config(
        adapter: Arc<dyn Live2DAdapter>,
        config: &Live2DConfig,
        on_handler_error: Option<HandlerErrorHook>,
    ) -> Self {
        let inner = Arc::new(ServiceInner {
            adapter: Arc::clone(&adapter),
            state: RwLock::new(Live2DState::Idle),
            mouth_value: RwLock::new(0.0),
            emitter: EventEmitter::new(config.event_channel_capacity, on_handler_error),
            load_seq: AtomicU64::new(0),
        });

        // Weak so the adapter holding the sink does not keep the service alive
        let weak: Weak<ServiceInner> = Arc::downgrade(&inner);
        let sink: EventSink = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_adapter_event(event);
            }
        });
        adapter.set_event_sink(sink);

        Self { inner }
    }

    pub fn state(&self) -> Live2DState {
        self.inner.state.read().clone()
    }

    pub fn platform(&self) -> neko_core::Platform {
        self.inner.adapter.platform()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.adapter.capabilities()
    }

    pub fn adapter(&self) -> &Arc<dyn Live2DAdapter> {
        &self.inner.adapter
    }

    pub fn runtime(&self) -> Option<Arc<dyn Live2DRuntime>> {
        self.inner.adapter.runtime()
    }

    /// Last value passed to [`set_mouth_value`](Self::set_mouth_value), clamped.
    pub fn mouth_value(&self) -> f64 {
        *self.inner.mouth_value.read()
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Live2DEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.emitter.on(kind, handler)
    }

    /// Broadcast receiver of every event.
    pub fn subscribe(&self) -> broadcast::Receiver<Live2DEvent> {
        self.inner.emitter.subscribe()
    }

    fn require(&self, supported: bool, operation: &'static str) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(Live2DError::CapabilityMissing { operation })
        }
    }

    /// Load `model` through the adapter.
    ///
    /// A blank uri fails with [`Live2DError::InvalidModelRef`] before any state
    /// change. An adapter failure moves to the error state, emits `error` and
    /// is returned. A load overtaken by a newer load or unload leaves state
    /// alone and returns [`Live2DError::LoadSuperseded`] (or its own failure).
    pub async fn load_model(&self, model: ModelRef, options: LoadOptions) -> Result<()> {
        if !model.is_valid() {
            return Err(Live2DError::InvalidModelRef(
                "model reference must carry a non-empty uri".to_string(),
            ));
        }

        let seq = self.inner.load_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.set_state(Live2DState::Loading { model: model.clone() });

        let outcome = self.inner.adapter.load_model(&model, &options).await;
        let current = self.inner.load_seq.load(Ordering::SeqCst) == seq;

        match outcome {
            Ok(()) if current => {
                self.inner.set_state(Live2DState::Ready { model: model.clone() });
                info!("Live2D model loaded: {}", model.uri);
                self.inner.emitter.emit(Live2DEvent::ModelLoaded { model });
                Ok(())
            }
            Ok(()) => {
                debug!("Discarding superseded load of {}", model.uri);
                Err(Live2DError::LoadSuperseded { uri: model.uri })
            }
            Err(source) => {
                let err = Live2DError::ModelLoadFailed {
                    uri: model.uri.clone(),
                    source,
                };
                if current {
                    let info = err.to_info();
                    warn!("Live2D model load failed: {}", info);
                    self.inner.set_state(Live2DState::Error {
                        model: Some(model),
                        error: info.clone(),
                    });
                    self.inner.emitter.emit(Live2DEvent::Error { error: info });
                } else {
                    debug!("Superseded load of {} failed: {}", model.uri, err);
                }
                Err(err)
            }
        }
    }

    /// Unload the current model. Always ends in `idle` and emits
    /// `modelUnloaded`; an adapter failure is returned afterwards.
    pub async fn unload_model(&self) -> Result<()> {
        self.inner.load_seq.fetch_add(1, Ordering::SeqCst);
        let prev_model = self.inner.state.read().model().cloned();

        let failure = match self.inner.adapter.unload_model().await {
            Ok(()) | Err(AdapterError::Unsupported { .. }) => None,
            Err(e) => {
                warn!("Adapter unload failed: {}", e);
                Some(e)
            }
        };

        self.inner.set_state(Live2DState::Idle);
        self.inner.emitter.emit(Live2DEvent::ModelUnloaded { prev_model });

        match failure {
            Some(e) => Err(Live2DError::Adapter(e)),
            None => Ok(()),
        }
    }

    pub async fn play_motion(&self, motion: &MotionRef) -> Result<()> {
        self.require(self.capabilities().motions, "play_motion")?;
        self.inner
            .adapter
            .play_motion(motion)
            .await
            .map_err(|e| Live2DError::from_adapter("play_motion", e))
    }

    pub async fn set_expression(&self, expression: &ExpressionRef) -> Result<()> {
        self.require(self.capabilities().expressions, "set_expression")?;
        self.inner
            .adapter
            .set_expression(expression)
            .await
            .map_err(|e| Live2DError::from_adapter("set_expression", e))
    }

    /// Validate, clamp to [0,1], store and forward. Returns the stored value.
    pub fn set_mouth_value(&self, value: f64) -> Result<f64> {
        if !value.is_finite() {
            return Err(Live2DError::InvalidNumber {
                name: "mouth_value",
                value,
            });
        }
        self.require(self.capabilities().mouth, "set_mouth_value")?;
        let value = clamp01(value);
        *self.inner.mouth_value.write() = value;
        self.inner
            .adapter
            .set_mouth_value(value)
            .map_err(|e| Live2DError::from_adapter("set_mouth_value", e))?;
        Ok(value)
    }

    pub async fn set_transform(&self, transform: &Transform) -> Result<()> {
        self.require(self.capabilities().transform, "set_transform")?;
        check_transform(transform)?;
        self.inner
            .adapter
            .set_transform(transform)
            .await
            .map_err(|e| Live2DError::from_adapter("set_transform", e))
    }

    /// Adapter view properties; empty when the adapter has none.
    pub fn view_props(&self) -> ViewProps {
        self.inner.adapter.view_props().unwrap_or_default()
    }

    /// Unload, then release the adapter. Both steps are best-effort.
    pub async fn dispose(&self) {
        if let Err(e) = self.unload_model().await {
            warn!("Unload during dispose failed: {}", e);
        }
        if let Err(e) = self.inner.adapter.dispose().await {
            warn!("Adapter dispose failed: {}", e);
        }
        info!("Live2D service disposed");
    }
}

fn check_transform(transform: &Transform) -> Result<()> {
    let position = transform.position.map(|p| [("position.x", p.x), ("position.y", p.y)]);
    let scale = transform.scale.map(|s| {
        let v = s.to_vec2();
        [("scale.x", v.x), ("scale.y", v.y)]
    });
    for (name, value) in position.into_iter().chain(scale).flatten() {
        if !value.is_finite() {
            return Err(Live2DError::InvalidNumber { name, value });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use neko_core::{Scale, Vec2};

    #[test]
    fn test_check_transform() {
        assert!(check_transform(&Transform::default()).is_ok());
        assert!(check_transform(&Transform::new(Some(Vec2::new(1.0, 2.0)), Some(Scale::Uniform(0.5)))).is_ok());

        let err = check_transform(&Transform::new(None, Some(Scale::Axes(Vec2::new(1.0, f64::INFINITY))))).unwrap_err();
        assert!(matches!(err, Live2DError::InvalidNumber { name: "scale.y", .. }));
    }
}
