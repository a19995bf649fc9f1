//! Service state machine and event tests

use async_trait::async_trait;
use neko_core::{ErrorInfo, ExpressionRef, Live2DState, Live2DStatus, ModelRef, MotionRef, Platform, Transform, Vec2};
use neko_live2d::{
    AdapterError, Capabilities, EventKind, EventSink, HandlerErrorHook, HeadlessAdapter, HeadlessModelSpec,
    Live2DAdapter, Live2DConfig, Live2DError, Live2DEvent, Live2DService, LoadOptions,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Adapter that records calls and fails on demand
#[derive(Default)]
struct ScriptedAdapter {
    capabilities: Capabilities,
    delays: HashMap<String, Duration>,
    failing_uris: Vec<String>,
    fail_unload: bool,
    calls: Mutex<Vec<String>>,
    sink: Mutex<Option<EventSink>>,
}

impl ScriptedAdapter {
    fn full() -> Self {
        Self {
            capabilities: Capabilities::all(),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn report(&self, event: Live2DEvent) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }
}

#[async_trait]
impl Live2DAdapter for ScriptedAdapter {
    fn platform(&self) -> Platform {
        Platform::Unknown
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn set_event_sink(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    async fn load_model(&self, model: &ModelRef, _options: &LoadOptions) -> Result<(), AdapterError> {
        self.calls.lock().push(format!("load:{}", model.uri));
        if let Some(delay) = self.delays.get(&model.uri) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing_uris.contains(&model.uri) {
            return Err(AdapterError::Backend("asset fetch failed".to_string()));
        }
        Ok(())
    }

    async fn unload_model(&self) -> Result<(), AdapterError> {
        self.calls.lock().push("unload".to_string());
        if self.fail_unload {
            return Err(AdapterError::Backend("renderer already gone".to_string()));
        }
        Ok(())
    }

    async fn play_motion(&self, motion: &MotionRef) -> Result<(), AdapterError> {
        self.calls.lock().push(format!("motion:{}", motion.group));
        Ok(())
    }

    async fn set_expression(&self, expression: &ExpressionRef) -> Result<(), AdapterError> {
        self.calls.lock().push(format!("expression:{}", expression.id));
        Ok(())
    }

    fn set_mouth_value(&self, value: f64) -> Result<(), AdapterError> {
        self.calls.lock().push(format!("mouth:{}", value));
        Ok(())
    }

    async fn set_transform(&self, _transform: &Transform) -> Result<(), AdapterError> {
        self.calls.lock().push("transform".to_string());
        Ok(())
    }

    async fn dispose(&self) -> Result<(), AdapterError> {
        self.calls.lock().push("dispose".to_string());
        Err(AdapterError::Backend("teardown failed".to_string()))
    }
}

fn record(service: &Live2DService, kind: EventKind) -> Arc<Mutex<Vec<Live2DEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    // Dropping the handle keeps the handler registered
    let _ = service.on(kind, move |event| {
        seen_clone.lock().push(event.clone());
        Ok(())
    });
    seen
}

#[tokio::test]
async fn test_blank_uri_is_rejected_without_state_change() {
    let adapter = Arc::new(ScriptedAdapter::full());
    let service = Live2DService::new(adapter.clone());
    let changes = record(&service, EventKind::StateChanged);

    for uri in ["", "   "] {
        let err = service.load_model(ModelRef::new(uri), LoadOptions::new()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_MODEL_REF");
    }

    assert_eq!(service.state(), Live2DState::Idle);
    assert!(changes.lock().is_empty());
    assert!(adapter.calls().is_empty());
}

#[tokio::test]
async fn test_successful_load() {
    let adapter = Arc::new(ScriptedAdapter::full());
    let service = Live2DService::new(adapter);
    let changes = record(&service, EventKind::StateChanged);
    let loaded = record(&service, EventKind::ModelLoaded);

    let model = ModelRef::url("/models/mao/mao.model3.json");
    service.load_model(model.clone(), LoadOptions::new()).await.unwrap();

    assert_eq!(service.state(), Live2DState::Ready { model: model.clone() });
    assert_eq!(loaded.lock().as_slice(), &[Live2DEvent::ModelLoaded { model: model.clone() }]);

    let statuses: Vec<(Live2DStatus, Live2DStatus)> = changes
        .lock()
        .iter()
        .map(|e| match e {
            Live2DEvent::StateChanged { prev, next } => (prev.status(), next.status()),
            other => panic!("unexpected event {:?}", other),
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            (Live2DStatus::Idle, Live2DStatus::Loading),
            (Live2DStatus::Loading, Live2DStatus::Ready)
        ]
    );
}

#[tokio::test]
async fn test_failed_load_sets_error_and_returns_it() {
    let adapter = Arc::new(ScriptedAdapter {
        failing_uris: vec!["broken".to_string()],
        ..ScriptedAdapter::full()
    });
    let service = Live2DService::new(adapter);
    let errors = record(&service, EventKind::Error);
    let loaded = record(&service, EventKind::ModelLoaded);

    let err = service.load_model(ModelRef::new("broken"), LoadOptions::new()).await.unwrap_err();
    assert!(matches!(err, Live2DError::ModelLoadFailed { ref uri, .. } if uri == "broken"));

    match service.state() {
        Live2DState::Error { model, error } => {
            assert_eq!(model, Some(ModelRef::new("broken")));
            assert_eq!(error.code, "MODEL_LOAD_FAILED");
            assert!(error.cause.unwrap().contains("asset fetch failed"));
        }
        other => panic!("expected error state, got {:?}", other),
    }
    assert_eq!(errors.lock().len(), 1);
    assert!(loaded.lock().is_empty());
}

#[tokio::test]
async fn test_unload_reaches_idle_even_when_adapter_fails() {
    let adapter = Arc::new(ScriptedAdapter {
        fail_unload: true,
        ..ScriptedAdapter::full()
    });
    let service = Live2DService::new(adapter);
    let unloaded = record(&service, EventKind::ModelUnloaded);

    service.load_model(ModelRef::new("m"), LoadOptions::new()).await.unwrap();
    let result = service.unload_model().await;

    assert!(matches!(result, Err(Live2DError::Adapter(_))));
    assert_eq!(service.state(), Live2DState::Idle);
    assert_eq!(
        unloaded.lock().as_slice(),
        &[Live2DEvent::ModelUnloaded {
            prev_model: Some(ModelRef::new("m"))
        }]
    );
}

#[tokio::test]
async fn test_missing_capability_fails_without_state_change() {
    let adapter = Arc::new(ScriptedAdapter::default());
    let service = Live2DService::new(adapter.clone());
    service.load_model(ModelRef::new("m"), LoadOptions::new()).await.unwrap();
    let before = service.state();

    let err = service.play_motion(&MotionRef::group("Idle")).await.unwrap_err();
    assert!(matches!(err, Live2DError::CapabilityMissing { operation: "play_motion" }));
    let err = service.set_expression(&ExpressionRef::new("smile")).await.unwrap_err();
    assert!(matches!(err, Live2DError::CapabilityMissing { operation: "set_expression" }));
    let err = service.set_mouth_value(0.5).unwrap_err();
    assert!(matches!(err, Live2DError::CapabilityMissing { operation: "set_mouth_value" }));
    let err = service.set_transform(&Transform::default()).await.unwrap_err();
    assert!(matches!(err, Live2DError::CapabilityMissing { operation: "set_transform" }));

    assert_eq!(service.state(), before);
    assert_eq!(adapter.calls(), vec!["load:m".to_string()]);
}

/// Adapter that only implements the required primitives
struct BareAdapter;

#[async_trait]
impl Live2DAdapter for BareAdapter {
    fn platform(&self) -> Platform {
        Platform::Web
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn load_model(&self, _model: &ModelRef, _options: &LoadOptions) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_unimplemented_primitive_reports_capability_missing() {
    let service = Live2DService::new(Arc::new(BareAdapter));
    service.load_model(ModelRef::new("m"), LoadOptions::new()).await.unwrap();

    let err = service.play_motion(&MotionRef::group("Idle")).await.unwrap_err();
    assert_eq!(err.code(), "CAPABILITY_MISSING");
    assert!(service.view_props().is_empty());

    // No unload primitive is not a failure
    service.unload_model().await.unwrap();
    assert_eq!(service.state(), Live2DState::Idle);
}

#[tokio::test]
async fn test_mouth_value_is_validated_and_clamped() {
    let adapter = Arc::new(ScriptedAdapter::full());
    let service = Live2DService::new(adapter.clone());

    assert_eq!(service.set_mouth_value(1.7).unwrap(), 1.0);
    assert_eq!(service.mouth_value(), 1.0);
    assert_eq!(service.set_mouth_value(-0.2).unwrap(), 0.0);
    assert_eq!(service.set_mouth_value(0.25).unwrap(), 0.25);

    for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = service.set_mouth_value(bad).unwrap_err();
        assert!(matches!(err, Live2DError::InvalidNumber { name: "mouth_value", .. }));
    }
    assert_eq!(service.mouth_value(), 0.25);
    assert_eq!(adapter.calls(), vec!["mouth:1", "mouth:0", "mouth:0.25"]);
}

#[tokio::test]
async fn test_non_finite_mouth_value_is_reported_before_capability() {
    let adapter = Arc::new(ScriptedAdapter::default());
    let service = Live2DService::new(adapter.clone());

    let err = service.set_mouth_value(f64::NAN).unwrap_err();
    assert_eq!(err.code(), "INVALID_NUMBER");
    let err = service.set_mouth_value(0.5).unwrap_err();
    assert_eq!(err.code(), "CAPABILITY_MISSING");
    assert!(adapter.calls().is_empty());
}

#[tokio::test]
async fn test_non_finite_transform_is_rejected() {
    let adapter = Arc::new(ScriptedAdapter::full());
    let service = Live2DService::new(adapter.clone());

    let err = service
        .set_transform(&Transform::new(Some(Vec2::new(f64::NAN, 0.0)), None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_NUMBER");
    assert!(adapter.calls().is_empty());
}

#[tokio::test]
async fn test_adapter_runtime_error_forces_error_state() {
    let adapter = Arc::new(ScriptedAdapter::full());
    let service = Live2DService::new(adapter.clone());
    let errors = record(&service, EventKind::Error);
    service.load_model(ModelRef::new("m"), LoadOptions::new()).await.unwrap();

    let info = ErrorInfo::new("RENDER_LOST", "WebGL context lost");
    adapter.report(Live2DEvent::Error { error: info.clone() });

    assert_eq!(
        service.state(),
        Live2DState::Error {
            model: Some(ModelRef::new("m")),
            error: info.clone()
        }
    );
    assert_eq!(errors.lock().as_slice(), &[Live2DEvent::Error { error: info }]);
}

#[tokio::test]
async fn test_adapter_events_are_republished() {
    let adapter = HeadlessAdapter::new();
    adapter.register_model("m", HeadlessModelSpec::new());
    let service = Live2DService::new(Arc::new(adapter.clone()));
    let taps = record(&service, EventKind::Tap);

    adapter.tap(12.0, 34.0);
    assert_eq!(taps.lock().as_slice(), &[Live2DEvent::Tap { x: 12.0, y: 34.0 }]);
    assert_eq!(service.platform(), Platform::Headless);
}

#[tokio::test]
async fn test_throwing_handler_does_not_block_delivery() {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let failures_clone = Arc::clone(&failures);
    let hook: HandlerErrorHook = Arc::new(move |kind, err| failures_clone.lock().push(format!("{}: {}", kind, err)));
    let service = Live2DService::with_config(Arc::new(ScriptedAdapter::full()), &Live2DConfig::default(), Some(hook));

    let _bad = service.on(EventKind::ModelLoaded, |_| anyhow::bail!("listener crashed"));
    let loaded = record(&service, EventKind::ModelLoaded);

    service.load_model(ModelRef::new("m"), LoadOptions::new()).await.unwrap();

    assert_eq!(loaded.lock().len(), 1);
    assert_eq!(failures.lock().as_slice(), &["modelLoaded: listener crashed".to_string()]);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let service = Live2DService::new(Arc::new(ScriptedAdapter::full()));
    let count = Arc::new(Mutex::new(0));
    let count_clone = Arc::clone(&count);
    let sub = service.on(EventKind::StateChanged, move |_| {
        *count_clone.lock() += 1;
        Ok(())
    });

    service.load_model(ModelRef::new("m"), LoadOptions::new()).await.unwrap();
    sub.unsubscribe();
    sub.unsubscribe();
    service.unload_model().await.unwrap();

    assert_eq!(*count.lock(), 2);
}

#[tokio::test]
async fn test_superseded_load_does_not_touch_state() {
    let mut delays = HashMap::new();
    delays.insert("slow".to_string(), Duration::from_millis(80));
    let adapter = Arc::new(ScriptedAdapter {
        delays,
        ..ScriptedAdapter::full()
    });
    let service = Live2DService::new(adapter);
    let loaded = record(&service, EventKind::ModelLoaded);

    let (slow, fast) = tokio::join!(service.load_model(ModelRef::new("slow"), LoadOptions::new()), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        service.load_model(ModelRef::new("fast"), LoadOptions::new()).await
    });

    assert!(matches!(slow, Err(Live2DError::LoadSuperseded { .. })));
    fast.unwrap();
    assert_eq!(service.state(), Live2DState::Ready { model: ModelRef::new("fast") });
    assert_eq!(loaded.lock().as_slice(), &[Live2DEvent::ModelLoaded { model: ModelRef::new("fast") }]);
}

#[tokio::test]
async fn test_broadcast_subscription() {
    let service = Live2DService::new(Arc::new(ScriptedAdapter::full()));
    let mut rx = service.subscribe();

    service.load_model(ModelRef::new("m"), LoadOptions::new()).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind());
    }
    assert_eq!(
        kinds,
        vec![EventKind::StateChanged, EventKind::StateChanged, EventKind::ModelLoaded]
    );
}

#[tokio::test]
async fn test_dispose_tolerates_teardown_failure() {
    let adapter = Arc::new(ScriptedAdapter::full());
    let service = Live2DService::new(adapter.clone());
    service.load_model(ModelRef::new("m"), LoadOptions::new()).await.unwrap();

    service.dispose().await;

    assert_eq!(service.state(), Live2DState::Idle);
    assert_eq!(adapter.calls(), vec!["load:m", "unload", "dispose"]);
}
