//! Headless avatar example

use neko_core::{MotionRef, OverrideMode};
use neko_live2d::{
    EmotionMapping, EventKind, HeadlessAdapter, HeadlessModelSpec, InMemoryPreferences, Live2DManager,
    LoadModelOptions, ManagerOptions, MotionClip, PreferencesSnapshot, StaticEmotionMapping,
};
use std::sync::Arc;
use std::time::Duration;

const MODEL_URI: &str = "/models/mao_pro/mao_pro.model3.json";

#[tokio::main]
async fn main() -> Result<(), neko_core::Error> {
    // Initialize tracing for better error messages
    tracing_subscriber::fmt::init();

    println!("Registering headless model...");
    let adapter = HeadlessAdapter::new();
    adapter.register_model(
        MODEL_URI,
        HeadlessModelSpec::new()
            .with_parameter("ParamAngleX", 0.0, -30.0, 30.0)
            .with_parameter("ParamEyeLOpen", 1.0, 0.0, 1.0)
            .with_parameter("ParamMouthOpenY", 0.0, 0.0, 1.0)
            .with_motion(
                "Idle",
                MotionClip::new(2.0).with_curve("ParamAngleX", &[(0.0, -10.0), (1.0, 10.0), (2.0, -10.0)]),
            )
            .with_motion(
                "TapBody",
                MotionClip::new(0.5).with_curve("ParamAngleX", &[(0.0, 0.0), (0.25, 25.0), (0.5, 0.0)]),
            )
            .with_expression("exp_smile", &[("ParamEyeLOpen", 0.6)]),
    );

    let emotions = StaticEmotionMapping::new().with_model(
        MODEL_URI,
        EmotionMapping::default()
            .with_expressions("happy", &["exp_smile"])
            .with_motions("happy", &["TapBody"]),
    );

    let manager = Live2DManager::with_options(
        Arc::new(adapter.clone()),
        ManagerOptions::default()
            .with_preferences(Arc::new(InMemoryPreferences::new()))
            .with_emotion_provider(Arc::new(emotions)),
    );
    let _finished = manager.on(EventKind::MotionFinished, |event| {
        println!("  event: {:?}", event);
        Ok(())
    });

    println!("Loading model...");
    let placement = PreferencesSnapshot::new(MODEL_URI)
        .with_position(120.0, 40.0)
        .with_scale(0.8, 0.8);
    manager
        .load_model(MODEL_URI, LoadModelOptions::default().with_preferences(placement))
        .await?;
    println!("✓ Model ready: {}", manager.state().status());

    println!("\nPlaying idle with a saved head tilt...");
    manager
        .set_saved_model_parameters(Some([("ParamAngleX".to_string(), 5.0)].into_iter().collect()));
    manager.play_motion(&MotionRef::group("Idle")).await?;
    for _ in 0..30 {
        adapter.tick(Duration::from_millis(33));
    }
    println!("  ParamAngleX (additive): {:?}", adapter.parameter("ParamAngleX"));

    manager.set_parameter_override_mode(OverrideMode::Override);
    adapter.tick(Duration::from_millis(33));
    println!("  ParamAngleX (override): {:?}", adapter.parameter("ParamAngleX"));

    println!("\nTesting emotion...");
    let outcome = manager.set_emotion("happy").await;
    println!("  expression={:?} motion={:?}", outcome.expression, outcome.motion);

    println!("\nTesting lip sync...");
    manager.set_mouth(0.75)?;
    adapter.tick(Duration::from_millis(33));
    println!("  ParamMouthOpenY: {:?}", adapter.parameter("ParamMouthOpenY"));

    for _ in 0..20 {
        adapter.tick(Duration::from_millis(33));
    }

    manager.save_preferences().await;
    println!("\nSaved placement: {:?}", manager.load_preferences(MODEL_URI).await);

    manager.dispose().await;
    println!("\nExample completed!");
    Ok(())
}
