// N.E.K.O. Live2D command line interface
// Drives the control layer against the headless adapter

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use neko_core::{MotionRef, OverrideMode, ParameterMap};
use neko_live2d::{
    EmotionMappingProvider, HeadlessAdapter, HeadlessModelSpec, InMemoryPreferences, JsonFilePreferences,
    Live2DConfig, Live2DManager, LoadModelOptions, ManagerOptions, PreferencesRepository, StaticEmotionMapping,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "neko")]
#[command(about = "Avatar runtime control layer: simulate models, inspect preferences", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON, TOML or YAML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a headless model, drive it for a number of frames and print its parameters
    Simulate {
        /// Headless model description (JSON, TOML or YAML)
        #[arg(long, short)]
        model: PathBuf,

        /// Uri the model is loaded under (preferences and emotion lookups use it)
        #[arg(long, short)]
        uri: String,

        /// Frames to render
        #[arg(long, short, default_value = "60")]
        frames: u32,

        /// Frames per second
        #[arg(long, default_value = "30")]
        fps: f64,

        /// Emotion to show after loading
        #[arg(long, short)]
        emotion: Option<String>,

        /// Motion group to play after loading
        #[arg(long)]
        motion: Option<String>,

        /// Lip-sync mouth value in [0, 1]
        #[arg(long)]
        mouth: Option<f64>,

        /// Saved-parameter blend mode (off, override, additive)
        #[arg(long)]
        mode: Option<OverrideMode>,

        /// Saved parameter, as id=value (repeatable)
        #[arg(long = "saved", value_parser = parse_parameter)]
        saved: Vec<(String, f64)>,

        /// Persistent parameter, as id=value (repeatable)
        #[arg(long = "persistent", value_parser = parse_parameter)]
        persistent: Vec<(String, f64)>,

        /// Save placement and saved parameters when done
        #[arg(long)]
        save: bool,
    },

    /// Stored per-model preferences
    #[command(subcommand)]
    Prefs(PrefsCommands),

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum PrefsCommands {
    /// Show the entry a model uri resolves to
    Show {
        uri: String,
    },

    /// List every stored entry
    List,

    /// Remove every stored entry
    Clear,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
}

fn parse_parameter(s: &str) -> Result<(String, f64), String> {
    let (id, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=value, got '{}'", s))?;
    let id = id.trim();
    if id.is_empty() {
        return Err("parameter id cannot be empty".to_string());
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid value for {}: {}", id, e))?;
    if !value.is_finite() {
        return Err(format!("value for {} must be finite", id));
    }
    Ok((id.to_string(), value))
}

fn to_map(entries: Vec<(String, f64)>) -> Option<ParameterMap> {
    (!entries.is_empty()).then(|| entries.into_iter().collect())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Live2DConfig> {
    let config = match path {
        Some(path) => Live2DConfig::from_file(path).map_err(|e| anyhow!("Failed to load {}: {}", path.display(), e))?,
        None => Live2DConfig::default(),
    };
    let config = config.with_env_overrides();
    config.validate().map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

fn file_preferences(config: &Live2DConfig) -> anyhow::Result<JsonFilePreferences> {
    let path = config
        .preferences_path
        .as_ref()
        .ok_or_else(|| anyhow!("No preferences_path configured (set it in the config file or NEKO_PREFERENCES_PATH)"))?;
    Ok(JsonFilePreferences::new(path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Simulate {
            model,
            uri,
            frames,
            fps,
            emotion,
            motion,
            mouth,
            mode,
            saved,
            persistent,
            save,
        } => {
            let options = SimulateOptions {
                frames,
                fps,
                emotion,
                motion,
                mouth,
                mode,
                saved: to_map(saved),
                persistent: to_map(persistent),
                save,
            };
            simulate(&config, &model, &uri, options).await?;
        }
        Commands::Prefs(cmd) => {
            handle_prefs_command(&config, cmd).await?;
        }
        Commands::Config(ConfigCommands::Show) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

struct SimulateOptions {
    frames: u32,
    fps: f64,
    emotion: Option<String>,
    motion: Option<String>,
    mouth: Option<f64>,
    mode: Option<OverrideMode>,
    saved: Option<ParameterMap>,
    persistent: Option<ParameterMap>,
    save: bool,
}

async fn simulate(config: &Live2DConfig, model: &Path, uri: &str, options: SimulateOptions) -> anyhow::Result<()> {
    if !options.fps.is_finite() || options.fps <= 0.0 {
        return Err(anyhow!("fps must be a positive number"));
    }

    let spec = HeadlessModelSpec::from_file(model).with_context(|| format!("Failed to read {}", model.display()))?;
    let adapter = HeadlessAdapter::with_config(config);
    adapter.register_model(uri, spec);

    let preferences: Arc<dyn PreferencesRepository> = match &config.preferences_path {
        Some(path) => Arc::new(JsonFilePreferences::new(path)),
        None => Arc::new(InMemoryPreferences::new()),
    };
    let mut manager_options = ManagerOptions::default()
        .with_config(config.clone())
        .with_preferences(Arc::clone(&preferences));
    if let Some(path) = &config.emotion_mapping_path {
        let mapping: Arc<dyn EmotionMappingProvider> = Arc::new(StaticEmotionMapping::from_file(path)?);
        manager_options = manager_options.with_emotion_provider(mapping);
    }

    let manager = Live2DManager::with_options(Arc::new(adapter.clone()), manager_options);
    manager.load_model(uri, LoadModelOptions::default()).await?;
    info!("Simulating {} frames of {} at {} fps", options.frames, uri, options.fps);

    if let Some(mode) = options.mode {
        manager.set_parameter_override_mode(mode);
    }
    if options.saved.is_some() {
        manager.set_saved_model_parameters(options.saved);
    }
    if options.persistent.is_some() {
        manager.set_persistent_parameters(options.persistent);
    }
    if let Some(value) = options.mouth {
        manager.set_mouth(value)?;
    }
    if let Some(group) = &options.motion {
        manager.play_motion(&MotionRef::group(group.clone())).await?;
    }
    let emotion = match &options.emotion {
        Some(label) => Some(manager.set_emotion(label).await),
        None => None,
    };

    let dt = Duration::from_secs_f64(1.0 / options.fps);
    for _ in 0..options.frames {
        adapter.tick(dt);
    }
    debug!("Rendered {} frames", adapter.frames());

    let parameters: serde_json::Map<String, serde_json::Value> = adapter
        .parameter_table()
        .into_iter()
        .map(|(id, value)| (id, json!(value)))
        .collect();
    let report = json!({
        "uri": uri,
        "state": manager.state().status(),
        "frames": adapter.frames(),
        "mode": manager.parameter_override_mode(),
        "mouth": manager.mouth_value(),
        "transform": manager.transform_snapshot(),
        "emotion": emotion.map(|o| json!({ "expression": o.expression, "motion": o.motion })),
        "active_motion": adapter.active_motion().map(|m| m.group),
        "parameters": parameters,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if options.save {
        manager.save_preferences().await;
        match preferences.load(uri).await? {
            Some(_) => eprintln!("✓ Preferences saved for {}", uri),
            None => eprintln!("✗ Preferences not saved for {}", uri),
        }
    }

    manager.dispose().await;
    Ok(())
}

async fn handle_prefs_command(config: &Live2DConfig, cmd: PrefsCommands) -> anyhow::Result<()> {
    let repository = file_preferences(config)?;
    match cmd {
        PrefsCommands::Show { uri } => {
            let snapshot = repository.load(&uri).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        PrefsCommands::List => {
            let all = repository.all().await?;
            println!("{}", serde_json::to_string_pretty(&all)?);
        }
        PrefsCommands::Clear => {
            repository.clear().await?;
            println!("✓ Cleared {}", repository.path().display());
        }
    }
    Ok(())
}
