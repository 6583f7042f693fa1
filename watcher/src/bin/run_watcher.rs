//! Watch a room's subsampled frame stream with a vision model.

use anyhow::{Context, Result};
use clap::Parser;
use shared::room_config::RoomConfig;
use shared::shutdown::ShutdownFlag;
use shared::stream::RedisStore;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use watcher::{
    AlertSink, AwarenessCadence, AwarenessController, CommandAlertSink, InferenceClient,
    InferenceConfig, LogAlertSink, Orchestrator, OrchestratorConfig,
};

#[derive(Parser, Debug)]
#[command(name = "run_watcher")]
#[command(about = "Evaluate a room's camera stream against its instructions with a vision model")]
struct Args {
    /// Path to the room configuration YAML file
    #[arg(long)]
    config_file: PathBuf,

    /// Redis connection URL
    #[arg(long, default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Base URL of the OpenAI-compatible inference server
    #[arg(long, default_value = watcher::inference::DEFAULT_BASE_URL)]
    inference_url: String,

    /// API key sent as a bearer token, if the server requires one
    #[arg(long, env = "VLLM_API_KEY")]
    api_key: Option<String>,

    /// Frames per evaluation batch
    #[arg(long, default_value_t = 16)]
    num_frames_to_process: usize,

    /// Retries per instruction after a failed evaluation
    #[arg(long, default_value_t = 1)]
    max_retries: u32,

    /// Inference request timeout in seconds
    #[arg(long, default_value_t = 120)]
    request_timeout_secs: u64,

    /// Frame rate reported to the model when it cannot be measured
    #[arg(long, default_value_t = watcher::inference::DEFAULT_FPS)]
    default_fps: u32,

    /// Seconds between rounds at LOW awareness
    #[arg(long, default_value_t = 10.0)]
    low_cadence_secs: f64,

    /// Seconds between rounds at MEDIUM awareness
    #[arg(long, default_value_t = 5.0)]
    medium_cadence_secs: f64,

    /// Seconds between rounds at HIGH awareness
    #[arg(long, default_value_t = 1.0)]
    high_cadence_secs: f64,

    /// Program to run on every alert (logged only when omitted)
    #[arg(long)]
    alert_command: Option<String>,

    /// Arguments for the alert program
    #[arg(long, num_args = 1.., allow_hyphen_values = true, requires = "alert_command")]
    alert_args: Vec<String>,
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let room = RoomConfig::load(&args.config_file)
        .with_context(|| format!("Failed to load room config {}", args.config_file.display()))?;
    let instructions = room.require_instructions()?.to_vec();
    info!(
        config_file = %args.config_file.display(),
        instructions = instructions.len(),
        model = %room.llm.model_name,
        "Loaded configuration for room: {}", room.name
    );

    let cadence = AwarenessCadence::new(
        secs(args.low_cadence_secs),
        secs(args.medium_cadence_secs),
        secs(args.high_cadence_secs),
    )?;

    let shutdown = ShutdownFlag::install().context("Failed to install signal handler")?;

    let analyzer = InferenceClient::new(InferenceConfig {
        base_url: args.inference_url.clone(),
        model: room.llm.model_name.clone(),
        api_key: args.api_key.clone(),
        timeout: Duration::from_secs(args.request_timeout_secs),
        default_fps: args.default_fps,
        ..InferenceConfig::default()
    })
    .context("Failed to build inference client")?;

    let alerts: Box<dyn AlertSink> = match &args.alert_command {
        Some(program) => Box::new(CommandAlertSink::new(program.clone(), args.alert_args.clone())),
        None => Box::new(LogAlertSink::new(room.name.clone())),
    };

    let store = RedisStore::connect(&args.redis_url)
        .with_context(|| format!("Failed to connect to Redis at {}", args.redis_url))?;

    let config = OrchestratorConfig {
        batch_size: args.num_frames_to_process.max(1),
        max_retries: args.max_retries,
        ..OrchestratorConfig::default()
    };
    let mut orchestrator = Orchestrator::new(
        store,
        room.streams(),
        analyzer,
        alerts,
        instructions,
        AwarenessController::new(cadence),
        config,
    );
    orchestrator.run(&shutdown);

    let final_state = orchestrator.awareness();
    info!(
        rounds = orchestrator.rounds(),
        awareness_level = %final_state.level,
        "Watcher exited"
    );
    Ok(())
}
