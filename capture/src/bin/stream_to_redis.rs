//! Stream camera frames into a room's realtime and subsampled Redis streams.

use anyhow::{Context, Result};
use capture::{
    open_camera, run_producer, Capturer, FrameIngestor, ImageSequenceSource, ProducerConfig,
    RetryPolicy,
};
use clap::Parser;
use shared::encoder::{FrameEncoder, DEFAULT_JPEG_QUALITY};
use shared::frame_source::FrameSource;
use shared::room_config::RoomConfig;
use shared::shutdown::ShutdownFlag;
use shared::stream::RedisStore;
use shared::video_mirror::VideoMirror;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stream_to_redis")]
#[command(about = "Stream camera frames to Redis based on a room configuration")]
struct Args {
    /// Path to the room configuration YAML file
    #[arg(long)]
    config_file: PathBuf,

    /// Redis connection URL
    #[arg(long, default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Also record every encoded frame to this Motion-JPEG file
    #[arg(long)]
    save_stream_path: Option<PathBuf>,

    /// Replay the images in this directory instead of opening the camera
    #[arg(long)]
    demo_dir: Option<PathBuf>,

    /// Frame rate of the demo replay
    #[arg(long, default_value_t = 15.0)]
    demo_fps: f64,

    /// JPEG quality (1-100)
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY)]
    jpeg_quality: u8,

    /// Attempts at opening the camera before giving up
    #[arg(long, default_value_t = 3)]
    open_attempts: u32,

    /// Seconds to wait between camera open attempts
    #[arg(long, default_value_t = 2.0)]
    open_backoff_secs: f64,

    /// Longest wait for one frame before rechecking for shutdown, in milliseconds
    #[arg(long, default_value_t = 500)]
    grab_timeout_ms: u64,

    /// Consecutive camera or Redis failures tolerated before exiting
    #[arg(long, default_value_t = 10)]
    max_consecutive_failures: u32,

    /// Seconds between throughput reports
    #[arg(long, default_value_t = 30)]
    stats_interval_secs: u64,

    /// Size of the recording queue in frames
    #[arg(long, default_value_t = 64)]
    mirror_queue: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let room = RoomConfig::load(&args.config_file)
        .with_context(|| format!("Failed to load room config {}", args.config_file.display()))?;
    info!(
        config_file = %args.config_file.display(),
        "Loaded configuration for room: {}", room.name
    );

    let shutdown = ShutdownFlag::install().context("Failed to install signal handler")?;

    let source: Box<dyn FrameSource> = match &args.demo_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Using demo footage instead of the camera");
            Box::new(ImageSequenceSource::open(dir, args.demo_fps, true)?)
        }
        None => {
            let policy = RetryPolicy::new(
                args.open_attempts,
                Duration::from_secs_f64(args.open_backoff_secs.max(0.0)),
            );
            open_camera(&room.camera.uri, Some(room.frame_size()), &policy)
                .context("Failed to connect to camera")?
        }
    };

    let encoder = FrameEncoder::new(Some(room.frame_size()), args.jpeg_quality);
    let mut capturer = Capturer::new(source, encoder, Duration::from_millis(args.grab_timeout_ms));
    if let Some(path) = &args.save_stream_path {
        capturer = capturer.with_mirror(VideoMirror::create(path, args.mirror_queue)?);
        info!(path = %path.display(), "Recording stream");
    }

    let store = RedisStore::connect(&args.redis_url)
        .with_context(|| format!("Failed to connect to Redis at {}", args.redis_url))?;
    let streams = room.streams();
    info!(
        "Using subsample rate of 1 out of {} for {}",
        room.camera.subsample_rate, streams.subsampled.key
    );
    let mut ingestor = FrameIngestor::new(store, streams, room.camera.subsample_rate);

    let config = ProducerConfig {
        max_consecutive_failures: args.max_consecutive_failures,
        stats_interval: Duration::from_secs(args.stats_interval_secs),
    };
    let result = run_producer(&mut capturer, &mut ingestor, &config, shutdown.as_atomic());

    if let Some(mirror) = capturer.take_mirror() {
        let stats = mirror.finish();
        info!(frames = stats.frames_written, "Recording closed");
    }

    let summary = result.context("Streaming stopped")?;
    info!(
        frames = summary.frames,
        subsampled = summary.subsampled,
        "Stream closed"
    );
    Ok(())
}
