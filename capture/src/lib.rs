//! Producer side of the monitor: camera capture into the room's durable
//! frame streams.

pub mod capturer;
pub mod ingest;
pub mod replay;
pub mod retry;
pub mod rtsp_source;
pub mod v4l2_source;

use shared::frame_source::{CameraLocation, FrameSource, SourceResult};
use std::time::Duration;
use tracing::info;

pub use capturer::Capturer;
pub use ingest::{run_producer, FrameIngestor, ProducerConfig, ProducerError, ProducerSummary};
pub use replay::ImageSequenceSource;
pub use retry::RetryPolicy;
pub use rtsp_source::RtspFrameSource;
pub use v4l2_source::V4l2FrameSource;

/// How long a network camera gets to deliver its first frame.
pub const NETWORK_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Open the camera named by `uri`, retrying per `policy`.
///
/// URIs that can never be opened are rejected without retrying.
pub fn open_camera(
    uri: &str,
    size: Option<(u32, u32)>,
    policy: &RetryPolicy,
) -> SourceResult<Box<dyn FrameSource>> {
    let source: Box<dyn FrameSource> = match CameraLocation::resolve(uri)? {
        CameraLocation::Device(path) => {
            Box::new(policy.run(&format!("Opening camera {}", path.display()), |_| {
                V4l2FrameSource::open(&path, size)
            })?)
        }
        CameraLocation::Network(url) => {
            Box::new(policy.run("Connecting to network camera", |_| {
                RtspFrameSource::open(&url, size, NETWORK_CONNECT_TIMEOUT)
            })?)
        }
    };
    info!(camera = source.name(), "Successfully connected to camera");
    Ok(source)
}
