//! Camera abstraction for the capture pipeline.
//!
//! A [`FrameSource`] owns a device handle and hands out one raw RGB image per
//! successful grab. It never paces itself: the caller decides how long it is
//! willing to wait for the next frame and what to do when none is ready.
//!
//! Capture is split in two steps, mirroring how V4L2 and most camera SDKs
//! work: [`grab`](FrameSource::grab) checks whether a new frame is ready and
//! latches it, [`retrieve`](FrameSource::retrieve) decodes the latched frame.

pub mod mock;

use image::RgbImage;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub use mock::MockFrameSource;

/// Device faults raised by a [`FrameSource`].
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to open camera `{uri}`: {reason}")]
    Open { uri: String, reason: String },

    #[error("failed to read from camera: {0}")]
    Read(String),

    #[error("unsupported camera uri `{0}`")]
    Unsupported(String),

    #[error("unsupported pixel format {0}")]
    Format(String),

    #[error("corrupt frame: {0}")]
    Corrupt(String),

    #[error("no frame has been grabbed")]
    NothingGrabbed,

    #[error("source exhausted")]
    Exhausted,
}

impl SourceError {
    /// Faults after which the source is unusable and the producer should stop
    /// rather than count the failure and try again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SourceError::Unsupported(_) | SourceError::Format(_) | SourceError::Exhausted
        )
    }
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Where a room's camera lives, resolved from the configured URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraLocation {
    /// A V4L2 device node such as `/dev/video0`.
    Device(PathBuf),
    /// A network stream (RTSP or HTTP MJPEG) such as an IP camera.
    Network(String),
}

const NETWORK_SCHEMES: [&str; 4] = ["rtsp://", "rtsps://", "http://", "https://"];

impl CameraLocation {
    /// Numeric URIs map to `/dev/video<N>`, absolute paths are used verbatim,
    /// RTSP and HTTP URLs name a network stream. Anything else is rejected.
    pub fn resolve(uri: &str) -> SourceResult<Self> {
        let uri = uri.trim();
        if let Ok(n) = uri.parse::<u32>() {
            return Ok(Self::Device(PathBuf::from(format!("/dev/video{n}"))));
        }
        if let Some(path) = uri.strip_prefix("file://") {
            return Ok(Self::Device(PathBuf::from(path)));
        }
        if uri.starts_with('/') {
            return Ok(Self::Device(PathBuf::from(uri)));
        }
        let lower = uri.to_ascii_lowercase();
        if NETWORK_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
            return Ok(Self::Network(uri.to_string()));
        }
        Err(SourceError::Unsupported(uri.to_string()))
    }
}

pub trait FrameSource: Send {
    /// Wait at most `timeout` for a new frame and latch it.
    ///
    /// Returns `Ok(false)` when no frame became ready in time. A zero timeout
    /// makes this a pure readiness check.
    fn grab(&mut self, timeout: Duration) -> SourceResult<bool>;

    /// Decode the frame latched by the last successful [`grab`](Self::grab).
    fn retrieve(&mut self) -> SourceResult<RgbImage>;

    /// Human-readable identifier used in logs.
    fn name(&self) -> &str;
}

impl FrameSource for Box<dyn FrameSource> {
    fn grab(&mut self, timeout: Duration) -> SourceResult<bool> {
        (**self).grab(timeout)
    }

    fn retrieve(&mut self) -> SourceResult<RgbImage> {
        (**self).retrieve()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
