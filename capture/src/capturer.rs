//! Turns raw device frames into indexed, timestamped, encoded [`Frame`]s.

use chrono::Utc;
use shared::encoder::FrameEncoder;
use shared::frame_source::{FrameSource, SourceError};
use shared::video_mirror::VideoMirror;
use shared::Frame;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureCounters {
    pub captured: u64,
    pub not_ready: u64,
    pub skipped: u64,
    /// Frames the video mirror could not keep up with.
    pub mirror_dropped: u64,
}

pub struct Capturer<S> {
    source: S,
    encoder: FrameEncoder,
    mirror: Option<VideoMirror>,
    grab_timeout: Duration,
    next_index: u64,
    counters: CaptureCounters,
}

impl<S: FrameSource> Capturer<S> {
    /// `grab_timeout` bounds how long one call waits for the device.
    pub fn new(source: S, encoder: FrameEncoder, grab_timeout: Duration) -> Self {
        Self {
            source,
            encoder,
            mirror: None,
            grab_timeout,
            next_index: 0,
            counters: CaptureCounters::default(),
        }
    }

    pub fn with_mirror(mut self, mirror: VideoMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn counters(&self) -> CaptureCounters {
        CaptureCounters {
            mirror_dropped: self.mirror.as_ref().map_or(0, VideoMirror::dropped),
            ..self.counters
        }
    }

    /// Index the next successfully encoded frame will carry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Take the mirror out so the caller can flush it on shutdown.
    pub fn take_mirror(&mut self) -> Option<VideoMirror> {
        self.mirror.take()
    }

    /// Capture the next frame if the device has one ready.
    ///
    /// Returns `Ok(None)` when no frame was ready within the grab timeout or
    /// when the frame could not be decoded or encoded. Skipped frames do not
    /// consume an index. Device faults are returned to the caller.
    pub fn capture_next(&mut self) -> Result<Option<Frame>, SourceError> {
        if !self.source.grab(self.grab_timeout)? {
            self.counters.not_ready += 1;
            return Ok(None);
        }

        let image = match self.source.retrieve() {
            Ok(image) => image,
            Err(SourceError::Corrupt(reason)) => {
                warn!(source = self.source.name(), "Dropping undecodable frame: {}", reason);
                self.counters.skipped += 1;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let captured_at = Utc::now();

        let payload = match self.encoder.encode(&image) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(next_index = self.next_index, "Failed to encode frame as JPEG: {}", e);
                self.counters.skipped += 1;
                return Ok(None);
            }
        };

        if let Some(mirror) = &self.mirror {
            mirror.mirror(&payload);
        }

        let index = self.next_index;
        self.next_index += 1;
        self.counters.captured += 1;
        debug!(frame_idx = index, bytes = payload.len(), "Captured frame");
        Ok(Some(Frame::new(payload, captured_at, index)))
    }
}
