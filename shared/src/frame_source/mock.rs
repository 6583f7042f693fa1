use super::{FrameSource, SourceError, SourceResult};
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use std::time::Duration;

/// One scripted outcome of [`MockFrameSource::grab`].
#[derive(Debug, Clone)]
pub enum MockGrab {
    Frame(RgbImage),
    NotReady,
    Fail(String),
}

/// Scripted frame source for tests.
///
/// A source built from a single frame repeats it forever. Otherwise the
/// script is played once and further grabs fail with
/// [`SourceError::Exhausted`].
pub struct MockFrameSource {
    script: VecDeque<MockGrab>,
    repeat: Option<RgbImage>,
    latched: Option<RgbImage>,
    grabs: usize,
    name: String,
}

impl MockFrameSource {
    pub fn new(frames: Vec<RgbImage>) -> Self {
        Self::with_script(frames.into_iter().map(MockGrab::Frame).collect())
    }

    pub fn with_script(script: Vec<MockGrab>) -> Self {
        Self {
            script: script.into(),
            repeat: None,
            latched: None,
            grabs: 0,
            name: "mock".to_string(),
        }
    }

    pub fn new_repeating(frame: RgbImage) -> Self {
        Self {
            repeat: Some(frame),
            ..Self::with_script(Vec::new())
        }
    }

    /// `count` frames of a flat color, each tinted by its position so the
    /// encoded payloads differ.
    pub fn solid(width: u32, height: u32, count: usize) -> Self {
        let frames = (0..count)
            .map(|i| RgbImage::from_pixel(width, height, Rgb([(i * 16 % 256) as u8, 96, 160])))
            .collect();
        Self::new(frames)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Number of grab calls so far.
    pub fn grabs(&self) -> usize {
        self.grabs
    }
}

impl FrameSource for MockFrameSource {
    fn grab(&mut self, _timeout: Duration) -> SourceResult<bool> {
        self.grabs += 1;
        if let Some(frame) = &self.repeat {
            self.latched = Some(frame.clone());
            return Ok(true);
        }
        match self.script.pop_front() {
            Some(MockGrab::Frame(frame)) => {
                self.latched = Some(frame);
                Ok(true)
            }
            Some(MockGrab::NotReady) => Ok(false),
            Some(MockGrab::Fail(reason)) => Err(SourceError::Read(reason)),
            None => Err(SourceError::Exhausted),
        }
    }

    fn retrieve(&mut self) -> SourceResult<RgbImage> {
        self.latched.take().ok_or(SourceError::NothingGrabbed)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
