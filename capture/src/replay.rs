//! Replays a directory of still images as if it were a camera.

use image::RgbImage;
use shared::encoder::decode_rgb;
use shared::frame_source::{FrameSource, SourceError, SourceResult};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

const EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Serves the JPEG/PNG files of a directory in file-name order at a fixed
/// rate, optionally starting over when the last one has been served.
pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    position: usize,
    interval: Duration,
    next_due: Option<Instant>,
    looping: bool,
    latched: Option<PathBuf>,
    name: String,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path, fps: f64, looping: bool) -> SourceResult<Self> {
        let open_err = |reason: String| SourceError::Open {
            uri: dir.display().to_string(),
            reason,
        };
        if !(fps.is_finite() && fps > 0.0) {
            return Err(open_err(format!("invalid replay rate {fps}")));
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| open_err(e.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(open_err("no .jpg/.jpeg/.png files found".to_string()));
        }
        info!(dir = %dir.display(), frames = files.len(), fps, looping, "Replaying image sequence");

        Ok(Self {
            files,
            position: 0,
            interval: Duration::from_secs_f64(1.0 / fps),
            next_due: None,
            looping,
            latched: None,
            name: format!("replay:{}", dir.display()),
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn grab(&mut self, timeout: Duration) -> SourceResult<bool> {
        if self.position >= self.files.len() {
            if !self.looping {
                return Err(SourceError::Exhausted);
            }
            self.position = 0;
        }

        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        let wait = due.saturating_duration_since(now);
        if wait > timeout {
            std::thread::sleep(timeout);
            return Ok(false);
        }
        std::thread::sleep(wait);

        self.latched = Some(self.files[self.position].clone());
        self.position += 1;
        self.next_due = Some(due.max(now) + self.interval);
        Ok(true)
    }

    fn retrieve(&mut self) -> SourceResult<RgbImage> {
        let path = self.latched.take().ok_or(SourceError::NothingGrabbed)?;
        let bytes = std::fs::read(&path)
            .map_err(|e| SourceError::Read(format!("{}: {e}", path.display())))?;
        decode_rgb(&bytes).map_err(|e| SourceError::Corrupt(format!("{}: {e}", path.display())))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    fn demo_dir(count: u8) -> TempDir {
        let dir = TempDir::new().unwrap();
        for i in 0..count {
            let image = RgbImage::from_pixel(8, 6, Rgb([i * 40, 0, 0]));
            image.save(dir.path().join(format!("frame_{i:03}.png"))).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        dir
    }

    #[test]
    fn test_replays_in_name_order_then_exhausts() {
        let dir = demo_dir(3);
        let mut source = ImageSequenceSource::open(dir.path(), 1000.0, false).unwrap();
        assert_eq!(source.len(), 3);

        for i in 0..3u8 {
            assert!(source.grab(Duration::from_secs(1)).unwrap());
            let image = source.retrieve().unwrap();
            assert_eq!(image.get_pixel(0, 0), &Rgb([i * 40, 0, 0]));
        }
        assert!(matches!(source.grab(Duration::ZERO), Err(SourceError::Exhausted)));
    }

    #[test]
    fn test_looping_starts_over() {
        let dir = demo_dir(2);
        let mut source = ImageSequenceSource::open(dir.path(), 1000.0, true).unwrap();
        for _ in 0..5 {
            assert!(source.grab(Duration::from_secs(1)).unwrap());
            source.retrieve().unwrap();
        }
    }

    #[test]
    fn test_not_ready_before_interval() {
        let dir = demo_dir(2);
        let mut source = ImageSequenceSource::open(dir.path(), 0.5, false).unwrap();
        assert!(source.grab(Duration::ZERO).unwrap());
        // The next frame is due two seconds later
        assert!(!source.grab(Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn test_empty_directory_fails_to_open() {
        let dir = TempDir::new().unwrap();
        let result = ImageSequenceSource::open(dir.path(), 2.0, false);
        assert!(matches!(result, Err(SourceError::Open { .. })));
    }
}
