//! Side-channel recording of the capture stream.
//!
//! Encoded frames are handed to a worker thread through a bounded channel and
//! appended back to back to a Motion-JPEG file. The capture loop never waits
//! on the disk: when the queue is full the frame is dropped from the
//! recording and a warning is logged.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Totals reported when the mirror shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStats {
    pub frames_written: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
}

pub struct VideoMirror {
    sender: Option<Sender<Vec<u8>>>,
    worker: Option<JoinHandle<MirrorStats>>,
    path: PathBuf,
    dropped: AtomicU64,
}

impl VideoMirror {
    /// Open (or create) `path` for appending and start the writer thread.
    ///
    /// Parent directories are created as needed. Failing to open the file is
    /// reported here; everything after that is logged by the worker.
    pub fn create(path: impl AsRef<Path>, queue_len: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open mirror file: {}", path.display()))?;

        let (sender, receiver) = bounded::<Vec<u8>>(queue_len.max(1));
        let worker_path = path.clone();
        let worker = std::thread::Builder::new()
            .name("video-mirror".into())
            .spawn(move || {
                info!(path = %worker_path.display(), "Video mirror started");
                let stats = write_frames(file, receiver.iter());
                info!(
                    path = %worker_path.display(),
                    frames = stats.frames_written,
                    bytes = stats.bytes_written,
                    errors = stats.write_errors,
                    "Video mirror stopped"
                );
                stats
            })
            .context("Failed to spawn video mirror thread")?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            path,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames rejected because the writer fell behind or had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue an encoded frame for recording. Never blocks.
    ///
    /// Returns whether the frame was queued.
    pub fn mirror(&self, jpeg: &[u8]) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(jpeg.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "Video mirror queue full, frame not recorded");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Video mirror writer has shut down, frame not recorded");
                false
            }
        }
    }

    /// Flush queued frames and stop the writer thread.
    pub fn finish(mut self) -> MirrorStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> MirrorStats {
        drop(self.sender.take());
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => {
                warn!("Video mirror worker panicked: {:?}", e);
                MirrorStats::default()
            }
            None => MirrorStats::default(),
        }
    }
}

impl Drop for VideoMirror {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_frames(file: File, frames: impl Iterator<Item = Vec<u8>>) -> MirrorStats {
    let mut out = BufWriter::new(file);
    let mut stats = MirrorStats::default();
    for jpeg in frames {
        match out.write_all(&jpeg).and_then(|_| out.flush()) {
            Ok(()) => {
                stats.frames_written += 1;
                stats.bytes_written += jpeg.len() as u64;
            }
            Err(e) => {
                stats.write_errors += 1;
                warn!("Failed to write frame to video mirror: {}", e);
            }
        }
    }
    stats
}
