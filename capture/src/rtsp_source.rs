//! Network camera backend for [`FrameSource`].
//!
//! An `ffmpeg` child process pulls the RTSP (or HTTP MJPEG) stream and writes
//! it to stdout as back-to-back JPEG images. A reader thread splits that byte
//! stream into frames and keeps only the newest few in a bounded channel, so
//! a slow consumer sees fresh frames instead of a growing backlog.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::RgbImage;
use shared::encoder::decode_rgb;
use shared::frame_source::{FrameSource, SourceError, SourceResult};
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const FRAME_QUEUE: usize = 2;
const READ_CHUNK: usize = 64 * 1024;
/// A partial frame larger than this is garbage, not a JPEG.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;

pub struct RtspFrameSource {
    child: Child,
    frames: Receiver<Vec<u8>>,
    reader: Option<JoinHandle<u64>>,
    name: String,
    pending: Option<Vec<u8>>,
    latched: Option<Vec<u8>>,
}

impl RtspFrameSource {
    /// Start pulling `url`, scaled to `size` if given, and wait up to
    /// `connect_timeout` for the first frame.
    pub fn open(
        url: &str,
        size: Option<(u32, u32)>,
        connect_timeout: Duration,
    ) -> SourceResult<Self> {
        let name = redact(url);
        let open_err = |reason: String| SourceError::Open {
            uri: name.clone(),
            reason,
        };

        let mut child = Command::new("ffmpeg")
            .args(ffmpeg_args(url, size))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| open_err(format!("failed to start ffmpeg: {e}")))?;

        if let Some(stderr) = child.stderr.take() {
            let camera = name.clone();
            let spawned = std::thread::Builder::new()
                .name("ffmpeg-log".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        warn!(camera = %camera, "ffmpeg: {}", line);
                    }
                });
            if let Err(e) = spawned {
                warn!(camera = %name, "ffmpeg log thread not started: {}", e);
            }
        }

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                stop_child(&mut child);
                return Err(open_err("ffmpeg stdout not captured".into()));
            }
        };
        let (sender, frames) = bounded(FRAME_QUEUE);
        let oldest = frames.clone();
        let camera = name.clone();
        let reader = std::thread::Builder::new()
            .name("rtsp-reader".into())
            .spawn(move || read_frames(stdout, sender, oldest, &camera));
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                stop_child(&mut child);
                return Err(open_err(format!("failed to spawn reader thread: {e}")));
            }
        };

        let mut source = Self {
            child,
            frames,
            reader: Some(reader),
            name,
            pending: None,
            latched: None,
        };
        // Dropping `source` on failure stops ffmpeg
        match source.frames.recv_timeout(connect_timeout) {
            Ok(first) => source.pending = Some(first),
            Err(e) => {
                let reason = match e {
                    RecvTimeoutError::Timeout => format!("no frame within {connect_timeout:?}"),
                    RecvTimeoutError::Disconnected => "ffmpeg exited before the first frame".into(),
                };
                return Err(SourceError::Open {
                    uri: source.name.clone(),
                    reason,
                });
            }
        }
        info!(camera = %source.name, "Successfully connected to network stream");
        Ok(source)
    }
}

impl FrameSource for RtspFrameSource {
    fn grab(&mut self, timeout: Duration) -> SourceResult<bool> {
        if let Some(first) = self.pending.take() {
            self.latched = Some(first);
            return Ok(true);
        }
        match self.frames.recv_timeout(timeout) {
            Ok(jpeg) => {
                self.latched = Some(jpeg);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                Err(SourceError::Read("network stream ended".into()))
            }
        }
    }

    fn retrieve(&mut self) -> SourceResult<RgbImage> {
        let jpeg = self.latched.take().ok_or(SourceError::NothingGrabbed)?;
        decode_rgb(&jpeg).map_err(|e| SourceError::Corrupt(e.to_string()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for RtspFrameSource {
    fn drop(&mut self) {
        stop_child(&mut self.child);
        if let Some(Ok(frames)) = self.reader.take().map(JoinHandle::join) {
            debug!(camera = %self.name, frames, "Network stream closed");
        }
    }
}

fn stop_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("ffmpeg already stopped: {}", e);
    }
    let _ = child.wait();
}

fn ffmpeg_args(url: &str, size: Option<(u32, u32)>) -> Vec<String> {
    let mut args: Vec<String> = ["-nostdin", "-loglevel", "error"]
        .into_iter()
        .map(String::from)
        .collect();
    if url.to_ascii_lowercase().starts_with("rtsp") {
        args.extend(["-rtsp_transport", "tcp"].map(String::from));
    }
    args.extend(["-fflags", "+nobuffer+discardcorrupt", "-flags", "low_delay"].map(String::from));
    args.extend(["-i".to_string(), url.to_string(), "-an".to_string()]);
    if let Some((width, height)) = size {
        args.extend(["-vf".to_string(), format!("scale={width}:{height}")]);
    }
    args.extend(["-f", "mjpeg", "-q:v", "3", "-"].map(String::from));
    args
}

/// Strip `user:password@` from a URL before it is logged.
fn redact(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://{}", &rest[at + 1..]),
        None => url.to_string(),
    }
}

/// Reader thread body. Returns the number of frames split out.
fn read_frames(
    mut stdout: ChildStdout,
    sender: Sender<Vec<u8>>,
    oldest: Receiver<Vec<u8>>,
    camera: &str,
) -> u64 {
    let mut splitter = JpegSplitter::default();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut frames = 0u64;
    loop {
        let n = match stdout.read(&mut chunk) {
            Ok(0) => {
                info!(camera, frames, "ffmpeg output ended");
                return frames;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(camera, "Failed to read ffmpeg output: {}", e);
                return frames;
            }
        };
        for mut jpeg in splitter.push(&chunk[..n]) {
            frames += 1;
            // Keep the newest frames: evict the oldest queued one when full
            loop {
                match sender.try_send(jpeg) {
                    Ok(()) => break,
                    Err(TrySendError::Full(back)) => {
                        let _ = oldest.try_recv();
                        jpeg = back;
                    }
                    Err(TrySendError::Disconnected(_)) => return frames,
                }
            }
        }
    }
}

/// Splits a byte stream of concatenated JPEG images on SOI/EOI markers.
///
/// Bytes before the first SOI are discarded. Entropy-coded data never
/// contains an unescaped `FF D9`, so the first EOI after an SOI ends the
/// image.
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buf: Vec<u8>,
    /// Offset where the EOI search resumes; earlier bytes were already
    /// scanned.
    scanned: usize,
}

impl JpegSplitter {
    /// Feed the next chunk and return every image it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut images = Vec::new();
        loop {
            let Some(start) = find_marker(&self.buf, 0, SOI) else {
                // A trailing 0xFF may be the first half of the next SOI
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                self.buf.drain(..self.buf.len() - keep);
                self.scanned = 0;
                break;
            };
            if start > 0 {
                self.buf.drain(..start);
                self.scanned = self.scanned.saturating_sub(start);
            }
            let from = self.scanned.max(2);
            match find_marker(&self.buf, from, EOI) {
                Some(end) => {
                    images.push(self.buf.drain(..end + 2).collect());
                    self.scanned = 0;
                }
                None => {
                    // The last byte may pair with the next chunk
                    self.scanned = self.buf.len().saturating_sub(1);
                    break;
                }
            }
        }
        if self.buf.len() > MAX_FRAME_BYTES {
            warn!(bytes = self.buf.len(), "Discarding oversized partial frame");
            self.buf.clear();
            self.scanned = 0;
        }
        images
    }
}

fn find_marker(data: &[u8], from: usize, marker: u8) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w[0] == 0xFF && w[1] == marker)
        .map(|i| i + from)
}
