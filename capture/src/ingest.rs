//! Dual-retention ingestion and the producer loop.
//!
//! Every captured frame goes to the room's realtime stream (short, exact
//! bound). Every `subsample_rate`-th frame, counted by frame index, also goes
//! to the subsampled stream (long, approximate bound) that the watcher reads.

use shared::frame_source::{FrameSource, SourceError};
use shared::rolling::RollingWindow;
use shared::stream::{EntryId, RoomStreams, StoreError, StoreResult, StreamClient, StreamStore};
use shared::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::capturer::Capturer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReceipt {
    pub realtime_id: EntryId,
    pub subsampled_id: Option<EntryId>,
}

pub struct FrameIngestor<S> {
    client: StreamClient<S>,
    streams: RoomStreams,
    subsample_rate: u64,
}

impl<S: StreamStore> FrameIngestor<S> {
    /// # Panics
    /// Panics if `subsample_rate` is zero.
    pub fn new(store: S, streams: RoomStreams, subsample_rate: u64) -> Self {
        assert!(subsample_rate > 0, "subsample_rate must be at least 1");
        Self {
            client: StreamClient::new(store),
            streams,
            subsample_rate,
        }
    }

    pub fn streams(&self) -> &RoomStreams {
        &self.streams
    }

    pub fn client_mut(&mut self) -> &mut StreamClient<S> {
        &mut self.client
    }

    pub fn is_subsampled(&self, frame: &Frame) -> bool {
        frame.index() % self.subsample_rate == 0
    }

    /// Append `frame` to the realtime stream and, if its index is a multiple
    /// of the subsample rate, to the subsampled stream.
    ///
    /// A failed realtime append skips the subsampled one.
    pub fn ingest(&mut self, frame: &Frame) -> StoreResult<IngestReceipt> {
        let realtime = &self.streams.realtime;
        let realtime_id =
            self.client
                .append_frame(frame, &realtime.key, realtime.max_len, realtime.trim)?;

        let subsampled_id = if self.is_subsampled(frame) {
            let subsampled = &self.streams.subsampled;
            let id = self.client.append_frame(
                frame,
                &subsampled.key,
                subsampled.max_len,
                subsampled.trim,
            )?;
            info!(
                frame_idx = frame.index(),
                timestamp = %frame.captured_at(),
                "Added frame to subsampled stream"
            );
            Some(id)
        } else {
            None
        };

        Ok(IngestReceipt {
            realtime_id,
            subsampled_id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Consecutive device-read or store-append failures tolerated before the
    /// producer gives up.
    pub max_consecutive_failures: u32,
    /// How often throughput statistics are logged.
    pub stats_interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            stats_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    pub frames: u64,
    pub subsampled: u64,
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("camera failed: {0}")]
    Device(#[source] SourceError),
    #[error("stream store failed: {0}")]
    Store(#[source] StoreError),
}

/// Capture and ingest frames until `running` is cleared or the source runs
/// out.
///
/// There is no pacing sleep: the loop waits only inside the source's grab,
/// so it runs at the rate the device delivers frames.
pub fn run_producer<F: FrameSource, S: StreamStore>(
    capturer: &mut Capturer<F>,
    ingestor: &mut FrameIngestor<S>,
    config: &ProducerConfig,
    running: &AtomicBool,
) -> Result<ProducerSummary, ProducerError> {
    let max_failures = config.max_consecutive_failures.max(1);
    let mut summary = ProducerSummary::default();
    let mut device_failures = 0u32;
    let mut store_failures = 0u32;
    let mut arrivals: RollingWindow<Instant> = RollingWindow::new(120);
    let mut append_latency: RollingWindow<Duration> = RollingWindow::new(120);
    let mut last_report = Instant::now();

    info!(
        realtime = %ingestor.streams().realtime.key,
        subsampled = %ingestor.streams().subsampled.key,
        subsample_rate = ingestor.subsample_rate,
        "Starting to stream frames"
    );

    while running.load(Ordering::SeqCst) {
        let frame = match capturer.capture_next() {
            Ok(Some(frame)) => {
                device_failures = 0;
                frame
            }
            Ok(None) => continue,
            Err(SourceError::Exhausted) => {
                info!("Frame source exhausted");
                break;
            }
            Err(e) if e.is_terminal() => return Err(ProducerError::Device(e)),
            Err(e) => {
                device_failures += 1;
                error!("Failed to capture frame ({}/{}): {}", device_failures, max_failures, e);
                if device_failures >= max_failures {
                    return Err(ProducerError::Device(e));
                }
                continue;
            }
        };
        arrivals.push(Instant::now());

        let started = Instant::now();
        match ingestor.ingest(&frame) {
            Ok(receipt) => {
                append_latency.push(started.elapsed());
                store_failures = 0;
                summary.frames += 1;
                if receipt.subsampled_id.is_some() {
                    summary.subsampled += 1;
                }
                debug!(frame_idx = frame.index(), entry_id = %receipt.realtime_id, "Ingested frame");
            }
            Err(e) => {
                store_failures += 1;
                error!(
                    frame_idx = frame.index(),
                    "Failed to append frame ({}/{}): {}", store_failures, max_failures, e
                );
                if store_failures >= max_failures {
                    return Err(ProducerError::Store(e));
                }
            }
        }

        if last_report.elapsed() >= config.stats_interval {
            report(&summary, &arrivals, &append_latency, capturer);
            last_report = Instant::now();
        }
    }

    info!(frames = summary.frames, subsampled = summary.subsampled, "Producer stopped");
    Ok(summary)
}

fn report<F: FrameSource>(
    summary: &ProducerSummary,
    arrivals: &RollingWindow<Instant>,
    append_latency: &RollingWindow<Duration>,
    capturer: &Capturer<F>,
) {
    let counters = capturer.counters();
    match (arrivals.rate_per_second(), append_latency.mean()) {
        (Some(fps), Some(latency)) => info!(
            frames = summary.frames,
            subsampled = summary.subsampled,
            skipped = counters.skipped,
            mirror_dropped = counters.mirror_dropped,
            "Capture rate {:.1} fps, mean append latency {:.1}ms (max {:.1}ms)",
            fps,
            latency.as_secs_f64() * 1000.0,
            append_latency.max().unwrap_or_default().as_secs_f64() * 1000.0
        ),
        _ => warn!(
            frames = summary.frames,
            not_ready = counters.not_ready,
            "Not enough frames captured to report a rate"
        ),
    }
}
