//! The watcher round loop.
//!
//! One round: read the newest batch from the subsampled stream, evaluate it
//! once per instruction, fold the recommendations into the awareness state,
//! fire at most one alert, append exactly one log entry, then wait out the
//! cadence of the (possibly new) awareness level.

use std::time::{Duration, Instant};

use chrono::Utc;
use shared::shutdown::ShutdownFlag;
use shared::stream::{EntryId, LogEntry, RoomStreams, StoreError, StreamClient, StreamStore};
use shared::{AwarenessLevel, Frame};
use tracing::{debug, error, info, warn};

use crate::alert::AlertSink;
use crate::awareness::{AwarenessController, AwarenessSnapshot};
use crate::inference::{FrameAnalyzer, InferenceFailure};
use crate::verdict::WatcherVerdict;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Frames per evaluation batch.
    pub batch_size: usize,
    /// Extra attempts per instruction after a failed evaluation.
    pub max_retries: u32,
    /// Wait before rereading an empty subsampled stream.
    pub empty_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            max_retries: 1,
            empty_backoff: Duration::from_millis(300),
        }
    }
}

/// What one round did.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// The subsampled stream was empty; nothing was evaluated or logged.
    NoFrames,
    /// At least one instruction produced a verdict.
    Evaluated {
        level: AwarenessLevel,
        should_alert: bool,
        failed_instructions: usize,
        log_id: EntryId,
    },
    /// Every instruction failed; an error entry was logged.
    Failed { error: String, log_id: EntryId },
}

pub struct Orchestrator<S, A, K> {
    client: StreamClient<S>,
    streams: RoomStreams,
    analyzer: A,
    alerts: K,
    instructions: Vec<String>,
    awareness: AwarenessController,
    config: OrchestratorConfig,
    rounds: u64,
}

impl<S, A, K> Orchestrator<S, A, K>
where
    S: StreamStore,
    A: FrameAnalyzer,
    K: AlertSink,
{
    /// # Panics
    ///
    /// Panics if `instructions` is empty or `config.batch_size` is zero.
    pub fn new(
        store: S,
        streams: RoomStreams,
        analyzer: A,
        alerts: K,
        instructions: Vec<String>,
        awareness: AwarenessController,
        config: OrchestratorConfig,
    ) -> Self {
        assert!(!instructions.is_empty(), "Instructions must be a non-empty list");
        assert!(config.batch_size > 0, "batch_size must be at least 1");
        Self {
            client: StreamClient::new(store),
            streams,
            analyzer,
            alerts,
            instructions,
            awareness,
            config,
            rounds: 0,
        }
    }

    pub fn awareness(&self) -> AwarenessSnapshot {
        self.awareness.snapshot()
    }

    pub fn awareness_mut(&mut self) -> &mut AwarenessController {
        &mut self.awareness
    }

    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn store(&self) -> &S {
        self.client.store()
    }

    /// Run one round. A store fault aborts the round before anything is
    /// logged, except when the fault hits the final log append, in which case
    /// an alert for the round may already have fired.
    pub fn run_round(&mut self) -> Result<RoundOutcome, StoreError> {
        let mut frames = self
            .client
            .read_latest_frames(&self.streams.subsampled.key, self.config.batch_size)?;
        if frames.is_empty() {
            return Ok(RoundOutcome::NoFrames);
        }
        order_by_capture(&mut frames);
        self.rounds += 1;

        let mut verdicts = Vec::with_capacity(self.instructions.len());
        let mut last_error = None;
        for instruction in &self.instructions {
            match self.evaluate_with_retry(&frames, instruction) {
                Ok(verdict) => verdicts.push(verdict),
                Err(err) => last_error = Some(err.to_string()),
            }
        }
        let failed_instructions = self.instructions.len() - verdicts.len();
        let timestamp = Utc::now();

        if verdicts.is_empty() {
            let error = last_error.unwrap_or_else(|| "no verdicts produced".to_string());
            error!(round = self.rounds, "Every instruction failed: {error}");
            let entry = LogEntry::Error {
                timestamp,
                error: error.clone(),
            };
            let log_id = self.append_log(&entry)?;
            return Ok(RoundOutcome::Failed { error, log_id });
        }

        let level = self
            .awareness
            .update(verdicts.iter().map(|v| v.recommended_awareness_level));
        let should_alert = verdicts.iter().any(|v| v.should_alert);
        if should_alert {
            self.alerts.alert();
        }

        let entry = LogEntry::Round {
            timestamp,
            should_alert,
            awareness_level: level,
            reasoning: combined_reasoning(&verdicts),
            failed_instructions,
            last_error,
        };
        let log_id = self.append_log(&entry)?;
        info!(
            round = self.rounds,
            frames = frames.len(),
            should_alert,
            awareness_level = %level,
            failed_instructions,
            "Round complete"
        );

        Ok(RoundOutcome::Evaluated {
            level,
            should_alert,
            failed_instructions,
            log_id,
        })
    }

    /// Run rounds until `shutdown` is requested.
    ///
    /// Each round starts one awareness cadence after the previous one started;
    /// a round that overruns its cadence is followed immediately by the next.
    /// Store faults are logged and the loop carries on.
    pub fn run(&mut self, shutdown: &ShutdownFlag) {
        info!(
            stream = %self.streams.subsampled.key,
            instructions = self.instructions.len(),
            awareness_level = %self.awareness.level(),
            "Watcher started"
        );
        while shutdown.is_running() {
            let started = Instant::now();
            match self.run_round() {
                Ok(RoundOutcome::NoFrames) => {
                    warn!(stream = %self.streams.subsampled.key, "No frames available yet");
                    if !shutdown.sleep(self.config.empty_backoff) {
                        break;
                    }
                    continue;
                }
                Ok(_) => {}
                Err(err) => error!("Stream store fault, skipping round: {err}"),
            }

            let remaining = self.awareness.cadence().saturating_sub(started.elapsed());
            debug!(sleep_ms = remaining.as_millis() as u64, "Waiting for next round");
            if !shutdown.sleep(remaining) {
                break;
            }
        }
        info!(rounds = self.rounds, "Watcher stopped");
    }

    fn evaluate_with_retry(
        &self,
        frames: &[Frame],
        instruction: &String,
    ) -> Result<WatcherVerdict, InferenceFailure> {
        let attempts = self.config.max_retries + 1;
        let mut attempt = 1;
        loop {
            match self
                .analyzer
                .evaluate(frames, std::slice::from_ref(instruction))
            {
                Ok(verdict) => return Ok(verdict),
                Err(err) if attempt < attempts => {
                    warn!(instruction = %instruction, attempt, "Evaluation failed, retrying: {err}");
                    attempt += 1;
                }
                Err(err) => {
                    error!(instruction = %instruction, attempt, "Evaluation failed: {err}");
                    return Err(err);
                }
            }
        }
    }

    fn append_log(&mut self, entry: &LogEntry) -> Result<EntryId, StoreError> {
        let logs = &self.streams.logs;
        self.client
            .append_log(&logs.key, entry, logs.max_len, logs.trim)
    }
}

/// Streams hand back frames in entry order, which is capture order for a
/// single producer. Restore capture order if a batch arrives otherwise.
fn order_by_capture(frames: &mut [Frame]) {
    let key = |f: &Frame| (f.captured_at(), f.index());
    if frames.windows(2).any(|w| key(&w[0]) > key(&w[1])) {
        warn!("Batch out of capture order, sorting");
        frames.sort_by_key(key);
    }
}

fn combined_reasoning(verdicts: &[WatcherVerdict]) -> String {
    verdicts
        .iter()
        .map(|v| v.reasoning.trim())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    #[test]
    fn test_out_of_order_batch_is_sorted() {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut frames = vec![
            Frame::new(vec![1], base + ChronoDuration::seconds(2), 2),
            Frame::new(vec![1], base, 0),
            Frame::new(vec![1], base + ChronoDuration::seconds(1), 1),
        ];
        order_by_capture(&mut frames);
        let order: Vec<u64> = frames.iter().map(|f| f.index()).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_reasoning_is_joined_per_verdict() {
        let verdict = |r: &str| WatcherVerdict {
            should_alert: false,
            reasoning: r.into(),
            recommended_awareness_level: AwarenessLevel::Low,
        };
        assert_eq!(
            combined_reasoning(&[verdict("Asleep "), verdict("In crib")]),
            "Asleep\nIn crib"
        );
    }
}
