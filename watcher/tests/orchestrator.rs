use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use shared::shutdown::ShutdownFlag;
use shared::stream::{LogEntry, MemoryStore, RoomStreams, StreamBounds, StreamClient, TrimMode};
use shared::{AwarenessLevel, Frame};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use watcher::{
    AlertSink, AwarenessCadence, AwarenessController, FrameAnalyzer, InferenceFailure,
    Orchestrator, OrchestratorConfig, RoundOutcome, WatcherVerdict,
};

type Reply = Result<WatcherVerdict, InferenceFailure>;

/// Answers per instruction from a queue; an exhausted queue repeats its last
/// reply.
#[derive(Default)]
struct ScriptedAnalyzer {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    latency: Duration,
    stop_after: Option<(usize, ShutdownFlag)>,
}

impl ScriptedAnalyzer {
    fn reply(self, instruction: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(instruction.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Take `latency` to answer each evaluation.
    fn slow(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Request a stop on `shutdown` once `calls` evaluations have answered.
    fn stop_after(mut self, calls: usize, shutdown: &ShutdownFlag) -> Self {
        self.stop_after = Some((calls, shutdown.clone()));
        self
    }
}

impl FrameAnalyzer for ScriptedAnalyzer {
    fn evaluate(&self, frames: &[Frame], instructions: &[String]) -> Reply {
        assert!(!frames.is_empty());
        assert_eq!(instructions.len(), 1, "one instruction per evaluation");
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.batch_sizes.lock().unwrap().push(frames.len());
        thread::sleep(self.latency);
        if let Some((limit, shutdown)) = &self.stop_after {
            if calls >= *limit {
                shutdown.request_stop();
            }
        }

        let mut replies = self.replies.lock().unwrap();
        let queue = replies.get_mut(&instructions[0]).expect("unscripted instruction");
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        }
    }
}

#[derive(Clone, Default)]
struct CountingSink(Arc<AtomicUsize>);

impl CountingSink {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl AlertSink for CountingSink {
    fn alert(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn verdict(should_alert: bool, level: AwarenessLevel, reasoning: &str) -> Reply {
    Ok(WatcherVerdict {
        should_alert,
        reasoning: reasoning.into(),
        recommended_awareness_level: level,
    })
}

fn transport(msg: &str) -> Reply {
    Err(InferenceFailure::Transport(msg.into()))
}

fn streams() -> RoomStreams {
    RoomStreams::for_room("nursery", StreamBounds::default())
}

fn seed_frames(store: &MemoryStore, count: u64) {
    let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let mut client = StreamClient::new(store.clone());
    for i in 0..count {
        let frame = Frame::new(vec![0xFF, 0xD8], base + ChronoDuration::milliseconds(500 * i as i64), i);
        client
            .append_frame(&frame, "nursery:subsampled", 64, TrimMode::Approximate)
            .unwrap();
    }
}

fn logs(store: &MemoryStore) -> Vec<LogEntry> {
    StreamClient::new(store.clone())
        .read_latest_logs("nursery:logs", 100, None)
        .unwrap()
        .into_iter()
        .map(|(_, entry)| entry)
        .collect()
}

fn orchestrator(
    store: &MemoryStore,
    analyzer: ScriptedAnalyzer,
    sink: &CountingSink,
    instructions: &[&str],
) -> Orchestrator<MemoryStore, ScriptedAnalyzer, CountingSink> {
    Orchestrator::new(
        store.clone(),
        streams(),
        analyzer,
        sink.clone(),
        instructions.iter().map(|s| s.to_string()).collect(),
        AwarenessController::default(),
        OrchestratorConfig {
            batch_size: 4,
            ..OrchestratorConfig::default()
        },
    )
}

#[test]
fn test_round_takes_highest_level_and_alerts_once() {
    let store = MemoryStore::new();
    seed_frames(&store, 10);
    let sink = CountingSink::default();
    let analyzer = ScriptedAnalyzer::default()
        .reply("stay in crib", verdict(false, AwarenessLevel::Low, "Asleep"))
        .reply("no climbing", verdict(true, AwarenessLevel::High, "Climbing"));
    let mut watcher = orchestrator(&store, analyzer, &sink, &["stay in crib", "no climbing"]);

    let outcome = watcher.run_round().unwrap();
    assert!(matches!(
        outcome,
        RoundOutcome::Evaluated {
            level: AwarenessLevel::High,
            should_alert: true,
            failed_instructions: 0,
            ..
        }
    ));
    assert_eq!(sink.count(), 1);
    assert_eq!(watcher.awareness().level, AwarenessLevel::High);
    assert_eq!(watcher.awareness().cadence, Duration::from_secs(1));

    let entries = logs(&store);
    assert_eq!(entries.len(), 1);
    match &entries[0] {
        LogEntry::Round {
            should_alert,
            awareness_level,
            reasoning,
            ..
        } => {
            assert!(*should_alert);
            assert_eq!(*awareness_level, AwarenessLevel::High);
            assert_eq!(reasoning, "Asleep\nClimbing");
        }
        other => panic!("unexpected entry {other:?}"),
    }
}

#[test]
fn test_batch_is_bounded_by_batch_size() {
    let store = MemoryStore::new();
    seed_frames(&store, 10);
    let sink = CountingSink::default();
    let analyzer =
        ScriptedAnalyzer::default().reply("stay in crib", verdict(false, AwarenessLevel::Low, "ok"));
    let mut watcher = orchestrator(&store, analyzer, &sink, &["stay in crib"]);

    watcher.run_round().unwrap();
    assert_eq!(sink.count(), 0);
    assert_eq!(watcher.analyzer().calls.load(Ordering::SeqCst), 1);
    assert_eq!(*watcher.analyzer().batch_sizes.lock().unwrap(), vec![4]);
}

#[test]
fn test_low_round_raises_low_state_to_medium() {
    let store = MemoryStore::new();
    seed_frames(&store, 3);
    let sink = CountingSink::default();
    let analyzer = ScriptedAnalyzer::default()
        .reply("a", verdict(false, AwarenessLevel::Medium, "Stirring"))
        .reply("b", verdict(false, AwarenessLevel::Low, "Quiet"));
    let mut watcher = orchestrator(&store, analyzer, &sink, &["a", "b"]);
    *watcher.awareness_mut() =
        AwarenessController::new(AwarenessCadence::default()).with_level(AwarenessLevel::Low);
    assert_eq!(watcher.awareness().cadence, Duration::from_secs(10));

    watcher.run_round().unwrap();
    assert_eq!(watcher.awareness().level, AwarenessLevel::Medium);
    assert_eq!(sink.count(), 0);
}

#[test]
fn test_failed_evaluation_is_retried_once() {
    let store = MemoryStore::new();
    seed_frames(&store, 5);
    let sink = CountingSink::default();
    let analyzer = ScriptedAnalyzer::default()
        .reply("stay in crib", transport("connection reset"))
        .reply("stay in crib", verdict(false, AwarenessLevel::Low, "Asleep"));
    let mut watcher = orchestrator(&store, analyzer, &sink, &["stay in crib"]);

    let outcome = watcher.run_round().unwrap();
    assert!(matches!(
        outcome,
        RoundOutcome::Evaluated {
            failed_instructions: 0,
            ..
        }
    ));
    assert_eq!(logs(&store).len(), 1);
}

#[test]
fn test_partial_failure_is_logged_with_round() {
    let store = MemoryStore::new();
    seed_frames(&store, 5);
    let sink = CountingSink::default();
    let analyzer = ScriptedAnalyzer::default()
        .reply("a", verdict(false, AwarenessLevel::Low, "Asleep"))
        .reply("b", transport("timed out"));
    let mut watcher = orchestrator(&store, analyzer, &sink, &["a", "b"]);

    watcher.run_round().unwrap();
    let entries = logs(&store);
    assert_eq!(entries.len(), 1);
    match &entries[0] {
        LogEntry::Round {
            failed_instructions,
            last_error,
            ..
        } => {
            assert_eq!(*failed_instructions, 1);
            assert!(last_error.as_deref().unwrap().contains("timed out"));
        }
        other => panic!("unexpected entry {other:?}"),
    }
}

#[test]
fn test_all_failed_round_logs_error_entry() {
    let store = MemoryStore::new();
    seed_frames(&store, 5);
    let sink = CountingSink::default();
    let analyzer = ScriptedAnalyzer::default()
        .reply("a", transport("connection refused"))
        .reply("b", transport("connection refused"));
    let mut watcher = orchestrator(&store, analyzer, &sink, &["a", "b"]);

    let outcome = watcher.run_round().unwrap();
    assert!(matches!(outcome, RoundOutcome::Failed { .. }));
    assert_eq!(sink.count(), 0);
    assert_eq!(watcher.awareness().level, AwarenessLevel::Medium);

    let entries = logs(&store);
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_error());
}

#[test]
fn test_empty_stream_is_not_a_round() {
    let store = MemoryStore::new();
    let sink = CountingSink::default();
    let analyzer =
        ScriptedAnalyzer::default().reply("a", verdict(true, AwarenessLevel::High, "unused"));
    let mut watcher = orchestrator(&store, analyzer, &sink, &["a"]);

    assert_eq!(watcher.run_round().unwrap(), RoundOutcome::NoFrames);
    assert!(logs(&store).is_empty());
    assert_eq!(watcher.rounds(), 0);
}

#[test]
fn test_stopped_flag_ends_run_without_rounds() {
    let store = MemoryStore::new();
    seed_frames(&store, 5);
    let sink = CountingSink::default();
    let analyzer =
        ScriptedAnalyzer::default().reply("a", verdict(true, AwarenessLevel::High, "unused"));
    let mut watcher = orchestrator(&store, analyzer, &sink, &["a"]);

    let shutdown = ShutdownFlag::new();
    shutdown.request_stop();
    watcher.run(&shutdown);
    assert_eq!(watcher.rounds(), 0);
    assert_eq!(sink.count(), 0);
}

#[test]
fn test_run_stops_after_interrupt() {
    let store = MemoryStore::new();
    seed_frames(&store, 5);
    let sink = CountingSink::default();
    let shutdown = ShutdownFlag::new();
    let analyzer = ScriptedAnalyzer::default()
        .reply("a", verdict(false, AwarenessLevel::High, "Awake"))
        .stop_after(2, &shutdown);
    let mut watcher = orchestrator(&store, analyzer, &sink, &["a"]);

    watcher.run(&shutdown);

    // The stop lands during the second round, so its wait is skipped
    assert_eq!(watcher.rounds(), 2);
    assert_eq!(logs(&store).len(), 2);
}

/// Gaps between consecutive round log entries, oldest first.
fn round_gaps(store: &MemoryStore) -> Vec<Duration> {
    let mut stamps: Vec<_> = logs(store).iter().map(LogEntry::timestamp).collect();
    stamps.reverse();
    stamps
        .windows(2)
        .map(|w| (w[1] - w[0]).to_std().unwrap())
        .collect()
}

#[test]
fn test_processing_time_counts_against_cadence() {
    let store = MemoryStore::new();
    seed_frames(&store, 5);
    let sink = CountingSink::default();
    let shutdown = ShutdownFlag::new();
    let analyzer = ScriptedAnalyzer::default()
        .reply("a", verdict(false, AwarenessLevel::High, "Awake"))
        .slow(Duration::from_millis(600))
        .stop_after(3, &shutdown);
    let mut watcher = orchestrator(&store, analyzer, &sink, &["a"]);

    watcher.run(&shutdown);

    // HIGH cadence is one second: rounds start a second apart, not a second
    // after the previous evaluation finished
    let gaps = round_gaps(&store);
    assert_eq!(gaps.len(), 2);
    for gap in gaps {
        assert!(gap >= Duration::from_millis(900), "gap {gap:?}");
        assert!(gap < Duration::from_millis(1400), "gap {gap:?}");
    }
}

#[test]
fn test_overrunning_round_is_followed_immediately() {
    let store = MemoryStore::new();
    seed_frames(&store, 5);
    let sink = CountingSink::default();
    let shutdown = ShutdownFlag::new();
    let analyzer = ScriptedAnalyzer::default()
        .reply("a", verdict(false, AwarenessLevel::High, "Awake"))
        .slow(Duration::from_millis(1200))
        .stop_after(2, &shutdown);
    let mut watcher = orchestrator(&store, analyzer, &sink, &["a"]);

    watcher.run(&shutdown);

    // Each round takes longer than the one second cadence, so the gap is the
    // evaluation time alone
    let gaps = round_gaps(&store);
    assert_eq!(gaps.len(), 1);
    assert!(gaps[0] >= Duration::from_millis(1100), "gap {:?}", gaps[0]);
    assert!(gaps[0] < Duration::from_millis(1900), "gap {:?}", gaps[0]);
}

#[test]
#[should_panic(expected = "Instructions must be a non-empty list")]
fn test_empty_instruction_list_panics() {
    let store = MemoryStore::new();
    let sink = CountingSink::default();
    orchestrator(&store, ScriptedAnalyzer::default(), &sink, &[]);
}
