//! Consumer side of the monitor: evaluates recent frames with a vision model
//! and adapts its own polling rate to the awareness level the model suggests.

pub mod alert;
pub mod awareness;
pub mod inference;
pub mod orchestrator;
pub mod prompt;
pub mod verdict;

pub use alert::{AlertSink, CommandAlertSink, LogAlertSink};
pub use awareness::{AwarenessCadence, AwarenessController, AwarenessSnapshot};
pub use inference::{
    effective_fps, FrameAnalyzer, InferenceClient, InferenceConfig, InferenceFailure,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RoundOutcome};
pub use verdict::WatcherVerdict;
