//! Alert delivery.
//!
//! The watcher fires at most one alert per round, synchronously, before the
//! round's log entry is written. Delivery failures are logged and never stop
//! the loop.

use std::process::Command;
use tracing::{error, warn};

pub trait AlertSink {
    fn alert(&mut self);
}

impl<T: AlertSink + ?Sized> AlertSink for Box<T> {
    fn alert(&mut self) {
        (**self).alert()
    }
}

/// Writes the alert to the process log only.
#[derive(Debug, Clone)]
pub struct LogAlertSink {
    room: String,
}

impl LogAlertSink {
    pub fn new(room: impl Into<String>) -> Self {
        Self { room: room.into() }
    }
}

impl AlertSink for LogAlertSink {
    fn alert(&mut self) {
        warn!(room = %self.room, "ALERT: instructions violated");
    }
}

/// Runs an external command (e.g. an audio player or a notifier) per alert.
///
/// The command is waited on so alerts never overlap.
#[derive(Debug, Clone)]
pub struct CommandAlertSink {
    program: String,
    args: Vec<String>,
}

impl CommandAlertSink {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl AlertSink for CommandAlertSink {
    fn alert(&mut self) {
        match Command::new(&self.program).args(&self.args).status() {
            Ok(status) if status.success() => {}
            Ok(status) => error!(program = %self.program, %status, "Alert command failed"),
            Err(err) => error!(program = %self.program, "Failed to run alert command: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_sink_through_box() {
        let mut sink: Box<dyn AlertSink> = Box::new(LogAlertSink::new("nursery"));
        sink.alert();
    }

    #[test]
    fn test_missing_command_does_not_panic() {
        let mut sink = CommandAlertSink::new("/nonexistent/alert-player", vec![]);
        sink.alert();
    }

    #[cfg(unix)]
    #[test]
    fn test_command_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("fired");
        let mut sink = CommandAlertSink::new(
            "sh",
            vec!["-c".into(), format!("touch {}", marker.display())],
        );
        sink.alert();
        assert!(marker.exists());
    }
}
