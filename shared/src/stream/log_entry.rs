//! Schema of the per-room logs stream.
//!
//! The store enforces no schema on log entries; this type is the single
//! place that decides which fields a round summary carries.
//!
//! | field | meaning |
//! |---|---|
//! | `timestamp` | unix seconds, decimal text |
//! | `should_alert` | `"0"` / `"1"` |
//! | `awareness_level` | `LOW` / `MEDIUM` / `HIGH` after the round |
//! | `reasoning` | free text |
//! | `failed_instructions` | count of instructions that failed this round (only when non-zero) |
//! | `last_error` | most recent failure message (only when `failed_instructions` is present) |
//! | `error` | present instead of the alert fields when every instruction failed |

use chrono::{DateTime, Utc};

use super::FieldMap;
use crate::awareness::AwarenessLevel;

pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_SHOULD_ALERT: &str = "should_alert";
pub const FIELD_AWARENESS_LEVEL: &str = "awareness_level";
pub const FIELD_REASONING: &str = "reasoning";
pub const FIELD_FAILED_INSTRUCTIONS: &str = "failed_instructions";
pub const FIELD_LAST_ERROR: &str = "last_error";
pub const FIELD_ERROR: &str = "error";

/// One entry of the logs stream: exactly one is written per watcher round.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    /// At least one instruction produced a verdict.
    Round {
        timestamp: DateTime<Utc>,
        should_alert: bool,
        awareness_level: AwarenessLevel,
        reasoning: String,
        failed_instructions: usize,
        last_error: Option<String>,
    },
    /// Every instruction failed.
    Error {
        timestamp: DateTime<Utc>,
        error: String,
    },
}

impl LogEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LogEntry::Round { timestamp, .. } | LogEntry::Error { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, LogEntry::Error { .. })
    }

    pub fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        let mut put = |k: &str, v: String| {
            fields.insert(k.to_string(), v.into_bytes());
        };

        put(FIELD_TIMESTAMP, unix_seconds(self.timestamp()));
        match self {
            LogEntry::Round {
                should_alert,
                awareness_level,
                reasoning,
                failed_instructions,
                last_error,
                ..
            } => {
                put(FIELD_SHOULD_ALERT, if *should_alert { "1" } else { "0" }.into());
                put(FIELD_AWARENESS_LEVEL, awareness_level.as_str().into());
                put(FIELD_REASONING, reasoning.clone());
                if *failed_instructions > 0 {
                    put(FIELD_FAILED_INSTRUCTIONS, failed_instructions.to_string());
                    if let Some(err) = last_error {
                        put(FIELD_LAST_ERROR, err.clone());
                    }
                }
            }
            LogEntry::Error { error, .. } => put(FIELD_ERROR, error.clone()),
        }
        fields
    }

    /// Parse a logs-stream entry, returning `None` if it does not follow the
    /// schema above.
    pub fn from_fields(fields: &FieldMap) -> Option<Self> {
        let text = |k: &str| {
            fields
                .get(k)
                .map(|v| String::from_utf8_lossy(v).into_owned())
        };

        let timestamp = parse_unix_seconds(&text(FIELD_TIMESTAMP)?)?;

        if let Some(error) = text(FIELD_ERROR) {
            return Some(LogEntry::Error { timestamp, error });
        }

        let should_alert = match text(FIELD_SHOULD_ALERT)?.as_str() {
            "1" => true,
            "0" => false,
            _ => return None,
        };
        let awareness_level = text(FIELD_AWARENESS_LEVEL)?.parse().ok()?;
        let reasoning = text(FIELD_REASONING)?;
        let failed_instructions = match text(FIELD_FAILED_INSTRUCTIONS) {
            Some(n) => n.parse().ok()?,
            None => 0,
        };

        Some(LogEntry::Round {
            timestamp,
            should_alert,
            awareness_level,
            reasoning,
            failed_instructions,
            last_error: text(FIELD_LAST_ERROR),
        })
    }
}

fn unix_seconds(ts: DateTime<Utc>) -> String {
    format!("{}.{:06}", ts.timestamp(), ts.timestamp_subsec_micros())
}

fn parse_unix_seconds(text: &str) -> Option<DateTime<Utc>> {
    let secs: f64 = text.trim().parse().ok()?;
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let micros = ((secs - whole) * 1_000_000.0).round() as u32;
    DateTime::from_timestamp(whole as i64, micros.min(999_999) * 1_000)
}
