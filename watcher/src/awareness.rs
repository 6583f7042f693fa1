//! Awareness state machine and the poll cadence each level maps to.

use chrono::{DateTime, Utc};
use shared::room_config::ConfigError;
use shared::AwarenessLevel;
use std::time::Duration;

/// Round period per awareness level. Higher awareness polls at least as
/// often as lower awareness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwarenessCadence {
    low: Duration,
    medium: Duration,
    high: Duration,
}

impl AwarenessCadence {
    pub fn new(low: Duration, medium: Duration, high: Duration) -> Result<Self, ConfigError> {
        if high > medium || medium > low {
            return Err(ConfigError::Validation(format!(
                "awareness cadence must satisfy high <= medium <= low (got high {high:?}, medium {medium:?}, low {low:?})"
            )));
        }
        Ok(Self { low, medium, high })
    }

    pub fn for_level(&self, level: AwarenessLevel) -> Duration {
        match level {
            AwarenessLevel::Low => self.low,
            AwarenessLevel::Medium => self.medium,
            AwarenessLevel::High => self.high,
        }
    }
}

impl Default for AwarenessCadence {
    fn default() -> Self {
        Self {
            low: Duration::from_secs(10),
            medium: Duration::from_secs(5),
            high: Duration::from_secs(1),
        }
    }
}

/// Read-only copy of the controller state for anything outside the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwarenessSnapshot {
    pub level: AwarenessLevel,
    pub cadence: Duration,
    pub updated_at: DateTime<Utc>,
}

/// Owns the current awareness level of one watcher loop.
///
/// Starts at MEDIUM. A round's recommendations can only raise the level: the
/// next level is the maximum of the current one and every recommendation in
/// the round. Nothing decays on its own; only [`reset`](Self::reset) lowers
/// the level.
#[derive(Debug, Clone)]
pub struct AwarenessController {
    level: AwarenessLevel,
    cadence: AwarenessCadence,
    updated_at: DateTime<Utc>,
}

impl AwarenessController {
    pub fn new(cadence: AwarenessCadence) -> Self {
        Self {
            level: AwarenessLevel::Medium,
            cadence,
            updated_at: Utc::now(),
        }
    }

    /// Start from `level` instead of MEDIUM, e.g. when resuming a room.
    pub fn with_level(mut self, level: AwarenessLevel) -> Self {
        self.level = level;
        self
    }

    pub fn level(&self) -> AwarenessLevel {
        self.level
    }

    /// Period of the round loop at the current level.
    pub fn cadence(&self) -> Duration {
        self.cadence.for_level(self.level)
    }

    /// Fold one round of recommendations into the state and return the new
    /// level. An empty round leaves the level unchanged.
    pub fn update<I>(&mut self, recommendations: I) -> AwarenessLevel
    where
        I: IntoIterator<Item = AwarenessLevel>,
    {
        let next = recommendations.into_iter().fold(self.level, Ord::max);
        if next != self.level {
            tracing::info!(from = %self.level, to = %next, "Awareness level changed");
            self.level = next;
        }
        self.updated_at = Utc::now();
        self.level
    }

    pub fn reset(&mut self) {
        self.level = AwarenessLevel::Medium;
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> AwarenessSnapshot {
        AwarenessSnapshot {
            level: self.level,
            cadence: self.cadence(),
            updated_at: self.updated_at,
        }
    }
}

impl Default for AwarenessController {
    fn default() -> Self {
        Self::new(AwarenessCadence::default())
    }
}
