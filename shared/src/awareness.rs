//! Monitoring intensity levels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Discrete monitoring intensity, ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AwarenessLevel {
    Low,
    Medium,
    High,
}

impl AwarenessLevel {
    pub const ALL: [AwarenessLevel; 3] = [Self::Low, Self::Medium, Self::High];

    /// Wire name (`LOW`, `MEDIUM`, `HIGH`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl Default for AwarenessLevel {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for AwarenessLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown awareness level `{0}` (expected LOW, MEDIUM or HIGH)")]
pub struct ParseAwarenessLevelError(pub String);

impl FromStr for AwarenessLevel {
    type Err = ParseAwarenessLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(ParseAwarenessLevelError(other.to_string())),
        }
    }
}
