//! Structured answer the vision model must produce for one evaluation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::AwarenessLevel;

/// Verdict for one batch of frames against one instruction list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatcherVerdict {
    pub should_alert: bool,
    pub reasoning: String,
    pub recommended_awareness_level: AwarenessLevel,
}

impl WatcherVerdict {
    /// JSON schema handed to the server for guided decoding.
    pub fn json_schema() -> Value {
        let levels: Vec<&str> = AwarenessLevel::ALL.iter().map(|l| l.as_str()).collect();
        json!({
            "title": "WatcherResponse",
            "type": "object",
            "properties": {
                "should_alert": { "title": "Should Alert", "type": "boolean" },
                "reasoning": { "title": "Reasoning", "type": "string" },
                "recommended_awareness_level": {
                    "title": "AwarenessLevel",
                    "type": "string",
                    "enum": levels,
                },
            },
            "required": ["should_alert", "reasoning", "recommended_awareness_level"],
            "additionalProperties": false,
        })
    }

    /// Validate the model's message content against the schema.
    ///
    /// Models sometimes wrap the object in a Markdown code fence even under
    /// guided decoding; one enclosing fence is stripped before parsing.
    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(strip_code_fence(content))
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening line
    match body.find('\n') {
        Some(newline) => body[newline + 1..].trim(),
        None => body.trim(),
    }
}
