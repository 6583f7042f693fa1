//! Captured frame model and its flat wire representation.
//!
//! A [`Frame`] is one encoded image with its capture time and a per-capturer
//! monotonically increasing index. Once appended to a stream it is flattened
//! into three fields (`frame_bytes`, `timestamp`, `frame_idx`) and the
//! in-process value may be dropped.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use std::fmt;

use crate::stream::FieldMap;

/// Field holding the raw encoded image bytes.
pub const FIELD_FRAME_BYTES: &str = "frame_bytes";
/// Field holding the ISO-8601 capture timestamp.
pub const FIELD_TIMESTAMP: &str = "timestamp";
/// Field holding the decimal frame index.
pub const FIELD_FRAME_IDX: &str = "frame_idx";

/// One timestamped, indexed, encoded image.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
    captured_at: DateTime<Utc>,
    index: u64,
}

impl Frame {
    pub fn new(payload: Vec<u8>, captured_at: DateTime<Utc>, index: u64) -> Self {
        Self {
            payload,
            captured_at,
            index,
        }
    }

    /// Encoded image bytes (JPEG for frames produced by the capturer).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Flatten into the stream wire format.
    ///
    /// The payload is stored verbatim, the timestamp as RFC 3339 text with
    /// microsecond precision and the index as decimal text.
    pub fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(FIELD_FRAME_BYTES.to_string(), self.payload.clone());
        fields.insert(
            FIELD_TIMESTAMP.to_string(),
            format_timestamp(self.captured_at).into_bytes(),
        );
        fields.insert(
            FIELD_FRAME_IDX.to_string(),
            self.index.to_string().into_bytes(),
        );
        fields
    }

    /// Rebuild a frame from a stream entry's field map.
    ///
    /// Returns `Err` describing the first problem when a required field is
    /// missing or the timestamp/index cannot be parsed. Callers reading from a
    /// stream log and skip such entries.
    pub fn from_fields(fields: &FieldMap) -> Result<Self, FrameDecodeError> {
        let payload = fields
            .get(FIELD_FRAME_BYTES)
            .ok_or(FrameDecodeError::MissingField(FIELD_FRAME_BYTES))?
            .clone();

        let timestamp_raw = fields
            .get(FIELD_TIMESTAMP)
            .ok_or(FrameDecodeError::MissingField(FIELD_TIMESTAMP))?;
        let timestamp_text = std::str::from_utf8(timestamp_raw)
            .map_err(|_| FrameDecodeError::InvalidTimestamp(lossy(timestamp_raw)))?;
        let captured_at = parse_timestamp(timestamp_text)
            .ok_or_else(|| FrameDecodeError::InvalidTimestamp(timestamp_text.to_string()))?;

        let index_raw = fields
            .get(FIELD_FRAME_IDX)
            .ok_or(FrameDecodeError::MissingField(FIELD_FRAME_IDX))?;
        let index = std::str::from_utf8(index_raw)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| FrameDecodeError::InvalidIndex(lossy(index_raw)))?;

        Ok(Self {
            payload,
            captured_at,
            index,
        })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("captured_at", &format_timestamp(self.captured_at))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Reasons a stream entry could not be turned back into a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unparsable timestamp `{0}`")]
    InvalidTimestamp(String),
    #[error("unparsable frame index `{0}`")]
    InvalidIndex(String),
}

/// Render a timestamp the way it is stored on the wire.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an ISO-8601 timestamp.
///
/// Offsets are honoured when present. Naive timestamps (as written by some
/// older producers) are interpreted as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
