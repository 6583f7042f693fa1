//! Durable, length-bounded, time-ordered streams.
//!
//! A stream is an append-only sequence of flat field maps keyed by an opaque,
//! monotonically increasing [`EntryId`] assigned by the store. Trimming of the
//! oldest entries happens as a side effect of [`StreamStore::append`] and is
//! the only deletion path.
//!
//! Two stores are provided: [`RedisStore`] for production (Redis streams,
//! `XADD ... MAXLEN` / `XREVRANGE`) and [`MemoryStore`] for tests and
//! single-process experiments.

pub mod client;
pub mod log_entry;
pub mod memory;
pub mod redis_store;

pub use client::StreamClient;
pub use log_entry::LogEntry;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Field name to raw value. Keys are UTF-8; values are arbitrary bytes.
pub type FieldMap = BTreeMap<String, Vec<u8>>;

/// Store-assigned entry identifier in Redis `<millis>-<seq>` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl Ord for EntryId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.millis, self.seq).cmp(&(other.millis, other.seq))
    }
}

impl PartialOrd for EntryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidEntryId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// How strictly a stream's length bound is enforced on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimMode {
    /// The bound holds after every append, never exceeded even transiently.
    Exact,
    /// The store may keep bounded slack above the limit for cheaper writes.
    Approximate,
}

/// One persisted stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub id: EntryId,
    pub fields: FieldMap,
}

/// Errors raised by stream stores. Never retried internally.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed entry id `{0}`")]
    InvalidEntryId(String),
    #[error("malformed store reply: {0}")]
    Protocol(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Primitive operations every durable stream backend provides.
pub trait StreamStore {
    /// Append `fields` to `stream`, trimming it to `max_len` entries.
    ///
    /// Creates the stream if it does not exist. Returns the id assigned to the
    /// new entry.
    fn append(
        &mut self,
        stream: &str,
        fields: &FieldMap,
        max_len: usize,
        trim: TrimMode,
    ) -> StoreResult<EntryId>;

    /// Up to `count` entries, newest first, optionally stopping at `min_id`
    /// (inclusive). A missing stream reads as empty.
    fn range_newest_first(
        &mut self,
        stream: &str,
        count: usize,
        min_id: Option<&EntryId>,
    ) -> StoreResult<Vec<StoredEntry>>;

    /// Current number of entries in `stream` (0 if it does not exist).
    fn len(&mut self, stream: &str) -> StoreResult<usize>;
}

impl<S: StreamStore + ?Sized> StreamStore for Box<S> {
    fn append(
        &mut self,
        stream: &str,
        fields: &FieldMap,
        max_len: usize,
        trim: TrimMode,
    ) -> StoreResult<EntryId> {
        (**self).append(stream, fields, max_len, trim)
    }

    fn range_newest_first(
        &mut self,
        stream: &str,
        count: usize,
        min_id: Option<&EntryId>,
    ) -> StoreResult<Vec<StoredEntry>> {
        (**self).range_newest_first(stream, count, min_id)
    }

    fn len(&mut self, stream: &str) -> StoreResult<usize> {
        (**self).len(stream)
    }
}

/// A named stream together with its retention policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub key: String,
    pub max_len: usize,
    pub trim: TrimMode,
}

/// Retention bounds for the three streams kept per room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBounds {
    pub realtime_max_len: usize,
    pub subsampled_max_len: usize,
    pub logs_max_len: usize,
}

impl Default for StreamBounds {
    fn default() -> Self {
        Self {
            realtime_max_len: 3,
            subsampled_max_len: 64,
            logs_max_len: 3600 * 6,
        }
    }
}

/// The realtime, subsampled and logs streams of one monitored room.
///
/// The realtime stream holds every frame with exact trimming (it backs a live
/// view where stale entries are visible). The subsampled stream holds every
/// Nth frame and the logs stream holds round summaries, both with approximate
/// trimming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomStreams {
    pub realtime: StreamSpec,
    pub subsampled: StreamSpec,
    pub logs: StreamSpec,
}

impl RoomStreams {
    pub fn for_room(room: &str, bounds: StreamBounds) -> Self {
        Self {
            realtime: StreamSpec {
                key: format!("{room}:realtime"),
                max_len: bounds.realtime_max_len,
                trim: TrimMode::Exact,
            },
            subsampled: StreamSpec {
                key: format!("{room}:subsampled"),
                max_len: bounds.subsampled_max_len,
                trim: TrimMode::Approximate,
            },
            logs: StreamSpec {
                key: format!("{room}:logs"),
                max_len: bounds.logs_max_len,
                trim: TrimMode::Approximate,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_parse_and_display() {
        let id: EntryId = "1700000000123-7".parse().unwrap();
        assert_eq!(id, EntryId::new(1_700_000_000_123, 7));
        assert_eq!(id.to_string(), "1700000000123-7");

        let bare: EntryId = "42".parse().unwrap();
        assert_eq!(bare, EntryId::new(42, 0));

        assert!("abc-1".parse::<EntryId>().is_err());
        assert!("1-x".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_entry_id_ordering() {
        assert!(EntryId::new(5, 0) < EntryId::new(5, 1));
        assert!(EntryId::new(5, 9) < EntryId::new(6, 0));
    }

    #[test]
    fn test_room_stream_names_and_policies() {
        let streams = RoomStreams::for_room("nursery", StreamBounds::default());

        assert_eq!(streams.realtime.key, "nursery:realtime");
        assert_eq!(streams.realtime.trim, TrimMode::Exact);
        assert_eq!(streams.realtime.max_len, 3);

        assert_eq!(streams.subsampled.key, "nursery:subsampled");
        assert_eq!(streams.subsampled.trim, TrimMode::Approximate);
        assert_eq!(streams.subsampled.max_len, 64);

        assert_eq!(streams.logs.key, "nursery:logs");
        assert_eq!(streams.logs.max_len, 21_600);
    }
}
