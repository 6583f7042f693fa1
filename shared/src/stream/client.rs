//! Frame and log append/read protocol on top of a [`StreamStore`].

use tracing::{debug, warn};

use super::{EntryId, FieldMap, LogEntry, StoreResult, StoredEntry, StreamStore, TrimMode};
use crate::frame::Frame;

/// Serializes frames and log entries into streams and reads them back.
///
/// Every read returns entries oldest-first: the store is asked for the newest
/// `count` entries (its native newest-first order) and the result is reversed
/// before it is handed out. Consumers rely on this ordering.
///
/// Nothing here retries. A failed append or read is returned to the caller,
/// which owns the retry policy.
pub struct StreamClient<S> {
    store: S,
}

impl<S: StreamStore> StreamClient<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    /// Append `frame` to `stream`, trimming it to `max_len` entries.
    pub fn append_frame(
        &mut self,
        frame: &Frame,
        stream: &str,
        max_len: usize,
        trim: TrimMode,
    ) -> StoreResult<EntryId> {
        let id = self.append_fields(stream, &frame.to_fields(), max_len, trim)?;
        debug!(stream, frame_idx = frame.index(), entry_id = %id, "Appended frame");
        Ok(id)
    }

    /// Append an arbitrary field map. No schema is enforced.
    pub fn append_fields(
        &mut self,
        stream: &str,
        fields: &FieldMap,
        max_len: usize,
        trim: TrimMode,
    ) -> StoreResult<EntryId> {
        self.store.append(stream, fields, max_len, trim)
    }

    pub fn append_log(
        &mut self,
        stream: &str,
        entry: &LogEntry,
        max_len: usize,
        trim: TrimMode,
    ) -> StoreResult<EntryId> {
        self.append_fields(stream, &entry.to_fields(), max_len, trim)
    }

    /// The latest `count` raw entries, oldest first, optionally limited to ids
    /// at or after `since`.
    pub fn read_latest_entries(
        &mut self,
        stream: &str,
        count: usize,
        since: Option<&EntryId>,
    ) -> StoreResult<Vec<StoredEntry>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut entries = self.store.range_newest_first(stream, count, since)?;
        entries.reverse();
        Ok(entries)
    }

    /// The latest `count` frames of `stream`, oldest first.
    ///
    /// Entries that do not decode as frames are logged and skipped, so the
    /// result may be shorter than the number of entries read.
    pub fn read_latest(&mut self, stream: &str, count: usize) -> StoreResult<Vec<(EntryId, Frame)>> {
        let entries = self.read_latest_entries(stream, count, None)?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match Frame::from_fields(&entry.fields) {
                Ok(frame) => Some((entry.id, frame)),
                Err(e) => {
                    warn!(stream, entry_id = %entry.id, error = %e, "Skipping malformed frame entry");
                    None
                }
            })
            .collect())
    }

    /// Like [`read_latest`](Self::read_latest) without the entry ids.
    pub fn read_latest_frames(&mut self, stream: &str, count: usize) -> StoreResult<Vec<Frame>> {
        Ok(self
            .read_latest(stream, count)?
            .into_iter()
            .map(|(_, frame)| frame)
            .collect())
    }

    /// The latest `count` log entries, oldest first. Entries that do not
    /// follow the log schema are skipped.
    pub fn read_latest_logs(
        &mut self,
        stream: &str,
        count: usize,
        since: Option<&EntryId>,
    ) -> StoreResult<Vec<(EntryId, LogEntry)>> {
        let entries = self.read_latest_entries(stream, count, since)?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match LogEntry::from_fields(&entry.fields) {
                Some(log) => Some((entry.id, log)),
                None => {
                    warn!(stream, entry_id = %entry.id, "Skipping malformed log entry");
                    None
                }
            })
            .collect())
    }
}
