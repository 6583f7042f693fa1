//! In-process stream store with Redis-compatible trimming semantics.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use super::{EntryId, FieldMap, StoreResult, StoredEntry, StreamStore, TrimMode};

/// Entries an approximately trimmed stream may hold above its bound before
/// it is cut back (Redis trims whole radix-tree nodes of this size).
pub const APPROX_TRIM_SLACK: usize = 100;

#[derive(Debug, Default)]
struct MemoryStream {
    entries: VecDeque<StoredEntry>,
    last_id: Option<EntryId>,
}

impl MemoryStream {
    fn next_id(&mut self) -> EntryId {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let id = match self.last_id {
            Some(last) if now_ms <= last.millis => EntryId::new(last.millis, last.seq + 1),
            _ => EntryId::new(now_ms, 0),
        };
        self.last_id = Some(id);
        id
    }

    fn trim(&mut self, max_len: usize, trim: TrimMode, slack: usize) {
        let limit = match trim {
            TrimMode::Exact => max_len,
            TrimMode::Approximate => max_len + slack,
        };
        if self.entries.len() > limit {
            while self.entries.len() > max_len {
                self.entries.pop_front();
            }
        }
    }
}

/// Thread-safe in-memory [`StreamStore`].
///
/// Clones share the same underlying streams, so a test can hand one clone to
/// a producer and inspect another. Append and trim happen under one lock, so
/// an exact-trimmed stream is never observable above its bound.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    streams: Arc<Mutex<HashMap<String, MemoryStream>>>,
    approx_slack: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_approx_slack(APPROX_TRIM_SLACK)
    }

    /// Store whose approximate trimming tolerates `approx_slack` extra entries.
    pub fn with_approx_slack(approx_slack: usize) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            approx_slack,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryStream>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of every entry in `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StoredEntry> {
        self.lock()
            .get(stream)
            .map(|s| s.entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStore for MemoryStore {
    fn append(
        &mut self,
        stream: &str,
        fields: &FieldMap,
        max_len: usize,
        trim: TrimMode,
    ) -> StoreResult<EntryId> {
        let slack = self.approx_slack;
        let mut streams = self.lock();
        let entry = streams.entry(stream.to_string()).or_default();
        let id = entry.next_id();
        entry.entries.push_back(StoredEntry {
            id,
            fields: fields.clone(),
        });
        entry.trim(max_len, trim, slack);
        Ok(id)
    }

    fn range_newest_first(
        &mut self,
        stream: &str,
        count: usize,
        min_id: Option<&EntryId>,
    ) -> StoreResult<Vec<StoredEntry>> {
        let streams = self.lock();
        let Some(entry) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(entry
            .entries
            .iter()
            .rev()
            .take_while(|e| min_id.map_or(true, |min| e.id >= *min))
            .take(count)
            .cloned()
            .collect())
    }

    fn len(&mut self, stream: &str) -> StoreResult<usize> {
        Ok(self.lock().get(stream).map_or(0, |s| s.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(i: usize) -> FieldMap {
        let mut f = FieldMap::new();
        f.insert("n".to_string(), i.to_string().into_bytes());
        f
    }

    fn value(entry: &StoredEntry) -> String {
        String::from_utf8(entry.fields["n"].clone()).unwrap()
    }

    #[test]
    fn test_exact_trim_never_exceeds_bound() {
        let mut store = MemoryStore::new();
        for i in 0..20 {
            store.append("s", &fields(i), 5, TrimMode::Exact).unwrap();
            assert_eq!(store.len("s").unwrap(), (i + 1).min(5));
        }
    }

    #[test]
    fn test_approximate_trim_allows_bounded_slack() {
        let mut store = MemoryStore::with_approx_slack(3);
        for i in 0..8 {
            store.append("s", &fields(i), 4, TrimMode::Approximate).unwrap();
        }
        // 8 > 4 + 3, so the stream was cut back on the eighth append
        assert_eq!(store.len("s").unwrap(), 4);

        store.append("s", &fields(8), 4, TrimMode::Approximate).unwrap();
        store.append("s", &fields(9), 4, TrimMode::Approximate).unwrap();
        let len = store.len("s").unwrap();
        assert!(len > 4 && len <= 7, "len {len} outside slack window");
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mut store = MemoryStore::new();
        let ids: Vec<EntryId> = (0..50)
            .map(|i| store.append("s", &fields(i), 100, TrimMode::Exact).unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_range_newest_first_with_lower_bound() {
        let mut store = MemoryStore::new();
        let ids: Vec<EntryId> = (0..6)
            .map(|i| store.append("s", &fields(i), 100, TrimMode::Exact).unwrap())
            .collect();

        let newest = store.range_newest_first("s", 3, None).unwrap();
        let values: Vec<String> = newest.iter().map(value).collect();
        assert_eq!(values, vec!["5", "4", "3"]);

        let bounded = store.range_newest_first("s", 10, Some(&ids[4])).unwrap();
        let values: Vec<String> = bounded.iter().map(value).collect();
        assert_eq!(values, vec!["5", "4"]);
    }

    #[test]
    fn test_missing_stream_reads_empty() {
        let mut store = MemoryStore::new();
        assert!(store.range_newest_first("nope", 5, None).unwrap().is_empty());
        assert_eq!(store.len("nope").unwrap(), 0);
    }

    #[test]
    fn test_clones_share_streams() {
        let mut writer = MemoryStore::new();
        let reader = writer.clone();
        writer.append("s", &fields(1), 10, TrimMode::Exact).unwrap();
        assert_eq!(reader.entries("s").len(), 1);
    }
}
