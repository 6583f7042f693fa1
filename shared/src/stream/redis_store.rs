//! Redis streams backend.
//!
//! Appends map to `XADD <key> MAXLEN <=|~> <n> * field value ...` so the bound
//! is enforced by the server atomically with the write. Reads map to
//! `XREVRANGE <key> + <min> COUNT <n>`.

use redis::streams::StreamRangeReply;
use tracing::info;

use super::{EntryId, FieldMap, StoreError, StoreResult, StoredEntry, StreamStore, TrimMode};

/// Synchronous Redis connection implementing [`StreamStore`].
pub struct RedisStore {
    conn: redis::Connection,
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://localhost:6379`).
    ///
    /// Fails immediately if the server is unreachable. No reconnection is
    /// attempted later; a dropped connection surfaces as a [`StoreError`] on
    /// the next call.
    pub fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection()?;
        info!(url, "Connected to Redis stream store");
        Ok(Self { conn })
    }
}

impl StreamStore for RedisStore {
    fn append(
        &mut self,
        stream: &str,
        fields: &FieldMap,
        max_len: usize,
        trim: TrimMode,
    ) -> StoreResult<EntryId> {
        let id: String = xadd_cmd(stream, fields, max_len, trim).query(&mut self.conn)?;
        id.parse()
    }

    fn range_newest_first(
        &mut self,
        stream: &str,
        count: usize,
        min_id: Option<&EntryId>,
    ) -> StoreResult<Vec<StoredEntry>> {
        let reply: StreamRangeReply = xrevrange_cmd(stream, count, min_id).query(&mut self.conn)?;
        decode_range(reply)
    }

    fn len(&mut self, stream: &str) -> StoreResult<usize> {
        Ok(redis::cmd("XLEN").arg(stream).query(&mut self.conn)?)
    }
}

fn xadd_cmd(stream: &str, fields: &FieldMap, max_len: usize, trim: TrimMode) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream)
        .arg("MAXLEN")
        .arg(trim_operator(trim))
        .arg(max_len)
        .arg("*");
    for (field, value) in fields {
        cmd.arg(field.as_str()).arg(value.as_slice());
    }
    cmd
}

fn xrevrange_cmd(stream: &str, count: usize, min_id: Option<&EntryId>) -> redis::Cmd {
    let min = min_id.map_or_else(|| "-".to_string(), |id| id.to_string());
    let mut cmd = redis::cmd("XREVRANGE");
    cmd.arg(stream).arg("+").arg(min).arg("COUNT").arg(count);
    cmd
}

/// Values are taken as raw bytes; frame payloads are JPEG, not UTF-8.
fn decode_range(reply: StreamRangeReply) -> StoreResult<Vec<StoredEntry>> {
    reply
        .ids
        .into_iter()
        .map(|entry| -> StoreResult<StoredEntry> {
            let id: EntryId = entry.id.parse()?;
            let mut fields = FieldMap::new();
            for (field, value) in entry.map {
                let bytes: Vec<u8> = match value {
                    redis::Value::BulkString(bytes) => bytes,
                    redis::Value::SimpleString(text) => text.into_bytes(),
                    other => {
                        return Err(StoreError::Protocol(format!(
                            "field `{field}` of entry {id}: expected bytes, got {other:?}"
                        )))
                    }
                };
                fields.insert(field, bytes);
            }
            Ok(StoredEntry { id, fields })
        })
        .collect()
}

fn trim_operator(trim: TrimMode) -> &'static str {
    match trim {
        TrimMode::Exact => "=",
        TrimMode::Approximate => "~",
    }
}
