//! Redis Streams backend.
//!
//! Each aggregate log and the global log are Redis streams. Consumer groups
//! map directly onto `XGROUP`/`XREADGROUP`/`XAUTOCLAIM`/`XACK`, so group
//! bookkeeping survives consumer restarts.
//!
//! Appends run as a Lua script: the length check and the `XADD`s to both
//! streams execute atomically on the server, so two writers racing on one
//! aggregate cannot both pass the version check.
//!
//! The script touches an aggregate stream and the global stream in one
//! call. On Redis Cluster both keys must hash to the same slot, so the
//! `stream_prefix` must carry a hash tag (e.g. `{events}:`); otherwise the
//! append fails with `CROSSSLOT`. Standalone Redis needs no tag.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use redis::{Client, ErrorKind, RedisError, Script, Value};
use tracing::{debug, info, warn};

use super::{
    BackendError, EntryId, GroupStart, PendingSummary, Result, StoredEntry, StreamBackend,
};
use crate::envelope::RawEntry;
use crate::utils::retry::connection_backoff;

/// Compare-and-append to an aggregate stream and the global stream.
///
/// KEYS: aggregate stream, global stream.
/// ARGV: expected version, entry count, then per entry its field count
/// followed by field/value pairs.
/// Returns `{1, new_version}` on success, `{0, actual_version}` on mismatch.
const APPEND_SCRIPT: &str = r#"
local current = redis.call('XLEN', KEYS[1]) - 1
if current ~= tonumber(ARGV[1]) then
  return {0, current}
end
local count = tonumber(ARGV[2])
local idx = 3
for i = 1, count do
  local nfields = tonumber(ARGV[idx])
  idx = idx + 1
  local args = {}
  for j = 1, nfields * 2 do
    args[j] = ARGV[idx]
    idx = idx + 1
  end
  redis.call('XADD', KEYS[1], '*', unpack(args))
  redis.call('XADD', KEYS[2], '*', unpack(args))
end
return {1, current + count}
"#;

/// Redis Streams implementation of `StreamBackend`.
pub struct RedisBackend {
    conn: ConnectionManager,
    /// Dedicated to `XREADGROUP ... BLOCK` so blocked reads do not stall
    /// other commands on the multiplexed connection.
    blocking_conn: ConnectionManager,
    append_script: Script,
}

impl RedisBackend {
    /// Connect to Redis, retrying with backoff.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;

        let connect = || {
            let client = client.clone();
            async move { ConnectionManager::new(client).await }
        };
        let conn = connect
            .retry(connection_backoff())
            .when(|e: &RedisError| e.kind() != ErrorKind::InvalidClientConfig)
            .notify(|e: &RedisError, delay: Duration| {
                warn!(url = %url, error = %e, ?delay, "Redis connection failed, retrying");
            })
            .await?;
        let blocking_conn = ConnectionManager::new(client).await?;

        info!(url = %url, "Connected to Redis");

        Ok(Self {
            conn,
            blocking_conn,
            append_script: Script::new(APPEND_SCRIPT),
        })
    }

    fn to_stored(entry: StreamId) -> Result<StoredEntry> {
        let id = entry.id.parse::<EntryId>()?;
        let mut raw = RawEntry::new();
        for (field, value) in &entry.map {
            let value: String = redis::from_redis_value(value)?;
            raw.insert(field.as_str(), value);
        }
        Ok(StoredEntry {
            id,
            raw,
            deliveries: 0,
        })
    }

    fn to_stored_all(entries: Vec<StreamId>) -> Result<Vec<StoredEntry>> {
        entries.into_iter().map(Self::to_stored).collect()
    }

    /// Delivery counts of pending entries, by id.
    async fn delivery_counts(
        &self,
        key: &str,
        group: &str,
        ids: &[EntryId],
    ) -> Result<HashMap<EntryId, u32>> {
        let mut pipe = redis::pipe();
        for id in ids {
            let id = id.to_string();
            pipe.cmd("XPENDING")
                .arg(key)
                .arg(group)
                .arg(&id)
                .arg(&id)
                .arg(1);
        }

        let mut conn = self.conn.clone();
        // Each reply: [[id, consumer, idle-ms, deliveries]] or empty if the
        // entry was acknowledged in the meantime.
        let replies: Vec<Vec<(String, String, u64, u32)>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_group_error(e, key, group))?;

        let mut counts = HashMap::with_capacity(ids.len());
        for (id, _, _, deliveries) in replies.into_iter().flatten() {
            counts.insert(id.parse()?, deliveries);
        }
        Ok(counts)
    }

    fn map_group_error(err: RedisError, key: &str, group: &str) -> BackendError {
        if err.code() == Some("NOGROUP") {
            BackendError::NoGroup {
                key: key.to_string(),
                group: group.to_string(),
            }
        } else {
            BackendError::Redis(err)
        }
    }
}

#[async_trait]
impl StreamBackend for RedisBackend {
    async fn append(
        &self,
        stream_key: &str,
        global_key: &str,
        expected_version: i64,
        entries: Vec<RawEntry>,
    ) -> Result<i64> {
        let mut invocation = self.append_script.prepare_invoke();
        invocation
            .key(stream_key)
            .key(global_key)
            .arg(expected_version)
            .arg(entries.len());
        for raw in &entries {
            invocation.arg(raw.len());
            for (field, value) in raw.iter() {
                invocation.arg(field).arg(value);
            }
        }

        let mut conn = self.conn.clone();
        let (applied, version): (i64, i64) = invocation.invoke_async(&mut conn).await?;

        if applied == 0 {
            return Err(BackendError::VersionMismatch { actual: version });
        }

        debug!(stream = %stream_key, count = entries.len(), version, "Appended entries to Redis");
        Ok(version)
    }

    async fn stream_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("XLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn range(&self, key: &str, start: u64, end: Option<u64>) -> Result<Vec<StoredEntry>> {
        if matches!(end, Some(end) if end < start) {
            return Ok(Vec::new());
        }

        // Stream ids are not indexes: read the prefix up to `end` and skip.
        // Reads far into a long stream therefore transfer its whole head.
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(key).arg("-").arg("+");
        if let Some(end) = end {
            cmd.arg("COUNT").arg(end.saturating_add(1));
        }

        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = cmd.query_async(&mut conn).await?;

        let entries = reply.ids.into_iter().skip(start as usize).collect();
        Self::to_stored_all(entries)
    }

    async fn create_group(&self, key: &str, group: &str, start: GroupStart) -> Result<bool> {
        let start_id = match start {
            GroupStart::Latest => "$",
            GroupStart::Beginning => "0",
        };

        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                debug!(stream = %key, group = %group, ?start, "Created consumer group");
                Ok(true)
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_new(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StoredEntry>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count);

        // BLOCK 0 means "forever" to Redis, so omit it for non-blocking reads.
        let block_ms = block.as_millis() as u64;
        let mut conn = if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
            self.blocking_conn.clone()
        } else {
            self.conn.clone()
        };
        cmd.arg("STREAMS").arg(key).arg(">");

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_group_error(e, key, group))?;

        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();
        let mut delivered = Self::to_stored_all(entries)?;
        for entry in &mut delivered {
            entry.deliveries = 1;
        }
        Ok(delivered)
    }

    async fn claim_idle(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StoredEntry>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        // Reply: [next-cursor, [entries...], [deleted-ids...]] (the last
        // element only on Redis 7+).
        let reply: Vec<Value> = redis::cmd("XAUTOCLAIM")
            .arg(key)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_group_error(e, key, group))?;

        let claimed = reply
            .get(1)
            .ok_or_else(|| BackendError::UnexpectedReply("XAUTOCLAIM without entries".into()))?;
        let claimed: StreamRangeReply = redis::from_redis_value(claimed)?;

        let mut claimed = Self::to_stored_all(claimed.ids)?;
        if claimed.is_empty() {
            return Ok(claimed);
        }

        let ids: Vec<EntryId> = claimed.iter().map(|entry| entry.id).collect();
        let counts = self.delivery_counts(key, group, &ids).await?;
        for entry in &mut claimed {
            entry.deliveries = counts.get(&entry.id).copied().unwrap_or(1);
        }

        debug!(
            stream = %key,
            group = %group,
            consumer = %consumer,
            count = claimed.len(),
            "Claimed idle entries"
        );
        Ok(claimed)
    }

    async fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("XACK");
        cmd.arg(key).arg(group);
        for id in ids {
            cmd.arg(id.to_string());
        }

        let mut conn = self.conn.clone();
        let acked: u64 = cmd.query_async(&mut conn).await?;
        Ok(acked)
    }

    async fn pending(&self, key: &str, group: &str) -> Result<PendingSummary> {
        let mut conn = self.conn.clone();
        let (count, lowest, highest, consumers): (
            u64,
            Option<String>,
            Option<String>,
            Option<Vec<(String, String)>>,
        ) = redis::cmd("XPENDING")
            .arg(key)
            .arg(group)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_group_error(e, key, group))?;

        let mut per_consumer = BTreeMap::new();
        for (name, pending) in consumers.unwrap_or_default() {
            let pending = pending
                .parse::<u64>()
                .map_err(|_| BackendError::UnexpectedReply(format!("XPENDING count {pending}")))?;
            per_consumer.insert(name, pending);
        }

        Ok(PendingSummary {
            count,
            lowest: lowest.map(|id| id.parse()).transpose()?,
            highest: highest.map(|id| id.parse()).transpose()?,
            consumers: per_consumer,
        })
    }
}
