//! In-memory stream backend.
//!
//! Every log and consumer group lives behind one `RwLock`, so each trait
//! operation is atomic with respect to every other. That gives the same
//! guarantees Redis gives a single keyed stream: concurrent appends to one
//! aggregate serialize, and two consumers reading one group never receive
//! the same new entry.
//!
//! Shared by cloning the `Arc` it is wrapped in; a store and any number of
//! consumers built on the same instance see one backing store.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::debug;

use super::{
    BackendError, EntryId, GroupStart, PendingSummary, Result, StoredEntry, StreamBackend,
};
use crate::envelope::RawEntry;

/// Delivery state of a pending entry.
///
/// Entries not in a group's pending map are either new (at or past the
/// group cursor) or acknowledged (before it).
#[derive(Debug, Clone)]
struct Delivery {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

impl Delivery {
    fn to(consumer: &str, now: Instant) -> Self {
        Self {
            consumer: consumer.to_string(),
            delivered_at: now,
            deliveries: 1,
        }
    }

    fn is_reclaimable(&self, now: Instant, min_idle: Duration) -> bool {
        now.saturating_duration_since(self.delivered_at) >= min_idle
    }

    fn redeliver(&mut self, consumer: &str, now: Instant) {
        self.consumer = consumer.to_string();
        self.delivered_at = now;
        self.deliveries += 1;
    }
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    cursor: usize,
    pending: BTreeMap<EntryId, Delivery>,
}

#[derive(Debug, Default)]
struct Log {
    entries: Vec<StoredEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct State {
    logs: HashMap<String, Log>,
    last_id: EntryId,
}

impl State {
    /// Next entry id: wall-clock millis, with a sequence for ties.
    fn next_id(&mut self) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let id = if now_ms > self.last_id.ms {
            EntryId::new(now_ms, 0)
        } else {
            EntryId::new(self.last_id.ms, self.last_id.seq + 1)
        };
        self.last_id = id;
        id
    }

    fn push(&mut self, key: &str, raw: RawEntry) {
        let id = self.next_id();
        self.logs
            .entry(key.to_string())
            .or_default()
            .entries
            .push(StoredEntry {
                id,
                raw,
                deliveries: 0,
            });
    }

    fn group_mut(&mut self, key: &str, group: &str) -> Result<(&mut GroupState, &[StoredEntry])> {
        let no_group = || BackendError::NoGroup {
            key: key.to_string(),
            group: group.to_string(),
        };
        let log = self.logs.get_mut(key).ok_or_else(no_group)?;
        let state = log.groups.get_mut(group).ok_or_else(no_group)?;
        Ok((state, &log.entries))
    }
}

/// In-process implementation of `StreamBackend`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
    appended: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver new entries if any are available, without waiting.
    async fn try_read_new(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StoredEntry>> {
        let mut state = self.state.write().await;
        let (group_state, entries) = state.group_mut(key, group)?;

        let now = Instant::now();
        let end = entries.len().min(group_state.cursor + count);
        let mut delivered: Vec<StoredEntry> = entries[group_state.cursor..end].to_vec();

        for entry in &mut delivered {
            let delivery = Delivery::to(consumer, now);
            entry.deliveries = delivery.deliveries;
            group_state.pending.insert(entry.id, delivery);
        }
        group_state.cursor = end;

        Ok(delivered)
    }
}

#[async_trait]
impl StreamBackend for MemoryBackend {
    async fn append(
        &self,
        stream_key: &str,
        global_key: &str,
        expected_version: i64,
        entries: Vec<RawEntry>,
    ) -> Result<i64> {
        let mut state = self.state.write().await;

        let current = state
            .logs
            .get(stream_key)
            .map(|log| log.entries.len() as i64)
            .unwrap_or(0)
            - 1;

        if current != expected_version {
            return Err(BackendError::VersionMismatch { actual: current });
        }

        let count = entries.len() as i64;
        for raw in entries {
            state.push(stream_key, raw.clone());
            state.push(global_key, raw);
        }
        drop(state);

        self.appended.notify_waiters();

        debug!(stream = %stream_key, count, "Appended entries in memory");
        Ok(current + count)
    }

    async fn stream_len(&self, key: &str) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .logs
            .get(key)
            .map(|log| log.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn range(&self, key: &str, start: u64, end: Option<u64>) -> Result<Vec<StoredEntry>> {
        let state = self.state.read().await;
        let Some(log) = state.logs.get(key) else {
            return Ok(Vec::new());
        };

        let len = log.entries.len();
        let start = (start as usize).min(len);
        let end = end
            .map(|e| (e as usize).saturating_add(1).min(len))
            .unwrap_or(len);

        if start >= end {
            return Ok(Vec::new());
        }
        Ok(log.entries[start..end].to_vec())
    }

    async fn create_group(&self, key: &str, group: &str, start: GroupStart) -> Result<bool> {
        let mut state = self.state.write().await;
        let log = state.logs.entry(key.to_string()).or_default();

        if log.groups.contains_key(group) {
            return Ok(false);
        }

        let cursor = match start {
            GroupStart::Latest => log.entries.len(),
            GroupStart::Beginning => 0,
        };
        log.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: BTreeMap::new(),
            },
        );

        debug!(stream = %key, group = %group, ?start, "Created consumer group");
        Ok(true)
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

        let deadline = Instant::now() + block;
        loop {
            // Register for wakeups before checking, so an append landing
            // between the check and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delivered = self.try_read_new(key, group, consumer, count).await?;
            if !delivered.is_empty() {
                return Ok(delivered);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn claim_idle(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StoredEntry>> {
        let mut state = self.state.write().await;
        let (group_state, entries) = state.group_mut(key, group)?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (id, delivery) in group_state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if !delivery.is_reclaimable(now, min_idle) {
                continue;
            }
            let Ok(index) = entries.binary_search_by(|e| e.id.cmp(id)) else {
                continue;
            };

            debug!(
                stream = %key,
                group = %group,
                entry = %id,
                from = %delivery.consumer,
                to = %consumer,
                deliveries = delivery.deliveries + 1,
                "Claimed idle entry"
            );
            delivery.redeliver(consumer, now);
            claimed.push(StoredEntry {
                deliveries: delivery.deliveries,
                ..entries[index].clone()
            });
        }

        Ok(claimed)
    }

    async fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        let mut state = self.state.write().await;
        let (group_state, _) = state.group_mut(key, group)?;

        let acked = ids
            .iter()
            .filter(|id| group_state.pending.remove(id).is_some())
            .count() as u64;
        Ok(acked)
    }

    async fn pending(&self, key: &str, group: &str) -> Result<PendingSummary> {
        let mut state = self.state.write().await;
        let (group_state, _) = state.group_mut(key, group)?;

        let mut consumers: BTreeMap<String, u64> = BTreeMap::new();
        for delivery in group_state.pending.values() {
            *consumers.entry(delivery.consumer.clone()).or_default() += 1;
        }

        Ok(PendingSummary {
            count: group_state.pending.len() as u64,
            lowest: group_state.pending.keys().next().copied(),
            highest: group_state.pending.keys().next_back().copied(),
            consumers,
        })
    }
}
