//! Backing store implementations.
//!
//! The store and consumer engines only see the `StreamBackend` trait: the
//! native primitives of a keyed append-only log with consumer groups.
//! Atomicity lives here. The compare-and-append and the group delivery
//! cursor must each be a single indivisible operation in the backing store.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::config::{BackendType, EventStoreConfig};
use crate::envelope::RawEntry;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryBackend;

#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur in a backing store.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Version mismatch: stream is at version {actual}")]
    VersionMismatch { actual: i64 },

    #[error("Consumer group '{group}' does not exist on '{key}'")]
    NoGroup { key: String, group: String },

    #[error("Invalid entry id: {0}")]
    InvalidEntryId(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Backend '{0}' is not enabled in this build")]
    Unsupported(&'static str),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Identifier of an entry within one log, ordered by append time.
///
/// Rendered as `<ms>-<seq>`, the Redis stream id format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BackendError::InvalidEntryId(s.to_string());
        let (ms, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// An entry as stored in a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub id: EntryId,
    pub raw: RawEntry,
    /// Times the entry has been delivered within the reading group,
    /// counting this delivery. Zero for plain range reads.
    pub deliveries: u32,
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStart {
    /// Only entries appended after the group was created.
    #[default]
    Latest,
    /// Every entry already in the log.
    Beginning,
}

/// Delivered-but-unacknowledged entries of a consumer group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub count: u64,
    pub lowest: Option<EntryId>,
    pub highest: Option<EntryId>,
    /// Pending count per consumer name.
    pub consumers: BTreeMap<String, u64>,
}

/// Interface for a keyed append-only log store with consumer groups.
///
/// Implementations:
/// - `MemoryBackend`: in-process, for tests and local development
/// - `RedisBackend`: Redis Streams
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Append entries to an aggregate log and the global log.
    ///
    /// Succeeds only if the aggregate log currently holds exactly
    /// `expected_version + 1` entries. The check and both writes happen as
    /// one atomic operation; on mismatch nothing is written and
    /// `VersionMismatch` carries the actual version. Returns the version of
    /// the last appended entry.
    async fn append(
        &self,
        stream_key: &str,
        global_key: &str,
        expected_version: i64,
        entries: Vec<RawEntry>,
    ) -> Result<i64>;

    /// Number of entries in a log. Missing logs have length 0.
    async fn stream_len(&self, key: &str) -> Result<u64>;

    /// Entries by index, `start..=end` (to the tail when `end` is `None`).
    ///
    /// Indexes are positions in the log, not entry ids. Backends without
    /// indexed access may scan from the head of the log.
    async fn range(&self, key: &str, start: u64, end: Option<u64>) -> Result<Vec<StoredEntry>>;

    /// Create a consumer group, creating the log if needed.
    ///
    /// Returns `false` if the group already existed.
    async fn create_group(&self, key: &str, group: &str, start: GroupStart) -> Result<bool>;

    /// Deliver up to `count` never-delivered entries to `consumer`.
    ///
    /// Delivered entries become pending for that consumer. Waits up to
    /// `block` for new entries when none are available; a zero `block`
    /// returns immediately.
    async fn read_new(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StoredEntry>>;

    /// Transfer up to `count` pending entries idle for at least `min_idle`
    /// to `consumer`, resetting their idle time.
    ///
    /// Claimed entries carry their delivery count, this claim included.
    async fn claim_idle(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StoredEntry>>;

    /// Acknowledge entries, removing them from the pending set.
    ///
    /// Returns how many were actually pending.
    async fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<u64>;

    /// Summary of a group's pending entries.
    async fn pending(&self, key: &str, group: &str) -> Result<PendingSummary>;
}

/// Initialize the backing store based on configuration.
pub async fn init_backend(config: &EventStoreConfig) -> Result<Arc<dyn StreamBackend>> {
    info!(backend = ?config.backend.backend_type, "Initializing stream backend");

    match config.backend.backend_type {
        BackendType::Memory => Ok(Arc::new(MemoryBackend::new())),
        #[cfg(feature = "redis")]
        BackendType::Redis => Ok(Arc::new(
            RedisBackend::connect(&config.backend.redis.url).await?,
        )),
        #[cfg(not(feature = "redis"))]
        BackendType::Redis => {
            tracing::error!("Redis backend requested but 'redis' feature is not enabled");
            Err(BackendError::Unsupported("redis"))
        }
    }
}
