//! # Stream log
//!
//! The durable append log the pipeline rides on: producers append position
//! reports with bounded retention, a consumer group of workers reads new
//! entries, reclaims entries abandoned by dead consumers, and acknowledges
//! entries once their data is committed downstream. These four operations
//! are the entire broker surface the pipeline depends on.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStreamLog;
pub use self::redis::RedisStreamLog;

/// Enumeration of errors for operations on a stream log.
/// Errors can originate from the redis client and are wrapped to provide
/// the failing command as context.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("{command} command failed with: {error}")]
    CommandError {
        command: &'static str,
        error: ::redis::RedisError,
    },
    #[error("timed out waiting for {0}")]
    TimeoutError(&'static str),
    #[error("{0} is not a valid stream entry id")]
    InvalidEntryId(String),
}

/// A log-assigned entry identifier, unique and monotonically increasing
/// within the stream. Follows the `millis-seq` shape of redis stream ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StreamError::InvalidEntryId(s.to_owned());
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;

        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// One entry delivered from the log to a consumer.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: EntryId,
    /// Flat field pairs as appended by the producer. Empty when the entry
    /// was evicted from the retention window after being delivered; the
    /// consumer treats such entries as malformed and acknowledges them.
    pub fields: Vec<(String, String)>,
    /// Delivery attempts observed by the consumer group for this entry,
    /// including the one that produced this value: 1 on a fresh read,
    /// higher after reclaims. Drives the poison-pill ceiling.
    pub deliveries: u64,
}

impl StreamEntry {
    pub fn field_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The append/read/claim/ack contract of the durable log.
///
/// Delivery bookkeeping lives in the log, per consumer group: an entry is
/// undelivered, then pending on a named consumer, then acknowledged. The
/// log is the sole source of mutual exclusion between workers; the
/// pipeline itself takes no locks.
#[async_trait]
pub trait StreamLog {
    /// Append field pairs as a new entry, returning its assigned id.
    /// Retention is bounded: once the stream exceeds its configured
    /// length the oldest entries are dropped, acknowledged or not.
    async fn append(&self, fields: &[(String, String)]) -> Result<EntryId, StreamError>;

    /// Read up to `count` never-yet-delivered entries for this group,
    /// assigning them to `consumer`. Blocks up to `block` when the stream
    /// has no new entries; returns an empty vec on timeout. This is the
    /// pipeline's only blocking point and must stay cancellation-safe.
    async fn read_new(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Reassign up to `count` entries that have been pending on some
    /// consumer for at least `min_idle` over to `consumer`. Used by the
    /// recovery sweep to rescue work from crashed or stalled workers.
    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Acknowledge entries, removing them from pending bookkeeping.
    /// Idempotent: ids already acknowledged (or never delivered) are
    /// ignored. Returns how many entries this call actually settled.
    async fn ack(&self, ids: &[EntryId]) -> Result<u64, StreamError>;
}
