use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

use beacon_common::report::PositionReport;

// The cache is a best-effort side channel for dashboards; give up quickly
// rather than stall the caller.
const CACHE_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache command failed: {0}")]
    CommandError(#[from] redis::RedisError),
    #[error("cache command timed out")]
    TimeoutError,
    #[error("cached payload is not a valid report: {0}")]
    PayloadError(#[from] serde_json::Error),
}

/// Latest-known-position cache, one entry per courier.
///
/// Writes are last-write-wins per courier key and refresh the TTL; an
/// entry that outlives its TTL is gone, whether or not anything deleted
/// it. Consumed by dashboards only, never by the durable pipeline.
#[async_trait]
pub trait LiveCache {
    /// Overwrite the courier's entry with this report and a fresh TTL.
    async fn set(&self, report: &PositionReport, ttl: Duration) -> Result<(), CacheError>;

    /// The courier's latest report, or None once expired or never written.
    async fn get(&self, courier_id: i64) -> Result<Option<PositionReport>, CacheError>;
}

pub struct RedisLiveCache {
    client: redis::Client,
    key_prefix: String,
}

impl RedisLiveCache {
    pub fn new(url: &str, key_prefix: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;

        Ok(Self {
            client,
            key_prefix: key_prefix.to_owned(),
        })
    }

    fn key(&self, courier_id: i64) -> String {
        format!("{}:{}", self.key_prefix, courier_id)
    }
}

#[async_trait]
impl LiveCache for RedisLiveCache {
    async fn set(&self, report: &PositionReport, ttl: Duration) -> Result<(), CacheError> {
        let payload = serde_json::to_string(report)?;
        let mut conn = self.client.get_async_connection().await?;

        let set = conn.set_ex::<_, _, ()>(self.key(report.courier_id), payload, ttl.as_secs() as usize);
        timeout(CACHE_TIMEOUT, set)
            .await
            .map_err(|_| CacheError::TimeoutError)??;

        Ok(())
    }

    async fn get(&self, courier_id: i64) -> Result<Option<PositionReport>, CacheError> {
        let mut conn = self.client.get_async_connection().await?;

        let get = conn.get::<_, Option<String>>(self.key(courier_id));
        let payload = timeout(CACHE_TIMEOUT, get)
            .await
            .map_err(|_| CacheError::TimeoutError)??;

        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}

/// In-memory cache with real TTL expiry, for tests.
#[derive(Default)]
pub struct MemoryLiveCache {
    entries: Mutex<HashMap<i64, (PositionReport, Instant)>>,
}

impl MemoryLiveCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LiveCache for MemoryLiveCache {
    async fn set(&self, report: &PositionReport, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().expect("poisoned cache lock");
        entries.insert(report.courier_id, (report.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, courier_id: i64) -> Result<Option<PositionReport>, CacheError> {
        let entries = self.entries.lock().expect("poisoned cache lock");
        Ok(entries
            .get(&courier_id)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(report, _)| report.clone()))
    }
}
