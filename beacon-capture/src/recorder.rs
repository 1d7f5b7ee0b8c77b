use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use thiserror::Error;
use tracing::{instrument, warn};

use beacon_common::report::{ParseError, PositionReport, PositionUpdate};
use beacon_common::stream::{EntryId, RedisStreamLog, StreamError, StreamLog};

use crate::cache::{LiveCache, RedisLiveCache};
use crate::config::Config;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error(transparent)]
    InvalidReport(#[from] ParseError),
    #[error("failed to append report to the stream log: {0}")]
    AppendError(#[from] StreamError),
}

/// The write side of the pipeline: takes a raw position submission,
/// refreshes the courier's live-cache entry and appends the report to the
/// durable log.
///
/// The append is authoritative: the call succeeds once the log has the
/// entry, without waiting for downstream ingestion. The cache write is a
/// best-effort side channel and neither blocks nor is blocked by the
/// append.
pub struct PositionRecorder {
    cache: Arc<dyn LiveCache + Send + Sync>,
    log: Arc<dyn StreamLog + Send + Sync>,
    cache_ttl: Duration,
}

impl PositionRecorder {
    pub fn new(
        cache: Arc<dyn LiveCache + Send + Sync>,
        log: Arc<dyn StreamLog + Send + Sync>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            log,
            cache_ttl,
        }
    }

    /// Wire a recorder against redis from environment configuration.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let cache = RedisLiveCache::new(&config.redis_url, &config.cache_key_prefix)?;
        let log = RedisStreamLog::new(
            &config.redis_url,
            &config.stream_key,
            &config.consumer_group,
            config.stream_retention,
        )
        .await?;

        Ok(Self::new(
            Arc::new(cache),
            Arc::new(log),
            Duration::from_secs(config.cache_ttl_secs),
        ))
    }

    #[instrument(skip_all, fields(courier_id = update.courier_id))]
    pub async fn record(&self, update: PositionUpdate) -> Result<EntryId, RecordError> {
        counter!("beacon_reports_received_total").increment(1);

        // Rejected submissions never reach the cache or the log.
        let report = PositionReport::from_update(update, Utc::now())?;

        if let Err(err) = self.cache.set(&report, self.cache_ttl).await {
            counter!("beacon_cache_write_failures_total").increment(1);
            warn!(
                courier_id = report.courier_id,
                "failed to update live position cache: {}", err
            );
        }

        let entry_id = self.log.append(&report.to_fields()).await?;
        counter!("beacon_reports_appended_total").increment(1);

        Ok(entry_id)
    }
}
