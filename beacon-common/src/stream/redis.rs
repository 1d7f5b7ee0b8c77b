use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{
    StreamClaimReply, StreamMaxlen, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tokio::time::timeout;
use tracing::debug;

use super::{EntryId, StreamEntry, StreamError, StreamLog};

/// Ceiling for commands that are expected to answer promptly. Blocking
/// reads get this much on top of the requested block time.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// A stream log backed by a redis stream and one consumer group.
///
/// Entries are appended with `XADD MAXLEN ~`, so retention is approximate
/// and enforced by redis itself. Reclaiming goes through `XPENDING` to
/// learn idle times and delivery counts, then `XCLAIM` with the same
/// min-idle so a consumer that touched its entries in between keeps them.
pub struct RedisStreamLog {
    client: redis::Client,
    key: String,
    group: String,
    retention: usize,
}

impl RedisStreamLog {
    /// Connect and make sure the stream and consumer group exist.
    pub async fn new(
        url: &str,
        key: &str,
        group: &str,
        retention: usize,
    ) -> Result<Self, StreamError> {
        let client = redis::Client::open(url).map_err(|error| StreamError::CommandError {
            command: "CONNECT",
            error,
        })?;

        let log = Self {
            client,
            key: key.to_owned(),
            group: group.to_owned(),
            retention,
        };
        log.create_group().await?;

        Ok(log)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StreamError> {
        let connect = self.client.get_async_connection();
        timeout(COMMAND_TIMEOUT, connect)
            .await
            .map_err(|_| StreamError::TimeoutError("CONNECT"))?
            .map_err(|error| StreamError::CommandError {
                command: "CONNECT",
                error,
            })
    }

    async fn create_group(&self) -> Result<(), StreamError> {
        let mut conn = self.connection().await?;

        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.key, &self.group, "$")
            .await;

        match created {
            Ok(()) => Ok(()),
            // The group already exists, another worker got there first.
            Err(error) if error.code() == Some("BUSYGROUP") => Ok(()),
            Err(error) => Err(StreamError::CommandError {
                command: "XGROUP CREATE",
                error,
            }),
        }
    }

    fn entry_from_stream_id(
        raw: redis::streams::StreamId,
        deliveries: u64,
    ) -> Result<StreamEntry, StreamError> {
        let id: EntryId = raw.id.parse()?;

        let mut fields = Vec::with_capacity(raw.map.len());
        for (name, value) in raw.map {
            match redis::from_redis_value::<String>(&value) {
                Ok(value) => fields.push((name, value)),
                // A non-UTF8 value cannot come from our producer; leave the
                // field out and let the fail-closed parser reject the entry.
                Err(_) => debug!(entry_id = %id, field = %name, "skipping non-string field"),
            }
        }

        Ok(StreamEntry {
            id,
            fields,
            deliveries,
        })
    }
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    async fn append(&self, fields: &[(String, String)]) -> Result<EntryId, StreamError> {
        let mut conn = self.connection().await?;

        let add = conn.xadd_maxlen(
            &self.key,
            StreamMaxlen::Approx(self.retention),
            "*",
            fields,
        );
        let id: String = timeout(COMMAND_TIMEOUT, add)
            .await
            .map_err(|_| StreamError::TimeoutError("XADD"))?
            .map_err(|error| StreamError::CommandError {
                command: "XADD",
                error,
            })?;

        id.parse()
    }

    async fn read_new(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.connection().await?;

        let options = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let keys = [&self.key];
        let ids = [">"];
        let read = conn.xread_options(&keys, &ids, &options);
        let reply: StreamReadReply = timeout(block + COMMAND_TIMEOUT, read)
            .await
            .map_err(|_| StreamError::TimeoutError("XREADGROUP"))?
            .map_err(|error| StreamError::CommandError {
                command: "XREADGROUP",
                error,
            })?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for raw in key.ids {
                entries.push(Self::entry_from_stream_id(raw, 1)?);
            }
        }
        Ok(entries)
    }

    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.connection().await?;

        let pending = conn.xpending_count(&self.key, &self.group, "-", "+", count);
        let pending: StreamPendingCountReply = timeout(COMMAND_TIMEOUT, pending)
            .await
            .map_err(|_| StreamError::TimeoutError("XPENDING"))?
            .map_err(|error| StreamError::CommandError {
                command: "XPENDING",
                error,
            })?;

        let min_idle_ms = min_idle.as_millis() as usize;
        let mut stale_ids = Vec::new();
        let mut deliveries = std::collections::HashMap::new();
        for entry in pending.ids {
            if entry.last_delivered_ms >= min_idle_ms {
                // The claim below is one more delivery on top of the ones
                // already recorded by the group.
                deliveries.insert(entry.id.clone(), entry.times_delivered as u64 + 1);
                stale_ids.push(entry.id);
            }
        }

        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        let claim = conn.xclaim(&self.key, &self.group, consumer, min_idle_ms, &stale_ids);
        let reply: StreamClaimReply = timeout(COMMAND_TIMEOUT, claim)
            .await
            .map_err(|_| StreamError::TimeoutError("XCLAIM"))?
            .map_err(|error| StreamError::CommandError {
                command: "XCLAIM",
                error,
            })?;

        let mut entries = Vec::with_capacity(reply.ids.len());
        for raw in reply.ids {
            let delivered = deliveries.get(&raw.id).copied().unwrap_or(1);
            entries.push(Self::entry_from_stream_id(raw, delivered)?);
        }
        Ok(entries)
    }

    async fn ack(&self, ids: &[EntryId]) -> Result<u64, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection().await?;

        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let ack = conn.xack(&self.key, &self.group, &ids);
        let settled: u64 = timeout(COMMAND_TIMEOUT, ack)
            .await
            .map_err(|_| StreamError::TimeoutError("XACK"))?
            .map_err(|error| StreamError::CommandError {
                command: "XACK",
                error,
            })?;

        Ok(settled)
    }
}
