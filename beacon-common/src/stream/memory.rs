use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{EntryId, StreamEntry, StreamError, StreamLog};

/// How often a blocking read re-checks the stream for new entries.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(2);

struct Pending {
    consumer: String,
    delivered_at: Instant,
    /// Extra idle time granted by tests, so reclaim scenarios do not have
    /// to sleep through a real idle threshold.
    extra_idle: Duration,
    deliveries: u64,
}

impl Pending {
    fn idle(&self) -> Duration {
        self.delivered_at.elapsed() + self.extra_idle
    }
}

#[derive(Default)]
struct Inner {
    entries: Vec<(EntryId, Vec<(String, String)>)>,
    next_millis: u64,
    cursor: Option<EntryId>,
    pending: HashMap<EntryId, Pending>,
    acked: Vec<EntryId>,
}

/// An in-memory stream log with the same observable semantics as the
/// redis-backed one: append order, approximate bounded retention,
/// per-group pending bookkeeping with idle clocks and delivery counts,
/// and idempotent acknowledgment.
///
/// Only exists so that the full worker state machine is testable without
/// infrastructure; never used in a deployed process.
pub struct MemoryStreamLog {
    retention: usize,
    inner: Mutex<Inner>,
}

impl MemoryStreamLog {
    pub fn new(retention: usize) -> Self {
        Self {
            retention,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Entries currently retained, delivered or not.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("poisoned stream lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids delivered to some consumer and not yet acknowledged.
    pub fn pending_ids(&self) -> Vec<EntryId> {
        let inner = self.inner.lock().expect("poisoned stream lock");
        let mut ids: Vec<EntryId> = inner.pending.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Ids acknowledged so far, in acknowledgment order.
    pub fn acked_ids(&self) -> Vec<EntryId> {
        self.inner.lock().expect("poisoned stream lock").acked.clone()
    }

    /// Make every pending entry look `age` older than it is, so a claim
    /// cycle sees it as abandoned without the test having to wait.
    pub fn backdate_pending(&self, age: Duration) {
        let mut inner = self.inner.lock().expect("poisoned stream lock");
        for pending in inner.pending.values_mut() {
            pending.extra_idle += age;
        }
    }
}

#[async_trait]
impl StreamLog for MemoryStreamLog {
    async fn append(&self, fields: &[(String, String)]) -> Result<EntryId, StreamError> {
        let mut inner = self.inner.lock().expect("poisoned stream lock");

        inner.next_millis += 1;
        let id = EntryId::new(inner.next_millis, 0);
        inner.entries.push((id, fields.to_vec()));

        // Approximate retention: drop the oldest entries past the window.
        // Pending bookkeeping is left in place, matching the broker.
        while inner.entries.len() > self.retention {
            inner.entries.remove(0);
        }

        Ok(id)
    }

    async fn read_new(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = Instant::now() + block;

        loop {
            let delivered = {
                let mut inner = self.inner.lock().expect("poisoned stream lock");

                let cursor = inner.cursor;
                let fresh: Vec<(EntryId, Vec<(String, String)>)> = inner
                    .entries
                    .iter()
                    .filter(|(id, _)| cursor.map_or(true, |cursor| *id > cursor))
                    .take(count)
                    .cloned()
                    .collect();

                let now = Instant::now();
                let mut delivered = Vec::with_capacity(fresh.len());
                for (id, fields) in fresh {
                    inner.cursor = Some(id);
                    inner.pending.insert(
                        id,
                        Pending {
                            consumer: consumer.to_owned(),
                            delivered_at: now,
                            extra_idle: Duration::ZERO,
                            deliveries: 1,
                        },
                    );
                    delivered.push(StreamEntry {
                        id,
                        fields,
                        deliveries: 1,
                    });
                }
                delivered
            };

            if !delivered.is_empty() || Instant::now() >= deadline {
                return Ok(delivered);
            }
            tokio::time::sleep(READ_POLL_INTERVAL).await;
        }
    }

    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut inner = self.inner.lock().expect("poisoned stream lock");

        let mut stale: Vec<EntryId> = inner
            .pending
            .iter()
            .filter(|(_, pending)| pending.idle() >= min_idle)
            .map(|(id, _)| *id)
            .collect();
        stale.sort();
        stale.truncate(count);

        let now = Instant::now();
        let mut claimed = Vec::with_capacity(stale.len());
        for id in stale {
            // Entries evicted from the retention window after delivery are
            // claimed with no fields, like the broker reports them.
            let fields = inner
                .entries
                .iter()
                .find(|(entry_id, _)| *entry_id == id)
                .map(|(_, fields)| fields.clone())
                .unwrap_or_default();

            let pending = inner
                .pending
                .get_mut(&id)
                .expect("stale id taken from pending map");
            pending.consumer = consumer.to_owned();
            pending.delivered_at = now;
            pending.extra_idle = Duration::ZERO;
            pending.deliveries += 1;

            claimed.push(StreamEntry {
                id,
                fields,
                deliveries: pending.deliveries,
            });
        }

        Ok(claimed)
    }

    async fn ack(&self, ids: &[EntryId]) -> Result<u64, StreamError> {
        let mut inner = self.inner.lock().expect("poisoned stream lock");

        let mut settled = 0;
        for id in ids {
            if inner.pending.remove(id).is_some() {
                inner.acked.push(*id);
                settled += 1;
            }
        }
        Ok(settled)
    }
}
