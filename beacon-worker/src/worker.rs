use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use beacon_common::metrics::report_dropped_reports;
use beacon_common::report::PositionReport;
use beacon_common::retry::RetryPolicy;
use beacon_common::stream::{EntryId, StreamEntry, StreamLog};

use crate::error::WorkerError;
use crate::store::{HistoryStore, LoadError};

/// Tunables for one worker instance. Passed in explicitly so that several
/// differently-configured workers can coexist in a single process.
#[derive(Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    /// Upper bound on the blocking wait for new entries.
    pub read_block: Duration,
    /// How long an entry must sit pending on a consumer before it counts
    /// as abandoned. Must be comfortably larger than a slow batch load,
    /// or live workers will steal each other's in-flight work.
    pub claim_min_idle: Duration,
    /// Delivery attempts before a record that keeps failing its isolated
    /// insert is dropped as a poison pill.
    pub max_deliveries: u64,
    /// Batch-level attempts against transiently failing storage before
    /// degrading to the per-record path.
    pub max_batch_attempts: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 2000,
            read_block: Duration::from_secs(2),
            claim_min_idle: Duration::from_secs(30),
            max_deliveries: 5,
            max_batch_attempts: 3,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// What one pass of the loop did, for structured logging and tests.
#[derive(Debug, Default, PartialEq)]
pub struct CycleSummary {
    /// Entries rescued from dead or stalled consumers.
    pub reclaimed: usize,
    /// Entries freshly delivered to this worker.
    pub read: usize,
    /// Reports now durably in the history table.
    pub committed: usize,
    pub dropped_malformed: usize,
    pub dropped_poison: usize,
    /// Entries left unacknowledged for a later claim cycle.
    pub deferred: usize,
}

impl CycleSummary {
    pub fn did_work(&self) -> bool {
        self.reclaimed + self.read > 0
    }
}

struct ParsedEntry {
    id: EntryId,
    deliveries: u64,
    report: PositionReport,
}

/// A consumer-group member pulling position reports off the stream log
/// and bulk-loading them into the history table.
///
/// Each cycle walks Claiming-Abandoned → Reading-New → Loading → Acking,
/// with a degraded per-record sub-state entered when the batch load
/// fails. Workers coordinate only through the log's pending bookkeeping;
/// there is no shared state between them, so scaling out is just starting
/// more instances in the same group.
pub struct IngestWorker {
    /// Consumer name within the group. Used by the log to track which
    /// entries this worker owns.
    name: String,
    log: Arc<dyn StreamLog + Send + Sync>,
    store: Arc<dyn HistoryStore + Send + Sync>,
    settings: WorkerSettings,
    /// The liveness check handle, reported on every cycle.
    liveness: HealthHandle,
}

impl IngestWorker {
    pub fn new(
        name: &str,
        log: Arc<dyn StreamLog + Send + Sync>,
        store: Arc<dyn HistoryStore + Send + Sync>,
        settings: WorkerSettings,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            log,
            store,
            settings,
            liveness,
        }
    }

    /// Run cycles until `shutdown` flips to true, treating every stream
    /// or storage hiccup as transient: log, back off, try again. Never
    /// returns early on errors.
    ///
    /// Shutdown only interrupts the collect phase; a batch that reached
    /// Loading is always driven through Acking before the worker exits,
    /// so restarts do not redeliver more than the log's at-least-once
    /// floor already allows.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, error_backoff: Duration) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.liveness.report_healthy().await;

            let entries = tokio::select! {
                biased;
                changed = shutdown.changed() => match changed {
                    // Re-check the flag at the top of the loop.
                    Ok(()) => continue,
                    // Sender gone, nobody is left to signal us.
                    Err(_) => break,
                },
                collected = self.collect() => match collected {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(worker = %self.name, "stream log unavailable, backing off: {}", err);
                        tokio::time::sleep(error_backoff).await;
                        continue;
                    }
                },
            };

            match self.settle(entries).await {
                Ok(summary) if summary.did_work() => {
                    info!(
                        worker = %self.name,
                        committed = summary.committed,
                        reclaimed = summary.reclaimed,
                        dropped_malformed = summary.dropped_malformed,
                        dropped_poison = summary.dropped_poison,
                        deferred = summary.deferred,
                        "completed ingest cycle"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(worker = %self.name, "ingest cycle failed, backing off: {}", err);
                    tokio::time::sleep(error_backoff).await;
                }
            }
        }

        info!(worker = %self.name, "worker shut down");
    }

    /// One full pass of the state machine. Public so tests and tooling
    /// can step a worker deterministically.
    #[instrument(skip(self), fields(worker = %self.name))]
    pub async fn process_next_batch(&self) -> Result<CycleSummary, WorkerError> {
        let entries = self.collect().await?;
        self.settle(entries).await
    }

    /// Claiming-Abandoned then Reading-New: start from entries abandoned
    /// by dead consumers, then top the batch up with fresh ones.
    async fn collect(&self) -> Result<Vec<StreamEntry>, WorkerError> {
        let mut entries = self
            .log
            .claim_idle(
                &self.name,
                self.settings.claim_min_idle,
                self.settings.batch_size,
            )
            .await?;

        if !entries.is_empty() {
            counter!("beacon_entries_reclaimed_total").increment(entries.len() as u64);
            info!(worker = %self.name, count = entries.len(), "reclaimed abandoned entries");
        }

        if entries.len() < self.settings.batch_size {
            // Only block on a quiet stream when there is nothing to do;
            // reclaimed work should be settled promptly.
            let block = if entries.is_empty() {
                self.settings.read_block
            } else {
                Duration::ZERO
            };
            let top_up = self.settings.batch_size - entries.len();
            entries.extend(self.log.read_new(&self.name, top_up, block).await?);
        }

        Ok(entries)
    }

    /// Loading and Acking: parse, bulk-load (degrading to per-record on
    /// failure), then acknowledge everything committed or dropped.
    async fn settle(&self, entries: Vec<StreamEntry>) -> Result<CycleSummary, WorkerError> {
        let mut summary = CycleSummary {
            reclaimed: entries.iter().filter(|e| e.deliveries > 1).count(),
            read: entries.iter().filter(|e| e.deliveries == 1).count(),
            ..Default::default()
        };
        if entries.is_empty() {
            return Ok(summary);
        }

        let mut to_ack: Vec<EntryId> = Vec::new();
        let mut batch: Vec<ParsedEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            match PositionReport::from_fields(entry.field_pairs()) {
                Ok(report) => batch.push(ParsedEntry {
                    id: entry.id,
                    deliveries: entry.deliveries,
                    report,
                }),
                // Malformed entries are permanently unprocessable: ack
                // now so they are never delivered again.
                Err(err) => {
                    report_dropped_reports("malformed", 1);
                    warn!(worker = %self.name, entry_id = %entry.id, "dropping malformed entry: {}", err);
                    to_ack.push(entry.id);
                    summary.dropped_malformed += 1;
                }
            }
        }

        if !batch.is_empty() {
            let reports: Vec<PositionReport> = batch.iter().map(|p| p.report.clone()).collect();
            match self.load_batch(&reports).await {
                Ok(_) => {
                    summary.committed = batch.len();
                    to_ack.extend(batch.iter().map(|parsed| parsed.id));
                }
                Err(err) => {
                    warn!(worker = %self.name, batch_size = batch.len(), "bulk load failed, degrading to per-record loads: {}", err);
                    self.load_degraded(&batch, &mut summary, &mut to_ack).await;
                }
            }
        }

        let acked = self.log.ack(&to_ack).await?;

        if summary.committed > 0 {
            counter!("beacon_reports_ingested_total").increment(summary.committed as u64);
            histogram!("beacon_batch_commit_size").record(summary.committed as f64);
            info!(worker = %self.name, committed = summary.committed, acked, "committed batch");
        }

        Ok(summary)
    }

    /// The whole batch as one set-oriented insert, retrying transient
    /// storage failures with backoff. An error here means the caller must
    /// fall back to the per-record path.
    async fn load_batch(&self, reports: &[PositionReport]) -> Result<u64, LoadError> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.insert_batch(reports).await {
                Ok(rows) => return Ok(rows),
                Err(LoadError::Transient { error })
                    if attempt + 1 < self.settings.max_batch_attempts =>
                {
                    let backoff = self.settings.retry_policy.time_until_next_retry(attempt);
                    warn!(
                        worker = %self.name,
                        attempt,
                        "transient bulk load failure, retrying in {:?}: {}", backoff, error
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Degraded-Load: every record gets its own isolated insert, so one
    /// bad row cannot hold the rest of the partition hostage. Records
    /// that keep failing past the delivery ceiling are dropped as poison
    /// pills; anything else that fails stays pending for a later cycle.
    async fn load_degraded(
        &self,
        batch: &[ParsedEntry],
        summary: &mut CycleSummary,
        to_ack: &mut Vec<EntryId>,
    ) {
        counter!("beacon_degraded_loads_total").increment(1);

        for parsed in batch {
            match self.store.insert_one(&parsed.report).await {
                Ok(()) => {
                    summary.committed += 1;
                    to_ack.push(parsed.id);
                }
                Err(LoadError::Failed { error })
                    if parsed.deliveries >= self.settings.max_deliveries =>
                {
                    report_dropped_reports("poison", 1);
                    error!(
                        worker = %self.name,
                        entry_id = %parsed.id,
                        deliveries = parsed.deliveries,
                        "dropping poison record after repeated failures: {}", error
                    );
                    to_ack.push(parsed.id);
                    summary.dropped_poison += 1;
                }
                Err(err) => {
                    warn!(
                        worker = %self.name,
                        entry_id = %parsed.id,
                        "record load failed, leaving it pending for retry: {}", err
                    );
                    summary.deferred += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use health::HealthRegistry;

    use beacon_common::stream::MemoryStreamLog;

    use crate::store::testing::MemoryHistoryStore;

    fn fast_settings(batch_size: usize) -> WorkerSettings {
        WorkerSettings {
            batch_size,
            read_block: Duration::ZERO,
            claim_min_idle: Duration::from_secs(60),
            max_deliveries: 5,
            max_batch_attempts: 3,
            retry_policy: RetryPolicy::new(0, Duration::ZERO, None),
        }
    }

    async fn worker(
        name: &str,
        log: Arc<MemoryStreamLog>,
        store: Arc<MemoryHistoryStore>,
        settings: WorkerSettings,
    ) -> IngestWorker {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry
            .register(name.to_owned(), time::Duration::seconds(30))
            .await;
        IngestWorker::new(name, log, store, settings, liveness)
    }

    async fn append_report(log: &MemoryStreamLog, courier_id: i64) {
        let report = PositionReport {
            courier_id,
            latitude: 45.0,
            longitude: 9.0,
            status: None,
            recorded_at: Utc::now(),
        };
        log.append(&report.to_fields()).await.expect("append");
    }

    #[tokio::test]
    async fn full_stream_drains_in_batch_sized_bulk_loads() {
        let log = Arc::new(MemoryStreamLog::new(10_000));
        let store = Arc::new(MemoryHistoryStore::new());

        // 2,500 reports across 50 couriers with a batch size of 2,000
        // must produce exactly two bulk loads: 2,000 then 500.
        for i in 0..2500 {
            append_report(&log, i % 50).await;
        }

        let worker = worker("worker-0", log.clone(), store.clone(), fast_settings(2000)).await;

        let first = worker.process_next_batch().await.expect("first cycle");
        assert_eq!(first.read, 2000);
        assert_eq!(first.committed, 2000);

        let second = worker.process_next_batch().await.expect("second cycle");
        assert_eq!(second.read, 500);
        assert_eq!(second.committed, 500);

        assert_eq!(store.batch_sizes(), vec![2000, 500]);
        assert_eq!(store.rows().len(), 2500);
        assert_eq!(log.acked_ids().len(), 2500);
        assert!(log.pending_ids().is_empty());

        // Nothing left to do.
        let idle = worker.process_next_batch().await.expect("idle cycle");
        assert!(!idle.did_work());
    }

    #[tokio::test]
    async fn malformed_entry_does_not_block_its_batch() {
        let log = Arc::new(MemoryStreamLog::new(1024));
        let store = Arc::new(MemoryHistoryStore::new());

        for i in 0..5 {
            append_report(&log, i).await;
        }
        log.append(&[("lat".to_owned(), "200".to_owned())])
            .await
            .expect("append malformed");
        for i in 5..10 {
            append_report(&log, i).await;
        }

        let worker = worker("worker-0", log.clone(), store.clone(), fast_settings(100)).await;
        let summary = worker.process_next_batch().await.expect("cycle");

        assert_eq!(summary.committed, 10);
        assert_eq!(summary.dropped_malformed, 1);
        assert_eq!(store.rows().len(), 10);
        // The malformed entry was acked alongside the committed ones and
        // is never delivered again.
        assert_eq!(log.acked_ids().len(), 11);
        assert!(log.pending_ids().is_empty());

        let next = worker.process_next_batch().await.expect("idle cycle");
        assert!(!next.did_work());
        assert_eq!(store.batch_sizes(), vec![10]);
    }

    #[tokio::test]
    async fn survivor_reclaims_a_dead_workers_entries() {
        let log = Arc::new(MemoryStreamLog::new(10_000));
        let store = Arc::new(MemoryHistoryStore::new());

        for i in 0..100 {
            append_report(&log, i).await;
        }

        // A consumer reads 100 entries and dies before acking any.
        let delivered = log
            .read_new("doomed-worker", 100, Duration::ZERO)
            .await
            .expect("doomed read");
        assert_eq!(delivered.len(), 100);
        assert_eq!(log.pending_ids().len(), 100);

        let survivor = worker("survivor", log.clone(), store.clone(), fast_settings(200)).await;

        // Before the idle threshold elapses the survivor must not steal.
        let early = survivor.process_next_batch().await.expect("early cycle");
        assert_eq!(early.reclaimed, 0);

        log.backdate_pending(Duration::from_secs(120));
        let summary = survivor.process_next_batch().await.expect("recovery cycle");
        assert_eq!(summary.reclaimed, 100);
        assert_eq!(summary.committed, 100);
        assert_eq!(store.rows().len(), 100);
        assert_eq!(log.acked_ids().len(), 100);
        assert!(log.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn poison_record_is_dropped_once_past_the_delivery_ceiling() {
        let log = Arc::new(MemoryStreamLog::new(1024));
        let store = Arc::new(MemoryHistoryStore::new().with_poison_courier(13));

        append_report(&log, 1).await;
        append_report(&log, 13).await;
        append_report(&log, 2).await;

        let mut settings = fast_settings(100);
        settings.max_deliveries = 2;
        settings.max_batch_attempts = 1;
        let worker = worker("worker-0", log.clone(), store.clone(), settings).await;

        // First delivery: the batch fails on the poison record, the
        // degraded pass commits the healthy ones and leaves the poison
        // record pending, still below the ceiling.
        let first = worker.process_next_batch().await.expect("first cycle");
        assert_eq!(first.committed, 2);
        assert_eq!(first.dropped_poison, 0);
        assert_eq!(first.deferred, 1);
        assert_eq!(log.pending_ids().len(), 1);

        // Second delivery via reclaim hits the ceiling and drops it.
        log.backdate_pending(Duration::from_secs(120));
        let second = worker.process_next_batch().await.expect("second cycle");
        assert_eq!(second.reclaimed, 1);
        assert_eq!(second.committed, 0);
        assert_eq!(second.dropped_poison, 1);
        assert!(log.pending_ids().is_empty());

        // The poison record never made it to storage, everything else did.
        assert_eq!(store.rows().len(), 2);
        assert_eq!(log.acked_ids().len(), 3);
    }

    #[tokio::test]
    async fn transient_storage_outage_is_retried_at_batch_level() {
        let log = Arc::new(MemoryStreamLog::new(1024));
        let store = Arc::new(MemoryHistoryStore::new());
        store.inject_transient_failures(1);

        for i in 0..3 {
            append_report(&log, i).await;
        }

        let worker = worker("worker-0", log.clone(), store.clone(), fast_settings(100)).await;
        let summary = worker.process_next_batch().await.expect("cycle");

        // The batch was attempted twice but committed exactly once.
        assert_eq!(store.batch_sizes(), vec![3, 3]);
        assert_eq!(summary.committed, 3);
        assert_eq!(store.rows().len(), 3);
    }

    #[tokio::test]
    async fn prolonged_outage_defers_records_without_acking() {
        let log = Arc::new(MemoryStreamLog::new(1024));
        let store = Arc::new(MemoryHistoryStore::new());
        // Outlast the batch attempts and the per-record fallbacks.
        store.inject_transient_failures(100);

        for i in 0..3 {
            append_report(&log, i).await;
        }

        let worker = worker("worker-0", log.clone(), store.clone(), fast_settings(100)).await;
        let summary = worker.process_next_batch().await.expect("cycle");

        assert_eq!(summary.committed, 0);
        assert_eq!(summary.dropped_poison, 0);
        assert_eq!(summary.deferred, 3);
        // Nothing was lost: all three stay pending for a later cycle.
        assert_eq!(log.pending_ids().len(), 3);
        assert!(log.acked_ids().is_empty());
    }

    #[tokio::test]
    async fn redelivery_after_a_crash_duplicates_rows_instead_of_losing_them() {
        let log = Arc::new(MemoryStreamLog::new(1024));
        let store = Arc::new(MemoryHistoryStore::new());

        for i in 0..3 {
            append_report(&log, i).await;
        }

        // A consumer commits its batch but dies before acking: replay the
        // delivered entries into the store by hand to simulate the crash
        // window between Loading and Acking.
        let delivered = log
            .read_new("doomed-worker", 10, Duration::ZERO)
            .await
            .expect("doomed read");
        for entry in &delivered {
            let report = PositionReport::from_fields(entry.field_pairs()).expect("valid entry");
            store.insert_one(&report).await.expect("first commit");
        }
        assert_eq!(store.rows().len(), 3);

        // The survivor reclaims and commits the same entries again.
        log.backdate_pending(Duration::from_secs(120));
        let survivor = worker("survivor", log.clone(), store.clone(), fast_settings(100)).await;
        let summary = survivor.process_next_batch().await.expect("recovery cycle");

        assert_eq!(summary.committed, 3);
        assert_eq!(store.rows().len(), 6);
        assert_eq!(log.acked_ids().len(), 3);
    }

    #[tokio::test]
    async fn workers_in_the_same_group_split_the_stream() {
        let log = Arc::new(MemoryStreamLog::new(1024));
        let store = Arc::new(MemoryHistoryStore::new());

        for i in 0..10 {
            append_report(&log, i).await;
        }

        let first = worker("worker-0", log.clone(), store.clone(), fast_settings(5)).await;
        let second = worker("worker-1", log.clone(), store.clone(), fast_settings(5)).await;

        let a = first.process_next_batch().await.expect("first worker");
        let b = second.process_next_batch().await.expect("second worker");

        assert_eq!(a.read, 5);
        assert_eq!(b.read, 5);
        // Each entry went to exactly one worker.
        assert_eq!(store.rows().len(), 10);
        assert_eq!(log.acked_ids().len(), 10);
    }

    #[tokio::test]
    async fn run_loop_exits_on_shutdown() {
        let log = Arc::new(MemoryStreamLog::new(1024));
        let store = Arc::new(MemoryHistoryStore::new());

        let mut settings = fast_settings(100);
        settings.read_block = Duration::from_secs(30);
        let worker = Arc::new(worker("worker-0", log, store, settings).await);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(shutdown_rx, Duration::from_millis(10)).await })
        };

        // The worker is parked in its blocking read; shutdown must still
        // get through promptly.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).expect("send shutdown");

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker exited promptly")
            .expect("worker task did not panic");
    }
}
