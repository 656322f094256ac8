// 🚦 Pipeline - Reader + writer pool around one store
//
// Flow:
//   1. Start the reader; if it validates first, wait for that pass to end
//   2. Start one writer right away
//   3. Start the rest one stagger apart, unless the reader already finished
//   4. Join everyone; a terminated store means a forced stop
//
// Threads: 1 reader + up to (worker_count - 1) writers, where
// worker_count = max(2, min(threads + 1, available parallelism)).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LoaderConfig;
use crate::error::{IngestError, Result};
use crate::gateway::PersistenceGateway;
use crate::keys::KeyRegistry;
use crate::reader::{FeedReader, FeedSource};
use crate::store::TransactionStore;
use crate::writer::{BatchWriter, WriterReport};

// ============================================================================
// RUN SUMMARY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every record reached storage and the store never terminated
    Delivered,
    /// The store terminated first; running again is safe
    ForcedStop,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Delivered => "delivered",
            RunOutcome::ForcedStop => "forced_stop",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// SHA-256 of the feed, empty when it could not be read
    pub feed_digest: String,
    pub records_read: u32,
    pub transactions_written: usize,
    pub batches_requeued: usize,
    /// Writer threads actually started, at most `worker_count - 1`
    pub writers_started: usize,
    pub errors: usize,
    pub elapsed_ms: u64,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Workers the pool is sized for, reader included
pub fn worker_count(threads: usize, available: usize) -> usize {
    threads.saturating_add(1).min(available).max(2)
}

fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

pub struct Pipeline {
    config: LoaderConfig,
    gateway: Arc<dyn PersistenceGateway>,
    keys: Arc<KeyRegistry>,
}

impl Pipeline {
    pub fn new(config: LoaderConfig, gateway: Arc<dyn PersistenceGateway>) -> Self {
        Pipeline {
            config,
            gateway,
            keys: Arc::new(KeyRegistry::new()),
        }
    }

    /// Share an id registry across runs in the same process
    pub fn with_keys(mut self, keys: Arc<KeyRegistry>) -> Self {
        self.keys = keys;
        self
    }

    pub fn keys(&self) -> &Arc<KeyRegistry> {
        &self.keys
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load the configured source file
    pub fn run_configured(&self) -> Result<RunSummary> {
        self.run(FeedSource::File(self.config.source_path.clone()))
    }

    pub fn run(&self, source: FeedSource) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(%run_id, source = %source, "run started");

        let feed_digest = source.fingerprint().unwrap_or_else(|e| {
            warn!(source = %source, error = %e, "cannot fingerprint feed");
            String::new()
        });

        let store = Arc::new(TransactionStore::new(self.config.store_limits()));
        let reader = Arc::new(FeedReader::new(
            source,
            Arc::clone(&store),
            Arc::clone(&self.keys),
            self.config.validate_first,
        ));

        let reader_handle = {
            let reader = Arc::clone(&reader);
            spawn("feed-reader", &store, move || reader.run())?
        };

        while reader.is_validating() && !store.is_terminated() {
            thread::sleep(self.config.poll_interval());
        }

        let writers = worker_count(self.config.threads, available_parallelism()) - 1;
        info!(writers, "starting writer pool");

        let mut writer_handles = Vec::with_capacity(writers);
        writer_handles.push(self.spawn_writer(1, &store)?);
        for index in 2..=writers {
            self.wait_unless(self.config.writer_stagger(), || store.is_producer_finished());
            if store.is_producer_finished() {
                debug!(started = writer_handles.len(), "reader done, pool stays small");
                break;
            }
            writer_handles.push(self.spawn_writer(index, &store)?);
        }

        let writers_started = writer_handles.len();
        let reader_report = join(reader_handle, &store).unwrap_or_default();
        let mut writer_report = WriterReport::default();
        for handle in writer_handles {
            if let Some(report) = join(handle, &store) {
                writer_report.merge(&report);
            }
        }

        let outcome = if store.is_terminated() {
            RunOutcome::ForcedStop
        } else {
            RunOutcome::Delivered
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
            feed_digest,
            records_read: reader_report.records_read,
            transactions_written: writer_report.transactions_written,
            batches_requeued: writer_report.batches_requeued,
            writers_started,
            errors: store.error_count(),
            elapsed_ms: clock.elapsed().as_millis() as u64,
        };

        match outcome {
            RunOutcome::Delivered => info!(
                %run_id,
                records = summary.records_read,
                written = summary.transactions_written,
                writers = summary.writers_started,
                elapsed_ms = summary.elapsed_ms,
                "all transactions delivered"
            ),
            RunOutcome::ForcedStop => warn!(
                %run_id,
                records = summary.records_read,
                written = summary.transactions_written,
                errors = summary.errors,
                "run force-stopped, not every transaction was stored; running again is safe"
            ),
        }

        Ok(summary)
    }

    fn spawn_writer(
        &self,
        index: usize,
        store: &Arc<TransactionStore>,
    ) -> Result<JoinHandle<Option<WriterReport>>> {
        let name = format!("batch-writer-{}", index);
        let writer = BatchWriter::new(
            name.clone(),
            Arc::clone(store),
            Arc::clone(&self.gateway),
            self.config.attempts,
        );
        spawn(&name, store, move || writer.run())
    }

    /// Sleep up to `total` in poll-sized steps, returning early once `done`
    fn wait_unless(&self, total: Duration, done: impl Fn() -> bool) {
        let deadline = Instant::now() + total;
        let step = self.config.poll_interval();
        while !done() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(step.min(deadline - now));
        }
    }
}

/// Run `work` on a named thread. A panic terminates the store on the spot,
/// so threads blocked on it wake up and the run ends as a forced stop.
fn spawn<T, F>(name: &str, store: &Arc<TransactionStore>, work: F) -> Result<JoinHandle<Option<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let thread_name = name.to_string();
    let store = Arc::clone(store);

    let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(report) => Some(report),
            Err(_) => {
                let err = IngestError::WorkerPanicked(thread_name);
                error!(error = %err, "stopping run");
                store.terminate();
                None
            }
        }
    })?;
    Ok(handle)
}

fn join<T>(handle: JoinHandle<Option<T>>, store: &TransactionStore) -> Option<T> {
    handle.join().unwrap_or_else(|_| {
        store.terminate();
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SqliteGateway, StoredCounts};

    fn test_config() -> LoaderConfig {
        LoaderConfig {
            batch_size: 2,
            batch_capacity: 2,
            attempts: 2,
            error_threshold: 3,
            threads: 3,
            poll_interval_ms: 5,
            writer_stagger_ms: 10,
            gateway_timeout_ms: 5_000,
            ..LoaderConfig::default()
        }
    }

    fn feed(records: &[(&str, &str, &str)]) -> FeedSource {
        let body: String = records
            .iter()
            .map(|(amount, inn, place)| {
                format!(
                    "<transaction><place>{place}</place><amount>{amount}</amount>\
                     <currency>UAH</currency><card>123456****1234</card>\
                     <client><firstName>Ivan</firstName><lastName>Ivanoff</lastName>\
                     <middleName>Ivanoff</middleName><inn>{inn}</inn></client></transaction>"
                )
            })
            .collect();
        FeedSource::from_bytes(format!("<transactions>{}</transactions>", body))
    }

    fn gateway() -> Arc<SqliteGateway> {
        Arc::new(SqliteGateway::open_in_memory(Duration::from_secs(5)).unwrap())
    }

    struct RejectAll;

    impl PersistenceGateway for RejectAll {
        fn submit_batch(&self, _batch: &[crate::entities::Transaction]) -> usize {
            0
        }
    }

    struct PanicOnSubmit;

    impl PersistenceGateway for PanicOnSubmit {
        fn submit_batch(&self, _batch: &[crate::entities::Transaction]) -> usize {
            panic!("storage exploded");
        }
    }

    /// Holds every batch for a while before storing it
    struct SlowGateway {
        inner: Arc<SqliteGateway>,
        delay: Duration,
    }

    impl PersistenceGateway for SlowGateway {
        fn submit_batch(&self, batch: &[crate::entities::Transaction]) -> usize {
            thread::sleep(self.delay);
            self.inner.submit_batch(batch)
        }
    }

    fn same_records(count: usize) -> Vec<(&'static str, &'static str, &'static str)> {
        (0..count).map(|_| ("1", "1234567890", "A PLACE 1")).collect()
    }

    #[test]
    fn test_worker_count_bounds() {
        assert_eq!(worker_count(4, 8), 5);
        assert_eq!(worker_count(4, 2), 2);
        assert_eq!(worker_count(0, 1), 2);
        assert_eq!(worker_count(16, 4), 4);
        assert_eq!(worker_count(usize::MAX, 6), 6);
    }

    #[test]
    fn test_four_records_one_client_one_place() {
        let gateway = gateway();
        let pipeline = Pipeline::new(test_config(), gateway.clone());

        let summary = pipeline
            .run(feed(&[
                ("10.01", "1234567890", "A PLACE 1"),
                ("9876.01", "1234567890", "A PLACE 1"),
                ("12.01", "1234567890", "A PLACE 1"),
                ("12.01", "1234567890", "A PLACE 1"),
            ]))
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Delivered);
        assert_eq!(summary.records_read, 4);
        assert_eq!(summary.transactions_written, 4);
        assert_eq!(
            gateway.counts().unwrap(),
            StoredCounts {
                clients: 1,
                places: 1,
                transactions: 4
            }
        );
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let gateway = gateway();
        let records = [
            ("10.01", "1234567890", "A PLACE 1"),
            ("9876.01", "1234567891", "A PLACE 2"),
            ("12.01", "1234567892", "A PLACE 3"),
        ];

        let first = Pipeline::new(test_config(), gateway.clone());
        first.run(feed(&records)).unwrap();
        let after_first = gateway.counts().unwrap();

        let second = Pipeline::new(test_config(), gateway.clone()).with_keys(first.keys().clone());
        let summary = second.run(feed(&records)).unwrap();

        assert_eq!(summary.outcome, RunOutcome::Delivered);
        assert_eq!(gateway.counts().unwrap(), after_first);
    }

    #[test]
    fn test_bad_record_stops_before_any_write() {
        let gateway = gateway();
        let pipeline = Pipeline::new(test_config(), gateway.clone());

        let summary = pipeline
            .run(feed(&[
                ("10.01", "1234567890", "A PLACE 1"),
                ("10.01", "12345", "A PLACE 1"),
            ]))
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::ForcedStop);
        assert_eq!(summary.records_read, 2);
        assert_eq!(gateway.counts().unwrap().transactions, 0);
    }

    #[test]
    fn test_failing_storage_forces_stop() {
        let config = LoaderConfig {
            validate_first: false,
            ..test_config()
        };
        let pipeline = Pipeline::new(config, Arc::new(RejectAll));

        let summary = pipeline.run(feed(&same_records(6))).unwrap();

        assert_eq!(summary.outcome, RunOutcome::ForcedStop);
        assert_eq!(summary.transactions_written, 0);
        assert!(summary.errors > 3);
    }

    #[test]
    fn test_writer_panic_with_full_store_ends_run() {
        let config = LoaderConfig {
            validate_first: false,
            ..test_config()
        };
        let pipeline = Pipeline::new(config, Arc::new(PanicOnSubmit));

        // Far more records than the store holds, so the reader blocks on a full store
        let (done, outcome) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let summary = pipeline.run(feed(&same_records(200))).unwrap();
            let _ = done.send(summary);
        });

        let summary = outcome
            .recv_timeout(Duration::from_secs(30))
            .expect("run hung after a writer panicked");
        assert_eq!(summary.outcome, RunOutcome::ForcedStop);
        assert_eq!(summary.transactions_written, 0);
    }

    #[test]
    fn test_short_feed_starts_one_writer() {
        let gateway = gateway();
        let config = LoaderConfig {
            writer_stagger_ms: 5_000,
            ..test_config()
        };
        let pipeline = Pipeline::new(config, gateway.clone());

        let started = Instant::now();
        let summary = pipeline
            .run(feed(&[
                ("10.01", "1234567890", "A PLACE 1"),
                ("12.01", "1234567890", "A PLACE 1"),
            ]))
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Delivered);
        assert_eq!(summary.writers_started, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(gateway.counts().unwrap().transactions, 2);
    }

    #[test]
    fn test_long_feed_starts_full_writer_pool() {
        let inner = gateway();
        let config = LoaderConfig {
            validate_first: false,
            ..test_config()
        };
        let slow = Arc::new(SlowGateway {
            inner: inner.clone(),
            delay: Duration::from_millis(20),
        });
        let expected = worker_count(config.threads, available_parallelism()) - 1;
        let pipeline = Pipeline::new(config, slow);

        let summary = pipeline.run(feed(&same_records(40))).unwrap();

        assert_eq!(summary.outcome, RunOutcome::Delivered);
        assert_eq!(summary.writers_started, expected);
        assert_eq!(summary.transactions_written, 40);
        assert_eq!(inner.counts().unwrap().transactions, 40);
    }

    #[test]
    fn test_summary_serializes_outcome_in_snake_case() {
        let summary = RunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome: RunOutcome::Delivered,
            feed_digest: String::new(),
            records_read: 0,
            transactions_written: 0,
            batches_requeued: 0,
            writers_started: 0,
            errors: 0,
            elapsed_ms: 0,
        };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["outcome"], "delivered");
    }
}
