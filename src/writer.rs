// ✍️ Batch Writer - Pulls batches from the store and delivers them
//
// A delivery counts only when the gateway stored the whole batch. After
// `attempts` failed deliveries the batch goes back to the store, which counts
// an error, and any writer may pick it up again later.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::entities::Transaction;
use crate::gateway::PersistenceGateway;
use crate::store::TransactionStore;

/// What one writer did, returned when its thread ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterReport {
    pub batches_written: usize,
    pub transactions_written: usize,
    pub batches_requeued: usize,
}

impl WriterReport {
    pub fn merge(&mut self, other: &WriterReport) {
        self.batches_written += other.batches_written;
        self.transactions_written += other.transactions_written;
        self.batches_requeued += other.batches_requeued;
    }
}

pub struct BatchWriter {
    name: String,
    store: Arc<TransactionStore>,
    gateway: Arc<dyn PersistenceGateway>,
    batch_size: usize,
    attempts: usize,
}

impl BatchWriter {
    pub fn new(
        name: impl Into<String>,
        store: Arc<TransactionStore>,
        gateway: Arc<dyn PersistenceGateway>,
        attempts: usize,
    ) -> Self {
        let batch_size = store.limits().batch_size;
        BatchWriter {
            name: name.into(),
            store,
            gateway,
            batch_size,
            attempts,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loop until the store is drained or terminated
    pub fn run(&self) -> WriterReport {
        info!(writer = %self.name, "writer started");
        let mut report = WriterReport::default();
        let mut batch = Vec::with_capacity(self.batch_size);

        while !self.store.is_drained() && !self.store.is_terminated() {
            self.store.pull(&mut batch, self.batch_size);
            if batch.is_empty() {
                continue;
            }

            let delivered = batch.len();
            if self.process_batch(&mut batch) {
                report.batches_written += 1;
                report.transactions_written += delivered;
            } else if !self.store.is_terminated() {
                report.batches_requeued += 1;
            }
        }

        if self.store.is_terminated() {
            warn!(writer = %self.name, ?report, "writer stopped early");
        } else {
            info!(writer = %self.name, ?report, "writer finished");
        }
        report
    }

    /// Try to deliver `batch` up to `attempts` times. On failure the batch is
    /// handed back to the store. `batch` is empty when this returns.
    pub fn process_batch(&self, batch: &mut Vec<Transaction>) -> bool {
        for attempt in 1..=self.attempts {
            if self.store.is_terminated() {
                batch.clear();
                return false;
            }

            let stored = self.gateway.submit_batch(batch);
            if stored == batch.len() {
                trace!(writer = %self.name, count = stored, "batch delivered");
                batch.clear();
                return true;
            }
            warn!(
                writer = %self.name,
                attempt,
                attempts = self.attempts,
                stored,
                expected = batch.len(),
                "delivery failed"
            );
        }

        if self.store.is_terminated() {
            batch.clear();
            return false;
        }

        debug!(writer = %self.name, count = batch.len(), "returning batch to store");
        self.store.push_back(std::mem::take(batch));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Client, Place};
    use crate::keys::KeyRegistry;
    use crate::store::StoreLimits;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Gateway that fails the first `failures` calls, then stores everything
    struct FlakyGateway {
        failures: usize,
        calls: AtomicUsize,
        stored: Mutex<Vec<i64>>,
    }

    impl FlakyGateway {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(FlakyGateway {
                failures,
                calls: AtomicUsize::new(0),
                stored: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PersistenceGateway for FlakyGateway {
        fn submit_batch(&self, batch: &[Transaction]) -> usize {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return 0;
            }
            self.stored.lock().extend(batch.iter().map(Transaction::id));
            batch.len()
        }
    }

    fn store(batch_size: usize, error_threshold: usize) -> Arc<TransactionStore> {
        Arc::new(TransactionStore::new(StoreLimits {
            batch_size,
            max_batches: 10,
            error_threshold,
            poll_interval: Duration::from_millis(5),
        }))
    }

    fn fill(store: &TransactionStore, count: u32) {
        let keys = KeyRegistry::new();
        let client = Arc::new(Client::new("Ivan", "Ivanoff", "Ivanoff", "1234567890").unwrap());
        let place = Arc::new(Place::new("A PLACE 1").unwrap());
        for serial in 1..=count {
            let transaction = Transaction::new(
                Decimal::new(1001, 2),
                "UAH",
                "123456****1234",
                client.clone(),
                place.clone(),
                serial,
                &keys,
            )
            .unwrap();
            store.push(transaction);
        }
    }

    #[test]
    fn test_writer_drains_store() {
        let store = store(3, 10);
        fill(&store, 7);
        store.finish_producing();

        let gateway = FlakyGateway::new(0);
        let writer = BatchWriter::new("writer-1", store.clone(), gateway.clone(), 3);
        let report = writer.run();

        assert_eq!(
            report,
            WriterReport {
                batches_written: 3,
                transactions_written: 7,
                batches_requeued: 0
            }
        );
        assert_eq!(gateway.stored.lock().len(), 7);
        assert!(store.is_drained());
    }

    #[test]
    fn test_exhausted_attempts_requeue_batch() {
        let store = store(4, 10);
        fill(&store, 4);
        store.finish_producing();

        let gateway = FlakyGateway::new(usize::MAX);
        let writer = BatchWriter::new("writer-1", store.clone(), gateway.clone(), 3);

        let mut batch = Vec::new();
        store.pull(&mut batch, 4);
        assert!(!writer.process_batch(&mut batch));

        assert_eq!(gateway.calls(), 3, "exactly `attempts` deliveries");
        assert!(batch.is_empty());
        assert_eq!(store.size(), 4, "batch is back in the store");
        assert_eq!(store.error_count(), 1);
    }

    #[test]
    fn test_requeued_batch_is_delivered_later() {
        let store = store(5, 10);
        fill(&store, 5);
        store.finish_producing();

        // Two failures with two attempts: first round requeues, second delivers
        let gateway = FlakyGateway::new(2);
        let writer = BatchWriter::new("writer-1", store.clone(), gateway.clone(), 2);
        let report = writer.run();

        assert_eq!(report.batches_requeued, 1);
        assert_eq!(report.batches_written, 1);
        assert_eq!(report.transactions_written, 5);
        assert_eq!(store.error_count(), 1);
        assert_eq!(gateway.calls(), 3);
    }

    #[test]
    fn test_persistent_failure_trips_threshold() {
        let store = store(2, 3);
        fill(&store, 6);
        store.finish_producing();

        let gateway = FlakyGateway::new(usize::MAX);
        let writer = BatchWriter::new("writer-1", store.clone(), gateway, 1);
        let report = writer.run();

        assert!(store.is_terminated());
        assert_eq!(report.transactions_written, 0);
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_terminated_store_stops_retries() {
        let store = store(2, 10);
        fill(&store, 2);
        let mut batch = Vec::new();
        store.pull(&mut batch, 2);
        store.terminate();

        let gateway = FlakyGateway::new(usize::MAX);
        let writer = BatchWriter::new("writer-1", store.clone(), gateway.clone(), 5);

        assert!(!writer.process_batch(&mut batch));
        assert_eq!(gateway.calls(), 0);
        assert_eq!(store.error_count(), 0);
    }
}
