// 📦 Transaction Store - Bounded FIFO between the reader and the writers
//
// - push blocks while the queue holds batch_size * max_batches transactions
// - push_back re-queues a failed batch past the limit and counts an error
// - every error event bumps a shared counter; past the threshold the store
//   terminates: queue cleared, producer marked finished, push/pull become no-ops
//
// Blocking is a condvar wait with a timeout, so every waiter re-checks the
// flags at least once per poll interval even if a wakeup is missed.

use crossbeam_channel::{unbounded, Receiver, SendError, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::entities::Transaction;

// ============================================================================
// LIMITS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Transactions handed to a writer per pull
    pub batch_size: usize,

    /// Batches the queue may hold before push blocks
    pub max_batches: usize,

    /// Error events tolerated; one more terminates the store
    pub error_threshold: usize,

    /// Upper bound on any single wait
    pub poll_interval: Duration,
}

impl StoreLimits {
    pub fn capacity(&self) -> usize {
        self.batch_size.saturating_mul(self.max_batches)
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        StoreLimits {
            batch_size: 150,
            max_batches: 100,
            error_threshold: 100,
            poll_interval: Duration::from_millis(100),
        }
    }
}

// ============================================================================
// TRANSACTION STORE
// ============================================================================

pub struct TransactionStore {
    limits: StoreLimits,
    sender: Sender<Transaction>,
    receiver: Receiver<Transaction>,
    errors: AtomicUsize,
    producer_finished: AtomicBool,
    terminated: AtomicBool,
    gate: Mutex<()>,
    changed: Condvar,
}

impl TransactionStore {
    pub fn new(limits: StoreLimits) -> Self {
        let (sender, receiver) = unbounded();

        TransactionStore {
            limits,
            sender,
            receiver,
            errors: AtomicUsize::new(0),
            producer_finished: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            gate: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    /// Append one transaction, waiting for room when the queue is full.
    ///
    /// `None` is an error event, not an item. Pushing into a terminated store
    /// does nothing.
    pub fn push(&self, transaction: impl Into<Option<Transaction>>) {
        let Some(transaction) = transaction.into() else {
            self.record_error();
            return;
        };

        self.wait_while(|| self.size() >= self.limits.capacity());
        if self.is_terminated() {
            return;
        }

        self.enqueue(transaction);
        self.notify();
    }

    /// Re-queue a batch that could not be delivered, ignoring the capacity
    /// limit. Always counts one error event.
    pub fn push_back(&self, batch: Vec<Transaction>) {
        self.record_error();
        if batch.is_empty() || self.is_terminated() {
            return;
        }

        let count = batch.len();
        for transaction in batch {
            if self.is_terminated() {
                break;
            }
            self.enqueue(transaction);
        }
        debug!(count, size = self.size(), "batch returned to store");
        self.notify();
    }

    /// Move up to `max_count` transactions into `batch`.
    ///
    /// Waits while the queue is empty and the producer is still running.
    /// Returns early once the producer finished or the store terminated.
    pub fn pull(&self, batch: &mut Vec<Transaction>, max_count: usize) {
        if self.is_terminated() {
            return;
        }

        let before = batch.len();
        while batch.len() < max_count {
            if let Ok(transaction) = self.receiver.try_recv() {
                batch.push(transaction);
                continue;
            }
            if self.is_producer_finished() || self.is_terminated() {
                break;
            }
            self.wait_while(|| self.receiver.is_empty() && !self.is_producer_finished());
        }

        if batch.len() > before {
            self.notify();
        }
    }

    /// Count one error event; crossing the threshold terminates the store
    pub fn record_error(&self) -> usize {
        let errors = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        if errors > self.limits.error_threshold {
            self.terminate();
        }
        errors
    }

    /// Close the store for good. Idempotent.
    pub fn terminate(&self) {
        self.producer_finished.store(true, Ordering::SeqCst);
        if !self.terminated.swap(true, Ordering::SeqCst) {
            warn!(
                errors = self.error_count(),
                dropped = self.size(),
                "store terminated"
            );
        }
        self.clear();
        self.notify();
    }

    /// Reader is done; writers may drain and stop
    pub fn finish_producing(&self) {
        self.producer_finished.store(true, Ordering::SeqCst);
        self.notify();
    }

    pub fn size(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_producer_finished(&self) -> bool {
        self.producer_finished.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    /// Producer done and nothing left to hand out
    pub fn is_drained(&self) -> bool {
        self.is_producer_finished() && self.size() == 0
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn enqueue(&self, transaction: Transaction) {
        let mut pending = transaction;
        loop {
            match self.sender.send(pending) {
                Ok(()) => break,
                Err(SendError(returned)) => {
                    pending = returned;
                    self.record_error();
                    if self.is_terminated() {
                        return;
                    }
                    self.pause();
                }
            }
        }

        // A terminate that raced with this send must not leave items behind
        if self.is_terminated() {
            self.clear();
        }
    }

    fn clear(&self) {
        while self.receiver.try_recv().is_ok() {}
    }

    /// Wait while `blocked` holds and the store is live, at most one poll
    /// interval per check.
    fn wait_while(&self, mut blocked: impl FnMut() -> bool) {
        let mut gate = self.gate.lock();
        while !self.is_terminated() && blocked() {
            self.changed.wait_for(&mut gate, self.limits.poll_interval);
        }
    }

    /// One bounded wait, for retrying a failed send
    fn pause(&self) {
        let mut gate = self.gate.lock();
        self.changed.wait_for(&mut gate, self.limits.poll_interval);
    }

    fn notify(&self) {
        let _gate = self.gate.lock();
        self.changed.notify_all();
    }
}
