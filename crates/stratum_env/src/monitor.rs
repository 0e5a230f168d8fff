//! Background watcher for transactions that outlive their timeout.

use crate::txn_set::TransactionSet;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

/// Periodically scans live transactions and reports any whose wall-clock
/// age exceeds the configured timeout.
///
/// The monitor only reports; it never aborts a transaction. It holds a
/// weak handle to the transaction registry, so it cannot keep an
/// environment alive, and it is started by the environment's activation
/// step after construction is complete.
pub(crate) struct StuckTransactionMonitor {
    stop: Arc<(Mutex<bool>, Condvar)>,
    flagged: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl StuckTransactionMonitor {
    /// Starts the monitor over `txns` with the given timeout.
    pub fn start(txns: Weak<TransactionSet>, timeout: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let flagged = Arc::new(AtomicU64::new(0));

        let period = timeout.max(Duration::from_millis(10));
        let thread_stop = Arc::clone(&stop);
        let thread_flagged = Arc::clone(&flagged);
        let worker = std::thread::Builder::new()
            .name("stratum-txn-monitor".into())
            .spawn(move || loop {
                {
                    let (lock, cond) = &*thread_stop;
                    let mut stopped = lock.lock();
                    if *stopped {
                        break;
                    }
                    cond.wait_for(&mut stopped, period);
                    if *stopped {
                        break;
                    }
                }

                let Some(txns) = txns.upgrade() else {
                    break;
                };
                for info in txns.snapshot() {
                    let age = info.created.elapsed();
                    if age > timeout {
                        thread_flagged.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            txn = info.id,
                            age_ms = age.as_millis() as u64,
                            thread = info.thread.as_deref().unwrap_or("<unknown>"),
                            "transaction exceeded its timeout"
                        );
                    }
                }
            })
            .ok();

        Self {
            stop,
            flagged,
            worker,
        }
    }

    /// Number of stuck-transaction reports emitted so far.
    pub fn flagged_count(&self) -> u64 {
        self.flagged.load(Ordering::Relaxed)
    }

    /// Stops the monitor and joins its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let (lock, cond) = &*self.stop;
            *lock.lock() = true;
            cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for StuckTransactionMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
