//! Garbage collector hooks and reclaimable-space accounting.
//!
//! The scan-and-relocate machinery lives below this layer; the environment
//! core only needs the collaborator surface: commits hand over the records
//! they superseded, the collector keeps per-tree reclaimable-byte
//! accounting on a background worker, and the environment can suspend,
//! resume, wake and finish it. The accounting is the utilization profile,
//! persisted in a reserved store so it survives reopen.

use crate::environment::Environment;
use crate::error::EnvResult;
use crate::store::StoreConfig;
use crate::tree::ExpiredLoggable;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Name of the reserved store holding the utilization profile.
pub const UTILIZATION_PROFILE_NAME: &str = "@utilization";

/// True for store names reserved for the collector's own bookkeeping.
#[must_use]
pub fn is_utilization_profile(store_name: &str) -> bool {
    store_name == UTILIZATION_PROFILE_NAME
}

enum GcMessage {
    Expired(Vec<ExpiredLoggable>),
    Wake,
}

#[derive(Default)]
struct GcState {
    suspended: u32,
    shutting_down: bool,
    busy: bool,
    pending: usize,
    reclaimable: HashMap<u64, u64>,
}

struct GcShared {
    state: Mutex<GcState>,
    cond: Condvar,
}

/// The environment's garbage collection collaborator.
///
/// Expired-loggable notifications arrive in commit order and are folded
/// into the accounting asynchronously. `suspend` blocks until the worker
/// is parked between batches, so callers can rely on the accounting being
/// quiescent while suspended.
pub struct GarbageCollector {
    shared: Arc<GcShared>,
    sender: Mutex<Option<Sender<GcMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GarbageCollector {
    pub(crate) fn new() -> Self {
        let shared = Arc::new(GcShared {
            state: Mutex::new(GcState::default()),
            cond: Condvar::new(),
        });
        let (sender, receiver) = std::sync::mpsc::channel();

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("stratum-gc".into())
            .spawn(move || worker_loop(&worker_shared, &receiver))
            .ok();
        if worker.is_none() {
            warn!("failed to spawn gc worker; expired records will not be accounted");
        }

        Self {
            shared,
            sender: Mutex::new(worker.as_ref().map(|_| sender)),
            worker: Mutex::new(worker),
        }
    }

    /// Hands a batch of expired records to the collector.
    ///
    /// Called after a commit releases the commit lock; batches are
    /// processed in the order they were fetched. After `finish` the batch
    /// is dropped.
    pub(crate) fn fetch_expired_loggables(
        &self,
        expired: impl IntoIterator<Item = ExpiredLoggable>,
    ) {
        let batch: Vec<ExpiredLoggable> = expired.into_iter().collect();
        if batch.is_empty() {
            return;
        }
        let sender = self.sender.lock();
        if let Some(sender) = sender.as_ref() {
            self.shared.state.lock().pending += 1;
            if sender.send(GcMessage::Expired(batch)).is_err() {
                let mut state = self.shared.state.lock();
                state.pending = state.pending.saturating_sub(1);
            }
        }
    }

    /// Suspends accounting; counted, so suspensions nest.
    ///
    /// Blocks until the worker finishes its current batch.
    pub fn suspend(&self) {
        let mut state = self.shared.state.lock();
        state.suspended += 1;
        while state.busy {
            self.shared.cond.wait(&mut state);
        }
    }

    /// Resumes accounting after a matching `suspend`.
    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        state.suspended = state.suspended.saturating_sub(1);
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Nudges the worker.
    pub fn wake(&self) {
        let sender = self.sender.lock();
        if let Some(sender) = sender.as_ref() {
            let _ = sender.send(GcMessage::Wake);
        }
    }

    /// Stops the worker and joins it. Idempotent; never called under the
    /// commit or meta lock.
    pub fn finish(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
        }
        self.shared.cond.notify_all();
        // Dropping the sender closes the channel; the worker drains what
        // is queued and exits.
        self.sender.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Waits up to `timeout` for queued batches to be accounted.
    pub(crate) fn wait_idle(&self, timeout: Duration) {
        let mut state = self.shared.state.lock();
        while state.pending > 0 || state.busy {
            if self
                .shared
                .cond
                .wait_for(&mut state, timeout)
                .timed_out()
            {
                break;
            }
        }
    }

    /// Total bytes superseded and not yet reclaimed.
    #[must_use]
    pub fn reclaimable_bytes(&self) -> u64 {
        self.shared.state.lock().reclaimable.values().sum()
    }

    /// Reclaimable bytes attributed to one tree.
    #[must_use]
    pub fn reclaimable_bytes_for(&self, structure_id: u64) -> u64 {
        self.shared
            .state
            .lock()
            .reclaimable
            .get(&structure_id)
            .copied()
            .unwrap_or(0)
    }

    /// Drops all accounting. Used by `clear`, whose log truncation makes
    /// every previously expired record vanish.
    pub(crate) fn reset(&self) {
        self.shared.state.lock().reclaimable.clear();
    }

    /// Persists the utilization profile into its reserved store.
    ///
    /// The environment is passed in explicitly; the collector holds no
    /// back-reference to it.
    pub(crate) fn save_utilization_profile(&self, env: &Environment) -> EnvResult<()> {
        let profile: Vec<(u64, u64)> = {
            let state = self.shared.state.lock();
            state
                .reclaimable
                .iter()
                .map(|(&id, &bytes)| (id, bytes))
                .collect()
        };
        if profile.is_empty() {
            return Ok(());
        }

        env.execute_in_transaction(|txn| {
            let store = env.open_store(
                UTILIZATION_PROFILE_NAME,
                StoreConfig::WITHOUT_DUPLICATES,
                txn,
            )?;
            for &(structure_id, bytes) in &profile {
                store.put(
                    txn,
                    stratum_bindings::u64_to_entry(structure_id),
                    bytes.to_le_bytes().to_vec(),
                )?;
            }
            Ok(())
        })?;
        debug!(trees = profile.len(), "utilization profile saved");
        Ok(())
    }

    /// Reloads the utilization profile persisted by a previous session.
    pub(crate) fn load_utilization_profile(&self, env: &Environment) -> EnvResult<()> {
        let entries = env.compute_in_readonly_transaction(|txn| {
            match env.open_store_optional(
                UTILIZATION_PROFILE_NAME,
                StoreConfig::USE_EXISTING,
                txn,
            )? {
                Some(store) => store.entries(txn),
                None => Ok(Vec::new()),
            }
        })?;

        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.shared.state.lock();
        for (key, value) in entries {
            let Ok(structure_id) = stratum_bindings::entry_to_u64(&key) else {
                continue;
            };
            let Ok(bytes) = <[u8; 8]>::try_from(value.as_slice()) else {
                continue;
            };
            state
                .reclaimable
                .insert(structure_id, u64::from_le_bytes(bytes));
        }
        Ok(())
    }
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("reclaimable_bytes", &self.reclaimable_bytes())
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: &GcShared, receiver: &Receiver<GcMessage>) {
    while let Ok(message) = receiver.recv() {
        match message {
            GcMessage::Expired(batch) => {
                let mut state = shared.state.lock();
                while state.suspended > 0 && !state.shutting_down {
                    shared.cond.wait(&mut state);
                }
                state.busy = true;
                for expired in &batch {
                    *state.reclaimable.entry(expired.structure_id).or_insert(0) +=
                        expired.length;
                }
                state.busy = false;
                state.pending = state.pending.saturating_sub(1);
                drop(state);
                shared.cond.notify_all();
            }
            GcMessage::Wake => {}
        }
    }
}
