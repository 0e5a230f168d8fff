//! The environment: stores, transactions and the commit protocol.
//!
//! The environment ties together one append-only log, the meta tree
//! mapping store names to their roots, the set of live transactions, the
//! garbage collector and the deferred task queue.
//!
//! Two mutual-exclusion regions order all writes, always acquired commit
//! lock first:
//!
//! - the **commit lock** serializes writing commits, `clear` and `close`
//! - the **meta lock** guards the published meta tree reference and the
//!   begin/commit hook sequencing; readers hold it only long enough to
//!   copy the reference
//!
//! A commit whose log append fails is rolled back by restoring the
//! pre-commit high address. If that rollback fails too, the environment
//! latches **inoperative** and refuses all further work.

use crate::config::EnvironmentConfig;
use crate::deferred::DeferredTaskQueue;
use crate::error::{EnvError, EnvResult};
use crate::gc::GarbageCollector;
use crate::location::EnvironmentLocation;
use crate::meta_tree::{MetaTree, TreeMetaInfo};
use crate::monitor::StuckTransactionMonitor;
use crate::store::{Store, StoreConfig};
use crate::transaction::Transaction;
use crate::txn_set::{TransactionSet, TxnInfo};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratum_bindings::StringBinding;
use stratum_log::{FileBackend, Log};
use tracing::{error, info, warn};

/// Why the environment refuses to operate.
#[derive(Debug, Clone)]
enum Fault {
    /// `close` completed; terminal by design.
    Closed,
    /// A commit failed and its rollback failed too.
    Commit(String),
}

struct EnvInner {
    log: Log,
    config: EnvironmentConfig,
    bindings: StringBinding,
    location: Option<EnvironmentLocation>,
    commit_lock: Mutex<()>,
    meta: Mutex<Arc<MetaTree>>,
    structure_id: AtomicU64,
    txn_serial: AtomicU64,
    txns: Arc<TransactionSet>,
    deferred: DeferredTaskQueue,
    gc: GarbageCollector,
    fault: RwLock<Option<Fault>>,
    monitor: Mutex<Option<StuckTransactionMonitor>>,
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        self.gc.finish();
        self.monitor.lock().take();
    }
}

/// Handle to an open environment.
///
/// Handles are cheap to clone and share one underlying environment.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    // ------------------------------------------------------------------
    // Opening and lifecycle
    // ------------------------------------------------------------------

    /// Opens (creating if absent) the environment at `path`.
    ///
    /// The directory is locked against other processes, and settings from
    /// an `exodus.properties` file next to the log override `config`.
    pub fn open(path: impl AsRef<Path>, mut config: EnvironmentConfig) -> EnvResult<Self> {
        let location = EnvironmentLocation::open(path.as_ref())?;
        config.apply_properties_file(&location.properties_path())?;
        let backend = FileBackend::open_with_create_dirs(&location.data_path())?;
        let log = Log::new(Box::new(backend))?;
        Self::from_parts(log, config, Some(location))
    }

    /// Opens an environment over an already constructed log.
    ///
    /// No directory lock or properties overlay is involved; tests and
    /// embedders with custom backends use this.
    pub fn open_with_log(log: Log, config: EnvironmentConfig) -> EnvResult<Self> {
        Self::from_parts(log, config, None)
    }

    /// Opens a fresh in-memory environment.
    pub fn open_in_memory(config: EnvironmentConfig) -> EnvResult<Self> {
        let log = Log::new(Box::new(stratum_log::MemoryBackend::new()))?;
        Self::open_with_log(log, config)
    }

    fn from_parts(
        log: Log,
        config: EnvironmentConfig,
        location: Option<EnvironmentLocation>,
    ) -> EnvResult<Self> {
        let (meta, last_structure_id) = MetaTree::create(&log, config.tree_max_page_size)?;
        let bindings = StringBinding::new(config.interner);

        let inner = Arc::new(EnvInner {
            log,
            bindings,
            location,
            commit_lock: Mutex::new(()),
            meta: Mutex::new(meta),
            structure_id: AtomicU64::new(last_structure_id),
            txn_serial: AtomicU64::new(0),
            txns: Arc::new(TransactionSet::new()),
            deferred: DeferredTaskQueue::new(),
            gc: GarbageCollector::new(),
            fault: RwLock::new(None),
            monitor: Mutex::new(None),
            config,
        });

        let env = Self { inner };
        env.activate();
        Ok(env)
    }

    /// Publication step, run once construction is complete: spawns the
    /// stuck-transaction monitor and reloads the GC utilization profile.
    fn activate(&self) {
        let timeout = self.inner.config.transaction_timeout;
        if timeout > Duration::ZERO {
            let monitor =
                StuckTransactionMonitor::start(Arc::downgrade(&self.inner.txns), timeout);
            *self.inner.monitor.lock() = Some(monitor);
        }
        if let Err(err) = self.inner.gc.load_utilization_profile(self) {
            warn!(error = %err, "failed to load utilization profile");
        }
        info!(location = %self.location(), "environment created");
    }

    /// Where the environment lives, for diagnostics.
    #[must_use]
    pub fn location(&self) -> String {
        match &self.inner.location {
            Some(location) => location.path().display().to_string(),
            None => "<in-memory>".to_string(),
        }
    }

    /// The environment's configuration.
    #[must_use]
    pub fn config(&self) -> &EnvironmentConfig {
        &self.inner.config
    }

    /// The underlying log.
    #[must_use]
    pub fn log(&self) -> &Log {
        &self.inner.log
    }

    /// The string binding configured for this environment.
    #[must_use]
    pub fn string_binding(&self) -> &StringBinding {
        &self.inner.bindings
    }

    /// The garbage collection collaborator.
    #[must_use]
    pub fn garbage_collector(&self) -> &GarbageCollector {
        &self.inner.gc
    }

    /// True until `close` has completed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !matches!(&*self.inner.fault.read(), Some(Fault::Closed))
    }

    /// Number of unfinished transactions.
    #[must_use]
    pub fn active_transaction_count(&self) -> usize {
        self.inner.txns.len()
    }

    /// Number of stuck-transaction reports emitted by the monitor.
    #[must_use]
    pub fn stuck_transaction_count(&self) -> u64 {
        self.inner
            .monitor
            .lock()
            .as_ref()
            .map_or(0, StuckTransactionMonitor::flagged_count)
    }

    /// Closes the environment. One-way.
    ///
    /// Fails with [`EnvError::Active`] when transactions are live and
    /// close-forcedly is off. On success all deferred tasks run and the
    /// log is closed; every later operation fails with
    /// [`EnvError::Closed`].
    pub fn close(&self) -> EnvResult<()> {
        let inner = &self.inner;
        // Finishing the collector must happen outside any lock.
        inner.gc.finish();

        // Fail fast before mutating durable state: a close that is going
        // to be rejected must not commit anything. Both checks are
        // re-run authoritatively under the commit lock below.
        if !self.is_open() {
            return Err(EnvError::Closed);
        }
        self.check_inactive(inner.config.close_forcedly)?;

        // The utilization profile commits through a regular transaction,
        // so it must be persisted before the commit lock is taken.
        if self.check_is_operative().is_ok() {
            if let Err(err) = inner.gc.save_utilization_profile(self) {
                warn!(error = %err, "failed to save utilization profile");
            }
        }

        let hit_rate;
        {
            let _commit = inner.commit_lock.lock();
            if !self.is_open() {
                return Err(EnvError::Closed);
            }
            self.check_inactive(inner.config.close_forcedly)?;
            hit_rate = inner.log.cache_hit_rate() * 100.0;
            inner.log.close()?;
            *inner.fault.write() = Some(Fault::Closed);
        }

        // No new reader can appear; every gate is moot.
        inner.deferred.drain_all();
        inner.gc.wait_idle(Duration::from_millis(100));
        inner.monitor.lock().take();

        info!(
            location = %self.location(),
            cache_hit_rate_pct = hit_rate,
            "environment closed"
        );
        Ok(())
    }

    /// Discards all data, resetting the environment to its pristine state.
    ///
    /// Fails with [`EnvError::Active`] when transactions are live.
    pub fn clear(&self) -> EnvResult<()> {
        let inner = &self.inner;
        self.check_is_operative()?;

        inner.gc.suspend();
        let result = (|| {
            let _commit = inner.commit_lock.lock();
            let mut meta = inner.meta.lock();
            self.check_inactive(false)?;

            inner.log.clear()?;
            inner.deferred.drain_all();
            inner.gc.reset();

            let (fresh, last_structure_id) =
                MetaTree::create(&inner.log, inner.config.tree_max_page_size)?;
            *meta = fresh;
            inner.structure_id.store(last_structure_id, Ordering::SeqCst);
            Ok(())
        })();
        inner.gc.resume();
        result
    }

    /// Wakes the garbage collector.
    pub fn gc(&self) {
        self.inner.gc.wake();
    }

    /// Suspends background garbage collection.
    pub fn suspend_gc(&self) {
        self.inner.gc.suspend();
    }

    /// Resumes background garbage collection.
    pub fn resume_gc(&self) {
        self.inner.gc.resume();
    }

    // ------------------------------------------------------------------
    // Transaction factories and executors
    // ------------------------------------------------------------------

    /// Begins a writing transaction.
    pub fn begin_transaction(&self) -> EnvResult<Transaction> {
        self.begin(false, false, None)
    }

    /// Begins a writing transaction whose `hook` runs under the meta lock
    /// at every snapshot acquisition (begin and each revert).
    pub fn begin_transaction_with_hook(
        &self,
        hook: Box<dyn Fn() + Send>,
    ) -> EnvResult<Transaction> {
        self.begin(false, false, Some(hook))
    }

    /// Begins a read-only transaction.
    pub fn begin_readonly_transaction(&self) -> EnvResult<Transaction> {
        self.begin(true, false, None)
    }

    /// Begins a read-only transaction with a begin hook.
    pub fn begin_readonly_transaction_with_hook(
        &self,
        hook: Box<dyn Fn() + Send>,
    ) -> EnvResult<Transaction> {
        self.begin(true, false, Some(hook))
    }

    /// Begins a writing transaction over a detached copy of the current
    /// meta tree, for work that must observe its own previously published
    /// state while still committing as one unit.
    pub fn begin_transaction_with_cloned_meta(&self) -> EnvResult<Transaction> {
        self.begin(false, true, None)
    }

    fn begin(
        &self,
        readonly: bool,
        cloned_meta: bool,
        hook: Option<Box<dyn Fn() + Send>>,
    ) -> EnvResult<Transaction> {
        let inner = &self.inner;
        self.check_is_operative()?;

        let snapshot = self.meta_snapshot(hook.as_deref());
        let snapshot = if cloned_meta {
            Arc::new(snapshot.deep_clone())
        } else {
            snapshot
        };

        let id = inner.txn_serial.fetch_add(1, Ordering::SeqCst) + 1;
        let thread = (inner.config.transaction_timeout > Duration::ZERO).then(|| {
            std::thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string()
        });
        inner.txns.add(TxnInfo {
            id,
            root: snapshot.root(),
            created: Instant::now(),
            thread,
        });

        Ok(Transaction::new(self.clone(), id, readonly, snapshot, hook))
    }

    /// Runs `body` in a transaction, retrying on stale snapshots until the
    /// flush succeeds.
    pub fn execute_in_transaction<F>(&self, body: F) -> EnvResult<()>
    where
        F: FnMut(&mut Transaction) -> EnvResult<()>,
    {
        self.compute_in_transaction(body)
    }

    /// Runs `body` in a transaction and returns its last result, retrying
    /// on stale snapshots until the flush succeeds.
    pub fn compute_in_transaction<T, F>(&self, mut body: F) -> EnvResult<T>
    where
        F: FnMut(&mut Transaction) -> EnvResult<T>,
    {
        let mut txn = self.begin_transaction()?;
        let result = loop {
            match body(&mut txn) {
                Ok(value) => match txn.flush() {
                    Ok(true) => break Ok(value),
                    Ok(false) => txn.revert()?,
                    Err(err) => break Err(err),
                },
                Err(err) => break Err(err),
            }
        };
        txn.abort();
        result
    }

    /// Runs `body` once in a read-only transaction.
    pub fn execute_in_readonly_transaction<F>(&self, body: F) -> EnvResult<()>
    where
        F: FnOnce(&mut Transaction) -> EnvResult<()>,
    {
        self.compute_in_readonly_transaction(body)
    }

    /// Runs `body` once in a read-only transaction and returns its result.
    pub fn compute_in_readonly_transaction<T, F>(&self, body: F) -> EnvResult<T>
    where
        F: FnOnce(&mut Transaction) -> EnvResult<T>,
    {
        let mut txn = self.begin_readonly_transaction()?;
        let result = body(&mut txn);
        txn.abort();
        result
    }

    /// Runs `task` once no live transaction could observe the state that
    /// exists now. With no live transactions it runs immediately.
    pub fn execute_transaction_safe_task(&self, task: impl FnOnce() + Send + 'static) {
        match self.inner.txns.newest_root() {
            None => task(),
            Some(root) => self.inner.deferred.register(Box::new(task), root),
        }
    }

    // ------------------------------------------------------------------
    // Stores
    // ------------------------------------------------------------------

    /// Opens a store, creating it when missing.
    ///
    /// Creation is recorded on `txn` and becomes durable with it.
    pub fn open_store(
        &self,
        name: &str,
        config: StoreConfig,
        txn: &mut Transaction,
    ) -> EnvResult<Store> {
        let meta_info = txn.meta_info_local(name)?;
        self.open_store_impl(name, config, Some(txn), meta_info)
    }

    /// Opens a store only if it exists; `Ok(None)` when missing.
    pub fn open_store_optional(
        &self,
        name: &str,
        config: StoreConfig,
        txn: &mut Transaction,
    ) -> EnvResult<Option<Store>> {
        let meta_info = txn.meta_info_local(name)?;
        if meta_info.is_none() {
            return Ok(None);
        }
        Ok(Some(self.open_store_impl(name, config, Some(txn), meta_info)?))
    }

    fn open_store_impl(
        &self,
        name: &str,
        mut config: StoreConfig,
        txn: Option<&mut Transaction>,
        meta_info: Option<TreeMetaInfo>,
    ) -> EnvResult<Store> {
        if config.use_existing {
            match meta_info {
                None => return Err(EnvError::no_such_store(name)),
                Some(info) => {
                    config = StoreConfig {
                        duplicates: info.duplicates,
                        prefixing: info.prefixing,
                        use_existing: true,
                    };
                }
            }
        }

        match meta_info {
            None => {
                let txn = txn.ok_or(EnvError::NoTransaction)?;
                let structure_id = self.allocate_structure_id();
                let info = TreeMetaInfo {
                    structure_id,
                    duplicates: config.duplicates,
                    prefixing: config.prefixing,
                };
                let store = Store::new(name, info);
                txn.store_created(&store)?;
                Ok(store)
            }
            Some(info) => {
                if info.duplicates != config.duplicates {
                    return Err(EnvError::config_mismatch(
                        name,
                        format!(
                            "opened with duplicates = {} but created with duplicates = {}",
                            config.duplicates, info.duplicates
                        ),
                    ));
                }
                if info.prefixing != config.prefixing && config.prefixing {
                    return Err(EnvError::config_mismatch(
                        name,
                        "opened with prefixing = true but created with prefixing = false",
                    ));
                }
                // A prefixing = false request against prefixing metadata
                // opens with the existing (prefixing) metadata.
                Ok(Store::new(name, info))
            }
        }
    }

    /// Empties a store: the old tree's records become reclaimable and a
    /// fresh tree is registered under the same name, in `txn`.
    pub fn truncate_store(&self, name: &str, txn: &mut Transaction) -> EnvResult<()> {
        let store = self
            .open_store_optional(name, StoreConfig::USE_EXISTING, txn)?
            .ok_or_else(|| EnvError::no_such_store(name))?;
        txn.store_removed(&store)?;

        let fresh = TreeMetaInfo {
            structure_id: self.allocate_structure_id(),
            ..store.meta_info()
        };
        txn.store_created(&Store::new(name, fresh))
    }

    /// Removes a store; its tree's records become reclaimable when `txn`
    /// commits.
    pub fn remove_store(&self, name: &str, txn: &mut Transaction) -> EnvResult<()> {
        let store = self
            .open_store_optional(name, StoreConfig::USE_EXISTING, txn)?
            .ok_or_else(|| EnvError::no_such_store(name))?;
        txn.store_removed(&store)
    }

    /// Whether a store with `name` exists in the current meta tree.
    #[must_use]
    pub fn store_exists(&self, name: &str) -> bool {
        let meta = self.meta_snapshot(None);
        matches!(meta.meta_info(name, &self.inner.bindings), Ok(Some(_)))
    }

    /// Names of the stores visible to `txn`, excluding internal ones.
    pub fn store_names(&self, txn: &Transaction) -> EnvResult<Vec<String>> {
        txn.visible_store_names()
    }

    // ------------------------------------------------------------------
    // Internals shared with Transaction
    // ------------------------------------------------------------------

    pub(crate) fn check_is_operative(&self) -> EnvResult<()> {
        match &*self.inner.fault.read() {
            None => Ok(()),
            Some(Fault::Closed) => Err(EnvError::Closed),
            Some(Fault::Commit(cause)) => Err(EnvError::inoperative(cause.clone())),
        }
    }

    /// Copies the current meta tree reference, running `hook` under the
    /// meta lock first.
    pub(crate) fn meta_snapshot(&self, hook: Option<&(dyn Fn() + Send)>) -> Arc<MetaTree> {
        let meta = self.inner.meta.lock();
        if let Some(hook) = hook {
            hook();
        }
        Arc::clone(&meta)
    }

    pub(crate) fn allocate_structure_id(&self) -> u64 {
        // Skip ids whose low byte is zero: their big-endian entries would
        // end in the string terminator and collide with name keys.
        loop {
            let id = self.inner.structure_id.fetch_add(1, Ordering::SeqCst) + 1;
            if id & 0xFF != 0 {
                return id;
            }
        }
    }

    /// The writer side of the commit protocol.
    ///
    /// Returns `Ok(false)` when the transaction's snapshot is stale.
    pub(crate) fn flush_transaction(
        &self,
        txn: &mut Transaction,
        force: bool,
    ) -> EnvResult<bool> {
        let inner = &self.inner;
        self.check_is_operative()?;
        if !force && txn.is_idempotent() {
            return Ok(true);
        }

        let expired;
        {
            let _commit = inner.commit_lock.lock();
            self.check_is_operative()?;

            if txn.snapshot_root() != inner.meta.lock().root() {
                return Ok(false);
            }

            let high_address = inner.log.high_address();
            match txn.do_commit(
                &inner.log,
                inner.config.tree_max_page_size,
                &inner.bindings,
            ) {
                Ok((new_meta, new_expired)) => {
                    let new_meta = Arc::new(new_meta);
                    let mut meta = inner.meta.lock();
                    *meta = Arc::clone(&new_meta);
                    txn.set_snapshot(new_meta);
                    if let Some(hook) = txn.take_commit_hook() {
                        hook();
                    }
                    expired = new_expired;
                }
                Err(err) => {
                    error!(txn = txn.id(), error = %err, "failed to flush transaction");
                    return Err(self.roll_back_failed_commit(high_address, err));
                }
            }
        }

        // Hand the superseded records to the collector outside the commit
        // lock; it observes batches in commit order.
        inner.gc.fetch_expired_loggables(expired);
        Ok(true)
    }

    /// Restores the pre-commit high address after a failed commit.
    ///
    /// Runs under the commit lock. When the rollback itself fails the
    /// environment transitions to the inoperative state, permanently.
    fn roll_back_failed_commit(&self, high_address: u64, err: EnvError) -> EnvError {
        match self.inner.log.set_high_address(high_address) {
            Ok(()) => EnvError::transaction_failed(err.to_string()),
            Err(rollback_err) => {
                let cause = format!(
                    "commit failed ({err}) and high address rollback failed ({rollback_err})"
                );
                *self.inner.fault.write() = Some(Fault::Commit(cause.clone()));
                error!("environment is now inoperative: {cause}");
                EnvError::transaction_failed(cause)
            }
        }
    }

    /// Deregisters a finished transaction and runs any deferred tasks its
    /// departure unblocks.
    pub(crate) fn finish_transaction(&self, id: u64) {
        self.inner.txns.remove(id);
        let oldest = self.inner.txns.oldest_root().unwrap_or(u64::MAX);
        self.inner.deferred.sweep(oldest);
    }

    /// Re-registers a reverted transaction under its refreshed root.
    pub(crate) fn reregister_transaction(&self, id: u64, root: u64) {
        self.inner.txns.add(TxnInfo {
            id,
            root,
            created: Instant::now(),
            thread: None,
        });
    }

    fn check_inactive(&self, forced: bool) -> EnvResult<()> {
        let count = self.inner.txns.len();
        if count > 0 {
            if forced {
                warn!(count, "proceeding with live transactions");
            } else {
                error!(count, "environment is active");
                return Err(EnvError::Active { count });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("location", &self.location())
            .field("is_open", &self.is_open())
            .field("active_transactions", &self.active_transaction_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_env() -> Environment {
        Environment::open_in_memory(EnvironmentConfig::default()).unwrap()
    }

    #[test]
    fn open_in_memory() {
        let env = create_env();
        assert!(env.is_open());
        assert_eq!(env.active_transaction_count(), 0);
        assert_eq!(env.location(), "<in-memory>");
    }

    #[test]
    fn allocated_structure_ids_skip_zero_low_byte() {
        let env = create_env();
        let mut previous = 0;
        for _ in 0..600 {
            let id = env.allocate_structure_id();
            assert!(id > 0);
            assert_ne!(id & 0xFF, 0);
            assert!(id > previous);
            previous = id;
        }
    }

    #[test]
    fn open_store_creates_and_reopens() {
        let env = create_env();
        let mut txn = env.begin_transaction().unwrap();
        let store = env
            .open_store("users", StoreConfig::WITHOUT_DUPLICATES, &mut txn)
            .unwrap();
        assert!(txn.flush().unwrap());

        let mut txn = env.begin_transaction().unwrap();
        let reopened = env
            .open_store("users", StoreConfig::WITHOUT_DUPLICATES, &mut txn)
            .unwrap();
        assert_eq!(reopened.structure_id(), store.structure_id());
        txn.abort();
    }

    #[test]
    fn open_store_optional_absent() {
        let env = create_env();
        let mut txn = env.begin_transaction().unwrap();
        let missing = env
            .open_store_optional("ghost", StoreConfig::WITHOUT_DUPLICATES, &mut txn)
            .unwrap();
        assert!(missing.is_none());
        txn.abort();
    }

    #[test]
    fn use_existing_requires_presence() {
        let env = create_env();
        let mut txn = env.begin_transaction().unwrap();
        let result = env.open_store("ghost", StoreConfig::USE_EXISTING, &mut txn);
        assert!(matches!(result, Err(EnvError::NoSuchStore { .. })));
        txn.abort();
    }

    #[test]
    fn duplicates_mismatch_is_rejected() {
        let env = create_env();
        env.execute_in_transaction(|txn| {
            env.open_store("s", StoreConfig::WITH_DUPLICATES, txn)?;
            Ok(())
        })
        .unwrap();

        let mut txn = env.begin_transaction().unwrap();
        let result = env.open_store("s", StoreConfig::WITHOUT_DUPLICATES, &mut txn);
        assert!(matches!(result, Err(EnvError::ConfigMismatch { .. })));
        txn.abort();
    }

    #[test]
    fn prefixing_upgrade_is_rejected() {
        let env = create_env();
        env.execute_in_transaction(|txn| {
            env.open_store("s", StoreConfig::WITHOUT_DUPLICATES, txn)?;
            Ok(())
        })
        .unwrap();

        let mut txn = env.begin_transaction().unwrap();
        let result = env.open_store(
            "s",
            StoreConfig::WITHOUT_DUPLICATES_WITH_PREFIXING,
            &mut txn,
        );
        assert!(matches!(result, Err(EnvError::ConfigMismatch { .. })));
        txn.abort();
    }

    #[test]
    fn prefixing_downgrade_opens_existing_metadata() {
        let env = create_env();
        env.execute_in_transaction(|txn| {
            env.open_store("s", StoreConfig::WITHOUT_DUPLICATES_WITH_PREFIXING, txn)?;
            Ok(())
        })
        .unwrap();

        let mut txn = env.begin_transaction().unwrap();
        let store = env
            .open_store("s", StoreConfig::WITHOUT_DUPLICATES, &mut txn)
            .unwrap();
        // Silently opened with the stored (prefixing) metadata.
        assert!(store.key_prefixing());
        txn.abort();
    }

    #[test]
    fn readonly_transaction_cannot_create_store() {
        let env = create_env();
        let mut txn = env.begin_readonly_transaction().unwrap();
        let result = env.open_store("fresh", StoreConfig::WITHOUT_DUPLICATES, &mut txn);
        assert!(matches!(result, Err(EnvError::Readonly)));
        txn.abort();
    }

    #[test]
    fn store_names_reflect_transaction_view() {
        let env = create_env();
        env.execute_in_transaction(|txn| {
            env.open_store("alpha", StoreConfig::WITHOUT_DUPLICATES, txn)?;
            env.open_store("beta", StoreConfig::WITHOUT_DUPLICATES, txn)?;
            Ok(())
        })
        .unwrap();

        let mut txn = env.begin_transaction().unwrap();
        env.remove_store("alpha", &mut txn).unwrap();
        env.open_store("gamma", StoreConfig::WITHOUT_DUPLICATES, &mut txn)
            .unwrap();
        assert_eq!(env.store_names(&txn).unwrap(), vec!["beta", "gamma"]);
        txn.abort();

        // Uncommitted view changes never leaked out.
        let txn = env.begin_readonly_transaction().unwrap();
        assert_eq!(env.store_names(&txn).unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn remove_store_expires_and_unregisters() {
        let env = create_env();
        env.execute_in_transaction(|txn| {
            let store = env.open_store("gone", StoreConfig::WITHOUT_DUPLICATES, txn)?;
            store.put(txn, b"k".to_vec(), b"v".to_vec())
        })
        .unwrap();
        assert!(env.store_exists("gone"));

        env.execute_in_transaction(|txn| env.remove_store("gone", txn))
            .unwrap();
        assert!(!env.store_exists("gone"));

        // Removing again fails.
        let mut txn = env.begin_transaction().unwrap();
        assert!(matches!(
            env.remove_store("gone", &mut txn),
            Err(EnvError::NoSuchStore { .. })
        ));
        txn.abort();
    }

    #[test]
    fn truncate_store_keeps_name_drops_data() {
        let env = create_env();
        env.execute_in_transaction(|txn| {
            let store = env.open_store("t", StoreConfig::WITHOUT_DUPLICATES, txn)?;
            store.put(txn, b"k".to_vec(), b"v".to_vec())
        })
        .unwrap();

        let old_id = env
            .compute_in_readonly_transaction(|txn| {
                Ok(env
                    .open_store_optional("t", StoreConfig::USE_EXISTING, txn)?
                    .map(|s| s.structure_id()))
            })
            .unwrap()
            .unwrap();

        env.execute_in_transaction(|txn| env.truncate_store("t", txn))
            .unwrap();

        env.execute_in_readonly_transaction(|txn| {
            let store = env
                .open_store_optional("t", StoreConfig::USE_EXISTING, txn)?
                .expect("store survives truncation");
            assert_ne!(store.structure_id(), old_id);
            assert!(store.get(txn, b"k")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn clear_resets_to_pristine() {
        let env = create_env();
        env.execute_in_transaction(|txn| {
            let store = env.open_store("data", StoreConfig::WITHOUT_DUPLICATES, txn)?;
            store.put(txn, b"k".to_vec(), b"v".to_vec())
        })
        .unwrap();

        env.clear().unwrap();
        assert!(!env.store_exists("data"));
        assert!(env.is_open());

        // The environment is fully usable again.
        env.execute_in_transaction(|txn| {
            let store = env.open_store("data", StoreConfig::WITHOUT_DUPLICATES, txn)?;
            store.put(txn, b"k2".to_vec(), b"v2".to_vec())
        })
        .unwrap();
    }

    #[test]
    fn clear_with_live_transaction_fails() {
        let env = create_env();
        let txn = env.begin_transaction().unwrap();
        assert!(matches!(env.clear(), Err(EnvError::Active { .. })));
        drop(txn);
        env.clear().unwrap();
    }

    #[test]
    fn close_is_one_way() {
        let env = create_env();
        env.close().unwrap();
        assert!(!env.is_open());
        assert!(matches!(env.close(), Err(EnvError::Closed)));
        assert!(matches!(env.begin_transaction(), Err(EnvError::Closed)));
        assert!(matches!(
            env.begin_readonly_transaction(),
            Err(EnvError::Closed)
        ));
    }

    #[test]
    fn close_with_live_transaction_fails_by_default() {
        let env = create_env();
        let txn = env.begin_transaction().unwrap();
        assert!(matches!(env.close(), Err(EnvError::Active { .. })));
        drop(txn);
        env.close().unwrap();
    }

    #[test]
    fn rejected_close_commits_nothing() {
        let env = create_env();
        env.execute_in_transaction(|txn| {
            let store = env.open_store("s", StoreConfig::WITHOUT_DUPLICATES, txn)?;
            store.put(txn, b"k".to_vec(), b"v1".to_vec())
        })
        .unwrap();
        env.execute_in_transaction(|txn| {
            let store = env.open_store("s", StoreConfig::WITHOUT_DUPLICATES, txn)?;
            store.put(txn, b"k".to_vec(), b"v2".to_vec())
        })
        .unwrap();

        // Make sure the collector has accounting a profile save would
        // durably commit.
        let deadline = Instant::now() + Duration::from_secs(5);
        while env.garbage_collector().reclaimable_bytes() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(env.garbage_collector().reclaimable_bytes() > 0);

        let txn = env.begin_transaction().unwrap();
        let high_before = env.log().high_address();
        let root_before = txn.snapshot_root();

        assert!(matches!(env.close(), Err(EnvError::Active { .. })));

        // The failed close appended nothing and published nothing.
        assert_eq!(env.log().high_address(), high_before);
        drop(txn);
        let txn = env.begin_readonly_transaction().unwrap();
        assert_eq!(txn.snapshot_root(), root_before);
        drop(txn);

        env.close().unwrap();
    }

    #[test]
    fn forced_close_leaves_live_transactions_dangling() {
        let env =
            Environment::open_in_memory(EnvironmentConfig::default().close_forcedly(true))
                .unwrap();
        let mut txn = env.begin_transaction().unwrap();
        env.close().unwrap();

        // The transaction was not forcibly terminated, but any further
        // work through it fails against the closed environment.
        assert!(matches!(txn.revert(), Err(EnvError::Closed)));
    }

    #[test]
    fn transaction_safe_task_runs_immediately_when_idle() {
        let env = create_env();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        env.execute_transaction_safe_task(move || {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(ran.load(Ordering::SeqCst));
    }
}
