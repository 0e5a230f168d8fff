//! Snapshot-owning transactions.
//!
//! A transaction pins the meta tree published at its begin (or at its last
//! `revert`) and works against that snapshot. Writers stage changes in
//! lazily materialized mutable trees; `flush` runs the commit protocol and
//! either publishes a new meta tree or reports a stale snapshot so the
//! caller can revert and retry.

use crate::environment::Environment;
use crate::error::{EnvError, EnvResult};
use crate::meta_tree::{MetaTree, TreeMetaInfo, META_TREE_ID};
use crate::store::Store;
use crate::tree::{ExpiredLoggable, MutableTree, Tree};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use stratum_bindings::{u64_to_entry, StringBinding};
use stratum_log::{Log, LogError};

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Flushed,
    Aborted,
}

/// A store removal recorded for commit.
struct RemovedStore {
    structure_id: u64,
    expired: Vec<ExpiredLoggable>,
}

/// A unit of work over one meta tree snapshot.
///
/// Dropping an unfinished transaction aborts it.
pub struct Transaction {
    env: Environment,
    id: u64,
    readonly: bool,
    state: TxnState,
    snapshot: Arc<MetaTree>,
    mutable_trees: BTreeMap<String, MutableTree>,
    created_stores: BTreeMap<String, TreeMetaInfo>,
    removed_stores: BTreeMap<String, RemovedStore>,
    immutable_trees: Mutex<HashMap<u64, Tree>>,
    begin_hook: Option<Box<dyn Fn() + Send>>,
    commit_hook: Option<Box<dyn FnOnce() + Send>>,
    created: Instant,
}

impl Transaction {
    pub(crate) fn new(
        env: Environment,
        id: u64,
        readonly: bool,
        snapshot: Arc<MetaTree>,
        begin_hook: Option<Box<dyn Fn() + Send>>,
    ) -> Self {
        Self {
            env,
            id,
            readonly,
            state: TxnState::Active,
            snapshot,
            mutable_trees: BTreeMap::new(),
            created_stores: BTreeMap::new(),
            removed_stores: BTreeMap::new(),
            immutable_trees: Mutex::new(HashMap::new()),
            begin_hook,
            commit_hook: None,
            created: Instant::now(),
        }
    }

    /// The transaction's serial id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Root address of the pinned meta tree snapshot.
    #[must_use]
    pub fn snapshot_root(&self) -> u64 {
        self.snapshot.root()
    }

    /// Whether this transaction refuses writes.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Whether the transaction has been flushed or aborted.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state != TxnState::Active
    }

    /// True while the transaction has nothing to commit.
    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        self.mutable_trees.is_empty()
            && self.created_stores.is_empty()
            && self.removed_stores.is_empty()
    }

    /// When the transaction began.
    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Installs a callback to run under the meta lock when this
    /// transaction publishes its snapshot.
    pub fn set_commit_hook(&mut self, hook: Box<dyn FnOnce() + Send>) {
        self.commit_hook = Some(hook);
    }

    /// Makes the staged changes durable and visible.
    ///
    /// Returns `Ok(false)` when a concurrent committer advanced the meta
    /// tree past this transaction's snapshot; `revert` and retry. A
    /// transaction with nothing staged succeeds without touching the log.
    pub fn flush(&mut self) -> EnvResult<bool> {
        self.flush_inner(false)
    }

    /// Like [`Transaction::flush`], but commits even when idempotent,
    /// producing a fresh meta tree version.
    pub fn force_flush(&mut self) -> EnvResult<bool> {
        self.flush_inner(true)
    }

    fn flush_inner(&mut self, force: bool) -> EnvResult<bool> {
        self.ensure_active()?;
        let env = self.env.clone();
        let flushed = env.flush_transaction(self, force)?;
        if flushed {
            self.state = TxnState::Flushed;
            env.finish_transaction(self.id);
        }
        Ok(flushed)
    }

    /// Discards staged changes and reacquires a fresh snapshot.
    pub fn revert(&mut self) -> EnvResult<()> {
        self.ensure_active()?;
        let env = self.env.clone();
        env.check_is_operative()?;

        self.mutable_trees.clear();
        self.created_stores.clear();
        self.removed_stores.clear();
        self.immutable_trees.lock().clear();

        let snapshot = env.meta_snapshot(self.begin_hook.as_deref());
        self.snapshot = snapshot;
        env.reregister_transaction(self.id, self.snapshot.root());
        Ok(())
    }

    /// Finishes the transaction, discarding staged changes.
    ///
    /// Safe to call at any time; on a flushed or aborted transaction it is
    /// a no-op.
    pub fn abort(&mut self) {
        if self.state == TxnState::Active {
            self.state = TxnState::Aborted;
            let env = self.env.clone();
            env.finish_transaction(self.id);
        }
    }

    fn ensure_active(&self) -> EnvResult<()> {
        if self.state == TxnState::Active {
            Ok(())
        } else {
            Err(EnvError::TransactionFinished)
        }
    }

    fn check_writable(&self) -> EnvResult<()> {
        self.ensure_active()?;
        if self.readonly {
            Err(EnvError::Readonly)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Data access (through Store handles)
    // ------------------------------------------------------------------

    pub(crate) fn get_value(&self, store: &Store, key: &[u8]) -> EnvResult<Option<Vec<u8>>> {
        self.ensure_active()?;
        if let Some(tree) = self.mutable_trees.get(store.name()) {
            return Ok(tree.get(key).map(<[u8]>::to_vec));
        }
        if self.removed_stores.contains_key(store.name()) {
            return Ok(None);
        }
        let tree = self.snapshot_tree(store.structure_id())?;
        Ok(tree.get(key).map(<[u8]>::to_vec))
    }

    pub(crate) fn put_value(&mut self, store: &Store, key: Vec<u8>, value: Vec<u8>) -> EnvResult<()> {
        self.mutable_tree(store)?.put(key, value);
        Ok(())
    }

    pub(crate) fn delete_value(&mut self, store: &Store, key: &[u8]) -> EnvResult<bool> {
        Ok(self.mutable_tree(store)?.delete(key))
    }

    pub(crate) fn entries_of(&self, store: &Store) -> EnvResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_active()?;
        if let Some(tree) = self.mutable_trees.get(store.name()) {
            return Ok(tree.merged_entries().into_iter().collect());
        }
        if self.removed_stores.contains_key(store.name()) {
            return Ok(Vec::new());
        }
        let tree = self.snapshot_tree(store.structure_id())?;
        Ok(tree
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect())
    }

    /// Lazily materializes the store's mutable working copy and marks the
    /// transaction non-idempotent.
    fn mutable_tree(&mut self, store: &Store) -> EnvResult<&mut MutableTree> {
        self.check_writable()?;
        let name = store.name();
        if !self.mutable_trees.contains_key(name) {
            let base = if self.created_stores.contains_key(name) {
                Tree::empty(store.structure_id())
            } else {
                self.snapshot_tree(store.structure_id())?
            };
            self.mutable_trees
                .insert(name.to_string(), base.to_mutable());
        }
        Ok(self
            .mutable_trees
            .get_mut(name)
            .unwrap_or_else(|| unreachable!("tree materialized above")))
    }

    /// Loads (and caches) the snapshot tree with `structure_id`.
    fn snapshot_tree(&self, structure_id: u64) -> EnvResult<Tree> {
        if let Some(tree) = self.immutable_trees.lock().get(&structure_id) {
            return Ok(tree.clone());
        }
        let tree = match self.snapshot.tree_root(structure_id)? {
            Some(root) => Tree::load(self.env.log(), root)?,
            None => Tree::empty(structure_id),
        };
        self.immutable_trees
            .lock()
            .insert(structure_id, tree.clone());
        Ok(tree)
    }

    // ------------------------------------------------------------------
    // Store registry bookkeeping
    // ------------------------------------------------------------------

    /// Store metadata as visible to this transaction: local creations and
    /// removals shadow the snapshot.
    pub(crate) fn meta_info_local(&self, name: &str) -> EnvResult<Option<TreeMetaInfo>> {
        if let Some(info) = self.created_stores.get(name) {
            return Ok(Some(*info));
        }
        if self.removed_stores.contains_key(name) {
            return Ok(None);
        }
        self.snapshot.meta_info(name, self.env.string_binding())
    }

    /// Registers a store created in this transaction and materializes its
    /// empty working copy.
    pub(crate) fn store_created(&mut self, store: &Store) -> EnvResult<()> {
        self.check_writable()?;
        self.created_stores
            .insert(store.name().to_string(), store.meta_info());
        self.mutable_trees.insert(
            store.name().to_string(),
            MutableTree::empty(store.structure_id()),
        );
        Ok(())
    }

    /// Records removal of a store. The superseded tree's records expire
    /// when this transaction commits.
    pub(crate) fn store_removed(&mut self, store: &Store) -> EnvResult<()> {
        self.check_writable()?;
        let name = store.name();
        self.mutable_trees.remove(name);
        let locally_created = self.created_stores.remove(name).is_some();

        if self.removed_stores.contains_key(name) {
            // A truncate already recorded the original removal.
            return Ok(());
        }
        let Some(info) = self.snapshot.meta_info(name, self.env.string_binding())? else {
            debug_assert!(locally_created, "removal of a store that never existed");
            return Ok(());
        };
        let tree = self.snapshot_tree(info.structure_id)?;
        self.removed_stores.insert(
            name.to_string(),
            RemovedStore {
                structure_id: info.structure_id,
                expired: tree.sources().to_vec(),
            },
        );
        Ok(())
    }

    /// Store names visible to this transaction, sorted.
    pub(crate) fn visible_store_names(&self) -> EnvResult<Vec<String>> {
        let binding = self.env.string_binding();
        let mut names: BTreeSet<String> =
            self.snapshot.store_names(binding)?.into_iter().collect();
        for name in self.removed_stores.keys() {
            names.remove(name);
        }
        for name in self.created_stores.keys() {
            names.insert(name.clone());
        }
        Ok(names
            .into_iter()
            .filter(|name| !crate::gc::is_utilization_profile(name))
            .collect())
    }

    // ------------------------------------------------------------------
    // Commit machinery (called under the commit lock)
    // ------------------------------------------------------------------

    /// Appends every staged tree and a new meta tree version to the log.
    ///
    /// Returns the new meta tree and the loggables superseded by this
    /// commit. Runs under the commit lock; any error triggers the caller's
    /// high-address rollback.
    pub(crate) fn do_commit(
        &mut self,
        log: &Log,
        page_size: usize,
        binding: &StringBinding,
    ) -> EnvResult<(MetaTree, Vec<ExpiredLoggable>)> {
        let mut entries = self.snapshot.entries_snapshot();
        let mut expired = Vec::new();

        for (name, removed) in &self.removed_stores {
            entries.remove(&binding.string_to_entry(name));
            entries.remove(&u64_to_entry(removed.structure_id));
            expired.extend(removed.expired.iter().cloned());
        }

        for (name, info) in &self.created_stores {
            entries.insert(binding.string_to_entry(name), info.encode());
        }

        for tree in self.mutable_trees.values() {
            let commit = tree.commit(log, page_size)?;
            expired.extend(commit.expired);
            let root = commit
                .tree
                .root()
                .ok_or_else(|| LogError::corrupt(0, "committed tree has no root"))?;
            entries.insert(
                u64_to_entry(tree.structure_id()),
                root.to_le_bytes().to_vec(),
            );
        }

        // The old meta tree version is superseded as well. Its root is the
        // final record appended, keeping the newest meta root last in the
        // log.
        expired.extend(self.snapshot.sources().iter().cloned());
        let (meta_tree, _) = crate::tree::write_tree(log, META_TREE_ID, entries, page_size)?;
        Ok((MetaTree::from_tree(meta_tree)?, expired))
    }

    /// Repins the transaction to the meta tree it just published.
    pub(crate) fn set_snapshot(&mut self, snapshot: Arc<MetaTree>) {
        self.snapshot = snapshot;
        self.immutable_trees.lock().clear();
    }

    pub(crate) fn take_commit_hook(&mut self) -> Option<Box<dyn FnOnce() + Send>> {
        self.commit_hook.take()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("readonly", &self.readonly)
            .field("state", &self.state)
            .field("snapshot_root", &self.snapshot_root())
            .field("idempotent", &self.is_idempotent())
            .finish_non_exhaustive()
    }
}
