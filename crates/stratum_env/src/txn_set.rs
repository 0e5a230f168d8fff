//! The set of live transactions.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

/// Bookkeeping for one live transaction.
#[derive(Debug, Clone)]
pub(crate) struct TxnInfo {
    /// Transaction serial.
    pub id: u64,
    /// Snapshot root the transaction is pinned to.
    pub root: u64,
    /// When the transaction began.
    pub created: Instant,
    /// Name of the creating thread, captured only when the stuck
    /// transaction monitor is enabled.
    pub thread: Option<String>,
}

#[derive(Default)]
struct SetInner {
    // (root, id) pairs give O(log n) oldest/newest-by-root queries.
    ordered: BTreeSet<(u64, u64)>,
    records: HashMap<u64, TxnInfo>,
}

/// Registry of live transactions, ordered by snapshot root.
///
/// `add` must tolerate re-insertion of an already registered transaction:
/// `revert` refreshes a transaction's snapshot root in place.
#[derive(Default)]
pub(crate) struct TransactionSet {
    inner: Mutex<SetInner>,
}

impl TransactionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transaction, or refreshes its root if already present.
    pub fn add(&self, info: TxnInfo) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.records.get(&info.id) {
            let stale = (existing.root, existing.id);
            inner.ordered.remove(&stale);
        }
        inner.ordered.insert((info.root, info.id));
        inner.records.insert(info.id, info);
    }

    /// Removes a transaction; removing an absent one is a no-op.
    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(info) = inner.records.remove(&id) {
            inner.ordered.remove(&(info.root, id));
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Smallest snapshot root among live transactions.
    pub fn oldest_root(&self) -> Option<u64> {
        self.inner.lock().ordered.first().map(|&(root, _)| root)
    }

    /// Largest snapshot root among live transactions.
    pub fn newest_root(&self) -> Option<u64> {
        self.inner.lock().ordered.last().map(|&(root, _)| root)
    }

    /// Copies out the live transaction records, for reporting.
    pub fn snapshot(&self) -> Vec<TxnInfo> {
        self.inner.lock().records.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u64, root: u64) -> TxnInfo {
        TxnInfo {
            id,
            root,
            created: Instant::now(),
            thread: None,
        }
    }

    #[test]
    fn empty_set_has_no_roots() {
        let set = TransactionSet::new();
        assert_eq!(set.len(), 0);
        assert!(set.oldest_root().is_none());
        assert!(set.newest_root().is_none());
    }

    #[test]
    fn tracks_oldest_and_newest() {
        let set = TransactionSet::new();
        set.add(info(1, 100));
        set.add(info(2, 300));
        set.add(info(3, 200));

        assert_eq!(set.len(), 3);
        assert_eq!(set.oldest_root(), Some(100));
        assert_eq!(set.newest_root(), Some(300));
    }

    #[test]
    fn remove_updates_bounds() {
        let set = TransactionSet::new();
        set.add(info(1, 100));
        set.add(info(2, 200));

        set.remove(1);
        assert_eq!(set.oldest_root(), Some(200));
        assert!(!set.contains(1));
        assert!(set.contains(2));

        // Removing twice is fine.
        set.remove(1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn reinsertion_refreshes_root_without_duplicates() {
        let set = TransactionSet::new();
        set.add(info(1, 100));
        set.add(info(2, 100));

        // A revert re-registers transaction 1 with a newer root.
        set.add(info(1, 500));

        assert_eq!(set.len(), 2);
        assert_eq!(set.oldest_root(), Some(100));
        assert_eq!(set.newest_root(), Some(500));

        set.remove(2);
        assert_eq!(set.oldest_root(), Some(500));
    }

    #[test]
    fn same_root_transactions_coexist() {
        let set = TransactionSet::new();
        set.add(info(1, 100));
        set.add(info(2, 100));
        assert_eq!(set.len(), 2);

        set.remove(1);
        assert_eq!(set.oldest_root(), Some(100));
    }
}
