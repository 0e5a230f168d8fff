//! Store handles and per-store configuration.

use crate::error::EnvResult;
use crate::meta_tree::TreeMetaInfo;
use crate::transaction::Transaction;

/// Options for opening a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Whether the store keeps duplicate keys.
    pub duplicates: bool,
    /// Whether the store's tree uses key prefixing.
    pub prefixing: bool,
    /// Open only if the store exists, adopting its stored configuration.
    pub use_existing: bool,
}

impl StoreConfig {
    /// Plain store: unique keys, no prefixing.
    pub const WITHOUT_DUPLICATES: Self = Self {
        duplicates: false,
        prefixing: false,
        use_existing: false,
    };

    /// Duplicate keys allowed, no prefixing.
    pub const WITH_DUPLICATES: Self = Self {
        duplicates: true,
        prefixing: false,
        use_existing: false,
    };

    /// Unique keys with key prefixing.
    pub const WITHOUT_DUPLICATES_WITH_PREFIXING: Self = Self {
        duplicates: false,
        prefixing: true,
        use_existing: false,
    };

    /// Duplicate keys with key prefixing.
    pub const WITH_DUPLICATES_WITH_PREFIXING: Self = Self {
        duplicates: true,
        prefixing: true,
        use_existing: false,
    };

    /// Adopt whatever configuration the existing store was created with.
    pub const USE_EXISTING: Self = Self {
        duplicates: false,
        prefixing: false,
        use_existing: true,
    };
}

/// A handle to a named store.
///
/// The handle is cheap to clone and carries the store's resolved
/// metadata; all data access goes through a transaction.
#[derive(Debug, Clone)]
pub struct Store {
    name: String,
    meta: TreeMetaInfo,
}

impl Store {
    pub(crate) fn new(name: impl Into<String>, meta: TreeMetaInfo) -> Self {
        Self {
            name: name.into(),
            meta,
        }
    }

    /// The store's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store's resolved metadata.
    #[must_use]
    pub fn meta_info(&self) -> TreeMetaInfo {
        self.meta
    }

    /// Identity of the store's tree across snapshots.
    #[must_use]
    pub fn structure_id(&self) -> u64 {
        self.meta.structure_id
    }

    /// Whether the store keeps duplicate keys.
    #[must_use]
    pub fn has_duplicates(&self) -> bool {
        self.meta.duplicates
    }

    /// Whether the store's tree uses key prefixing.
    #[must_use]
    pub fn key_prefixing(&self) -> bool {
        self.meta.prefixing
    }

    /// Reads the value for `key` as seen by `txn`.
    pub fn get(&self, txn: &Transaction, key: &[u8]) -> EnvResult<Option<Vec<u8>>> {
        txn.get_value(self, key)
    }

    /// Writes `key -> value` into the transaction's working copy.
    pub fn put(&self, txn: &mut Transaction, key: Vec<u8>, value: Vec<u8>) -> EnvResult<()> {
        txn.put_value(self, key, value)
    }

    /// Deletes `key`, returning whether it was visible to `txn`.
    pub fn delete(&self, txn: &mut Transaction, key: &[u8]) -> EnvResult<bool> {
        txn.delete_value(self, key)
    }

    /// Number of entries as seen by `txn`.
    pub fn count(&self, txn: &Transaction) -> EnvResult<usize> {
        Ok(self.entries(txn)?.len())
    }

    /// All entries in key order, as seen by `txn`.
    pub fn entries(&self, txn: &Transaction) -> EnvResult<Vec<(Vec<u8>, Vec<u8>)>> {
        txn.entries_of(self)
    }
}
