//! The meta tree: store names mapped to their metadata and roots.
//!
//! The meta tree is itself a tree, rooted at a well-known structure id.
//! Its key space holds two families that can never collide:
//!
//! - store-name keys, zero-terminated string entries, mapping to encoded
//!   [`TreeMetaInfo`]
//! - 8-byte big-endian structure-id keys (low byte never zero, so never
//!   zero-terminated), mapping to that tree's current root address
//!
//! Every successful commit appends a new meta tree version; the root of
//! that version is the snapshot root transactions are pinned to.

use crate::error::{EnvError, EnvResult};
use crate::tree::{ExpiredLoggable, Tree};
use std::collections::BTreeMap;
use std::sync::Arc;
use stratum_bindings::{entry_to_u64, u64_to_entry, StringBinding};
use stratum_log::{Log, LogError};

/// Structure id reserved for the meta tree itself.
pub const META_TREE_ID: u64 = 1;

/// Per-store descriptor kept in the meta tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeMetaInfo {
    /// Identity of the store's tree across snapshots. Always positive,
    /// low byte never zero.
    pub structure_id: u64,
    /// Whether the store allows duplicate keys.
    pub duplicates: bool,
    /// Whether the store's tree uses key prefixing.
    pub prefixing: bool,
}

const FLAG_DUPLICATES: u8 = 0x01;
const FLAG_PREFIXING: u8 = 0x02;

impl TreeMetaInfo {
    /// Encodes the descriptor: one flag byte plus the big-endian id.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.duplicates {
            flags |= FLAG_DUPLICATES;
        }
        if self.prefixing {
            flags |= FLAG_PREFIXING;
        }
        let mut entry = Vec::with_capacity(9);
        entry.push(flags);
        entry.extend_from_slice(&self.structure_id.to_be_bytes());
        entry
    }

    /// Decodes a descriptor entry.
    pub fn decode(entry: &[u8]) -> EnvResult<Self> {
        if entry.len() != 9 {
            return Err(EnvError::Binding(
                stratum_bindings::BindingError::WrongLength {
                    expected: 9,
                    actual: entry.len(),
                },
            ));
        }
        let flags = entry[0];
        let structure_id = entry_to_u64(&entry[1..])?;
        Ok(Self {
            structure_id,
            duplicates: flags & FLAG_DUPLICATES != 0,
            prefixing: flags & FLAG_PREFIXING != 0,
        })
    }
}

/// An immutable snapshot of the store registry.
///
/// Replaced atomically on every successful write commit; transactions pin
/// the snapshot they began against for their whole lifetime.
#[derive(Debug, Clone)]
pub struct MetaTree {
    root: u64,
    tree: Tree,
}

impl MetaTree {
    /// Builds the current meta tree from the log.
    ///
    /// The newest `META_TREE_ID` loggable is the root of the latest meta
    /// version, because the meta root is the final record every commit
    /// appends. An empty log gets an empty meta tree written to it first,
    /// so every environment has a durable root from the start.
    ///
    /// Returns the snapshot and the highest structure id in use.
    pub fn create(log: &Log, max_page_size: usize) -> EnvResult<(Arc<Self>, u64)> {
        let tree = match log.last_loggable_with_id(META_TREE_ID)? {
            Some(root_loggable) => Tree::load(log, root_loggable.address)?,
            None => {
                let (tree, _) =
                    crate::tree::write_tree(log, META_TREE_ID, BTreeMap::new(), max_page_size)?;
                tree
            }
        };
        let root = tree
            .root()
            .ok_or_else(|| LogError::corrupt(0, "meta tree has no root"))?;

        let mut last_structure_id = META_TREE_ID;
        for (key, value) in tree.iter() {
            if is_name_key(key) {
                let info = TreeMetaInfo::decode(value)?;
                last_structure_id = last_structure_id.max(info.structure_id);
            }
        }

        Ok((Arc::new(Self { root, tree }), last_structure_id))
    }

    /// Loads the meta tree version at `address`.
    ///
    /// Returns `None` when the address lies at or beyond the log's
    /// high-water mark.
    pub fn load(log: &Log, address: u64) -> EnvResult<Option<Self>> {
        if address >= log.high_address() {
            return Ok(None);
        }
        let tree = Tree::load(log, address)?;
        Ok(Some(Self {
            root: address,
            tree,
        }))
    }

    pub(crate) fn from_tree(tree: Tree) -> EnvResult<Self> {
        let root = tree
            .root()
            .ok_or_else(|| LogError::corrupt(0, "meta tree has no root"))?;
        Ok(Self { root, tree })
    }

    /// Root address of this snapshot.
    #[must_use]
    pub fn root(&self) -> u64 {
        self.root
    }

    /// Looks up the descriptor of a named store.
    pub fn meta_info(&self, name: &str, binding: &StringBinding) -> EnvResult<Option<TreeMetaInfo>> {
        let key = binding.string_to_entry(name);
        match self.tree.get(&key) {
            Some(entry) => Ok(Some(TreeMetaInfo::decode(entry)?)),
            None => Ok(None),
        }
    }

    /// Returns the current root address of the tree with `structure_id`.
    pub fn tree_root(&self, structure_id: u64) -> EnvResult<Option<u64>> {
        let key = u64_to_entry(structure_id);
        match self.tree.get(&key) {
            Some(entry) => {
                let bytes: [u8; 8] =
                    entry
                        .try_into()
                        .map_err(|_| LogError::corrupt(self.root, "malformed tree root entry"))?;
                Ok(Some(u64::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Returns the names of all registered stores.
    pub fn store_names(&self, binding: &StringBinding) -> EnvResult<Vec<String>> {
        let mut names = Vec::new();
        for (key, _) in self.tree.iter() {
            if is_name_key(key) {
                names.push(binding.entry_to_string(key)?.to_string());
            }
        }
        Ok(names)
    }

    /// Clones the underlying entry map for building the next version.
    #[must_use]
    pub(crate) fn entries_snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        (**self.tree.entries()).clone()
    }

    /// The loggables backing this snapshot; superseded by the next commit.
    #[must_use]
    pub fn sources(&self) -> &[ExpiredLoggable] {
        self.tree.sources()
    }

    /// Deep-clones the snapshot, detaching its entry map.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        Self {
            root: self.root,
            tree: self.tree.detached_copy(),
        }
    }
}

/// True for store-name keys, which always end with the zero terminator.
fn is_name_key(key: &[u8]) -> bool {
    key.last() == Some(&0)
}
