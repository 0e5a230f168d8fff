//! Persistent ordered trees over the log.
//!
//! The environment core consumes trees through a narrow contract: an
//! immutable snapshot opened at a root address, and a mutable copy whose
//! commit yields the new root plus the records it superseded. This module
//! implements that contract as a flat persistent map; the page-balancing
//! internals of a full B-tree live below this layer and are not the
//! environment's concern.
//!
//! ## On-log layout
//!
//! A committed tree version is a group of loggables sharing the tree's
//! structure id: the serialized entry map split into chunks of at most the
//! configured page size, followed by a root loggable listing the chunk
//! addresses. The root is always the last loggable the version appends.
//! Committing a new version expires every loggable of the previous one.

use crate::error::EnvResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use stratum_log::{Log, LogError, Loggable};

/// A log record superseded by a later tree version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredLoggable {
    /// Address of the superseded record.
    pub address: u64,
    /// Total on-log footprint of the record in bytes.
    pub length: u64,
    /// Structure id of the tree the record belonged to.
    pub structure_id: u64,
}

impl ExpiredLoggable {
    fn of(loggable: &Loggable) -> Self {
        Self {
            address: loggable.address,
            length: loggable.encoded_len(),
            structure_id: loggable.structure_id,
        }
    }
}

/// Result of committing a mutable tree.
#[derive(Debug)]
pub struct TreeCommit {
    /// The newly durable snapshot.
    pub tree: Tree,
    /// Records of the superseded version.
    pub expired: Vec<ExpiredLoggable>,
}

/// An immutable tree snapshot.
///
/// Snapshots stay valid for as long as their backing loggables exist in
/// the log, which the environment guarantees while any transaction root
/// depends on them.
#[derive(Debug, Clone)]
pub struct Tree {
    structure_id: u64,
    root: Option<u64>,
    entries: Arc<BTreeMap<Vec<u8>, Vec<u8>>>,
    sources: Arc<Vec<ExpiredLoggable>>,
}

impl Tree {
    /// Creates an empty tree that has never been written to the log.
    #[must_use]
    pub fn empty(structure_id: u64) -> Self {
        Self {
            structure_id,
            root: None,
            entries: Arc::new(BTreeMap::new()),
            sources: Arc::new(Vec::new()),
        }
    }

    /// Loads the tree version rooted at `root`.
    pub fn load(log: &Log, root: u64) -> EnvResult<Self> {
        let root_loggable = log.read(root)?;
        let structure_id = root_loggable.structure_id;

        let chunk_addresses = decode_root(&root_loggable)?;
        let mut sources = Vec::with_capacity(chunk_addresses.len() + 1);
        let mut serialized = Vec::new();
        for address in chunk_addresses {
            let chunk = log.read(address)?;
            if chunk.structure_id != structure_id {
                return Err(LogError::corrupt(address, "tree chunk has foreign structure id").into());
            }
            serialized.extend_from_slice(&chunk.data);
            sources.push(ExpiredLoggable::of(&chunk));
        }
        sources.push(ExpiredLoggable::of(&root_loggable));

        let entries = decode_entries(root, &serialized)?;
        Ok(Self {
            structure_id,
            root: Some(root),
            entries: Arc::new(entries),
            sources: Arc::new(sources),
        })
    }

    /// Returns the tree's structure id.
    #[must_use]
    pub fn structure_id(&self) -> u64 {
        self.structure_id
    }

    /// Returns the root address, or `None` for a never-committed tree.
    #[must_use]
    pub fn root(&self) -> Option<u64> {
        self.root
    }

    /// Looks up a key.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the tree holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// The loggables this snapshot was loaded from; these expire when a
    /// newer version is committed.
    #[must_use]
    pub fn sources(&self) -> &[ExpiredLoggable] {
        &self.sources
    }

    pub(crate) fn entries(&self) -> &Arc<BTreeMap<Vec<u8>, Vec<u8>>> {
        &self.entries
    }

    /// Copies this snapshot with its own detached entry map.
    #[must_use]
    pub(crate) fn detached_copy(&self) -> Tree {
        Tree {
            structure_id: self.structure_id,
            root: self.root,
            entries: Arc::new((*self.entries).clone()),
            sources: Arc::new(self.sources.to_vec()),
        }
    }

    /// Starts a mutable copy of this snapshot.
    #[must_use]
    pub fn to_mutable(&self) -> MutableTree {
        MutableTree {
            structure_id: self.structure_id,
            base: self.clone(),
            staged: BTreeMap::new(),
        }
    }
}

/// A copy-on-write working copy of a tree.
///
/// Changes stay in memory until [`MutableTree::commit`] appends a new
/// version to the log.
#[derive(Debug)]
pub struct MutableTree {
    structure_id: u64,
    base: Tree,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl MutableTree {
    /// Creates a mutable tree over an empty base.
    #[must_use]
    pub fn empty(structure_id: u64) -> Self {
        Tree::empty(structure_id).to_mutable()
    }

    /// Returns the tree's structure id.
    #[must_use]
    pub fn structure_id(&self) -> u64 {
        self.structure_id
    }

    /// Stages an insert or update.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.staged.insert(key, Some(value));
    }

    /// Stages a deletion, returning whether the key was visible.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let existed = self.get(key).is_some();
        if existed {
            self.staged.insert(key.to_vec(), None);
        }
        existed
    }

    /// Looks up a key through the staged overlay.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        match self.staged.get(key) {
            Some(Some(value)) => Some(value.as_slice()),
            Some(None) => None,
            None => self.base.get(key),
        }
    }

    /// Returns true when no changes have been staged.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.staged.is_empty()
    }

    /// Returns the merged entry map as it would be after commit.
    #[must_use]
    pub fn merged_entries(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut merged = (**self.base.entries()).clone();
        for (key, change) in &self.staged {
            match change {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged
    }

    /// Appends this version to the log.
    ///
    /// Returns the durable snapshot and the loggables of the version it
    /// supersedes (empty when the base was never committed).
    pub fn commit(&self, log: &Log, max_page_size: usize) -> EnvResult<TreeCommit> {
        let merged = self.merged_entries();
        let (tree, _) = write_tree(log, self.structure_id, merged, max_page_size)?;

        let expired = if self.base.root().is_some() {
            self.base.sources().to_vec()
        } else {
            Vec::new()
        };
        Ok(TreeCommit { tree, expired })
    }
}

/// Serializes `entries` as a new tree version and appends it.
pub(crate) fn write_tree(
    log: &Log,
    structure_id: u64,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    max_page_size: usize,
) -> EnvResult<(Tree, u64)> {
    let serialized = encode_entries(&entries);
    let page_size = max_page_size.max(1);

    // An empty entry map still serializes to its length prefix, so there
    // is always at least one chunk.
    let mut chunk_addresses = Vec::new();
    let mut sources = Vec::new();
    for chunk in serialized.chunks(page_size) {
        let address = log.append(structure_id, chunk)?;
        chunk_addresses.push(address);
        sources.push(ExpiredLoggable {
            address,
            length: Loggable::encoded_len_for(chunk.len()),
            structure_id,
        });
    }

    let mut root_payload = Vec::with_capacity(4 + chunk_addresses.len() * 8);
    root_payload.extend_from_slice(&(chunk_addresses.len() as u32).to_le_bytes());
    for address in &chunk_addresses {
        root_payload.extend_from_slice(&address.to_le_bytes());
    }
    let root = log.append(structure_id, &root_payload)?;
    sources.push(ExpiredLoggable {
        address: root,
        length: Loggable::encoded_len_for(root_payload.len()),
        structure_id,
    });

    let tree = Tree {
        structure_id,
        root: Some(root),
        entries: Arc::new(entries),
        sources: Arc::new(sources),
    };
    Ok((tree, root))
}

fn encode_entries(entries: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (key, value) in entries {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value);
    }
    buf
}

fn decode_root(root: &Loggable) -> EnvResult<Vec<u64>> {
    let data = &root.data;
    if data.len() < 4 {
        return Err(LogError::corrupt(root.address, "tree root too short").into());
    }
    let count = u32::from_le_bytes(data[0..4].try_into().unwrap_or([0; 4])) as usize;
    if data.len() != 4 + count * 8 {
        return Err(LogError::corrupt(root.address, "tree root has wrong length").into());
    }

    let mut addresses = Vec::with_capacity(count);
    for i in 0..count {
        let start = 4 + i * 8;
        let bytes: [u8; 8] = data[start..start + 8].try_into().unwrap_or([0; 8]);
        addresses.push(u64::from_le_bytes(bytes));
    }
    Ok(addresses)
}

fn decode_entries(root_address: u64, data: &[u8]) -> EnvResult<BTreeMap<Vec<u8>, Vec<u8>>> {
    let corrupt = || LogError::corrupt(root_address, "malformed tree payload");

    if data.len() < 4 {
        return Err(corrupt().into());
    }
    let count = u32::from_le_bytes(data[0..4].try_into().unwrap_or([0; 4])) as usize;
    let mut cursor = 4;
    let mut entries = BTreeMap::new();

    for _ in 0..count {
        let key = read_blob(data, &mut cursor).ok_or_else(corrupt)?;
        let value = read_blob(data, &mut cursor).ok_or_else(corrupt)?;
        entries.insert(key, value);
    }
    if cursor != data.len() {
        return Err(corrupt().into());
    }
    Ok(entries)
}

fn read_blob(data: &[u8], cursor: &mut usize) -> Option<Vec<u8>> {
    let len_end = cursor.checked_add(4)?;
    if len_end > data.len() {
        return None;
    }
    let len = u32::from_le_bytes(data[*cursor..len_end].try_into().ok()?) as usize;
    let end = len_end.checked_add(len)?;
    if end > data.len() {
        return None;
    }
    let blob = data[len_end..end].to_vec();
    *cursor = end;
    Some(blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_log::MemoryBackend;

    fn create_log() -> Log {
        Log::new(Box::new(MemoryBackend::new())).unwrap()
    }

    #[test]
    fn empty_tree_has_no_root() {
        let tree = Tree::empty(2);
        assert!(tree.root().is_none());
        assert!(tree.is_empty());
        assert!(tree.sources().is_empty());
    }

    #[test]
    fn commit_then_load_round_trips() {
        let log = create_log();
        let mut mutable = MutableTree::empty(2);
        mutable.put(b"alpha".to_vec(), b"1".to_vec());
        mutable.put(b"beta".to_vec(), b"2".to_vec());

        let commit = mutable.commit(&log, 4096).unwrap();
        assert!(commit.expired.is_empty());

        let loaded = Tree::load(&log, commit.tree.root().unwrap()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(b"alpha"), Some(b"1".as_slice()));
        assert_eq!(loaded.get(b"beta"), Some(b"2".as_slice()));
    }

    #[test]
    fn overlay_shadows_base() {
        let log = create_log();
        let mut mutable = MutableTree::empty(2);
        mutable.put(b"k".to_vec(), b"old".to_vec());
        let base = mutable.commit(&log, 4096).unwrap().tree;

        let mut next = base.to_mutable();
        assert_eq!(next.get(b"k"), Some(b"old".as_slice()));
        next.put(b"k".to_vec(), b"new".to_vec());
        assert_eq!(next.get(b"k"), Some(b"new".as_slice()));
        // The snapshot is untouched.
        assert_eq!(base.get(b"k"), Some(b"old".as_slice()));
    }

    #[test]
    fn delete_is_visible_in_overlay_only() {
        let log = create_log();
        let mut mutable = MutableTree::empty(2);
        mutable.put(b"k".to_vec(), b"v".to_vec());
        let base = mutable.commit(&log, 4096).unwrap().tree;

        let mut next = base.to_mutable();
        assert!(next.delete(b"k"));
        assert!(!next.delete(b"k"));
        assert!(next.get(b"k").is_none());
        assert_eq!(base.get(b"k"), Some(b"v".as_slice()));
    }

    #[test]
    fn second_commit_expires_first_version() {
        let log = create_log();
        let mut mutable = MutableTree::empty(2);
        mutable.put(b"k".to_vec(), b"v1".to_vec());
        let first = mutable.commit(&log, 4096).unwrap().tree;

        let mut next = first.to_mutable();
        next.put(b"k".to_vec(), b"v2".to_vec());
        let second = next.commit(&log, 4096).unwrap();

        assert_eq!(second.expired, first.sources().to_vec());
        assert!(second.tree.root().unwrap() > first.root().unwrap());
    }

    #[test]
    fn small_page_size_produces_chunked_versions() {
        let log = create_log();
        let mut mutable = MutableTree::empty(2);
        for i in 0..20u8 {
            mutable.put(vec![i], vec![i; 16]);
        }

        let commit = mutable.commit(&log, 32).unwrap();
        // Root + more than one chunk.
        assert!(commit.tree.sources().len() > 2);

        let loaded = Tree::load(&log, commit.tree.root().unwrap()).unwrap();
        assert_eq!(loaded.len(), 20);
        assert_eq!(loaded.get(&[7]), Some([7u8; 16].as_slice()));
    }

    #[test]
    fn unchanged_commit_reports_previous_version_expired() {
        // A forced rewrite of an unchanged tree still supersedes the old
        // version's loggables.
        let log = create_log();
        let mut mutable = MutableTree::empty(2);
        mutable.put(b"k".to_vec(), b"v".to_vec());
        let first = mutable.commit(&log, 4096).unwrap().tree;

        let rewrite = first.to_mutable().commit(&log, 4096).unwrap();
        assert_eq!(rewrite.expired.len(), first.sources().len());
    }

    #[test]
    fn is_unchanged_tracks_staging() {
        let mut mutable = MutableTree::empty(2);
        assert!(mutable.is_unchanged());
        mutable.put(b"k".to_vec(), b"v".to_vec());
        assert!(!mutable.is_unchanged());
    }

    #[test]
    fn load_rejects_foreign_chunk() {
        let log = create_log();
        // Craft a root that points at a chunk of another structure.
        let chunk = log.append(9, &encode_entries(&BTreeMap::new())).unwrap();
        let mut root_payload = Vec::new();
        root_payload.extend_from_slice(&1u32.to_le_bytes());
        root_payload.extend_from_slice(&chunk.to_le_bytes());
        let root = log.append(2, &root_payload).unwrap();

        assert!(Tree::load(&log, root).is_err());
    }

    #[test]
    fn iterates_in_key_order() {
        let log = create_log();
        let mut mutable = MutableTree::empty(2);
        mutable.put(b"c".to_vec(), b"3".to_vec());
        mutable.put(b"a".to_vec(), b"1".to_vec());
        mutable.put(b"b".to_vec(), b"2".to_vec());
        let tree = mutable.commit(&log, 4096).unwrap().tree;

        let keys: Vec<&[u8]> = tree.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b", b"c"]);
    }
}
