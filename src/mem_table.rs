//! An in-memory, sorted, versioned key-value map backed by a WAL, plus a
//! self-referential range iterator.
//!
//! Grounded in `examples/CrystalAnalyst-Lsm/src/mem_table.rs`'s
//! `crossbeam_skiplist::SkipMap` + `ouroboros::self_referencing` pattern,
//! generalized from the teacher's single-timestamp `ts` field to this
//! crate's `(version, seq)` pair and extended with an on-demand Merkle root
//! over the table's current contents so unflushed writes are provable too.

#![allow(dead_code)]

use bytes::Bytes;
use crossbeam_skiplist::map::Entry;
use crossbeam_skiplist::SkipMap;
use ouroboros::self_referencing;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::error::Result;
use crate::hash::{leaf_hash, Hash, MerkleProof, MerkleTree};
use crate::iterators::StorageIterator;
use crate::key::{EntryKind, KeyBytes, KeySlice, KeyVec};
use crate::table::SsTableBuilder;
use crate::wal::Wal;

pub(crate) fn map_bound(bound: Bound<&[u8]>) -> Bound<Bytes> {
    match bound {
        Bound::Included(x) => Bound::Included(Bytes::copy_from_slice(x)),
        Bound::Excluded(x) => Bound::Excluded(Bytes::copy_from_slice(x)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

pub(crate) fn map_key_bound(bound: Bound<KeySlice<'_>>) -> Bound<KeyBytes> {
    match bound {
        Bound::Included(x) => Bound::Included(x.to_key_vec().to_key_bytes()),
        Bound::Excluded(x) => Bound::Excluded(x.to_key_vec().to_key_bytes()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// An in-memory table of versioned internal keys. Every stored key already
/// carries its `(version, seq, kind)` trailer, so tombstones live in-map as
/// ordinary entries with an empty value and `EntryKind::Del`.
pub struct MemTable {
    pub(crate) map: Arc<SkipMap<KeyBytes, Bytes>>,
    id: usize,
    approximate_size: Arc<AtomicUsize>,
    wal: Option<Wal>,
}

impl MemTable {
    pub fn create(id: usize) -> Self {
        Self {
            id,
            map: Arc::new(SkipMap::new()),
            approximate_size: Arc::new(AtomicUsize::new(0)),
            wal: None,
        }
    }

    pub fn create_with_wal(id: usize, path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            id,
            wal: Some(Wal::create(path)?),
            map: Arc::new(SkipMap::new()),
            approximate_size: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Replays `path`'s WAL into a fresh in-memory map, promoting each
    /// legacy 8-byte-trailer record to `version = 0` as it is inserted.
    pub fn recover_from_wal(id: usize, path: impl AsRef<Path>) -> Result<Self> {
        let map = Arc::new(SkipMap::new());
        let approximate_size = Arc::new(AtomicUsize::new(0));
        let wal = Wal::recover(path, &map, &approximate_size)?;
        Ok(Self {
            id,
            wal: Some(wal),
            map,
            approximate_size,
        })
    }

    /// Seeks to the first stored entry `>= seek_key` in total order,
    /// returning its full internal key and value. The caller checks
    /// `user_key` equality after decode (§4.3's `get(seek_key)` contract).
    pub fn seek(&self, seek_key: KeySlice<'_>) -> Option<(KeyBytes, Bytes)> {
        let lower = seek_key.to_key_vec().to_key_bytes();
        self.map
            .range((Bound::Included(lower), Bound::Unbounded))
            .next()
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    pub fn scan(&self, lower: Bound<KeySlice<'_>>, upper: Bound<KeySlice<'_>>) -> MemTableIterator {
        let (lower, upper) = (map_key_bound(lower), map_key_bound(upper));
        let mut iter = MemTableIteratorBuilder {
            map: self.map.clone(),
            iter_builder: |map| map.range((lower, upper)),
            item: (KeyBytes::empty(), Bytes::new()),
        }
        .build();
        iter.next().unwrap();
        iter
    }

    /// Writes the WAL record first, then the in-memory entry, matching the
    /// teacher's crash-safety ordering.
    pub fn put(&self, key: KeySlice<'_>, value: &[u8]) -> Result<()> {
        if let Some(ref wal) = self.wal {
            wal.put(key.raw_ref(), value)?;
        }
        let estimated_size = key.len() + value.len();
        self.map.insert(
            key.to_key_vec().to_key_bytes(),
            Bytes::copy_from_slice(value),
        );
        self.approximate_size
            .fetch_add(estimated_size, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Flushes every entry — including tombstones — into a table builder.
    /// Every version is preserved; compaction, not flush, is where
    /// version-aware pruning happens.
    pub fn flush(&self, builder: &mut SsTableBuilder) -> Result<()> {
        for entry in self.map.iter() {
            builder.add(entry.key().as_key_slice(), &entry.value()[..]);
        }
        Ok(())
    }

    pub fn sync_wal(&self) -> Result<()> {
        if let Some(ref wal) = self.wal {
            wal.sync()?;
        }
        Ok(())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(AtomicOrdering::Relaxed)
    }

    /// Builds a Merkle tree over the table's current non-tombstone entries
    /// so unflushed writes can be included in a MasterRoot and proved
    /// before the next flush. `None` when the table holds no live values.
    pub fn merkle_tree(&self) -> Option<MerkleTree> {
        let leaves: Vec<Hash> = self
            .map
            .iter()
            .filter(|e| e.key().kind() != EntryKind::Del)
            .map(|e| leaf_hash(e.key().user_key(), e.key().version(), e.value()))
            .collect();
        MerkleTree::build(leaves)
    }

    /// Builds the Merkle inclusion proof for `(user_key, version)`'s leaf in
    /// this table's snapshot, or `None` if the entry is absent, tombstoned,
    /// or the table has no live entries at all.
    pub fn merkle_proof_for(&self, user_key: &[u8], version: u64) -> Option<MerkleProof> {
        let mut target = None;
        let mut leaves = Vec::new();
        for (i, e) in self
            .map
            .iter()
            .filter(|e| e.key().kind() != EntryKind::Del)
            .enumerate()
        {
            if e.key().user_key() == user_key && e.key().version() == version {
                target = Some(i);
            }
            leaves.push(leaf_hash(e.key().user_key(), e.key().version(), e.value()));
        }
        let tree = MerkleTree::build(leaves)?;
        tree.proof_for(target?)
    }
}

type SkipMapRangeIter<'a> = crossbeam_skiplist::map::Range<
    'a,
    KeyBytes,
    (Bound<KeyBytes>, Bound<KeyBytes>),
    KeyBytes,
    Bytes,
>;

#[self_referencing]
pub struct MemTableIterator {
    map: Arc<SkipMap<KeyBytes, Bytes>>,

    #[borrows(map)]
    #[not_covariant]
    iter: SkipMapRangeIter<'this>,

    item: (KeyBytes, Bytes),
}

impl MemTableIterator {
    fn entry_to_item(entry: Option<Entry<'_, KeyBytes, Bytes>>) -> (KeyBytes, Bytes) {
        entry
            .map(|x| (x.key().clone(), x.value().clone()))
            .unwrap_or_else(|| (KeyBytes::empty(), Bytes::new()))
    }
}

impl StorageIterator for MemTableIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice<'_> {
        self.borrow_item().0.as_key_slice()
    }

    fn value(&self) -> &[u8] {
        &self.borrow_item().1[..]
    }

    fn is_valid(&self) -> bool {
        !self.borrow_item().0.is_empty()
    }

    fn next(&mut self) -> Result<()> {
        let entry = self.with_iter_mut(|iter| MemTableIterator::entry_to_item(iter.next()));
        self.with_mut(|x| *x.item = entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::VMAX;

    #[test]
    fn put_then_seek_returns_latest_version() {
        let mt = MemTable::create(0);
        mt.put(
            KeyVec::encode(b"k", 1, 1, EntryKind::Val).as_key_slice(),
            b"v1",
        )
        .unwrap();
        mt.put(
            KeyVec::encode(b"k", 2, 2, EntryKind::Val).as_key_slice(),
            b"v2",
        )
        .unwrap();
        let probe = KeyVec::seek_latest(b"k", VMAX);
        let (found_key, value) = mt.seek(probe.as_key_slice()).unwrap();
        assert_eq!(found_key.user_key(), b"k");
        assert_eq!(&value[..], b"v2");
    }

    #[test]
    fn tombstone_is_stored_as_its_own_entry() {
        let mt = MemTable::create(0);
        mt.put(
            KeyVec::encode(b"k", 1, 1, EntryKind::Val).as_key_slice(),
            b"v1",
        )
        .unwrap();
        mt.put(
            KeyVec::encode(b"k", 1, 2, EntryKind::Del).as_key_slice(),
            b"",
        )
        .unwrap();
        assert_eq!(mt.map.len(), 2);
    }

    #[test]
    fn merkle_tree_excludes_tombstones() {
        let mt = MemTable::create(0);
        mt.put(
            KeyVec::encode(b"a", 1, 1, EntryKind::Val).as_key_slice(),
            b"1",
        )
        .unwrap();
        mt.put(
            KeyVec::encode(b"b", 1, 2, EntryKind::Del).as_key_slice(),
            b"",
        )
        .unwrap();
        let tree = mt.merkle_tree().unwrap();
        assert_eq!(tree.leaf_count(), 1);
    }
}
