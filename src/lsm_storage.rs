//! The storage engine: the versioned query plane (component H) and the
//! mutable `LsmStorageState` (component F/G's home) that memtables, flush,
//! and compaction all operate on.
//!
//! Grounded in `examples/CrystalAnalyst-Lsm/src/lsm_storage.rs`'s
//! `RwLock<Arc<LsmStroageState>>` + copy-on-write-snapshot shape; `get` is
//! generalized from single-version byte-key lookup to the seek-key design in
//! `key.rs` (`KeyVec::seek_latest`/`seek_at` embed the query's `version` and
//! the reader's `seq` so a single forward `range`/`create_and_seek_to_key`
//! scan both finds the right version and enforces snapshot isolation, since
//! any write committed after the snapshot sorts *before* the seek key and is
//! skipped automatically). `scan`, `write_batch`'s freeze trigger, and every
//! background-thread hookup (`open`, `force_flush_next_imm_memtable`) were
//! `todo!()` in the teacher and are implemented here.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    ops::Bound,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::info;

use crate::{
    block::Block,
    compact::{CompactionController, CompactionOptions, LeveledCompactionController},
    error::{Error, Result},
    hash::Hash,
    iterators::{
        concat_iterator::SstConcatIterator, merge_iterator::MergeIterator,
        two_merge_iterator::TwoMergeIterator, StorageIterator,
    },
    key::{KeyBytes, KeySlice, KeyVec},
    lsm_iterator::{FusedIterator, LsmIterator, LsmIteratorInner},
    manifest::{Manifest, ManifestRecord},
    master_root,
    mem_table::MemTable,
    proof::DBProof,
    snapshot::{Snapshot, SnapshotTracker},
    table::{builder::SsTableBuilder, iterator::SsTableIterator, FileObject, SsTable},
};

/// BlockCache for `read block from disk`, shared across every open SSTable.
pub type BlockCache = moka::sync::Cache<(usize, usize), Arc<Block>>;

/// The engine's current `Version`: which memtables and tables exist and
/// where. Replaced wholesale (copy-on-write) on every mutation, so readers
/// holding an `Arc<LsmStorageState>` snapshot never observe a torn update.
#[derive(Clone)]
pub struct LsmStorageState {
    pub memtable: Arc<MemTable>,
    /// Frozen memtables awaiting flush, newest first.
    pub imm_memtables: Vec<Arc<MemTable>>,
    /// L0 table ids, newest first.
    pub l0_sstables: Vec<usize>,
    /// `(level, table_ids)`, table ids ordered by ascending first key.
    pub levels: Vec<(usize, Vec<usize>)>,
    pub sstables: HashMap<usize, Arc<SsTable>>,
}

impl LsmStorageState {
    pub(crate) fn create(options: &LsmStorageOptions) -> Self {
        let mut levels = Vec::new();
        if let CompactionOptions::Leveled(opts) = &options.compaction_options {
            for level in 1..=opts.max_levels {
                levels.push((level, Vec::new()));
            }
        }
        Self {
            memtable: Arc::new(MemTable::create(0)),
            imm_memtables: Vec::new(),
            l0_sstables: Vec::new(),
            levels,
            sstables: HashMap::new(),
        }
    }
}

/// Configurable options for an open engine.
#[derive(Clone, Debug)]
pub struct LsmStorageOptions {
    pub block_size: usize,
    pub target_sst_size: usize,
    /// A memtable is frozen once its approximate size reaches this bound.
    pub memtable_size_limit: usize,
    /// Writers block (§5's backpressure) once this many frozen memtables are
    /// waiting on flush.
    pub max_memtable_limit: usize,
    pub compaction_options: CompactionOptions,
    pub enable_wal: bool,
}

impl Default for LsmStorageOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            target_sst_size: 2 << 20,
            memtable_size_limit: 4 << 20,
            max_memtable_limit: 8,
            compaction_options: CompactionOptions::NoCompaction,
            enable_wal: true,
        }
    }
}

#[derive(Clone, Debug)]
pub enum CompactionFilter {
    Prefix(Bytes),
}

pub(crate) fn key_within(user_key: &[u8], table_begin: KeySlice<'_>, table_end: KeySlice<'_>) -> bool {
    table_begin.user_key() <= user_key && user_key <= table_end.user_key()
}

/// Where a resolved point-lookup hit actually lives, needed only to build a
/// [`DBProof`]'s `layer`/`master` components (§4.8).
enum HitLayer {
    Memtable,
    Level { level: usize, table_id: usize },
}

struct Hit {
    key: KeyBytes,
    value: Bytes,
    layer: HitLayer,
}

pub(crate) struct LsmStorageInner {
    pub(crate) state: Arc<RwLock<Arc<LsmStorageState>>>,
    pub(crate) state_lock: Mutex<()>,
    write_lock: Mutex<()>,
    pub(crate) path: PathBuf,
    pub(crate) block_cache: Arc<BlockCache>,
    next_sst_id: AtomicUsize,
    pub(crate) options: Arc<LsmStorageOptions>,
    pub(crate) compaction_controller: CompactionController,
    pub(crate) manifest: Option<Manifest>,
    pub(crate) compaction_filters: Arc<Mutex<Vec<CompactionFilter>>>,
    pub(crate) snapshots: SnapshotTracker,
    background_error: Mutex<Option<String>>,
}

impl LsmStorageInner {
    fn check_background_error(&self) -> Result<()> {
        if let Some(msg) = self.background_error.lock().clone() {
            return Err(Error::ReadOnly(msg));
        }
        Ok(())
    }

    pub(crate) fn set_background_error(&self, msg: impl Into<String>) {
        *self.background_error.lock() = Some(msg.into());
    }

    /// `memtable` (or the provable frozen memtable, see [`Self::resolve`])
    /// checked first, then L0 (merged, newest-first), then each level
    /// (concatenated, ascending). The first layer with a matching user key
    /// wins, even if it is a tombstone — that is this system's version of
    /// "the write history shadows older writes" (§4.3).
    fn resolve(
        &self,
        state: &LsmStorageState,
        user_key: &[u8],
        seek: &KeyVec,
        restrict_to_provable_memtable: bool,
    ) -> Result<Option<Hit>> {
        let seek_slice = seek.as_key_slice();

        if restrict_to_provable_memtable {
            if let Some(mt) = Self::provable_memtable(state) {
                if let Some((k, v)) = mt.seek(seek_slice) {
                    if k.user_key() == user_key {
                        return Ok(Some(Hit {
                            key: k,
                            value: v,
                            layer: HitLayer::Memtable,
                        }));
                    }
                }
            }
        } else {
            if let Some((k, v)) = state.memtable.seek(seek_slice) {
                if k.user_key() == user_key {
                    return Ok(Some(Hit {
                        key: k,
                        value: v,
                        layer: HitLayer::Memtable,
                    }));
                }
            }
            for imm in &state.imm_memtables {
                if let Some((k, v)) = imm.seek(seek_slice) {
                    if k.user_key() == user_key {
                        return Ok(Some(Hit {
                            key: k,
                            value: v,
                            layer: HitLayer::Memtable,
                        }));
                    }
                }
            }
        }

        if let Some((table_id, k, v)) =
            self.resolve_in_tables(state, &state.l0_sstables, user_key, seek_slice, false)?
        {
            return Ok(Some(Hit {
                key: k,
                value: v,
                layer: HitLayer::Level { level: 0, table_id },
            }));
        }

        for (level, ids) in &state.levels {
            if ids.is_empty() {
                continue;
            }
            if let Some((table_id, k, v)) =
                self.resolve_in_tables(state, ids, user_key, seek_slice, true)?
            {
                return Ok(Some(Hit {
                    key: k,
                    value: v,
                    layer: HitLayer::Level {
                        level: *level,
                        table_id,
                    },
                }));
            }
        }

        Ok(None)
    }

    /// `l0_sstables` overlap in key range, so every bloom-admitted candidate
    /// must be probed and the winner taken by total order (the smallest
    /// matching internal key at this user key). A level's tables never
    /// overlap, so at most one table can ever match.
    fn resolve_in_tables(
        &self,
        state: &LsmStorageState,
        ids: &[usize],
        user_key: &[u8],
        seek: KeySlice<'_>,
        non_overlapping: bool,
    ) -> Result<Option<(usize, KeyBytes, Bytes)>> {
        let mut best: Option<(usize, KeyBytes, Bytes)> = None;
        for &id in ids {
            let Some(table) = state.sstables.get(&id) else {
                continue;
            };
            if !key_within(user_key, table.first_key().as_key_slice(), table.last_key().as_key_slice()) {
                continue;
            }
            if let Some(bloom) = &table.bloom {
                if !bloom.may_contain(farmhash::fingerprint32(user_key)) {
                    continue;
                }
            }
            let iter = SsTableIterator::create_and_seek_to_key(table.clone(), seek)?;
            if iter.is_valid() && iter.key().user_key() == user_key {
                let k = iter.key().to_key_vec().to_key_bytes();
                let v = Bytes::copy_from_slice(iter.value());
                let better = match &best {
                    None => true,
                    Some((_, bk, _)) => k.as_key_slice() < bk.as_key_slice(),
                };
                if better {
                    best = Some((id, k, v));
                }
                if non_overlapping {
                    break;
                }
            }
        }
        Ok(best)
    }

    /// The memtable whose root actually appears in the current MasterRoot
    /// layer list (active if non-empty, else the oldest non-empty frozen
    /// one) — see `master_root::layer_roots`. Only entries living in this
    /// one memtable are provable; others are provable once flushed.
    fn provable_memtable(state: &LsmStorageState) -> Option<Arc<MemTable>> {
        if !state.memtable.is_empty() {
            return Some(state.memtable.clone());
        }
        state.imm_memtables.iter().find(|m| !m.is_empty()).cloned()
    }

    fn snapshot_state(&self) -> Arc<LsmStorageState> {
        self.state.read().clone()
    }

    pub fn get_at(&self, key: &[u8], version: u64) -> Result<Option<Bytes>> {
        self.check_background_error()?;
        let state = self.snapshot_state();
        let snapshot = self.snapshots.snapshot();
        let seek = KeyVec::seek_at(key, version, snapshot.seq());
        let result = self.resolve(&state, key, &seek, false)?;
        drop(snapshot);
        match result {
            Some(hit) if !hit.key.is_tombstone() => Ok(Some(hit.value)),
            _ => Ok(None),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let state = self.snapshot_state();
        let snapshot = self.snapshots.snapshot();
        let seek = KeyVec::seek_latest(key, snapshot.seq());
        let result = self.resolve(&state, key, &seek, false)?;
        drop(snapshot);
        match result {
            Some(hit) if !hit.key.is_tombstone() => Ok(Some(hit.value)),
            _ => Ok(None),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Resolves `(key, version)` and assembles a three-layer [`DBProof`]
    /// (§4.8): `data` proves the leaf within its memtable/table, `layer`
    /// proves that tree's root within its level's table-root tree (a
    /// trivial single-node proof for a memtable hit, since a memtable root
    /// is itself a MasterRoot leaf), and `master` proves that layer's
    /// position in the current MasterRoot.
    pub fn get_with_proof(&self, key: &[u8], version: u64) -> Result<Option<(Bytes, u64, DBProof)>> {
        self.check_background_error()?;
        let state = self.snapshot_state();
        let snapshot = self.snapshots.snapshot();
        let seek = KeyVec::seek_at(key, version, snapshot.seq());
        let resolved = self.resolve(&state, key, &seek, true)?;
        drop(snapshot);
        let Some(hit) = resolved else {
            return Ok(None);
        };
        if hit.key.is_tombstone() {
            return Ok(None);
        }
        let actual_version = hit.key.version();

        let (data, layer, master_target) = match hit.layer {
            HitLayer::Memtable => {
                let mt = Self::provable_memtable(&state)
                    .ok_or_else(|| Error::InvalidArgument("no provable memtable".into()))?;
                let data = mt
                    .merkle_proof_for(key, actual_version)
                    .ok_or_else(|| Error::corrupted(None, "memtable merkle proof missing"))?;
                let trivial = crate::hash::MerkleProof {
                    root: data.root,
                    exists: true,
                    path: Vec::new(),
                };
                (data, trivial, master_root::Layer::Memtable)
            }
            HitLayer::Level { level, table_id } => {
                let table = state
                    .sstables
                    .get(&table_id)
                    .ok_or_else(|| Error::corrupted(None, "table missing from state"))?;
                let data = table
                    .proof_for(key, actual_version)
                    .ok_or_else(|| Error::corrupted(None, "table merkle proof missing"))?;
                let level_ids: &[usize] = if level == 0 {
                    &state.l0_sstables
                } else {
                    state
                        .levels
                        .iter()
                        .find(|(l, _)| *l == level)
                        .map(|(_, ids)| ids.as_slice())
                        .unwrap_or(&[])
                };
                let layer = master_root::level_proof_for(&state, level_ids, table_id)
                    .ok_or_else(|| Error::corrupted(None, "level merkle proof missing"))?;
                (data, layer, master_root::Layer::Level(level))
            }
        };

        let master = master_root::master_proof(&state, master_target)
            .ok_or_else(|| Error::corrupted(None, "master merkle proof missing"))?;

        Ok(Some((
            hit.value,
            actual_version,
            DBProof { data, layer, master },
        )))
    }

    /// Every live `(version, value)` pair stored for `key` with
    /// `v_min <= version <= v_max` (`0` on either bound means unbounded,
    /// §4.8), ascending by version. A forward scan seeded at this key's
    /// `VMAX` wildcard visits every version in descending order; the first
    /// occurrence of each version (highest `seq`) wins, and a tombstone
    /// winner removes that version from the result entirely.
    pub fn get_history(&self, key: &[u8], v_min: u64, v_max: u64) -> Result<Vec<(u64, Bytes)>> {
        self.check_background_error()?;
        let state = self.snapshot_state();
        let snapshot = self.snapshots.snapshot();
        let seek = KeyVec::seek_latest(key, snapshot.seq());
        let mut iter = self.build_merged_iter(&state, seek.as_key_slice())?;

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        while iter.is_valid() {
            let k = iter.key();
            if k.user_key() != key {
                break;
            }
            let version = k.version();
            if !seen.insert(version) {
                iter.next()?;
                continue;
            }
            let in_range = (v_min == 0 || version >= v_min) && (v_max == 0 || version <= v_max);
            if in_range && !k.is_tombstone() {
                out.push((version, Bytes::copy_from_slice(iter.value())));
            }
            iter.next()?;
        }
        drop(snapshot);
        out.reverse();
        Ok(out)
    }

    pub fn get_history_with_proof(
        &self,
        key: &[u8],
        v_min: u64,
        v_max: u64,
    ) -> Result<Vec<(u64, Bytes, DBProof)>> {
        let mut out = Vec::new();
        for (version, _) in self.get_history(key, v_min, v_max)? {
            if let Some((value, actual_version, proof)) = self.get_with_proof(key, version)? {
                out.push((actual_version, value, proof));
            }
        }
        Ok(out)
    }

    pub fn master_root(&self) -> Hash {
        let state = self.snapshot_state();
        master_root::master_root(&state)
    }

    /// Builds the merged, per-table-seeked raw internal-key iterator used by
    /// both `scan()` and `get_history()`: memtables merged (active first,
    /// then frozen newest-first — ties break toward index 0, i.e. the
    /// freshest), L0 tables merged (newest first), each level concatenated
    /// then those concatenations merged (ascending level, ties break toward
    /// the lower level), L0 and leveled combined (L0 wins ties), then
    /// memtables and tables combined (memtables win ties) — exactly the
    /// precedence order §4.3 requires.
    fn build_merged_iter(&self, state: &LsmStorageState, seek: KeySlice<'_>) -> Result<LsmIteratorInner> {
        let mut mem_iters = Vec::with_capacity(1 + state.imm_memtables.len());
        mem_iters.push(Box::new(
            state.memtable.scan(Bound::Included(seek), Bound::Unbounded),
        ));
        for imm in &state.imm_memtables {
            mem_iters.push(Box::new(imm.scan(Bound::Included(seek), Bound::Unbounded)));
        }
        let memtables_iter = MergeIterator::create(mem_iters);

        let mut l0_iters = Vec::with_capacity(state.l0_sstables.len());
        for id in &state.l0_sstables {
            if let Some(table) = state.sstables.get(id) {
                l0_iters.push(Box::new(SsTableIterator::create_and_seek_to_key(
                    table.clone(),
                    seek,
                )?));
            }
        }
        let l0_iter = MergeIterator::create(l0_iters);

        let mut level_concats = Vec::with_capacity(state.levels.len());
        for (_, ids) in &state.levels {
            let tables: Vec<_> = ids
                .iter()
                .filter_map(|id| state.sstables.get(id).cloned())
                .collect();
            level_concats.push(Box::new(SstConcatIterator::create_and_seek_to_key(
                tables, seek,
            )?));
        }
        let leveled_iter = MergeIterator::create(level_concats);

        let table_iter = TwoMergeIterator::create(l0_iter, leveled_iter)?;
        TwoMergeIterator::create(memtables_iter, table_iter)
    }

    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<FusedIterator<LsmIterator>> {
        self.check_background_error()?;
        let state = self.snapshot_state();
        let snapshot = self.snapshots.snapshot();
        let seek = match lower {
            Bound::Included(k) => KeyVec::seek_latest(k, snapshot.seq()),
            Bound::Excluded(k) => {
                let mut succ = k.to_vec();
                succ.push(0);
                KeyVec::seek_latest(&succ, snapshot.seq())
            }
            Bound::Unbounded => KeyVec::seek_latest(&[], snapshot.seq()),
        };
        let inner = self.build_merged_iter(&state, seek.as_key_slice())?;
        let end_bound = match upper {
            Bound::Included(k) => Bound::Included(Bytes::copy_from_slice(k)),
            Bound::Excluded(k) => Bound::Excluded(Bytes::copy_from_slice(k)),
            Bound::Unbounded => Bound::Unbounded,
        };
        Ok(FusedIterator::new(LsmIterator::new(
            inner, end_bound, snapshot,
        )?))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_batch(&[WriteBatchRecord::Put(key, value)])
    }

    pub fn put_at(&self, key: &[u8], value: &[u8], version: u64) -> Result<()> {
        self.write_batch(&[WriteBatchRecord::PutAt(key, value, version)])
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write_batch(&[WriteBatchRecord::Del(key)])
    }

    pub fn delete_at(&self, key: &[u8], version: u64) -> Result<()> {
        self.write_batch(&[WriteBatchRecord::DelAt(key, version)])
    }

    pub fn write_batch<T: AsRef<[u8]>>(&self, batch: &[WriteBatchRecord<T>]) -> Result<()> {
        self.check_background_error()?;
        let _write_guard = self.write_lock.lock();
        for record in batch {
            match record {
                WriteBatchRecord::Put(key, value) => {
                    self.apply_put(key.as_ref(), value.as_ref(), 0)?
                }
                WriteBatchRecord::PutAt(key, value, version) => {
                    self.apply_put(key.as_ref(), value.as_ref(), *version)?
                }
                WriteBatchRecord::Del(key) => self.apply_delete_latest(key.as_ref())?,
                WriteBatchRecord::DelAt(key, version) => {
                    self.apply_tombstone(key.as_ref(), *version)?
                }
            }
        }
        Ok(())
    }

    fn apply_put(&self, key: &[u8], value: &[u8], version: u64) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("key must not be empty".into()));
        }
        let seq = self.snapshots.next_seq();
        let ikey = KeyVec::encode(key, version, seq, crate::key::EntryKind::Val);
        let size = {
            let guard = self.state.read();
            guard.memtable.put(ikey.as_key_slice(), value)?;
            guard.memtable.approximate_size()
        };
        self.try_freeze(size)
    }

    fn apply_tombstone(&self, key: &[u8], version: u64) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("key must not be empty".into()));
        }
        let seq = self.snapshots.next_seq();
        let ikey = KeyVec::encode(key, version, seq, crate::key::EntryKind::Del);
        let size = {
            let guard = self.state.read();
            guard.memtable.put(ikey.as_key_slice(), b"")?;
            guard.memtable.approximate_size()
        };
        self.try_freeze(size)
    }

    /// No-version `delete(k)` tombstones whichever version is currently
    /// latest (§1's "implicit latest" convenience); a no-op if the key does
    /// not currently resolve to a live value.
    fn apply_delete_latest(&self, key: &[u8]) -> Result<()> {
        let state = self.snapshot_state();
        let seq = self.snapshots.current_seq();
        let seek = KeyVec::seek_latest(key, seq);
        let Some(hit) = self.resolve(&state, key, &seek, false)? else {
            return Ok(());
        };
        if hit.key.is_tombstone() {
            return Ok(());
        }
        self.apply_tombstone(key, hit.key.version())
    }

    fn try_freeze(&self, estimated_size: usize) -> Result<()> {
        if estimated_size < self.options.memtable_size_limit {
            return Ok(());
        }
        let state_lock = self.state_lock.lock();
        let guard = self.state.read();
        if guard.memtable.approximate_size() < self.options.memtable_size_limit {
            return Ok(());
        }
        drop(guard);
        self.force_freeze_memtable(&state_lock)
    }

    pub fn force_freeze_memtable(&self, state_lock_observer: &MutexGuard<'_, ()>) -> Result<()> {
        let new_id = self.next_sst_id();
        let new_memtable = if self.options.enable_wal {
            Arc::new(MemTable::create_with_wal(new_id, self.path_of_wal(new_id))?)
        } else {
            Arc::new(MemTable::create(new_id))
        };
        self.freeze_memtable_with_memtable(new_memtable)?;
        if let Some(manifest) = &self.manifest {
            manifest.add_record(state_lock_observer, ManifestRecord::NewMemtable(new_id))?;
        }
        self.sync_dir()?;
        Ok(())
    }

    fn freeze_memtable_with_memtable(&self, memtable: Arc<MemTable>) -> Result<()> {
        let mut guard = self.state.write();
        let mut snapshot = guard.as_ref().clone();
        let old = std::mem::replace(&mut snapshot.memtable, memtable);
        snapshot.imm_memtables.insert(0, old);
        *guard = Arc::new(snapshot);
        Ok(())
    }

    /// Flushes the oldest frozen memtable (§4.7's flush path) into a new L0
    /// table (or, with compaction disabled, straight into the sole managed
    /// level) and records the transition in the manifest.
    pub fn force_flush_next_imm_memtable(&self) -> Result<()> {
        let flush_memtable = {
            let guard = self.state.read();
            guard
                .imm_memtables
                .last()
                .cloned()
                .ok_or_else(|| Error::InvalidArgument("no frozen memtable to flush".into()))?
        };

        let mut builder = SsTableBuilder::new(self.options.block_size);
        flush_memtable.flush(&mut builder)?;
        let sst_id = flush_memtable.id();
        let sst = Arc::new(builder.build(sst_id, Some(self.block_cache.clone()), self.path_of_sst(sst_id))?);

        {
            let state_lock = self.state_lock.lock();
            let mut guard = self.state.write();
            let mut snapshot = guard.as_ref().clone();
            let popped = snapshot
                .imm_memtables
                .pop()
                .ok_or_else(|| Error::InvalidArgument("no frozen memtable to flush".into()))?;
            if popped.id() != sst_id {
                return Err(Error::InvalidArgument(
                    "flush target is not the oldest frozen memtable".into(),
                ));
            }
            if self.compaction_controller.flush_to_l0() {
                snapshot.l0_sstables.insert(0, sst_id);
            } else if let Some((_, ids)) = snapshot.levels.first_mut() {
                ids.insert(0, sst_id);
            }
            snapshot.sstables.insert(sst_id, sst);
            *guard = Arc::new(snapshot);
            if let Some(manifest) = &self.manifest {
                manifest.add_record(&state_lock, ManifestRecord::FlushMemtable(sst_id))?;
                manifest.add_record(&state_lock, ManifestRecord::AddTable { level: 0, sst_id })?;
            }
        }
        self.sync_dir()?;
        info!(sst_id, "flushed memtable to table");
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let guard = self.state.read();
        guard.memtable.sync_wal()
    }

    pub fn add_compaction_filter(&self, filter: CompactionFilter) {
        self.compaction_filters.lock().push(filter);
    }

    /// Pins the current sequence number, holding off tombstone GC for
    /// anything at or after it until dropped. Every read method (`get`,
    /// `get_at`, `scan`, `get_history`) already pins and releases its own
    /// snapshot internally; this is for a caller that wants to hold a
    /// watermark open across several separate calls.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.snapshot()
    }

    pub(crate) fn open(path: impl AsRef<Path>, options: LsmStorageOptions) -> Result<Arc<Self>> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let block_cache = Arc::new(BlockCache::new(1 << 20));

        let compaction_controller = match &options.compaction_options {
            CompactionOptions::Leveled(opts) => {
                CompactionController::Leveled(LeveledCompactionController::new(opts.clone()))
            }
            CompactionOptions::NoCompaction => CompactionController::None,
        };

        let manifest_path = path.join("MANIFEST");
        let mut state = LsmStorageState::create(&options);
        let mut max_seq = 0u64;
        let next_id;
        let manifest;

        if !manifest_path.exists() {
            manifest = Manifest::create(&manifest_path)?;
            let active_wal_id = 0;
            manifest.add_record_when_init(ManifestRecord::NewMemtable(active_wal_id))?;
            state.memtable = if options.enable_wal {
                Arc::new(MemTable::create_with_wal(
                    active_wal_id,
                    Self::path_of_wal_static(path, active_wal_id),
                )?)
            } else {
                Arc::new(MemTable::create(active_wal_id))
            };
            next_id = 1;
        } else {
            let (recovered_manifest, records) = Manifest::recover(&manifest_path)?;
            manifest = recovered_manifest;
            let mut pending_memtables: Vec<usize> = Vec::new();
            for record in records {
                match record {
                    ManifestRecord::NewMemtable(id) => pending_memtables.push(id),
                    ManifestRecord::FlushMemtable(id) => pending_memtables.retain(|x| *x != id),
                    ManifestRecord::AddTable { level, sst_id } => {
                        if level == 0 {
                            state.l0_sstables.insert(0, sst_id);
                        } else if let Some((_, ids)) =
                            state.levels.iter_mut().find(|(l, _)| *l == level)
                        {
                            ids.insert(0, sst_id);
                        }
                    }
                    ManifestRecord::RemoveTable { level, sst_id } => {
                        if level == 0 {
                            state.l0_sstables.retain(|x| *x != sst_id);
                        } else if let Some((_, ids)) =
                            state.levels.iter_mut().find(|(l, _)| *l == level)
                        {
                            ids.retain(|x| *x != sst_id);
                        }
                    }
                    ManifestRecord::EditSeq(seq) => max_seq = max_seq.max(seq),
                }
            }

            let mut max_id = 0usize;
            for &id in state
                .l0_sstables
                .iter()
                .chain(state.levels.iter().flat_map(|(_, ids)| ids.iter()))
            {
                max_id = max_id.max(id);
                let file = FileObject::open(&Self::path_of_sst_static(path, id))?;
                let table = SsTable::open(id, Some(block_cache.clone()), file)?;
                max_seq = max_seq.max(table.max_seq());
                state.sstables.insert(id, Arc::new(table));
            }

            pending_memtables.sort_unstable_by(|a, b| b.cmp(a));
            for id in &pending_memtables {
                max_id = max_id.max(*id);
                let wal_path = Self::path_of_wal_static(path, *id);
                if wal_path.exists() {
                    let mt = MemTable::recover_from_wal(*id, wal_path)?;
                    state.imm_memtables.insert(0, Arc::new(mt));
                }
            }

            next_id = max_id + 1;
            state.memtable = if options.enable_wal {
                Arc::new(MemTable::create_with_wal(next_id, Self::path_of_wal_static(path, next_id))?)
            } else {
                Arc::new(MemTable::create(next_id))
            };
            manifest.add_record_when_init(ManifestRecord::NewMemtable(next_id))?;
        }

        let inner = Arc::new(Self {
            state: Arc::new(RwLock::new(Arc::new(state))),
            state_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            path: path.to_path_buf(),
            block_cache,
            next_sst_id: AtomicUsize::new(next_id + 1),
            options: Arc::new(options),
            compaction_controller,
            manifest: Some(manifest),
            compaction_filters: Arc::new(Mutex::new(Vec::new())),
            snapshots: SnapshotTracker::new(max_seq + 1),
            background_error: Mutex::new(None),
        });
        Ok(inner)
    }

    pub(crate) fn next_sst_id(&self) -> usize {
        self.next_sst_id.fetch_add(1, AtomicOrdering::SeqCst)
    }

    pub(crate) fn path_of_sst_static(path: &Path, id: usize) -> PathBuf {
        path.join(format!("{id:05}.sst"))
    }

    pub(crate) fn path_of_sst(&self, id: usize) -> PathBuf {
        Self::path_of_sst_static(&self.path, id)
    }

    pub(crate) fn path_of_wal_static(path: &Path, id: usize) -> PathBuf {
        path.join(format!("{id:05}.wal"))
    }

    pub(crate) fn path_of_wal(&self, id: usize) -> PathBuf {
        Self::path_of_wal_static(&self.path, id)
    }

    pub(super) fn sync_dir(&self) -> Result<()> {
        Ok(std::fs::File::open(&self.path)?.sync_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> Arc<MiniLsm> {
        MiniLsm::open(dir.path(), LsmStorageOptions::default()).unwrap()
    }

    #[test]
    fn put_then_get_sees_latest_version() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = open(&dir);
        lsm.put_at(b"k", b"v1", 1).unwrap();
        lsm.put_at(b"k", b"v2", 2).unwrap();
        assert_eq!(lsm.get(b"k").unwrap().as_deref(), Some(&b"v2"[..]));
        assert_eq!(lsm.get_at(b"k", 1).unwrap().as_deref(), Some(&b"v1"[..]));
        lsm.close().unwrap();
    }

    #[test]
    fn delete_latest_shadows_current_version_only() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = open(&dir);
        lsm.put_at(b"k", b"v1", 1).unwrap();
        lsm.delete(b"k").unwrap();
        assert_eq!(lsm.get(b"k").unwrap(), None);
        assert_eq!(lsm.get_at(b"k", 1).unwrap(), None);
        lsm.close().unwrap();
    }

    #[test]
    fn freeze_and_flush_move_memtable_into_l0() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = open(&dir);
        lsm.put(b"k", b"v").unwrap();
        {
            let state_lock = lsm.inner.state_lock.lock();
            lsm.inner.force_freeze_memtable(&state_lock).unwrap();
        }
        assert_eq!(lsm.inner.state.read().imm_memtables.len(), 1);
        lsm.inner.force_flush_next_imm_memtable().unwrap();
        let state = lsm.inner.state.read();
        assert!(state.imm_memtables.is_empty());
        assert_eq!(state.l0_sstables.len(), 1);
        drop(state);
        assert_eq!(lsm.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
        lsm.close().unwrap();
    }

    #[test]
    fn reopen_recovers_state_from_manifest_and_wal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let lsm = open(&dir);
            lsm.put_at(b"k", b"v1", 1).unwrap();
            lsm.sync().unwrap();
            lsm.close().unwrap();
        }
        let lsm = open(&dir);
        assert_eq!(lsm.get_at(b"k", 1).unwrap().as_deref(), Some(&b"v1"[..]));
        lsm.close().unwrap();
    }

    #[test]
    fn key_within_compares_user_keys_not_full_internal_keys() {
        let begin = KeyVec::encode(b"a", 5, 1, crate::key::EntryKind::Val);
        let end = KeyVec::encode(b"z", 1, 1, crate::key::EntryKind::Val);
        assert!(key_within(b"m", begin.as_key_slice(), end.as_key_slice()));
        assert!(!key_within(b"zz", begin.as_key_slice(), end.as_key_slice()));
    }
}

pub enum WriteBatchRecord<T: AsRef<[u8]>> {
    Put(T, T),
    PutAt(T, T, u64),
    Del(T),
    DelAt(T, u64),
}

/// The embedder-facing handle: an open engine plus its background flush and
/// compaction threads.
pub struct MiniLsm {
    pub(crate) inner: Arc<LsmStorageInner>,
    flush_notifier: crossbeam::channel::Sender<()>,
    flush_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    compaction_notifier: crossbeam::channel::Sender<()>,
    compaction_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MiniLsm {
    pub fn open(path: impl AsRef<Path>, options: LsmStorageOptions) -> Result<Arc<Self>> {
        let inner = LsmStorageInner::open(path, options)?;
        let (flush_tx, flush_rx) = crossbeam::channel::unbounded();
        let (compaction_tx, compaction_rx) = crossbeam::channel::unbounded();
        let compaction_thread = inner.spawn_compaction_thread(compaction_rx)?;
        let flush_thread = inner.spawn_flush_thread(flush_rx)?;
        Ok(Arc::new(Self {
            inner,
            flush_notifier: flush_tx,
            flush_thread: Mutex::new(flush_thread),
            compaction_notifier: compaction_tx,
            compaction_thread: Mutex::new(compaction_thread),
        }))
    }

    /// Signals both background threads to stop, joins them, then drains
    /// every remaining memtable to disk so a subsequent `open` has nothing
    /// left to replay from the WAL.
    pub fn close(&self) -> Result<()> {
        self.inner.set_background_error("engine closing");
        let _ = self.compaction_notifier.send(());
        let _ = self.flush_notifier.send(());
        if let Some(t) = self.compaction_thread.lock().take() {
            t.join()
                .map_err(|_| Error::Release("compaction thread panicked".into()))?;
        }
        if let Some(t) = self.flush_thread.lock().take() {
            t.join()
                .map_err(|_| Error::Release("flush thread panicked".into()))?;
        }
        *self.inner.background_error.lock() = None;

        loop {
            let has_active = !self.inner.state.read().memtable.is_empty();
            if !has_active {
                break;
            }
            let state_lock = self.inner.state_lock.lock();
            self.inner.force_freeze_memtable(&state_lock)?;
        }
        while !self.inner.state.read().imm_memtables.is_empty() {
            self.inner.force_flush_next_imm_memtable()?;
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.get(key)
    }

    pub fn get_at(&self, key: &[u8], version: u64) -> Result<Option<Bytes>> {
        self.inner.get_at(key, version)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.inner.has(key)
    }

    pub fn get_with_proof(&self, key: &[u8], version: u64) -> Result<Option<(Bytes, u64, DBProof)>> {
        self.inner.get_with_proof(key, version)
    }

    pub fn get_history(&self, key: &[u8], v_min: u64, v_max: u64) -> Result<Vec<(u64, Bytes)>> {
        self.inner.get_history(key, v_min, v_max)
    }

    pub fn get_history_with_proof(
        &self,
        key: &[u8],
        v_min: u64,
        v_max: u64,
    ) -> Result<Vec<(u64, Bytes, DBProof)>> {
        self.inner.get_history_with_proof(key, v_min, v_max)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value)
    }

    pub fn put_at(&self, key: &[u8], value: &[u8], version: u64) -> Result<()> {
        self.inner.put_at(key, value, version)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)
    }

    pub fn delete_at(&self, key: &[u8], version: u64) -> Result<()> {
        self.inner.delete_at(key, version)
    }

    pub fn write_batch<T: AsRef<[u8]>>(&self, batch: &[WriteBatchRecord<T>]) -> Result<()> {
        self.inner.write_batch(batch)
    }

    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<FusedIterator<LsmIterator>> {
        self.inner.scan(lower, upper)
    }

    pub fn master_root(&self) -> Hash {
        self.inner.master_root()
    }

    pub fn compact_range(&self) -> Result<()> {
        self.inner.force_compact()
    }

    pub fn add_compaction_filter(&self, filter: CompactionFilter) {
        self.inner.add_compaction_filter(filter);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot()
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    pub fn dump_structure(&self) {
        self.inner.dump_structure()
    }
}
