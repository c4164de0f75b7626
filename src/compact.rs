//! The compaction engine (component G): picks which tables to merge, runs
//! the merge, and folds the result back into the engine's state and
//! manifest. Also owns the background flush/compaction worker loops.
//!
//! Grounded in `examples/CrystalAnalyst-Lsm/src/compact.rs`'s
//! `force_compact`/`compact_inner`/`compact_generate_sst` shape. Generalized
//! from the teacher's single-timestamp dedup (`key_ref()`/`ts()`) to this
//! crate's `(user_key, version)` pair: two entries are the "same key" for
//! compaction purposes only when both match, since distinct versions are
//! independently queryable forever (§4.7) and must never collapse into each
//! other the way repeated writes at one version legitimately do. The
//! watermark gate moves from `ts()` to `seq()` — sequence number, not
//! version, decides whether a tombstone is still needed to shadow an older
//! snapshot read.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::iterators::concat_iterator::SstConcatIterator;
use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::two_merge_iterator::TwoMergeIterator;
use crate::iterators::StorageIterator;
use crate::key::KeySlice;
use crate::manifest::ManifestRecord;
use crate::table::{builder::SsTableBuilder, iterator::SsTableIterator, SsTable};

pub(crate) mod leveled;

pub use leveled::{LeveledCompactionController, LeveledCompactionOptions, LeveledCompactionTask};

use crate::lsm_storage::{CompactionFilter, LsmStorageInner, LsmStorageState};

#[derive(Debug, Serialize, Deserialize)]
pub enum CompactionTask {
    Leveled(LeveledCompactionTask),
    ForceFullCompaction {
        l0_sstables: Vec<usize>,
        l1_sstables: Vec<usize>,
    },
}

impl CompactionTask {
    fn compact_to_bottom_level(&self) -> bool {
        match self {
            CompactionTask::ForceFullCompaction { .. } => true,
            CompactionTask::Leveled(task) => task.is_lower_level_bottom_level,
        }
    }
}

/// Controller for the configured compaction strategy.
pub(crate) enum CompactionController {
    Leveled(LeveledCompactionController),
    None,
}

impl CompactionController {
    pub fn generate_compaction_task(&self, snapshot: &LsmStorageState) -> Option<CompactionTask> {
        match self {
            CompactionController::Leveled(handle) => handle
                .generate_compaction_task(snapshot)
                .map(CompactionTask::Leveled),
            CompactionController::None => None,
        }
    }

    pub fn apply_compaction_result(
        &self,
        snapshot: &LsmStorageState,
        task: &CompactionTask,
        output: &[usize],
    ) -> (LsmStorageState, Vec<usize>) {
        match (self, task) {
            (CompactionController::Leveled(ctrl), CompactionTask::Leveled(task)) => {
                ctrl.apply_compaction_result(snapshot, task, output)
            }
            _ => unreachable!("compaction task does not match the configured controller"),
        }
    }

    pub fn flush_to_l0(&self) -> bool {
        matches!(self, Self::None | Self::Leveled(_))
    }
}

#[derive(Clone, Debug)]
pub enum CompactionOptions {
    Leveled(LeveledCompactionOptions),
    NoCompaction,
}

impl LsmStorageInner {
    /// Merges every L0 and L1 table into a fresh set of L1 tables. Only
    /// legal when compaction is otherwise disabled (manual maintenance, or
    /// a test harness that wants a deterministic layout).
    pub fn force_compact(&self) -> Result<()> {
        assert!(
            matches!(self.options.compaction_options, CompactionOptions::NoCompaction),
            "force_compact can only be called with compaction disabled"
        );
        let snapshot = self.state.read().clone();

        let l0_sstables = snapshot.l0_sstables.clone();
        let l1_sstables = snapshot
            .levels
            .first()
            .map(|(_, ids)| ids.clone())
            .unwrap_or_default();
        let compaction_task = CompactionTask::ForceFullCompaction {
            l0_sstables: l0_sstables.clone(),
            l1_sstables: l1_sstables.clone(),
        };
        let new_ssts = self.compact_inner(&compaction_task)?;
        let new_ids: Vec<usize> = new_ssts.iter().map(|t| t.sst_id()).collect();

        {
            let state_lock = self.state_lock.lock();
            let mut state = self.state.read().as_ref().clone();
            for sst in l0_sstables.iter().chain(l1_sstables.iter()) {
                state.sstables.remove(sst);
            }
            for sst in new_ssts {
                state.sstables.insert(sst.sst_id(), sst);
            }
            let removed: HashSet<usize> = l0_sstables.iter().copied().collect();
            state.l0_sstables.retain(|id| !removed.contains(id));
            if let Some((_, ids)) = state.levels.first_mut() {
                *ids = new_ids.clone();
            }
            *self.state.write() = Arc::new(state);

            if let Some(manifest) = &self.manifest {
                for &id in l0_sstables.iter() {
                    manifest.add_record(&state_lock, ManifestRecord::RemoveTable { level: 0, sst_id: id })?;
                }
                for &id in l1_sstables.iter() {
                    manifest.add_record(&state_lock, ManifestRecord::RemoveTable { level: 1, sst_id: id })?;
                }
                for &id in &new_ids {
                    manifest.add_record(&state_lock, ManifestRecord::AddTable { level: 1, sst_id: id })?;
                }
            }
            self.sync_dir()?;
        }
        for sst in l0_sstables.iter().chain(l1_sstables.iter()) {
            std::fs::remove_file(self.path_of_sst(*sst))?;
        }
        Ok(())
    }

    fn compact_inner(&self, task: &CompactionTask) -> Result<Vec<Arc<SsTable>>> {
        let snapshot = self.state.read().clone();
        match task {
            CompactionTask::ForceFullCompaction {
                l0_sstables,
                l1_sstables,
            } => {
                let mut l0_iters = Vec::with_capacity(l0_sstables.len());
                for id in l0_sstables.iter() {
                    l0_iters.push(Box::new(SsTableIterator::create_and_seek_to_first(
                        snapshot.sstables.get(id).unwrap().clone(),
                    )?));
                }
                let l1_ssts: Vec<_> = l1_sstables
                    .iter()
                    .map(|id| snapshot.sstables.get(id).unwrap().clone())
                    .collect();
                let iter = TwoMergeIterator::create(
                    MergeIterator::create(l0_iters),
                    SstConcatIterator::create_and_seek_to_first(l1_ssts)?,
                )?;
                self.compact_generate_sst(iter, task.compact_to_bottom_level())
            }
            CompactionTask::Leveled(LeveledCompactionTask {
                upper_level,
                upper_level_sst_ids,
                lower_level_sst_ids,
                ..
            }) => {
                let lower_ssts: Vec<_> = lower_level_sst_ids
                    .iter()
                    .map(|id| snapshot.sstables.get(id).unwrap().clone())
                    .collect();
                let lower_iter = SstConcatIterator::create_and_seek_to_first(lower_ssts)?;
                match upper_level {
                    Some(_) => {
                        let upper_ssts: Vec<_> = upper_level_sst_ids
                            .iter()
                            .map(|id| snapshot.sstables.get(id).unwrap().clone())
                            .collect();
                        let upper_iter = SstConcatIterator::create_and_seek_to_first(upper_ssts)?;
                        self.compact_generate_sst(
                            TwoMergeIterator::create(upper_iter, lower_iter)?,
                            task.compact_to_bottom_level(),
                        )
                    }
                    None => {
                        let mut upper_iters = Vec::with_capacity(upper_level_sst_ids.len());
                        for id in upper_level_sst_ids.iter() {
                            upper_iters.push(Box::new(SsTableIterator::create_and_seek_to_first(
                                snapshot.sstables.get(id).unwrap().clone(),
                            )?));
                        }
                        self.compact_generate_sst(
                            TwoMergeIterator::create(MergeIterator::create(upper_iters), lower_iter)?,
                            task.compact_to_bottom_level(),
                        )
                    }
                }
            }
        }
    }

    /// Drives a merged iterator over compaction inputs into a fresh run of
    /// output tables, collapsing repeated `(user_key, version)` entries to
    /// the newest `seq` and, at the bottom level, dropping a tombstone
    /// entirely once no pinned snapshot could still need it.
    fn compact_generate_sst(
        &self,
        mut iter: impl for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>,
        compact_to_bottom_level: bool,
    ) -> Result<Vec<Arc<SsTable>>> {
        let mut builder = None;
        let mut new_sst = Vec::new();
        let watermark = self.snapshots.watermark();
        let mut last_key: Option<(Vec<u8>, u64)> = None;
        let compaction_filters = self.compaction_filters.lock().clone();

        'outer: while iter.is_valid() {
            if builder.is_none() {
                builder = Some(SsTableBuilder::new(self.options.block_size));
            }

            let key = iter.key();
            let same_as_last_key = last_key
                .as_ref()
                .is_some_and(|(uk, v)| uk.as_slice() == key.user_key() && *v == key.version());

            if same_as_last_key {
                // An older, shadowed seq of an already-emitted (user_key, version).
                iter.next()?;
                continue;
            }

            if compact_to_bottom_level && key.is_tombstone() && key.seq() <= watermark {
                last_key = Some((key.user_key().to_vec(), key.version()));
                iter.next()?;
                continue;
            }

            if key.seq() <= watermark && !compaction_filters.is_empty() {
                for filter in &compaction_filters {
                    match filter {
                        CompactionFilter::Prefix(prefix) => {
                            if key.user_key().starts_with(prefix.as_ref()) {
                                last_key = Some((key.user_key().to_vec(), key.version()));
                                iter.next()?;
                                continue 'outer;
                            }
                        }
                    }
                }
            }

            let builder_inner = builder.as_mut().unwrap();
            if builder_inner.estimate_size() >= self.options.target_sst_size {
                let sst_id = self.next_sst_id();
                let old_builder = builder.take().unwrap();
                new_sst.push(Arc::new(old_builder.build(
                    sst_id,
                    Some(self.block_cache.clone()),
                    self.path_of_sst(sst_id),
                )?));
                builder = Some(SsTableBuilder::new(self.options.block_size));
            }

            let builder_inner = builder.as_mut().unwrap();
            builder_inner.add(key, iter.value());
            last_key = Some((key.user_key().to_vec(), key.version()));
            iter.next()?;
        }
        if let Some(builder) = builder {
            let sst_id = self.next_sst_id();
            new_sst.push(Arc::new(builder.build(
                sst_id,
                Some(self.block_cache.clone()),
                self.path_of_sst(sst_id),
            )?));
        }
        Ok(new_sst)
    }

    /// Picks and runs one leveled-compaction task, if the policy says one is
    /// due; a no-op under `CompactionOptions::NoCompaction`.
    fn trigger_compaction(&self) -> Result<()> {
        if matches!(self.compaction_controller, CompactionController::None) {
            return Ok(());
        }
        let snapshot = self.state.read().clone();
        let Some(task) = self.compaction_controller.generate_compaction_task(&snapshot) else {
            return Ok(());
        };
        let new_ssts = self.compact_inner(&task)?;
        let output_ids: Vec<usize> = new_ssts.iter().map(|t| t.sst_id()).collect();
        let (mut next_state, output_ids) =
            self.compaction_controller.apply_compaction_result(&snapshot, &task, &output_ids);

        let CompactionTask::Leveled(leveled_task) = &task else {
            unreachable!("generate_compaction_task only returns Leveled tasks");
        };
        let removed_ids: Vec<usize> = leveled_task
            .upper_level_sst_ids
            .iter()
            .chain(leveled_task.lower_level_sst_ids.iter())
            .copied()
            .collect();

        {
            let state_lock = self.state_lock.lock();
            for id in &removed_ids {
                next_state.sstables.remove(id);
            }
            for sst in new_ssts {
                next_state.sstables.insert(sst.sst_id(), sst);
            }
            *self.state.write() = Arc::new(next_state);

            if let Some(manifest) = &self.manifest {
                let upper_level = leveled_task.upper_level.unwrap_or(0);
                for &id in &leveled_task.upper_level_sst_ids {
                    manifest.add_record(&state_lock, ManifestRecord::RemoveTable { level: upper_level, sst_id: id })?;
                }
                for &id in &leveled_task.lower_level_sst_ids {
                    manifest.add_record(
                        &state_lock,
                        ManifestRecord::RemoveTable {
                            level: leveled_task.lower_level,
                            sst_id: id,
                        },
                    )?;
                }
                for &id in &output_ids {
                    manifest.add_record(
                        &state_lock,
                        ManifestRecord::AddTable {
                            level: leveled_task.lower_level,
                            sst_id: id,
                        },
                    )?;
                }
            }
            self.sync_dir()?;
        }
        for id in &removed_ids {
            let path = self.path_of_sst(*id);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Flushes the oldest frozen memtable, if one is waiting.
    fn trigger_flush(&self) -> Result<()> {
        let has_imm = !self.state.read().imm_memtables.is_empty();
        if has_imm {
            self.force_flush_next_imm_memtable()?;
        }
        Ok(())
    }

    pub(crate) fn spawn_compaction_thread(
        self: &Arc<Self>,
        rx: Receiver<()>,
    ) -> Result<Option<std::thread::JoinHandle<()>>> {
        if matches!(self.compaction_controller, CompactionController::None) {
            return Ok(None);
        }
        let this = self.clone();
        let handle = std::thread::spawn(move || loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = this.trigger_compaction() {
                        this.set_background_error(e.to_string());
                        return;
                    }
                }
            }
        });
        Ok(Some(handle))
    }

    pub(crate) fn spawn_flush_thread(
        self: &Arc<Self>,
        rx: Receiver<()>,
    ) -> Result<Option<std::thread::JoinHandle<()>>> {
        let this = self.clone();
        let handle = std::thread::spawn(move || loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = this.trigger_flush() {
                        this.set_background_error(e.to_string());
                        return;
                    }
                }
            }
        });
        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::CompactionOptions;
    use crate::lsm_storage::{LsmStorageOptions, MiniLsm};

    fn no_compaction_options() -> LsmStorageOptions {
        LsmStorageOptions {
            compaction_options: CompactionOptions::NoCompaction,
            enable_wal: false,
            memtable_size_limit: 1 << 20,
            ..LsmStorageOptions::default()
        }
    }

    #[test]
    fn force_compact_merges_l0_and_l1_keeping_distinct_versions() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = MiniLsm::open(dir.path(), no_compaction_options()).unwrap();

        lsm.put_at(b"k", b"v1", 1).unwrap();
        {
            let guard = lsm.inner.state_lock.lock();
            lsm.inner.force_freeze_memtable(&guard).unwrap();
        }
        lsm.inner.force_flush_next_imm_memtable().unwrap();

        lsm.put_at(b"k", b"v2", 2).unwrap();
        {
            let guard = lsm.inner.state_lock.lock();
            lsm.inner.force_freeze_memtable(&guard).unwrap();
        }
        lsm.inner.force_flush_next_imm_memtable().unwrap();

        assert_eq!(lsm.inner.state.read().l0_sstables.len(), 2);
        lsm.compact_range().unwrap();
        assert!(lsm.inner.state.read().l0_sstables.is_empty());

        assert_eq!(lsm.get_at(b"k", 1).unwrap().as_deref(), Some(&b"v1"[..]));
        assert_eq!(lsm.get_at(b"k", 2).unwrap().as_deref(), Some(&b"v2"[..]));
        lsm.close().unwrap();
    }

    #[test]
    fn force_compact_drops_tombstone_once_past_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let lsm = MiniLsm::open(dir.path(), no_compaction_options()).unwrap();

        lsm.put(b"k", b"v").unwrap();
        lsm.delete(b"k").unwrap();
        {
            let guard = lsm.inner.state_lock.lock();
            lsm.inner.force_freeze_memtable(&guard).unwrap();
        }
        lsm.inner.force_flush_next_imm_memtable().unwrap();

        lsm.compact_range().unwrap();
        assert_eq!(lsm.get(b"k").unwrap(), None);
        lsm.close().unwrap();
    }
}
