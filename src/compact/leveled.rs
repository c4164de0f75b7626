//! Leveled compaction trigger policy and the manifest-level bookkeeping for
//! applying a compaction's output back into a [`LsmStorageState`].
//!
//! Grounded in `examples/CrystalAnalyst-Lsm/src/compact/simple_leveled.rs`'s
//! `generate_compaction_task`/`apply_compaction_result` shape — that file's
//! `apply_compaction_result` was `todo!()` in the teacher; the size-ratio
//! trigger here keeps its structure (iterate levels, compare adjacent
//! counts against a ratio) generalized to the per-level byte-size ratio
//! `spec.md` §4.7 actually specifies (10x per level), plus an L0
//! file-count trigger.

#![allow(unused)]

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::lsm_storage::LsmStorageState;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LeveledCompactionTask {
    /// `None` means the upper side is L0 (unsorted run).
    pub upper_level: Option<usize>,
    pub upper_level_sst_ids: Vec<usize>,
    pub lower_level: usize,
    pub lower_level_sst_ids: Vec<usize>,
    pub is_lower_level_bottom_level: bool,
}

pub struct LeveledCompactionController {
    options: LeveledCompactionOptions,
}

#[derive(Debug, Clone)]
pub struct LeveledCompactionOptions {
    /// A level is compacted into the next once its total byte size exceeds
    /// the previous level's by more than this multiplier (§4.7: "10x").
    pub level_size_multiplier: usize,
    /// L0 table count that triggers an L0 -> base-level compaction.
    pub level0_files_num_compaction_threshold: usize,
    pub max_levels: usize,
    pub base_level_size_mb: usize,
}

impl Default for LeveledCompactionOptions {
    fn default() -> Self {
        Self {
            level_size_multiplier: 10,
            level0_files_num_compaction_threshold: 4,
            max_levels: 4,
            base_level_size_mb: 4,
        }
    }
}

impl LeveledCompactionController {
    pub fn new(options: LeveledCompactionOptions) -> Self {
        Self { options }
    }

    fn level_byte_size(snapshot: &LsmStorageState, ids: &[usize]) -> u64 {
        ids.iter()
            .filter_map(|id| snapshot.sstables.get(id))
            .map(|t| t.table_size())
            .sum()
    }

    /// Picks the next compaction task, if any: L0 first (once its table
    /// count crosses the threshold, compacted into L1), then the first
    /// level (scanning from L1 upward) whose byte size exceeds the prior
    /// level's by more than `level_size_multiplier`.
    pub fn generate_compaction_task(
        &self,
        snapshot: &LsmStorageState,
    ) -> Option<LeveledCompactionTask> {
        if snapshot.l0_sstables.len() >= self.options.level0_files_num_compaction_threshold {
            let lower_level = 1;
            let lower_ids = snapshot
                .levels
                .get(lower_level - 1)
                .map(|(_, ids)| ids.clone())
                .unwrap_or_default();
            return Some(LeveledCompactionTask {
                upper_level: None,
                upper_level_sst_ids: snapshot.l0_sstables.clone(),
                lower_level,
                lower_level_sst_ids: lower_ids,
                is_lower_level_bottom_level: lower_level == self.options.max_levels,
            });
        }

        for upper in 1..self.options.max_levels {
            let lower = upper + 1;
            let Some((_, upper_ids)) = snapshot.levels.get(upper - 1) else {
                continue;
            };
            if upper_ids.is_empty() {
                continue;
            }
            let upper_size = Self::level_byte_size(snapshot, upper_ids);
            let lower_ids = snapshot
                .levels
                .get(lower - 1)
                .map(|(_, ids)| ids.clone())
                .unwrap_or_default();
            let lower_size = Self::level_byte_size(snapshot, &lower_ids);
            let limit = upper_size.saturating_mul(self.options.level_size_multiplier as u64);
            if lower_size > limit {
                return Some(LeveledCompactionTask {
                    upper_level: Some(upper),
                    upper_level_sst_ids: upper_ids.clone(),
                    lower_level: lower,
                    lower_level_sst_ids: lower_ids,
                    is_lower_level_bottom_level: lower == self.options.max_levels,
                });
            }
        }
        None
    }

    /// Removes the task's input ids from L0/the upper and lower levels and
    /// inserts `output` into the lower level, re-sorted by first key so
    /// the level's non-overlap invariant's ordering assumption holds for
    /// `SstConcatIterator`.
    pub fn apply_compaction_result(
        &self,
        snapshot: &LsmStorageState,
        task: &LeveledCompactionTask,
        output: &[usize],
    ) -> (LsmStorageState, Vec<usize>) {
        let mut snapshot = snapshot.clone();

        if let Some(upper) = task.upper_level {
            let upper_idx = upper - 1;
            snapshot.levels[upper_idx].1.clear();
        } else {
            let removed: HashSet<usize> = task.upper_level_sst_ids.iter().copied().collect();
            snapshot.l0_sstables.retain(|id| !removed.contains(id));
        }

        let lower_idx = task.lower_level - 1;
        let removed_lower: HashSet<usize> = task.lower_level_sst_ids.iter().copied().collect();
        let mut new_lower: Vec<usize> = snapshot.levels[lower_idx]
            .1
            .iter()
            .copied()
            .filter(|id| !removed_lower.contains(id))
            .collect();
        new_lower.extend_from_slice(output);
        new_lower.sort_by(|a, b| {
            let ka = snapshot.sstables.get(a).map(|t| t.first_key().clone());
            let kb = snapshot.sstables.get(b).map(|t| t.first_key().clone());
            ka.cmp(&kb)
        });
        snapshot.levels[lower_idx].1 = new_lower;

        (snapshot, output.to_vec())
    }
}
