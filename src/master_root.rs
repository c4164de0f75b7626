//! MasterRoot assembly (component I): aggregates the active memtable's root
//! (if non-empty), each level's table-root tree, into a single hash, and
//! produces the proof of a layer root's position within that aggregate.
//!
//! Grounded in `spec.md` §4.9's ordering rule: "memtable first if non-empty,
//! then levels in ascending order, skipping empty levels" — a single
//! function (`layer_roots`) produces this list so the build path and the
//! master-proof path can never disagree on ordering, per §9's warning.

use crate::hash::{build_tree, Hash, MerkleProof, MerkleTree};
use crate::lsm_storage::LsmStorageState;

/// One entry in the ordered layer list MasterRoot is built over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Memtable,
    Level(usize),
}

/// Computes the ordered `(Layer, root)` list MasterRoot is built over:
/// the first non-empty memtable (active, else the oldest frozen one) and
/// then every level with at least one table, in ascending level order.
pub fn layer_roots(state: &LsmStorageState) -> Vec<(Layer, Hash)> {
    let mut out = Vec::new();

    if let Some(tree) = state.memtable.merkle_tree() {
        out.push((Layer::Memtable, tree.root()));
    } else {
        for imm in &state.imm_memtables {
            if let Some(tree) = imm.merkle_tree() {
                out.push((Layer::Memtable, tree.root()));
                break;
            }
        }
    }

    if !state.l0_sstables.is_empty() {
        if let Some(root) = level_root(state, &state.l0_sstables) {
            out.push((Layer::Level(0), root));
        }
    }
    for (level, ids) in &state.levels {
        if ids.is_empty() {
            continue;
        }
        if let Some(root) = level_root(state, ids) {
            out.push((Layer::Level(*level), root));
        }
    }
    out
}

/// Builds the tree over a level's member tables' Merkle roots, in the
/// level's stored table order.
fn level_root(state: &LsmStorageState, ids: &[usize]) -> Option<Hash> {
    let hashes: Vec<Hash> = ids
        .iter()
        .filter_map(|id| state.sstables.get(id))
        .map(|t| t.merkle_root())
        .collect();
    build_tree(hashes).map(|t| t.root())
}

/// Builds the proof that `table_id`'s root occupies its position within
/// `level_ids`' table-root tree (the "layer proof" for a table hit, per
/// §4.8). `None` if the table is not a member of `level_ids`.
pub fn level_proof_for(
    state: &LsmStorageState,
    level_ids: &[usize],
    table_id: usize,
) -> Option<MerkleProof> {
    let index = level_ids.iter().position(|id| *id == table_id)?;
    let hashes: Vec<Hash> = level_ids
        .iter()
        .filter_map(|id| state.sstables.get(id))
        .map(|t| t.merkle_root())
        .collect();
    let tree = build_tree(hashes)?;
    tree.proof_for(index)
}

/// Aggregates `layer_roots` into the MasterRoot. The zero hash when no
/// layer is populated (empty engine, per §8's boundary behaviour).
pub fn master_root(state: &LsmStorageState) -> Hash {
    let roots: Vec<Hash> = layer_roots(state).into_iter().map(|(_, h)| h).collect();
    build_tree(roots).map(|t| t.root()).unwrap_or([0u8; 32])
}

/// Builds the proof that `target`'s root occupies its position in the
/// current layer list, or `None` if that layer is no longer present
/// (version drifted under the caller, per §4.9).
pub fn master_proof(state: &LsmStorageState, target: Layer) -> Option<MerkleProof> {
    let roots = layer_roots(state);
    let index = roots.iter().position(|(l, _)| *l == target)?;
    let hashes: Vec<Hash> = roots.into_iter().map(|(_, h)| h).collect();
    let tree: MerkleTree = build_tree(hashes)?;
    tree.proof_for(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact::CompactionOptions;
    use crate::lsm_storage::LsmStorageOptions;

    fn options() -> LsmStorageOptions {
        LsmStorageOptions {
            block_size: 4096,
            target_sst_size: 1 << 20,
            memtable_size_limit: 1 << 20,
            max_memtable_limit: 4,
            compaction_options: CompactionOptions::NoCompaction,
            enable_wal: false,
        }
    }

    #[test]
    fn empty_state_has_zero_master_root() {
        let state = LsmStorageState::create(&options());
        assert_eq!(master_root(&state), [0u8; 32]);
    }

    #[test]
    fn nonempty_memtable_contributes_first_layer() {
        use crate::key::{EntryKind, KeyVec};
        let mut state = LsmStorageState::create(&options());
        state
            .memtable
            .put(KeyVec::encode(b"k", 1, 1, EntryKind::Val).as_key_slice(), b"v")
            .unwrap();
        let roots = layer_roots(&state);
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].0, Layer::Memtable);
        assert_ne!(master_root(&state), [0u8; 32]);
    }
}
