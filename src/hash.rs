//! Merkle hashing primitives shared by table footers, per-level roots, and
//! the MasterRoot.
//!
//! Grounded in `examples/original_source/leveldb/mlsm/hash.go` (leaf/internal
//! hash domain separation) and `mlsm/tree_builder.go`'s
//! `BuildTreeFromHashes` (balanced, odd-node-promoted binary tree over a
//! flat hash list). The pointer-based `merkle/tree.go` + `merkle/node.go`
//! design is deliberately not used here: that tree mixes the full internal
//! key into leaves, whereas `db_proof.go`'s actual `Verify()` path hashes
//! `(user_key || version, value)` — the "versioned-user-key" leaf form this
//! module implements.

use sha2::{Digest, Sha256};

use crate::key::versioned_user_key;

/// A 32-byte SHA-256 digest. SHA-256 is sufficient for this system's
/// authentication needs; no domain calls for a different hash function.
pub type Hash = [u8; 32];

const LEAF_TAG: u8 = 0x00;
const INTERNAL_TAG: u8 = 0x01;

/// `H(0x00 || user_key || version || value)`.
pub fn leaf_hash(user_key: &[u8], version: u64, value: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_TAG]);
    hasher.update(versioned_user_key(user_key, version));
    hasher.update(value);
    hasher.finalize().into()
}

/// `H(0x01 || left || right)`.
pub fn internal_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([INTERNAL_TAG]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// A left/right step on the path from a leaf to the root, as returned in a
/// [`MerkleProof`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStep {
    /// The sibling hash is the left child; ours is the right.
    Left(Hash),
    /// The sibling hash is the right child; ours is the left.
    Right(Hash),
}

/// A complete balanced Merkle tree over an ordered list of leaf hashes,
/// keeping every level (not just the root) so that [`MerkleTree::proof_for`]
/// never has to recompute anything.
///
/// Construction follows `BuildTreeFromHashes`: pair adjacent hashes moving
/// up a level at a time; an odd one out at any level is promoted unchanged
/// to the next level rather than self-paired.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `levels[0]` is the leaves, `levels.last()` is `[root]`.
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Builds a tree from leaf hashes in their intended left-to-right order.
    /// Returns `None` for an empty input; callers (level-root / MasterRoot
    /// assembly) skip empty inputs rather than construct a tree for them.
    pub fn build(leaves: Vec<Hash>) -> Option<Self> {
        if leaves.is_empty() {
            return None;
        }
        let mut levels = vec![leaves];
        while levels.last().unwrap().len() > 1 {
            let prev = levels.last().unwrap();
            let mut next = Vec::with_capacity(prev.len().div_ceil(2));
            let mut i = 0;
            while i < prev.len() {
                if i + 1 < prev.len() {
                    next.push(internal_hash(&prev[i], &prev[i + 1]));
                    i += 2;
                } else {
                    next.push(prev[i]);
                    i += 1;
                }
            }
            levels.push(next);
        }
        Some(MerkleTree { levels })
    }

    pub fn root(&self) -> Hash {
        self.levels.last().unwrap()[0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Computes the authentication path for leaf `index`, root-agnostic:
    /// callers combine it with [`Self::root()`] to form a [`MerkleProof`].
    pub fn path_for(&self, mut index: usize) -> Option<Vec<ProofStep>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut path = Vec::with_capacity(self.levels.len() - 1);
        for level in &self.levels[..self.levels.len() - 1] {
            let is_right = index % 2 == 1;
            let sibling_index = if is_right { index - 1 } else { index + 1 };
            if sibling_index < level.len() {
                let sibling = level[sibling_index];
                path.push(if is_right {
                    ProofStep::Left(sibling)
                } else {
                    ProofStep::Right(sibling)
                });
            }
            // else: odd one out, promoted unchanged — no step at this level.
            index /= 2;
        }
        Some(path)
    }

    /// Builds a full proof for leaf `index` bundling the root and the path.
    pub fn proof_for(&self, index: usize) -> Option<MerkleProof> {
        let path = self.path_for(index)?;
        Some(MerkleProof {
            root: self.root(),
            exists: true,
            path,
        })
    }
}

/// A single-layer Merkle inclusion proof: the root it proves membership
/// under, whether the element exists (a `false` proof certifies absence at
/// the leaf-list boundary a caller already knows), and the sibling path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub root: Hash,
    pub exists: bool,
    pub path: Vec<ProofStep>,
}

impl MerkleProof {
    /// Recomputes the root from `leaf` and the stored path, returning
    /// whether it matches `self.root`.
    pub fn verify(&self, leaf: Hash) -> bool {
        if !self.exists {
            return false;
        }
        let mut cur = leaf;
        for step in &self.path {
            cur = match step {
                ProofStep::Left(sibling) => internal_hash(sibling, &cur),
                ProofStep::Right(sibling) => internal_hash(&cur, sibling),
            };
        }
        cur == self.root
    }
}

/// Builds the tree over a set of already-computed roots (table roots within
/// a level, or layer roots for the MasterRoot) and returns it. There is no
/// separate "aggregate" hash distinct from [`internal_hash`]; level roots
/// and the MasterRoot are built with exactly this same function.
pub fn build_tree(hashes: Vec<Hash>) -> Option<MerkleTree> {
    MerkleTree::build(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(n: u8) -> Hash {
        leaf_hash(&[n], 1, &[n, n])
    }

    #[test]
    fn single_leaf_tree_root_is_the_leaf() {
        let tree = MerkleTree::build(vec![leaf(1)]).unwrap();
        assert_eq!(tree.root(), leaf(1));
        let proof = tree.proof_for(0).unwrap();
        assert!(proof.path.is_empty());
        assert!(proof.verify(leaf(1)));
    }

    #[test]
    fn even_count_all_leaves_verify() {
        let leaves: Vec<Hash> = (0..8).map(leaf).collect();
        let tree = MerkleTree::build(leaves.clone()).unwrap();
        for (i, l) in leaves.iter().enumerate() {
            let proof = tree.proof_for(i).unwrap();
            assert!(proof.verify(*l), "leaf {i} failed to verify");
        }
    }

    #[test]
    fn odd_count_promotes_last_leaf_and_still_verifies() {
        let leaves: Vec<Hash> = (0..5).map(leaf).collect();
        let tree = MerkleTree::build(leaves.clone()).unwrap();
        for (i, l) in leaves.iter().enumerate() {
            let proof = tree.proof_for(i).unwrap();
            assert!(proof.verify(*l), "leaf {i} failed to verify");
        }
    }

    #[test]
    fn tampered_leaf_fails_verification() {
        let leaves: Vec<Hash> = (0..4).map(leaf).collect();
        let tree = MerkleTree::build(leaves).unwrap();
        let proof = tree.proof_for(2).unwrap();
        assert!(!proof.verify(leaf(99)));
    }

    #[test]
    fn empty_input_has_no_tree() {
        assert!(MerkleTree::build(vec![]).is_none());
    }

    #[test]
    fn leaf_hash_is_domain_separated_from_internal_hash() {
        let l = leaf_hash(b"k", 1, b"v");
        let i = internal_hash(&l, &l);
        assert_ne!(l, i);
    }
}
