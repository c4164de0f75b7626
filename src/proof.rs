//! The three-layer proof wire type handed back from `get_with_proof`.
//!
//! Grounded in `spec.md` §6's "Proof wire shape": `DBProof{data, layer,
//! master}`, each a [`crate::hash::MerkleProof`], chained leaf -> table root
//! -> level root -> master root. `verify` folds exactly that chain; the
//! caller is still responsible for the final comparison against the
//! engine's currently-exposed `master_root()` (§8 property 5), since a
//! proof can be valid on its own terms yet stale relative to the live
//! engine.

use crate::hash::{leaf_hash, Hash, MerkleProof};

/// A complete inclusion proof for one `(user_key, version, value)` entry:
/// membership in its table's leaf tree, that table's root's membership in
/// its level's table-root tree, and that level root's membership in the
/// MasterRoot tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DBProof {
    pub data: MerkleProof,
    pub layer: MerkleProof,
    pub master: MerkleProof,
}

impl DBProof {
    /// Recomputes `leaf_hash(user_key, version, value)` and folds it through
    /// `data`, then `data.root` through `layer`, then `layer.root` through
    /// `master`, returning whether every step checks out. Does not compare
    /// `self.master.root` against any externally-known MasterRoot — see
    /// module docs.
    pub fn verify(&self, user_key: &[u8], version: u64, value: &[u8]) -> bool {
        let leaf = leaf_hash(user_key, version, value);
        if !self.data.verify(leaf) {
            return false;
        }
        if !self.layer.verify(self.data.root) {
            return false;
        }
        self.master.verify(self.layer.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{build_tree, MerkleTree};

    fn chain_proof(leaves: &[Hash], idx: usize) -> (MerkleProof, Hash) {
        let tree = MerkleTree::build(leaves.to_vec()).unwrap();
        (tree.proof_for(idx).unwrap(), tree.root())
    }

    #[test]
    fn three_layer_chain_verifies() {
        let uk = b"k";
        let version = 7u64;
        let value = b"v";
        let leaf = leaf_hash(uk, version, value);

        let (data, data_root) = chain_proof(&[leaf, [1u8; 32]], 0);
        assert_eq!(data.root, data_root);

        let (layer, layer_root) = chain_proof(&[data_root, [2u8; 32], [3u8; 32]], 0);
        assert_eq!(layer.root, layer_root);

        let (master, master_root) = chain_proof(&[layer_root], 0);
        assert_eq!(master.root, master_root);

        let proof = DBProof { data, layer, master };
        assert!(proof.verify(uk, version, value));
        assert_eq!(proof.master.root, master_root);
    }

    #[test]
    fn tampered_value_fails() {
        let uk = b"k";
        let version = 7u64;
        let leaf = leaf_hash(uk, version, b"v");
        let (data, _) = chain_proof(&[leaf], 0);
        let (layer, _) = chain_proof(&[data.root], 0);
        let (master, _) = chain_proof(&[layer.root], 0);
        let proof = DBProof { data, layer, master };
        assert!(!proof.verify(uk, version, b"tampered"));
    }
}
