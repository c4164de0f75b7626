//! Per-table Merkle footer.
//!
//! A flat list of `(user_key, version, leaf_hash)` triples, one per live
//! (non-tombstone) entry the table holds, in key order — the exact input
//! shape `build_tree`/[`MerkleTree::build`] expects. Persisted as its own
//! footer section so the table root and any entry's inclusion proof can be
//! rebuilt on open without re-reading the data blocks.
//!
//! Grounded in the same `original_source/leveldb/mlsm` design the engine's
//! MasterRoot reuses (see `crate::hash`); the on-disk framing itself
//! follows the teacher's `BlockMeta`/`Bloom` footer sections in
//! `table.rs`/`table/bloom.rs` (length-prefixed records, trailing CRC32).

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::hash::{Hash, MerkleProof, MerkleTree};

#[derive(Debug, Clone)]
pub struct TableMerkle {
    tree: Option<MerkleTree>,
    /// `(user_key, version, leaf_hash)` in the same order the leaves were
    /// fed to the tree, so `proof_for` can locate a leaf's index.
    entries: Vec<(Vec<u8>, u64, Hash)>,
}

impl TableMerkle {
    /// `entries` must already be in ascending key order (the order the
    /// table builder adds them in).
    pub fn build(entries: Vec<(Vec<u8>, u64, Hash)>) -> Self {
        let leaves = entries.iter().map(|(_, _, h)| *h).collect();
        Self {
            tree: MerkleTree::build(leaves),
            entries,
        }
    }

    pub fn root(&self) -> Hash {
        self.tree.as_ref().map(|t| t.root()).unwrap_or([0u8; 32])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn proof_for(&self, user_key: &[u8], version: u64) -> Option<MerkleProof> {
        let idx = self
            .entries
            .iter()
            .position(|(uk, v, _)| uk.as_slice() == user_key && *v == version)?;
        self.tree.as_ref()?.proof_for(idx)
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.put_u32(self.entries.len() as u32);
        for (uk, v, leaf) in &self.entries {
            buf.put_u16(uk.len() as u16);
            buf.put_slice(uk);
            buf.put_u64(*v);
            buf.put_slice(leaf);
        }
        let checksum = crc32fast::hash(&buf[start..]);
        buf.put_u32(checksum);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::corrupted(None, "merkle footer too short"));
        }
        let checksum = crc32fast::hash(&buf[..buf.len() - 4]);
        let mut cursor = buf;
        let n = cursor.get_u32() as usize;
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            if cursor.remaining() < 2 {
                return Err(Error::corrupted(None, "merkle footer truncated"));
            }
            let uk_len = cursor.get_u16() as usize;
            if cursor.remaining() < uk_len + 8 + 32 {
                return Err(Error::corrupted(None, "merkle footer truncated"));
            }
            let uk = cursor[..uk_len].to_vec();
            cursor.advance(uk_len);
            let version = cursor.get_u64();
            let mut leaf = [0u8; 32];
            leaf.copy_from_slice(&cursor[..32]);
            cursor.advance(32);
            entries.push((uk, version, leaf));
        }
        if cursor.remaining() < 4 {
            return Err(Error::corrupted(None, "merkle footer missing checksum"));
        }
        if cursor.get_u32() != checksum {
            return Err(Error::corrupted(None, "merkle footer checksum mismatch"));
        }
        let tree = MerkleTree::build(entries.iter().map(|(_, _, h)| *h).collect());
        Ok(Self { tree, entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::leaf_hash;

    #[test]
    fn encode_decode_round_trip_preserves_root_and_proofs() {
        let entries = vec![
            (b"a".to_vec(), 1, leaf_hash(b"a", 1, b"va")),
            (b"b".to_vec(), 1, leaf_hash(b"b", 1, b"vb")),
            (b"c".to_vec(), 2, leaf_hash(b"c", 2, b"vc")),
        ];
        let tm = TableMerkle::build(entries);
        let mut buf = Vec::new();
        tm.encode(&mut buf);
        let decoded = TableMerkle::decode(&buf).unwrap();
        assert_eq!(decoded.root(), tm.root());
        let proof = decoded.proof_for(b"b", 1).unwrap();
        assert!(proof.verify(leaf_hash(b"b", 1, b"vb")));
    }

    #[test]
    fn corrupted_footer_is_rejected() {
        let entries = vec![(b"a".to_vec(), 1, leaf_hash(b"a", 1, b"va"))];
        let tm = TableMerkle::build(entries);
        let mut buf = Vec::new();
        tm.encode(&mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(TableMerkle::decode(&buf).is_err());
    }
}
