#![allow(unused)]

use crate::{
    block::builder::BlockBuilder,
    hash::leaf_hash,
    key::{EntryKind, Key, KeySlice, KeyVec},
    lsm_storage::BlockCache,
};
use bytes::BufMut;

use super::merkle::TableMerkle;
use super::{bloom::Bloom, BlockMeta, FileObject, SsTable};
use crate::error::Result;
use farmhash::FarmHasher;
use std::{path::Path, sync::Arc};

/// Builds an SsTable from key-value pairs, fed in ascending internal-key
/// order. Every version of every key is kept — this is a pure serialization
/// step, not a compaction step, so it never drops an entry.
pub struct SsTableBuilder {
    builder: BlockBuilder,
    block_size: usize,
    first_key: KeyVec,
    last_key: KeyVec,
    data: Vec<u8>,
    pub(crate) meta: Vec<BlockMeta>,
    key_hashes: Vec<u32>,
    max_seq: u64,
    merkle_entries: Vec<(Vec<u8>, u64, crate::hash::Hash)>,
}

impl SsTableBuilder {
    pub fn new(block_size: usize) -> Self {
        Self {
            builder: BlockBuilder::new(block_size),
            block_size,
            first_key: KeyVec::new(),
            last_key: KeyVec::new(),
            data: Vec::new(),
            meta: Vec::new(),
            key_hashes: Vec::new(),
            max_seq: 0,
            merkle_entries: Vec::new(),
        }
    }

    /// Adds a key-value pair to the table. `key` is a fully-encoded
    /// internal key (component A); the bloom filter is built over the
    /// *user* key portion so a point lookup can test it directly, and
    /// non-tombstone entries also feed the table's Merkle footer.
    pub fn add(&mut self, key: KeySlice<'_>, value: &[u8]) {
        if self.first_key.is_empty() {
            self.first_key.set_from_slice(key);
        }

        self.key_hashes.push(farmhash::fingerprint32(key.user_key()));
        self.max_seq = self.max_seq.max(key.seq());
        if key.kind() != EntryKind::Del {
            self.merkle_entries.push((
                key.user_key().to_vec(),
                key.version(),
                leaf_hash(key.user_key(), key.version(), value),
            ));
        }

        if self.builder.add(key, value) {
            self.last_key.set_from_slice(key);
            return;
        }

        self.finish_block();

        assert!(self.builder.add(key, value));
        self.first_key.set_from_slice(key);
        self.last_key.set_from_slice(key);
    }

    /// Builds the SSTable and writes it to `path`.
    pub fn build(
        mut self,
        id: usize,
        block_cache: Option<Arc<BlockCache>>,
        path: impl AsRef<Path>,
    ) -> Result<SsTable> {
        self.finish_block();
        let mut buf = self.data;

        let meta_offset = buf.len();
        BlockMeta::encode_block_meta(&self.meta, &mut buf);
        buf.put_u32(meta_offset as u32);

        let merkle = TableMerkle::build(self.merkle_entries);
        let merkle_offset = buf.len();
        merkle.encode(&mut buf);
        buf.put_u32(merkle_offset as u32);

        let bloom = Bloom::build_from_key_hashes(
            &self.key_hashes,
            Bloom::bloom_bits_per_key(self.key_hashes.len(), 0.01),
        );
        let bloom_offset = buf.len();
        bloom.encode(&mut buf);
        buf.put_u32(bloom_offset as u32);

        // Fixed-size trailer, no offset needed: always the last 8 bytes.
        buf.put_u64(self.max_seq);

        let file = FileObject::create(path.as_ref(), buf)?;
        Ok(SsTable {
            id,
            file,
            first_key: self.meta.first().unwrap().first_key.clone(),
            last_key: self.meta.last().unwrap().last_key.clone(),
            block_meta: self.meta,
            block_meta_offset: meta_offset,
            block_cache,
            bloom: Some(bloom),
            merkle,
            max_seq: self.max_seq,
        })
    }

    /// The estimated size of the table under construction; used by the
    /// compaction engine to decide when to roll to a new output table.
    pub fn estimate_size(&self) -> usize {
        self.data.len()
    }

    fn finish_block(&mut self) {
        if self.builder.is_empty() {
            return;
        }
        let builder = std::mem::replace(&mut self.builder, BlockBuilder::new(self.block_size));
        let encoded_block = builder.build().encode();
        self.meta.push(BlockMeta {
            offset: self.data.len(),
            first_key: std::mem::take(&mut self.first_key).to_key_bytes(),
            last_key: std::mem::take(&mut self.last_key).to_key_bytes(),
        });
        let checksum = crc32fast::hash(&encoded_block);
        self.data.extend(encoded_block);
        self.data.put_u32(checksum);
    }

    #[cfg(test)]
    pub(crate) fn build_for_test(self, path: impl AsRef<Path>) -> Result<SsTable> {
        self.build(0, None, path)
    }
}
