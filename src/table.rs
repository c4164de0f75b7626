#![allow(unused)]
pub(crate) mod bloom;
pub(crate) mod builder;
pub(crate) mod merkle;
pub(crate) mod iterator;

pub use self::builder::SsTableBuilder;

use self::bloom::Bloom;
use self::merkle::TableMerkle;
use crate::error::{Error, Result};
use crate::hash::{Hash, MerkleProof};
use crate::key::{Key, KeyBytes};
use crate::lsm_storage::BlockCache;
use bytes::{Buf, BufMut};
use std::{fs::File, io::Read, path::Path, sync::Arc};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    offset: usize,
    first_key: KeyBytes,
    last_key: KeyBytes,
}

impl BlockMeta {
    pub fn encode_block_meta(block_meta: &[BlockMeta], buf: &mut Vec<u8>) {
        let mut estimated_size = std::mem::size_of::<u32>();
        for meta in block_meta {
            estimated_size += std::mem::size_of::<u32>();
            estimated_size += std::mem::size_of::<u16>() + meta.first_key.len();
            estimated_size += std::mem::size_of::<u16>() + meta.last_key.len();
        }
        estimated_size += std::mem::size_of::<u32>();

        buf.reserve(estimated_size);
        let original_len = buf.len();
        buf.put_u32(block_meta.len() as u32);

        for meta in block_meta {
            buf.put_u32(meta.offset as u32);
            buf.put_u16(meta.first_key.len() as u16);
            buf.put_slice(meta.first_key.raw_ref());
            buf.put_u16(meta.last_key.len() as u16);
            buf.put_slice(meta.last_key.raw_ref());
        }
        buf.put_u32(crc32fast::hash(&buf[original_len + 4..]));
        assert_eq!(estimated_size, buf.len() - original_len)
    }

    pub fn decode_block_meta(mut buf: &[u8]) -> Result<Vec<BlockMeta>> {
        let mut block_meta = Vec::new();
        let num = buf.get_u32() as usize;
        let checksum = crc32fast::hash(&buf[..buf.remaining() - 4]);
        for _ in 0..num {
            let offset = buf.get_u32() as usize;
            let first_key_len = buf.get_u16() as usize;
            let first_key = KeyBytes::from_bytes(buf.copy_to_bytes(first_key_len))?;
            let last_key_len: usize = buf.get_u16() as usize;
            let last_key = KeyBytes::from_bytes(buf.copy_to_bytes(last_key_len))?;
            block_meta.push(BlockMeta {
                offset,
                first_key,
                last_key,
            });
        }
        if buf.get_u32() != checksum {
            return Err(Error::corrupted(None, "block meta checksum mismatched"));
        }
        Ok(block_meta)
    }
}

/// A file object.
pub struct FileObject(Option<File>, u64);

impl FileObject {
    pub fn create(path: &Path, data: Vec<u8>) -> Result<Self> {
        std::fs::write(path, &data)?;
        File::open(path)?.sync_all()?;
        Ok(FileObject(
            Some(File::options().read(true).write(false).open(path)?),
            data.len() as u64,
        ))
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options().read(true).write(false).open(path)?;
        let size = file.metadata()?.len();
        Ok(FileObject(Some(file), size))
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let mut data = vec![0; len as usize];
        self.0.as_ref().unwrap().read_exact_at(&mut data[..], offset)?;
        Ok(data)
    }

    pub fn size(&self) -> u64 {
        self.1
    }
}

/// An SSTable: an on-disk, sorted run of versioned internal keys, plus the
/// bloom filter (for point-lookup pruning) and Merkle footer (component E)
/// needed to serve authenticated reads without scanning the data blocks.
pub struct SsTable {
    pub(crate) file: FileObject,
    pub(crate) block_meta: Vec<BlockMeta>,
    pub(crate) block_meta_offset: usize,
    id: usize,
    block_cache: Option<Arc<BlockCache>>,
    first_key: KeyBytes,
    last_key: KeyBytes,
    pub(crate) bloom: Option<Bloom>,
    pub(crate) merkle: TableMerkle,
    max_seq: u64,
}

impl SsTable {
    /// Opens an SSTable from `file`, reading its footers back to front:
    /// a fixed 8-byte `max_seq` trailer first, then the bloom filter,
    /// Merkle footer, and block meta, each of the latter three with its
    /// offset stored by the section immediately after it — mirroring how
    /// `build()` wrote them.
    pub fn open(id: usize, block_cache: Option<Arc<BlockCache>>, file: FileObject) -> Result<Self> {
        let len = file.size();

        let raw_max_seq = file.read(len - 8, 8)?;
        let max_seq = (&raw_max_seq[..]).get_u64();

        let raw_bloom_offset = file.read(len - 8 - 4, 4)?;
        let bloom_offset = (&raw_bloom_offset[..]).get_u32() as u64;
        let raw_bloom = file.read(bloom_offset, len - 8 - 4 - bloom_offset)?;
        let bloom_filter =
            Bloom::decode(&raw_bloom).map_err(|e| Error::corrupted(None, e.to_string()))?;

        let raw_merkle_offset = file.read(bloom_offset - 4, 4)?;
        let merkle_offset = (&raw_merkle_offset[..]).get_u32() as u64;
        let raw_merkle = file.read(merkle_offset, bloom_offset - 4 - merkle_offset)?;
        let merkle = TableMerkle::decode(&raw_merkle)?;

        let raw_meta_offset = file.read(merkle_offset - 4, 4)?;
        let block_meta_offset = (&raw_meta_offset[..]).get_u32() as u64;
        let raw_meta = file.read(block_meta_offset, merkle_offset - 4 - block_meta_offset)?;
        let block_meta = BlockMeta::decode_block_meta(&raw_meta[..])?;

        Ok(Self {
            file,
            first_key: block_meta.first().unwrap().first_key.clone(),
            last_key: block_meta.last().unwrap().last_key.clone(),
            block_meta,
            block_meta_offset: block_meta_offset as usize,
            id,
            block_cache,
            bloom: Some(bloom_filter),
            merkle,
            max_seq,
        })
    }

    pub fn first_key(&self) -> &KeyBytes {
        &self.first_key
    }
    pub fn last_key(&self) -> &KeyBytes {
        &self.last_key
    }
    pub fn num_of_blocks(&self) -> usize {
        self.block_meta.len()
    }
    pub fn table_size(&self) -> u64 {
        self.file.1
    }
    pub fn sst_id(&self) -> usize {
        self.id
    }
    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }
    pub fn merkle_root(&self) -> Hash {
        self.merkle.root()
    }
    pub fn proof_for(&self, user_key: &[u8], version: u64) -> Option<MerkleProof> {
        self.merkle.proof_for(user_key, version)
    }

    pub(crate) fn find_block_idx(&self, key: crate::key::KeySlice<'_>) -> usize {
        self.block_meta
            .partition_point(|meta| meta.first_key.as_key_slice() <= key)
            .saturating_sub(1)
    }

    pub(crate) fn read_block(&self, block_idx: usize) -> Result<Arc<crate::block::Block>> {
        let offset = self.block_meta[block_idx].offset;
        let offset_end = self
            .block_meta
            .get(block_idx + 1)
            .map_or(self.block_meta_offset, |m| m.offset);
        let block_len = offset_end - offset - 4;
        let raw = self.file.read(offset as u64, (offset_end - offset) as u64)?;
        let checksum = (&raw[block_len..]).get_u32();
        if checksum != crc32fast::hash(&raw[..block_len]) {
            return Err(Error::corrupted(None, "block checksum mismatched"));
        }
        Ok(Arc::new(crate::block::Block::decode(&raw[..block_len])))
    }

    pub(crate) fn read_block_cached(&self, block_idx: usize) -> Result<Arc<crate::block::Block>> {
        if let Some(ref cache) = self.block_cache {
            let key = (self.id, block_idx);
            cache
                .try_get_with(key, || self.read_block(block_idx))
                .map_err(|e| Error::corrupted(None, e.to_string()))
        } else {
            self.read_block(block_idx)
        }
    }
}
