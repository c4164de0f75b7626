use crate::error::Result;
use crate::key::KeySlice;
use crate::table::iterator::SsTableIterator;
use crate::table::SsTable;

use std::sync::Arc;

use super::StorageIterator;

/// Concatenates multiple SSTables whose key ranges do not overlap (the
/// tables of a single level above L0) as if they were one sorted stream,
/// avoiding a full k-way merge when a simple linear scan across tables
/// suffices.
pub struct SstConcatIterator {
    current: Option<SsTableIterator>,
    next_sst_idx: usize,
    sstables: Vec<Arc<SsTable>>,
}

impl SstConcatIterator {
    pub fn create_and_seek_to_first(sstables: Vec<Arc<SsTable>>) -> Result<Self> {
        Self::check_sst_valid(&sstables);
        if sstables.is_empty() {
            return Ok(Self {
                current: None,
                next_sst_idx: 0,
                sstables,
            });
        }
        let mut iter = Self {
            current: Some(SsTableIterator::create_and_seek_to_first(sstables[0].clone())?),
            next_sst_idx: 1,
            sstables,
        };
        iter.move_until_valid()?;
        Ok(iter)
    }

    pub fn create_and_seek_to_key(sstables: Vec<Arc<SsTable>>, key: KeySlice<'_>) -> Result<Self> {
        Self::check_sst_valid(&sstables);
        let idx = sstables
            .partition_point(|table| table.last_key().as_key_slice() < key)
            .min(sstables.len());
        if idx >= sstables.len() {
            return Ok(Self {
                current: None,
                next_sst_idx: sstables.len(),
                sstables,
            });
        }
        let mut iter = Self {
            current: Some(SsTableIterator::create_and_seek_to_key(
                sstables[idx].clone(),
                key,
            )?),
            next_sst_idx: idx + 1,
            sstables,
        };
        iter.move_until_valid()?;
        Ok(iter)
    }

    fn check_sst_valid(sstables: &[Arc<SsTable>]) {
        for pair in sstables.windows(2) {
            debug_assert!(
                pair[0].last_key().as_key_slice() <= pair[1].first_key().as_key_slice(),
                "sstables passed to SstConcatIterator must be ordered and non-overlapping"
            );
        }
    }

    fn move_until_valid(&mut self) -> Result<()> {
        while let Some(iter) = self.current.as_mut() {
            if iter.is_valid() {
                break;
            }
            if self.next_sst_idx >= self.sstables.len() {
                self.current = None;
                break;
            }
            self.current = Some(SsTableIterator::create_and_seek_to_first(
                self.sstables[self.next_sst_idx].clone(),
            )?);
            self.next_sst_idx += 1;
        }
        Ok(())
    }
}

impl StorageIterator for SstConcatIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn is_valid(&self) -> bool {
        self.current.as_ref().map(|iter| iter.is_valid()).unwrap_or(false)
    }

    fn key(&self) -> Self::KeyType<'_> {
        self.current.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().unwrap().value()
    }

    fn next(&mut self) -> Result<()> {
        self.current.as_mut().unwrap().next()?;
        self.move_until_valid()?;
        Ok(())
    }

    fn number_of_iterators(&self) -> usize {
        1
    }
}
