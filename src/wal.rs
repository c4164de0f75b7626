//! Write-ahead log: every memtable write is durably appended here before it
//! lands in the in-memory skiplist, so a crash can replay it back.
//!
//! Record framing: `key_len: u16 LE | key | value_len: u32 LE | value |
//! crc32: u32 LE` where `crc32` covers `key_len..value`. `key` is the fully
//! encoded 16-byte-trailer internal key (component A) — version included —
//! so a crash-recovered memtable keeps every write's caller-supplied version
//! intact. [`crate::key::decode_wal`]/[`crate::key::encode_wal`] remain for
//! the legacy 8-byte trailer format and are no longer on this write path.
//!
//! Grounded in `examples/CrystalAnalyst-Lsm/src/wal.rs`'s
//! `Arc<Mutex<BufWriter<File>>>` shape, with `crc32fast` framing added per
//! this crate's recovery/corruption requirements (the teacher's file had no
//! framing at all — every method was a `todo!()`).

#![allow(dead_code)]

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};
use crate::key::KeyBytes;

pub struct Wal {
    file: Arc<Mutex<BufWriter<File>>>,
}

impl Wal {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    /// Replays every well-formed record in `path` into `skiplist`, then
    /// reopens the file in append mode for further writes. A record whose
    /// length prefix runs past EOF is treated as a crash-torn tail write and
    /// silently dropped; a record whose CRC does not match its payload is
    /// reported as [`Error::Corrupted`] since that indicates bit rot rather
    /// than a torn write.
    pub fn recover(
        path: impl AsRef<Path>,
        skiplist: &SkipMap<KeyBytes, Bytes>,
        approximate_size: &AtomicUsize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut raw = Vec::new();
        File::open(path)?.read_to_end(&mut raw)?;
        let mut buf = &raw[..];

        while !buf.is_empty() {
            if buf.len() < 2 {
                break;
            }
            let key_len = (&buf[..2]).get_u16_le() as usize;
            let after_key_len = &buf[2..];
            if after_key_len.len() < key_len + 4 {
                break;
            }
            let key_bytes = &after_key_len[..key_len];
            let after_key = &after_key_len[key_len..];
            let value_len = (&after_key[..4]).get_u32_le() as usize;
            let after_value_len = &after_key[4..];
            if after_value_len.len() < value_len + 4 {
                break;
            }
            let value_bytes = &after_value_len[..value_len];
            let crc_bytes = &after_value_len[value_len..value_len + 4];
            let stored_crc = (&crc_bytes[..]).get_u32_le();

            let record_len = 2 + key_len + 4 + value_len;
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&buf[..record_len]);
            if hasher.finalize() != stored_crc {
                return Err(Error::corrupted(
                    Some(path.display().to_string()),
                    "wal record crc mismatch",
                ));
            }

            let internal_key = KeyBytes::from_bytes(Bytes::copy_from_slice(key_bytes))?;
            let value = Bytes::copy_from_slice(value_bytes);
            approximate_size.fetch_add(key_len + value.len(), AtomicOrdering::Relaxed);
            skiplist.insert(internal_key, value);

            buf = &after_value_len[value_len + 4..];
        }

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    /// Appends one record. `key` is the fully encoded internal key (the
    /// caller's `KeySlice::raw_ref()`), version included.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(2 + key.len() + 4 + value.len() + 4);
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        let mut guard = self.file.lock().unwrap();
        guard.write_all(&buf)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let mut guard = self.file.lock().unwrap();
        guard.flush()?;
        guard.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{EntryKind, KeyVec};
    use tempfile::tempdir;

    #[test]
    fn put_then_recover_round_trips_with_version_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.wal");
        {
            let wal = Wal::create(&path).unwrap();
            let k = KeyVec::encode(b"k1", 9, 1, EntryKind::Val);
            wal.put(k.raw_ref(), b"v1").unwrap();
            wal.sync().unwrap();
        }
        let map = SkipMap::new();
        let size = AtomicUsize::new(0);
        let _wal = Wal::recover(&path, &map, &size).unwrap();
        assert_eq!(map.len(), 1);
        let entry = map.iter().next().unwrap();
        assert_eq!(entry.key().user_key(), b"k1");
        assert_eq!(entry.key().as_key_slice().version(), 9);
    }

    #[test]
    fn truncated_tail_record_is_dropped_not_erred() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.wal");
        {
            let wal = Wal::create(&path).unwrap();
            let k = KeyVec::encode(b"k1", 1, 1, EntryKind::Val);
            wal.put(k.raw_ref(), b"v1").unwrap();
            wal.sync().unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.push(0xff);
        bytes.push(0xff);
        std::fs::write(&path, bytes).unwrap();

        let map = SkipMap::new();
        let size = AtomicUsize::new(0);
        let _wal = Wal::recover(&path, &map, &size).unwrap();
        assert_eq!(map.len(), 1);
    }
}
