//! The manifest: an append-only log of edit records describing the
//! current `Version` (which tables live at which level, memtable rotation,
//! the sequence-number watermark). Replayed in full on open.
//!
//! Grounded in `examples/CrystalAnalyst-Lsm/src/manifest.rs`'s
//! `serde_json` + `crc32fast`-framed `Mutex<File>` design; `recover` and
//! `add_record` were both `todo!()` in the teacher and are implemented here
//! following the same framing `add_record_when_init` already used
//! (`record_len: u64 BE | json | crc32: u32 BE`).

use bytes::BufMut;
use parking_lot::{Mutex, MutexGuard};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::Path,
    sync::Arc,
};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Stores the metadata describing the engine's current `Version` on disk.
pub struct Manifest {
    file: Arc<Mutex<File>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ManifestRecord {
    /// A table was added at `level` (`0` is L0, which holds unsorted runs).
    AddTable { level: usize, sst_id: usize },
    /// A table was removed from `level`, typically as a compaction input.
    RemoveTable { level: usize, sst_id: usize },
    /// A new active memtable was created with this id.
    NewMemtable(usize),
    /// The memtable with this id was flushed to an L0 table.
    FlushMemtable(usize),
    /// The engine's next-sequence-number watermark advanced past this
    /// value; replayed to resume sequence allocation after a restart.
    EditSeq(u64),
}

impl Manifest {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .create_new(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Replays every well-formed record in `path`, in write order, then
    /// reopens the file for further appends. A record whose length prefix
    /// runs past EOF is treated as a crash-torn tail write and dropped; a
    /// CRC mismatch on an otherwise complete record is reported as
    /// [`Error::Corrupted`].
    pub fn recover(path: impl AsRef<Path>) -> Result<(Self, Vec<ManifestRecord>)> {
        let path = path.as_ref();
        let mut raw = Vec::new();
        File::open(path)?.read_to_end(&mut raw)?;
        let mut buf = &raw[..];
        let mut records = Vec::new();

        while !buf.is_empty() {
            if buf.len() < 8 {
                break;
            }
            let record_len = u64::from_be_bytes(buf[..8].try_into().unwrap()) as usize;
            let rest = &buf[8..];
            if rest.len() < record_len + 4 {
                break;
            }
            let payload = &rest[..record_len];
            let stored_crc = u32::from_be_bytes(rest[record_len..record_len + 4].try_into().unwrap());
            if crc32fast::hash(payload) != stored_crc {
                return Err(Error::corrupted(
                    Some(path.display().to_string()),
                    "manifest record crc mismatch",
                ));
            }
            let record: ManifestRecord = serde_json::from_slice(payload)
                .map_err(|e| Error::corrupted(Some(path.display().to_string()), e.to_string()))?;
            records.push(record);
            buf = &rest[record_len + 4..];
        }

        let file = OpenOptions::new().read(true).write(true).append(true).open(path)?;
        Ok((
            Self {
                file: Arc::new(Mutex::new(file)),
            },
            records,
        ))
    }

    /// Appends a record while the caller holds the engine's state-lock
    /// observer, guaranteeing manifest writes are ordered the same as the
    /// state transitions they describe.
    pub fn add_record(
        &self,
        _state_lock_observer: &MutexGuard<'_, ()>,
        record: ManifestRecord,
    ) -> Result<()> {
        self.append(record)
    }

    pub fn add_record_when_init(&self, record: ManifestRecord) -> Result<()> {
        self.append(record)
    }

    fn append(&self, record: ManifestRecord) -> Result<()> {
        let mut file = self.file.lock();
        let buf = serde_json::to_vec(&record)
            .map_err(|e| Error::corrupted(None, e.to_string()))?;
        let hash = crc32fast::hash(&buf);
        file.write_all(&(buf.len() as u64).to_be_bytes())?;
        file.write_all(&buf)?;
        file.write_all(&hash.to_be_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_round_trip_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST");
        {
            let m = Manifest::create(&path).unwrap();
            m.add_record_when_init(ManifestRecord::NewMemtable(0)).unwrap();
            m.add_record_when_init(ManifestRecord::FlushMemtable(0)).unwrap();
            m.add_record_when_init(ManifestRecord::AddTable { level: 0, sst_id: 1 })
                .unwrap();
        }
        let (_m, records) = Manifest::recover(&path).unwrap();
        assert_eq!(
            records,
            vec![
                ManifestRecord::NewMemtable(0),
                ManifestRecord::FlushMemtable(0),
                ManifestRecord::AddTable { level: 0, sst_id: 1 },
            ]
        );
    }

    #[test]
    fn truncated_tail_record_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST");
        {
            let m = Manifest::create(&path).unwrap();
            m.add_record_when_init(ManifestRecord::NewMemtable(7)).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[1, 2, 3]);
        std::fs::write(&path, bytes).unwrap();

        let (_m, records) = Manifest::recover(&path).unwrap();
        assert_eq!(records, vec![ManifestRecord::NewMemtable(7)]);
    }
}
