//! A verifiable, multi-version log-structured merge key-value store: every
//! write carries a caller-supplied 64-bit version, and every read can be
//! accompanied by a three-layer Merkle proof chaining the value up to a
//! single `MasterRoot` hash.
//!
//! See [`lsm_storage`] for the engine entry point (`MiniLsm`).

pub mod block;
pub mod compact;
pub mod debug;
pub mod error;
pub mod hash;
pub mod iterators;
pub mod key;
pub mod lsm_iterator;
pub mod lsm_storage;
pub mod manifest;
pub mod master_root;
pub mod mem_table;
pub mod proof;
pub mod snapshot;
pub mod table;
pub mod wal;

pub use error::{Error, Result};
pub use lsm_storage::{CompactionFilter, LsmStorageOptions, MiniLsm, WriteBatchRecord};
pub use proof::DBProof;
