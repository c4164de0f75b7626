//! Reader snapshots and the watermark used to decide when a tombstone is
//! safe to drop during compaction.
//!
//! Repurposed from the teacher's `mvcc/watermark.rs`: this crate has no
//! multi-batch transactions (`spec.md` §1 Non-goals), so the rest of
//! `mvcc.rs`'s transaction machinery (`CommittedTxnData`, conflict
//! detection, `Transaction`) is dropped; only the watermark — the
//! lowest-pinned read sequence number across all live snapshots — survives,
//! since it is exactly what §4.7's tombstone-GC rule needs: "a tombstone
//! survives until ... no older snapshot could observe the shadowed entry".

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Tracks every currently-pinned read sequence number so the compactor
/// knows the oldest one a tombstone must still respect.
#[derive(Default)]
pub struct Watermark {
    readers: BTreeMap<u64, usize>,
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reader(&mut self, seq: u64) {
        *self.readers.entry(seq).or_default() += 1;
    }

    pub fn remove_reader(&mut self, seq: u64) {
        if let Some(cnt) = self.readers.get_mut(&seq) {
            *cnt -= 1;
            if *cnt == 0 {
                self.readers.remove(&seq);
            }
        }
    }

    /// The oldest pinned read sequence number, or `None` if no snapshot is
    /// outstanding (in which case the caller falls back to the engine's
    /// current sequence counter).
    pub fn watermark(&self) -> Option<u64> {
        self.readers.keys().next().copied()
    }

    pub fn num_snapshots(&self) -> usize {
        self.readers.len()
    }
}

/// A read handle pinning a `(seq)` snapshot of the engine: every read
/// issued through it observes exactly the writes committed at or before
/// `seq`, as required by §5's "write visible iff the read's snapshot was
/// taken after the commit".
pub struct Snapshot {
    pub(crate) seq: u64,
    watermark: Arc<Mutex<Watermark>>,
}

impl Snapshot {
    pub(crate) fn pin(seq: u64, watermark: Arc<Mutex<Watermark>>) -> Self {
        watermark.lock().add_reader(seq);
        Self { seq, watermark }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.watermark.lock().remove_reader(self.seq);
    }
}

/// Engine-wide sequence counter and watermark, replacing the teacher's
/// `LsmMvccInner` now that there is no transaction commit timestamp
/// distinct from the write sequence counter.
pub struct SnapshotTracker {
    next_seq: AtomicU64,
    watermark: Arc<Mutex<Watermark>>,
}

impl SnapshotTracker {
    pub fn new(init_seq: u64) -> Self {
        Self {
            next_seq: AtomicU64::new(init_seq),
            watermark: Arc::new(Mutex::new(Watermark::new())),
        }
    }

    /// Allocates and returns the next sequence number, for use by a single
    /// write under the engine's write lock.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, AtomicOrdering::SeqCst)
    }

    pub fn current_seq(&self) -> u64 {
        self.next_seq.load(AtomicOrdering::SeqCst)
    }

    /// Restores the counter after manifest replay (`ManifestRecord::EditSeq`).
    pub fn restore_seq(&self, seq: u64) {
        self.next_seq.store(seq, AtomicOrdering::SeqCst);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::pin(self.current_seq(), self.watermark.clone())
    }

    /// The lowest sequence number any live snapshot could still observe;
    /// falls back to the current sequence counter when none is pinned.
    pub fn watermark(&self) -> u64 {
        self.watermark
            .lock()
            .watermark()
            .unwrap_or_else(|| self.current_seq())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_tracks_oldest_pinned_snapshot() {
        let tracker = SnapshotTracker::new(0);
        let s1 = tracker.snapshot();
        let _ = tracker.next_seq();
        let s2 = tracker.snapshot();
        assert_eq!(tracker.watermark(), s1.seq());
        drop(s1);
        assert_eq!(tracker.watermark(), s2.seq());
        drop(s2);
        assert_eq!(tracker.watermark(), tracker.current_seq());
    }
}
